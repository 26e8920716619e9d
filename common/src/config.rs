use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub allowed_gpio: Vec<u8>,
    pub onboard_device_name: String,
    pub onboard_led_gpio: u8,
    pub tick_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            allowed_gpio: vec![0, 1, 2, 3, 4, 5, 12, 13, 14, 15],
            onboard_device_name: "Pi LED".to_string(),
            onboard_led_gpio: 48,
            tick_interval_ms: 1_000,
            request_timeout_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn sanitize(&mut self) {
        let onboard_led = self.onboard_led_gpio;
        let mut seen = BTreeSet::new();
        self.allowed_gpio
            .retain(|pin| *pin != onboard_led && seen.insert(*pin));

        let name = self.onboard_device_name.trim();
        self.onboard_device_name = if name.is_empty() {
            Self::default().onboard_device_name
        } else {
            name.to_string()
        };

        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 10_000);
        self.request_timeout_ms = self.request_timeout_ms.clamp(10, self.tick_interval_ms);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ap_ssid: String,
    pub ap_password: String,
    pub ap_channel: u8,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "PicoW_Scheduler".to_string(),
            ap_password: "12345678".to_string(),
            ap_channel: 1,
            http_port: 80,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.ap_ssid.trim().is_empty() || self.ap_ssid.len() > 32 {
            self.ap_ssid = defaults.ap_ssid;
        }

        // WPA2 passphrases are 8..=63 bytes.
        if !(8..=63).contains(&self.ap_password.len()) {
            self.ap_password = defaults.ap_password;
        }

        if !(1..=13).contains(&self.ap_channel) {
            self.ap_channel = defaults.ap_channel;
        }

        if self.http_port == 0 {
            self.http_port = defaults.http_port;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.scheduler.sanitize();
        self.network.sanitize();
    }
}
