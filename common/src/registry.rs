use std::collections::HashMap;

use log::{info, warn};

use crate::{
    config::SchedulerConfig,
    error::{PinError, Rejection, SchedulerError, StorageError},
    hal::{OutputFactory, OutputPin},
    storage::{load_json, save_json, Storage},
    types::{Device, PinRef},
};

pub const MAX_NAME_CHARS: usize = 32;

struct Binding<P> {
    pin: P,
    high: Option<bool>,
}

/// The onboard indicator device always exists and cannot be removed.
pub struct DeviceRegistry<O: OutputFactory, S> {
    devices: Vec<Device>,
    bindings: HashMap<String, Binding<O::Pin>>,
    outputs: O,
    storage: S,
    onboard_name: String,
    allowed_gpio: Vec<u8>,
}

impl<O: OutputFactory, S: Storage> DeviceRegistry<O, S> {
    pub const KEY: &'static str = "devices.json";

    pub fn load(config: &SchedulerConfig, outputs: O, storage: S) -> Self {
        let onboard = Device::new(config.onboard_device_name.clone(), PinRef::Onboard);

        let (devices, rewrite) = match load_json::<Vec<serde_json::Value>, _>(&storage, Self::KEY)
        {
            Ok(Some(records)) => {
                let original = serde_json::Value::Array(records.clone());
                let devices = normalize(records, &onboard);
                let changed = serde_json::to_value(&devices).ok() != Some(original);
                (devices, changed)
            }
            Ok(None) => (vec![onboard], true),
            Err(err) => {
                warn!("failed to load devices, using defaults: {err}");
                (vec![onboard], true)
            }
        };

        let mut registry = Self {
            devices,
            bindings: HashMap::new(),
            outputs,
            storage,
            onboard_name: config.onboard_device_name.clone(),
            allowed_gpio: config.allowed_gpio.clone(),
        };

        if rewrite {
            if let Err(err) = registry.persist(&registry.devices) {
                warn!("failed to write device list: {err}");
            }
        }

        for device in registry.devices.clone() {
            match registry.outputs.open(device.pin) {
                Ok(pin) => {
                    registry
                        .bindings
                        .insert(device.name.clone(), Binding { pin, high: None });
                }
                Err(err) => warn!("failed to initialize device `{}`: {err}", device.name),
            }
        }

        info!("loaded {} device(s)", registry.devices.len());
        registry
    }

    pub fn list(&self) -> &[Device] {
        &self.devices
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.name == name)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn free_gpio(&self) -> Vec<u8> {
        self.allowed_gpio
            .iter()
            .copied()
            .filter(|gpio| self.owner_of(PinRef::Gpio(*gpio)).is_none())
            .collect()
    }

    pub fn add(&mut self, name: &str, pin_spec: &str) -> Result<&Device, SchedulerError> {
        if name.trim().is_empty() {
            return Err(Rejection::EmptyName.into());
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(Rejection::NameTooLong(MAX_NAME_CHARS).into());
        }
        if self.get(name).is_some() {
            return Err(Rejection::DuplicateName(name.to_string()).into());
        }

        let pin = match pin_spec.parse::<PinRef>() {
            Ok(PinRef::Gpio(gpio)) if self.allowed_gpio.contains(&gpio) => PinRef::Gpio(gpio),
            _ => return Err(Rejection::PinNotAllowed(pin_spec.to_string()).into()),
        };
        if let Some(owner) = self.owner_of(pin) {
            return Err(Rejection::PinInUse(pin, owner.name.clone()).into());
        }

        let mut output = self.outputs.open(pin)?;
        output.set_level(false)?;

        let device = Device::new(name, pin);
        let mut next = self.devices.clone();
        next.push(device.clone());
        self.persist(&next)?;

        self.devices = next;
        self.bindings.insert(
            device.name.clone(),
            Binding {
                pin: output,
                high: Some(false),
            },
        );
        info!("new device added: {} GPIO {}", device.name, device.pin);
        Ok(&self.devices[self.devices.len() - 1])
    }

    pub fn remove(&mut self, name: &str) -> Result<Device, SchedulerError> {
        if name == self.onboard_name {
            return Err(Rejection::Permanent(name.to_string()).into());
        }
        let Some(index) = self.devices.iter().position(|device| device.name == name) else {
            return Err(Rejection::UnknownDevice(name.to_string()).into());
        };

        if let Err(err) = self.force_low(name) {
            warn!("failed to switch off `{name}` before removal: {err}");
        }

        let mut next = self.devices.clone();
        let removed = next.remove(index);
        self.persist(&next)?;

        self.devices = next;
        self.bindings.remove(name);
        info!("device deleted: {name}");
        Ok(removed)
    }

    pub fn drive(&mut self, name: &str, high: bool) -> Result<bool, PinError> {
        let Some(binding) = self.bindings.get_mut(name) else {
            return Ok(false);
        };
        binding.pin.set_level(high)?;
        if binding.high != Some(high) {
            info!("{name} {}", if high { "ON" } else { "OFF" });
            binding.high = Some(high);
        }
        Ok(true)
    }

    pub fn force_low(&mut self, name: &str) -> Result<bool, PinError> {
        self.drive(name, false)
    }

    fn owner_of(&self, pin: PinRef) -> Option<&Device> {
        self.devices.iter().find(|device| device.pin == pin)
    }

    fn persist(&self, devices: &[Device]) -> Result<(), StorageError> {
        save_json(&self.storage, Self::KEY, devices)
    }
}

fn normalize(records: Vec<serde_json::Value>, onboard: &Device) -> Vec<Device> {
    let mut devices = vec![onboard.clone()];
    for record in records {
        let device = match serde_json::from_value::<Device>(record.clone()) {
            Ok(device) => device,
            Err(err) => {
                warn!("dropping malformed device record {record}: {err}");
                continue;
            }
        };
        if device == *onboard {
            continue;
        }
        if device.name.trim().is_empty() {
            warn!("dropping unnamed device on {}", device.pin);
        } else if device.pin.is_onboard() {
            warn!("dropping `{}`: the onboard output is reserved", device.name);
        } else if devices.iter().any(|kept| kept.name == device.name) {
            warn!("dropping duplicate device `{}`", device.name);
        } else if devices.iter().any(|kept| kept.pin == device.pin) {
            warn!("dropping `{}`: gpio {} already bound", device.name, device.pin);
        } else {
            devices.push(device);
        }
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hal::SimBoard, storage::MemoryStorage};
    use pretty_assertions::assert_eq;

    fn registry(storage: &MemoryStorage, board: &SimBoard) -> DeviceRegistry<SimBoard, MemoryStorage> {
        DeviceRegistry::load(&SchedulerConfig::default(), board.clone(), storage.clone())
    }

    fn rejection(result: Result<&Device, SchedulerError>) -> Option<Rejection> {
        result.unwrap_err().rejection().cloned()
    }

    fn names<O: OutputFactory, S: Storage>(registry: &DeviceRegistry<O, S>) -> Vec<String> {
        registry.list().iter().map(|d| d.name.clone()).collect()
    }

    #[test]
    fn fresh_storage_holds_only_onboard_device() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let registry = registry(&storage, &board);

        assert_eq!(names(&registry), vec!["Pi LED"]);
        assert!(registry.is_bound("Pi LED"));
        assert_eq!(
            storage.get_json("devices.json"),
            Some(serde_json::json!([{"name": "Pi LED", "gpio": "LED"}]))
        );
    }

    #[test]
    fn add_validates_name_pin_and_allow_list() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut registry = registry(&storage, &board);

        registry.add("Pump", "2").unwrap();

        assert_eq!(
            rejection(registry.add("Pump", "3")),
            Some(Rejection::DuplicateName("Pump".to_string()))
        );
        assert_eq!(
            rejection(registry.add("Fan", "2")),
            Some(Rejection::PinInUse(PinRef::Gpio(2), "Pump".to_string()))
        );
        assert_eq!(
            rejection(registry.add("Fan", "7")),
            Some(Rejection::PinNotAllowed("7".to_string()))
        );
        assert_eq!(
            rejection(registry.add("Fan", "LED")),
            Some(Rejection::PinNotAllowed("LED".to_string()))
        );
        assert_eq!(rejection(registry.add("", "3")), Some(Rejection::EmptyName));
        assert_eq!(
            rejection(registry.add(&"x".repeat(MAX_NAME_CHARS + 1), "3")),
            Some(Rejection::NameTooLong(MAX_NAME_CHARS))
        );
        registry.add(&"y".repeat(MAX_NAME_CHARS), "4").unwrap();
        registry.remove(&"y".repeat(MAX_NAME_CHARS)).unwrap();

        assert_eq!(names(&registry), vec!["Pi LED", "Pump"]);
        assert_eq!(board.level(PinRef::Gpio(2)), Some(false));
        assert!(!registry.free_gpio().contains(&2));
    }

    #[test]
    fn onboard_device_is_permanent() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut registry = registry(&storage, &board);

        let err = registry.remove("Pi LED").unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&Rejection::Permanent("Pi LED".to_string()))
        );
        assert_eq!(names(&registry), vec!["Pi LED"]);
    }

    #[test]
    fn remove_forces_low_and_unbinds() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut registry = registry(&storage, &board);
        registry.add("Pump", "2").unwrap();
        registry.drive("Pump", true).unwrap();
        assert!(board.is_high(PinRef::Gpio(2)));

        registry.remove("Pump").unwrap();

        assert!(!board.is_high(PinRef::Gpio(2)));
        assert!(!registry.is_bound("Pump"));
        assert_eq!(names(&registry), vec!["Pi LED"]);
        assert!(registry.free_gpio().contains(&2));
    }

    #[test]
    fn pin_failure_aborts_add() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        board.break_pin(PinRef::Gpio(3));
        let mut registry = registry(&storage, &board);

        let err = registry.add("Fan", "3").unwrap_err();
        assert!(matches!(err, SchedulerError::Pin(_)));
        assert_eq!(names(&registry), vec!["Pi LED"]);
    }

    #[test]
    fn storage_failure_aborts_add_and_remove() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut registry = registry(&storage, &board);
        registry.add("Pump", "2").unwrap();

        storage.fail_writes(true);
        assert!(matches!(
            registry.add("Fan", "3"),
            Err(SchedulerError::Storage(_))
        ));
        assert!(matches!(
            registry.remove("Pump"),
            Err(SchedulerError::Storage(_))
        ));

        assert_eq!(names(&registry), vec!["Pi LED", "Pump"]);
        assert!(registry.is_bound("Pump"));
    }

    #[test]
    fn drive_without_binding_is_a_no_op() {
        let storage = MemoryStorage::new();
        let board = SimBoard::new();
        let mut registry = registry(&storage, &board);

        assert_eq!(registry.drive("Ghost", true), Ok(false));
        assert_eq!(registry.drive("Pi LED", true), Ok(true));
        assert!(board.is_high(PinRef::Onboard));
    }

    #[test]
    fn load_normalizes_persisted_devices() {
        let raw = r#"[
            {"name":"Pump","gpio":"2"},
            {"name":"Pi LED","gpio":"LED"},
            {"name":"Pump","gpio":"3"},
            {"name":"Fan","gpio":2},
            {"name":"Broken"},
            {"name":"Heater","gpio":14}
        ]"#;
        let storage = MemoryStorage::new().with_entry("devices.json", raw);
        let board = SimBoard::new();
        board.break_pin(PinRef::Gpio(14));
        let registry = registry(&storage, &board);

        assert_eq!(names(&registry), vec!["Pi LED", "Pump", "Heater"]);
        assert!(registry.is_bound("Pump"));
        assert!(!registry.is_bound("Heater"));
        assert_eq!(
            storage.get_json("devices.json").unwrap().as_array().unwrap().len(),
            3
        );
    }

    #[test]
    fn free_pins_follow_configured_order() {
        let config = SchedulerConfig {
            allowed_gpio: vec![14, 2, 12, 3],
            ..SchedulerConfig::default()
        };
        let mut registry =
            DeviceRegistry::load(&config, SimBoard::new(), MemoryStorage::new());
        registry.add("Pump", "12").unwrap();

        assert_eq!(registry.free_gpio(), vec![14, 2, 3]);
    }
}
