use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method as HttpMethod},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use scheduler_common::{
    api,
    config::NetworkConfig,
    storage::{ensure_fits, load_json},
    Engine, HttpRequest, Method, OutputFactory, OutputPin, PinError, PinRef, Reply,
    RuntimeConfig, SoftRtc, Storage, StorageError,
};

const NVS_NAMESPACE: &str = "scheduler";
const NVS_CONFIG_KEY: &str = "config_json";
const MAX_HTTP_BODY: usize = 4096;
const MAX_NVS_BLOB: usize = 16 * 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

struct Envelope {
    request: HttpRequest,
    reply: mpsc::Sender<Reply>,
}

#[derive(Clone)]
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStorage {
    fn open(&self, key: &str) -> Result<EspNvs<NvsDefault>, StorageError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(|err| backend(key, err))
    }
}

fn backend(key: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Backend {
        key: key.to_string(),
        message: err.to_string(),
    }
}

impl Storage for NvsStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.open(key)?;
        let Some(len) = nvs.blob_len(key).map_err(|err| backend(key, err))? else {
            return Ok(None);
        };
        ensure_fits(key, len, MAX_NVS_BLOB)?;
        let mut buffer = vec![0_u8; len];
        let blob = nvs
            .get_blob(key, &mut buffer)
            .map_err(|err| backend(key, err))?;
        Ok(blob.map(<[u8]>::to_vec))
    }

    fn write(&self, key: &str, payload: &[u8]) -> Result<(), StorageError> {
        ensure_fits(key, payload.len(), MAX_NVS_BLOB)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open(key)?;
        nvs.set_blob(key, payload).map_err(|err| backend(key, err))
    }
}

struct EspOutputs {
    onboard_gpio: u8,
}

struct EspPin {
    pin: PinRef,
    driver: PinDriver<'static, AnyOutputPin, Output>,
}

impl EspOutputs {
    fn open_driver(&self, pin: PinRef, gpio: u8) -> Result<EspPin, PinError> {
        // SAFETY: the registry opens at most one driver per pin.
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(gpio))) };
        match driver {
            Ok(mut driver) => {
                driver.set_low().map_err(|err| PinError::Write {
                    pin,
                    reason: err.to_string(),
                })?;
                Ok(EspPin { pin, driver })
            }
            Err(err) => Err(PinError::Unavailable {
                pin,
                reason: err.to_string(),
            }),
        }
    }
}

impl OutputFactory for EspOutputs {
    type Pin = EspPin;

    fn onboard(&mut self) -> Result<EspPin, PinError> {
        self.open_driver(PinRef::Onboard, self.onboard_gpio)
    }

    fn output(&mut self, gpio: u8) -> Result<EspPin, PinError> {
        self.open_driver(PinRef::Gpio(gpio), gpio)
    }
}

impl OutputPin for EspPin {
    fn set_level(&mut self, high: bool) -> Result<(), PinError> {
        let result = if high {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        result.map_err(|err| PinError::Write {
            pin: self.pin,
            reason: err.to_string(),
        })
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let storage = NvsStorage {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = match load_json::<RuntimeConfig, _>(&storage, NVS_CONFIG_KEY) {
        Ok(runtime) => runtime.unwrap_or_default(),
        Err(err) => {
            warn!("failed to load runtime config from NVS: {err}");
            RuntimeConfig::default()
        }
    };
    runtime.sanitize();
    info!(
        "config loaded: ap=`{}` channel={} port={} allowed gpio={:?}",
        runtime.network.ap_ssid,
        runtime.network.ap_channel,
        runtime.network.http_port,
        runtime.scheduler.allowed_gpio
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = start_access_point(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi access point startup failed")?;

    let mut engine = Engine::boot(
        runtime.scheduler.clone(),
        SoftRtc::power_on(),
        EspOutputs {
            onboard_gpio: runtime.scheduler.onboard_led_gpio,
        },
        storage,
    );

    let (tx, rx) = mpsc::channel::<Envelope>();
    let server = create_http_server(&runtime.network, tx)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register main loop with watchdog: {err:#}");
    }

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    let tick = Duration::from_millis(runtime.scheduler.tick_interval_ms);
    let wait = Duration::from_millis(runtime.scheduler.request_timeout_ms);
    let mut next_tick = Instant::now();

    loop {
        feed_watchdog();

        let now = Instant::now();
        if now >= next_tick {
            let report = engine.tick();
            debug!(
                "tick {}: {} output(s) driven, {} task(s) retired",
                report.now,
                report.driven.len(),
                report.retired.len()
            );
            next_tick = now + tick;
        }

        let timeout = next_tick.saturating_duration_since(Instant::now()).min(wait);
        match rx.recv_timeout(timeout) {
            Ok(envelope) => {
                let reply = api::handle(&mut engine, &envelope.request);
                if envelope.reply.send(reply).is_err() {
                    debug!("http handler gave up before the reply was ready");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("http server request channel closed"));
            }
        }
    }
}

fn start_access_point(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: network
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP SSID too long"))?,
        password: network
            .ap_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: network.ap_channel,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;

    let ip = wifi.wifi().ap_netif().get_ip_info()?.ip;
    info!("access point `{}` up, serving on http://{ip}", network.ap_ssid);
    Ok(wifi)
}

fn create_http_server(
    network: &NetworkConfig,
    tx: mpsc::Sender<Envelope>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: network.http_port,
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for (http_method, method) in [(HttpMethod::Get, Method::Get), (HttpMethod::Post, Method::Post)]
    {
        let tx = tx.clone();
        server.fn_handler::<anyhow::Error, _>("/*", http_method, move |mut req| {
            let target = req.uri().to_string();
            let body = read_request_body(&mut req)?;
            let request = HttpRequest::from_target(
                method,
                &target,
                String::from_utf8_lossy(&body).into_owned(),
            );

            let (reply_tx, reply_rx) = mpsc::channel();
            tx.send(Envelope {
                request,
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("scheduler loop stopped"))?;
            let reply = reply_rx
                .recv_timeout(REPLY_TIMEOUT)
                .map_err(|_| anyhow!("scheduler loop did not answer"))?;
            write_reply(req, &reply)
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_reply(req: Request<&mut EspHttpConnection<'_>>, reply: &Reply) -> anyhow::Result<()> {
    let mut headers = vec![("Content-Type", reply.content_type())];
    if let Some(location) = reply.location() {
        headers.push(("Location", location));
    }
    req.into_response(reply.status(), None, &headers)?
        .write_all(reply.body().as_bytes())?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
