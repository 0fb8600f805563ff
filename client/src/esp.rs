use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    io::EspIOError,
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SntpConf, SyncStatus},
    sys::esp_err_t,
    wifi::{EspWifi, WifiEvent},
};
use log::{error, info, warn};

use tempo_common::{
    error::{LinkError, TimeError},
    tempo::MAX_RESPONSE_BYTES,
    ConnectivitySupervisor, DisconnectReason, Fatal, FatalAction, HttpResponse, HttpTransport,
    LinkEvent, NetworkConfig, PipelineReport, RuntimeConfig, SystemClock, TempoApi, TimeBase,
    TimeSource, TransportError, Watchdog, WifiDriver,
};

const NVS_NAMESPACE: &str = "tempo";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const READ_CHUNK_SIZE: usize = 512;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, timezone=`{}`, ntp=`{}`",
        runtime.network.wifi_ssid, runtime.time.timezone, runtime.time.ntp_server,
    );

    if !runtime.has_station_credentials() {
        handle_fatal(Fatal::Config("wifi ssid missing".to_string()));
    }

    let Peripherals { modem, .. } = Peripherals::take()?;
    let driver = EspWifiDriver::new(modem, sys_loop.clone(), nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let (events_tx, events_rx) = mpsc::channel();
    let (fatal_tx, fatal_rx) = mpsc::channel();
    let _subscription = subscribe_disconnects(&sys_loop, Arc::clone(&driver.leaving), events_tx)?;

    let link = ConnectivitySupervisor::new(
        driver,
        runtime.network.clone(),
        SystemClock,
        EspTaskWatchdog,
    );
    link.spawn_event_loop(events_rx, fatal_tx)
        .context("failed to start wifi supervisor")?;

    let mut api = TempoApi::new(EspHttpTransport);
    let mut time = TimeBase::new(EspSntpSource::default(), runtime.time.ambiguity);

    match tempo_common::run_pipeline(&runtime, &link, &mut time, &mut api) {
        Ok(report) => log_report(&report),
        Err(fatal) => handle_fatal(fatal),
    }

    // The supervisor keeps the link healthy from here on; it only reports back
    // when it cannot.
    if let Ok(fatal) = fatal_rx.recv() {
        handle_fatal(fatal);
    }

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn log_report(report: &PipelineReport) {
    if let Some(section) = &report.custom {
        info!("GET CUSTOM DAY TEMPO COLOR");
        for line in section.to_string().lines() {
            info!("{line}");
        }
    }
    if let Some(section) = &report.today {
        info!("GET CURRENT DAY TEMPO COLOR");
        for line in section.to_string().lines() {
            info!("{line}");
        }
    }
}

fn handle_fatal(fatal: Fatal) -> ! {
    match fatal.action() {
        FatalAction::Restart => {
            error!("{fatal}; restarting");
            thread::sleep(Duration::from_secs(1));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        FatalAction::Halt => {
            error!("{fatal}; halting");
            thread::sleep(Duration::from_secs(1));
            // No wake source is configured, so this never returns.
            unsafe { esp_idf_svc::sys::esp_deep_sleep_start() };
        }
    }

    #[allow(unreachable_code)]
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }

    if runtime.api.basic_auth.is_empty() {
        if let Some(auth) = option_env!("TEMPO_BASIC_AUTH") {
            runtime.api.basic_auth = auth.to_string();
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

struct EspWifiDriver {
    wifi: EspWifi<'static>,
    /// Set while we are the ones tearing the association down.
    leaving: Arc<AtomicBool>,
}

impl EspWifiDriver {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("wifi started in station mode");
        disable_wifi_power_save();

        Ok(Self {
            wifi,
            leaving: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl WifiDriver for EspWifiDriver {
    fn begin_connect(&mut self, _credentials: &NetworkConfig) -> Result<(), LinkError> {
        self.leaving.store(false, Ordering::SeqCst);
        self.wifi
            .connect()
            .map_err(|err| LinkError::Driver(err.to_string()))
    }

    fn is_link_up(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.leaving.store(true, Ordering::SeqCst);
        self.wifi
            .disconnect()
            .map_err(|err| LinkError::Driver(err.to_string()))
    }
}

fn subscribe_disconnects(
    sys_loop: &EspSystemEventLoop,
    leaving: Arc<AtomicBool>,
    events: Sender<LinkEvent>,
) -> anyhow::Result<EspSubscription<'static, System>> {
    let subscription = sys_loop.subscribe::<WifiEvent, _>(move |event| {
        if let WifiEvent::StaDisconnected(_) = event {
            let reason = if leaving.load(Ordering::SeqCst) {
                DisconnectReason::ASSOC_LEAVE
            } else {
                DisconnectReason::UNSPECIFIED
            };
            let _ = events.send(LinkEvent::Lost(reason));
        }
    })?;
    Ok(subscription)
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

/// Task watchdog bound to whichever task is waiting.
struct EspTaskWatchdog;

impl Watchdog for EspTaskWatchdog {
    fn arm(&self, timeout: Duration) -> Result<(), String> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };

        let mut rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reconfigure(&config) };
        if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE as esp_err_t {
            rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
        }
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(format!("esp_task_wdt init failed with code {rc}"));
        }

        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
        if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_ARG as esp_err_t {
            return Ok(());
        }
        Err(format!("esp_task_wdt_add failed with code {rc}"))
    }

    fn disarm(&self) {
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_delete(core::ptr::null_mut()) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("esp_task_wdt_delete failed with code {rc}");
        }
    }
}

#[derive(Default)]
struct EspSntpSource {
    sntp: Option<EspSntp<'static>>,
}

impl TimeSource for EspSntpSource {
    fn start_sync(&mut self, server: &str) -> Result<(), TimeError> {
        let mut conf = SntpConf::default();
        conf.servers[0] = server;
        let sntp = EspSntp::new(&conf).map_err(|err| TimeError::Source(err.to_string()))?;
        info!("SNTP started against `{server}`");
        self.sntp = Some(sntp);
        Ok(())
    }

    fn is_synced(&self) -> bool {
        self.sntp
            .as_ref()
            .is_some_and(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One TLS connection per request, verified against the certificate bundle.
struct EspHttpTransport;

fn transport_error(err: EspIOError) -> TransportError {
    let code = err.0.code();
    if code == esp_idf_svc::sys::ESP_ERR_HTTP_EAGAIN as esp_err_t
        || code == esp_idf_svc::sys::ESP_ERR_TIMEOUT as esp_err_t
    {
        TransportError::Timeout
    } else if code == esp_idf_svc::sys::ESP_ERR_HTTP_CONNECT as esp_err_t {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

impl HttpTransport for EspHttpTransport {
    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf)
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let mut client = HttpClient::wrap(connection);

        let request = client
            .request(Method::Get, url, headers)
            .map_err(transport_error)?;
        let mut response = request.submit().map_err(transport_error)?;
        let status = response.status();

        let mut body = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            let read = response.read(&mut chunk).map_err(transport_error)?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_RESPONSE_BYTES {
                return Err(TransportError::BodyTooLarge(MAX_RESPONSE_BYTES));
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse { status, body })
    }
}
