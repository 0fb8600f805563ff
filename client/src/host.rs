use std::{
    io::{ErrorKind, Read},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use tracing::{error, info, warn};

use tempo_common::{
    error::{LinkError, TimeError},
    tempo::MAX_RESPONSE_BYTES,
    ConnectivitySupervisor, DisconnectReason, Fatal, FatalAction, HttpResponse, HttpTransport,
    LinkEvent, NetworkConfig, PipelineReport, RuntimeConfig, SystemClock, TempoApi, TimeBase,
    TimeSource, TransportError, Watchdog, WifiDriver,
};

/// Exit status asking the service manager for a fresh start (EX_TEMPFAIL).
const RESTART_EXIT_CODE: i32 = 75;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("TEMPO_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.tempo/runtime.json"));
    let mut runtime = load_runtime_config(&config_path).await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from {}: {err:#}", config_path.display());
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();

    info!("access to the RTE API \"Tempo Like Supply Contract\"");
    let outcome = tokio::task::spawn_blocking(move || run_once(&runtime))
        .await
        .context("pipeline task panicked")?;

    match outcome {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(fatal) => match fatal.action() {
            FatalAction::Restart => {
                error!("{fatal}; exiting for restart");
                std::process::exit(RESTART_EXIT_CODE);
            }
            FatalAction::Halt => {
                error!("{fatal}; halted, press ctrl-c to exit");
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to wait for ctrl-c")?;
                Ok(())
            }
        },
    }
}

fn run_once(runtime: &RuntimeConfig) -> Result<PipelineReport, Fatal> {
    let target = reachability_target(&runtime.api.token_url)
        .ok_or_else(|| Fatal::Config(format!("token url `{}` has no host", runtime.api.token_url)))?;

    let (events_tx, events_rx) = mpsc::channel();
    let (fatal_tx, fatal_rx) = mpsc::channel();

    let driver = HostLink::new(target);
    driver
        .spawn_monitor(events_tx)
        .map_err(|err| service_error("link monitor", err))?;

    let link = ConnectivitySupervisor::new(
        driver,
        runtime.network.clone(),
        SystemClock,
        HostWatchdog::default(),
    );
    link.spawn_event_loop(events_rx, fatal_tx)
        .map_err(|err| service_error("link supervisor", err))?;

    let transport = ReqwestTransport::new().map_err(|err| service_error("http client", err))?;
    let mut api = TempoApi::new(transport);
    let mut time = TimeBase::new(HostTimeSource::default(), runtime.time.ambiguity);

    let report = tempo_common::run_pipeline(runtime, &link, &mut time, &mut api)?;
    if let Ok(fatal) = fatal_rx.try_recv() {
        return Err(fatal);
    }
    Ok(report)
}

fn service_error(what: &'static str, err: impl std::fmt::Display) -> Fatal {
    Fatal::Service {
        what,
        reason: err.to_string(),
    }
}

fn print_report(report: &PipelineReport) {
    if let Some(section) = &report.custom {
        println!("\nGET CUSTOM DAY TEMPO COLOR\n{section}");
    }
    if let Some(section) = &report.today {
        println!("\nGET CURRENT DAY TEMPO COLOR\n{section}");
    }
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(ssid) = lookup("WIFI_SSID") {
        runtime.network.wifi_ssid = ssid;
    }
    if let Some(pass) = lookup("WIFI_PASS") {
        runtime.network.wifi_pass = pass;
    }
    if let Some(auth) = lookup("TEMPO_BASIC_AUTH") {
        runtime.api.basic_auth = auth;
    }
    if let Some(timezone) = lookup("TEMPO_TIMEZONE") {
        runtime.time.timezone = timezone;
    }
    if let Some(server) = lookup("TEMPO_NTP_SERVER") {
        runtime.time.ntp_server = server;
    }
}

/// `host:port` to test for reachability, taken from an http(s) URL.
fn reachability_target(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str().filter(|host| !host.is_empty())?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

fn reachable(target: &str) -> bool {
    let Ok(addrs) = target.to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok())
}

/// The host has no radio: "associated" means the API host answers on TCP.
#[derive(Clone)]
struct HostLink {
    target: Arc<str>,
    enabled: Arc<AtomicBool>,
}

impl HostLink {
    fn new(target: String) -> Self {
        Self {
            target: target.into(),
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_monitor(&self, events: Sender<LinkEvent>) -> std::io::Result<()> {
        let link = self.clone();
        thread::Builder::new()
            .name("link-monitor".to_string())
            .spawn(move || {
                let mut was_up = false;
                loop {
                    thread::sleep(MONITOR_INTERVAL);
                    let event = if !link.enabled.load(Ordering::SeqCst) {
                        was_up.then_some(LinkEvent::Lost(DisconnectReason::ASSOC_LEAVE))
                    } else if reachable(&link.target) {
                        was_up = true;
                        None
                    } else {
                        was_up.then_some(LinkEvent::Lost(DisconnectReason::BEACON_TIMEOUT))
                    };

                    if let Some(event) = event {
                        was_up = false;
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                }
            })
            .map(|_| ())
    }
}

impl WifiDriver for HostLink {
    fn begin_connect(&mut self, _credentials: &NetworkConfig) -> Result<(), LinkError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_link_up(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && reachable(&self.target)
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Exits the process if a wait outlives its deadline.
#[derive(Clone, Default)]
struct HostWatchdog {
    generation: Arc<AtomicU64>,
}

impl Watchdog for HostWatchdog {
    fn arm(&self, timeout: Duration) -> Result<(), String> {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                thread::sleep(timeout);
                if generation.load(Ordering::SeqCst) == armed {
                    error!("watchdog expired after {}s", timeout.as_secs());
                    std::process::exit(RESTART_EXIT_CODE);
                }
            })
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    fn disarm(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Trusts the operating system clock once it looks plausible.
#[derive(Default)]
struct HostTimeSource {
    server: Option<String>,
}

fn plausible(now: DateTime<Utc>) -> bool {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .is_some_and(|floor| now >= floor)
}

impl TimeSource for HostTimeSource {
    fn start_sync(&mut self, server: &str) -> Result<(), TimeError> {
        info!("host clock is kept by the OS; configured NTP server `{server}` is informational");
        self.server = Some(server.to_string());
        Ok(())
    }

    fn is_synced(&self) -> bool {
        self.server.is_some() && plausible(Utc::now())
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Blocking reqwest client with no connection reuse.
struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().map_err(transport_error)?;
        let status = response.status().as_u16();
        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_BYTES as u64)
        {
            return Err(TransportError::BodyTooLarge(MAX_RESPONSE_BYTES));
        }

        let mut body = Vec::new();
        response
            .take(MAX_RESPONSE_BYTES as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|err| match err.kind() {
                ErrorKind::TimedOut => TransportError::Timeout,
                _ => TransportError::Io(err.to_string()),
            })?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(TransportError::BodyTooLarge(MAX_RESPONSE_BYTES));
        }

        Ok(HttpResponse { status, body })
    }
}
