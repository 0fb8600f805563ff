//! Wireless association lifecycle with silent reconnection.

use std::{
    fmt,
    sync::{
        mpsc::{Receiver, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use crate::{
    config::NetworkConfig,
    error::{Fatal, LinkError},
    watchdog::{await_condition, Clock, Watchdog},
};

const EVENT_LOOP_STACK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

/// 802.11 / ESP-IDF disconnect reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectReason(pub u16);

impl DisconnectReason {
    pub const UNSPECIFIED: Self = Self(1);
    pub const AUTH_EXPIRE: Self = Self(2);
    /// Sent when this station leaves on request.
    pub const ASSOC_LEAVE: Self = Self(8);
    pub const BEACON_TIMEOUT: Self = Self(200);
    pub const NO_AP_FOUND: Self = Self(201);
    pub const AUTH_FAIL: Self = Self(202);
    pub const CONNECTION_FAIL: Self = Self(205);

    pub fn is_voluntary(self) -> bool {
        self == Self::ASSOC_LEAVE
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::UNSPECIFIED => "unspecified",
            Self::AUTH_EXPIRE => "auth expired",
            Self::ASSOC_LEAVE => "left",
            Self::BEACON_TIMEOUT => "beacon timeout",
            Self::NO_AP_FOUND => "no AP found",
            Self::AUTH_FAIL => "auth failed",
            Self::CONNECTION_FAIL => "connection failed",
            _ => "other",
        };
        write!(f, "{name} ({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Lost(DisconnectReason),
}

pub trait WifiDriver: Send {
    /// Issues an association request without waiting for the outcome.
    fn begin_connect(&mut self, credentials: &NetworkConfig) -> Result<(), LinkError>;
    /// Associated and holding an address.
    fn is_link_up(&self) -> bool;
    fn disconnect(&mut self) -> Result<(), LinkError>;
}

struct Inner<D, C, W> {
    driver: Mutex<D>,
    state: Mutex<LinkState>,
    connecting: Mutex<()>,
    credentials: NetworkConfig,
    clock: C,
    watchdog: W,
}

/// Owns the association and repairs it when the link drops.
pub struct ConnectivitySupervisor<D, C, W> {
    inner: Arc<Inner<D, C, W>>,
}

impl<D, C, W> Clone for ConnectivitySupervisor<D, C, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D, C, W> ConnectivitySupervisor<D, C, W>
where
    D: WifiDriver + 'static,
    C: Clock + 'static,
    W: Watchdog + 'static,
{
    pub fn new(driver: D, credentials: NetworkConfig, clock: C, watchdog: W) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver: Mutex::new(driver),
                state: Mutex::new(LinkState::Disconnected),
                connecting: Mutex::new(()),
                credentials,
                clock,
                watchdog,
            }),
        }
    }

    pub fn clock(&self) -> &C {
        &self.inner.clock
    }

    pub fn watchdog(&self) -> &W {
        &self.inner.watchdog
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: LinkState) {
        let mut current = lock(&self.inner.state);
        if *current != state {
            log::info!("wifi {} -> {}", current.as_str(), state.as_str());
            *current = state;
        }
    }

    /// Blocks until associated. A timeout is fatal.
    pub fn connect(&self) -> Result<(), Fatal> {
        let _serial = lock(&self.inner.connecting);
        let credentials = &self.inner.credentials;

        self.set_state(LinkState::Connecting);
        log::info!("wifi connecting to `{}`", credentials.wifi_ssid);
        if let Err(err) = lock(&self.inner.driver).begin_connect(credentials) {
            log::warn!("wifi association request failed: {err}");
        }

        let waited = await_condition(
            &self.inner.clock,
            &self.inner.watchdog,
            "wifi association",
            credentials.connect_timeout_secs,
            || lock(&self.inner.driver).is_link_up(),
        );

        match waited {
            Ok(()) => {
                self.set_state(LinkState::Connected);
                Ok(())
            }
            Err(fatal) => {
                self.set_state(LinkState::Disconnected);
                Err(fatal)
            }
        }
    }

    /// Leaves the network on purpose; the resulting loss event is ignored.
    pub fn disconnect(&self) -> Result<(), LinkError> {
        lock(&self.inner.driver).disconnect()?;
        self.set_state(LinkState::Disconnected);
        Ok(())
    }

    pub fn handle_event(&self, event: LinkEvent) -> Result<(), Fatal> {
        let LinkEvent::Lost(reason) = event;

        if reason.is_voluntary() {
            log::info!("wifi left network: {reason}");
            self.set_state(LinkState::Disconnected);
            return Ok(());
        }

        if self.state() == LinkState::Connecting {
            // The pending connect keeps its own deadline; just ask again.
            log::warn!("wifi association attempt dropped: {reason}; retrying");
            if let Err(err) = lock(&self.inner.driver).begin_connect(&self.inner.credentials) {
                log::warn!("wifi association request failed: {err}");
            }
            return Ok(());
        }

        log::warn!("wifi link lost: {reason}; reconnecting");
        self.connect()
    }

    /// Consumes link events on a dedicated thread. Fatal outcomes are handed
    /// to the owner of `fatal`, which decides on the restart.
    pub fn spawn_event_loop(
        &self,
        events: Receiver<LinkEvent>,
        fatal: Sender<Fatal>,
    ) -> std::io::Result<JoinHandle<()>> {
        let supervisor = self.clone();
        thread::Builder::new()
            .name("wifi-supervisor".to_string())
            .stack_size(EVENT_LOOP_STACK_SIZE)
            .spawn(move || {
                for event in events {
                    if let Err(err) = supervisor.handle_event(event) {
                        log::warn!("wifi supervisor giving up: {err}");
                        let _ = fatal.send(err);
                        break;
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;
    use crate::watchdog::testing::{ManualClock, RecordingWatchdog};

    #[derive(Clone, Default)]
    struct FakeDriver {
        up: Arc<AtomicBool>,
        requests: Arc<AtomicU32>,
        associates: bool,
    }

    impl WifiDriver for FakeDriver {
        fn begin_connect(&mut self, _credentials: &NetworkConfig) -> Result<(), LinkError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.associates {
                self.up.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn is_link_up(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn disconnect(&mut self) -> Result<(), LinkError> {
            self.up.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn credentials() -> NetworkConfig {
        NetworkConfig {
            wifi_ssid: "home".to_string(),
            wifi_pass: "secret".to_string(),
            connect_timeout_secs: 5,
        }
    }

    fn supervisor(
        driver: FakeDriver,
    ) -> ConnectivitySupervisor<FakeDriver, ManualClock, RecordingWatchdog> {
        ConnectivitySupervisor::new(
            driver,
            credentials(),
            ManualClock::default(),
            RecordingWatchdog::default(),
        )
    }

    #[test]
    fn connect_reaches_connected() {
        let driver = FakeDriver {
            associates: true,
            ..Default::default()
        };
        let supervisor = supervisor(driver.clone());

        assert_eq!(supervisor.state(), LinkState::Disconnected);
        supervisor.connect().unwrap();
        assert_eq!(supervisor.state(), LinkState::Connected);
        assert_eq!(driver.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connect_timeout_is_fatal() {
        let supervisor = supervisor(FakeDriver::default());

        let err = supervisor.connect().unwrap_err();

        assert!(matches!(
            err,
            Fatal::Timeout {
                what: "wifi association",
                timeout_secs: 5
            }
        ));
        assert_eq!(supervisor.state(), LinkState::Disconnected);
    }

    #[test]
    fn voluntary_loss_stays_disconnected() {
        let driver = FakeDriver {
            associates: true,
            ..Default::default()
        };
        let supervisor = supervisor(driver.clone());
        supervisor.connect().unwrap();

        supervisor.disconnect().unwrap();
        supervisor
            .handle_event(LinkEvent::Lost(DisconnectReason::ASSOC_LEAVE))
            .unwrap();

        assert_eq!(supervisor.state(), LinkState::Disconnected);
        assert_eq!(driver.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loss_while_connecting_reissues_request() {
        let driver = FakeDriver::default();
        let supervisor = supervisor(driver.clone());
        supervisor.set_state(LinkState::Connecting);

        supervisor
            .handle_event(LinkEvent::Lost(DisconnectReason::NO_AP_FOUND))
            .unwrap();

        assert_eq!(supervisor.state(), LinkState::Connecting);
        assert_eq!(driver.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn accidental_loss_heals_without_caller() {
        let driver = FakeDriver {
            associates: true,
            ..Default::default()
        };
        let supervisor = supervisor(driver.clone());
        supervisor.connect().unwrap();

        let (events_tx, events_rx) = mpsc::channel();
        let (fatal_tx, fatal_rx) = mpsc::channel();
        let handle = supervisor.spawn_event_loop(events_rx, fatal_tx).unwrap();

        driver.up.store(false, Ordering::SeqCst);
        events_tx
            .send(LinkEvent::Lost(DisconnectReason::BEACON_TIMEOUT))
            .unwrap();
        drop(events_tx);
        handle.join().unwrap();

        assert_eq!(supervisor.state(), LinkState::Connected);
        assert_eq!(driver.requests.load(Ordering::SeqCst), 2);
        assert!(fatal_rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn failed_reconnect_is_forwarded_as_fatal() {
        let driver = FakeDriver {
            associates: true,
            ..Default::default()
        };
        let supervisor = supervisor(driver.clone());
        supervisor.connect().unwrap();

        let (events_tx, events_rx) = mpsc::channel();
        let (fatal_tx, fatal_rx) = mpsc::channel();
        let handle = supervisor.spawn_event_loop(events_rx, fatal_tx).unwrap();

        // The access point is gone for good.
        let mut driver = driver;
        driver.associates = false;
        *lock(&supervisor.inner.driver) = driver.clone();
        driver.up.store(false, Ordering::SeqCst);

        events_tx
            .send(LinkEvent::Lost(DisconnectReason::BEACON_TIMEOUT))
            .unwrap();
        handle.join().unwrap();

        let fatal = fatal_rx.recv().unwrap();
        assert!(matches!(fatal, Fatal::Timeout { .. }));
        assert_eq!(supervisor.state(), LinkState::Disconnected);
    }
}
