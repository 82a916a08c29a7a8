//! Network attachment: join the configured station network or expose the
//! open recovery access point.
//!
//! ```text
//!     Uninitialized -- init --> Idle
//!     Idle -- try_connect_station (no creds) --> Idle            (false)
//!     Idle -- try_connect_station --> StationConnecting
//!     StationConnecting -- GOT_IP --> StationConnected           (true)
//!     StationConnecting -- retries exhausted | timeout --> Idle  (false, radio stopped)
//!     Idle -- start_recovery_ap --> RecoveryAp
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::{AccessPointConfig, StationPolicy};
use crate::event_set::{EventSet, CONNECTED, FAILED};
use crate::settings::{SettingsStore, StorageMedium, StoreError, WifiCredentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Uninitialized,
    Idle,
    StationConnecting { retries: u8 },
    StationConnected,
    RecoveryAp,
    Failed,
}

/// Link events delivered by the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    StationStarted,
    Disconnected,
    GotIp,
}

/// What the driver must do in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Connect,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioError {
    pub op: &'static str,
    pub code: i32,
}

impl RadioError {
    pub fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with {}", self.op, self.code)
    }
}

impl std::error::Error for RadioError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    InvalidState(NetworkState),
    Radio(RadioError),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::InvalidState(state) => write!(f, "operation not allowed in state {state:?}"),
            NetworkError::Radio(e) => write!(f, "radio: {e}"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<RadioError> for NetworkError {
    fn from(e: RadioError) -> Self {
        NetworkError::Radio(e)
    }
}

/// The radio singleton. Only [`NetworkAttacher`] drives it.
pub trait Radio {
    /// Keeps event delivery alive; dropping it unregisters every handler.
    type Subscription;

    /// Brings up the driver stack without starting the radio.
    fn init(&mut self) -> Result<(), RadioError>;

    /// Routes station and IP events into `monitor` and performs the
    /// returned [`Reaction`].
    fn subscribe(&mut self, monitor: Arc<LinkMonitor>) -> Result<Self::Subscription, RadioError>;

    fn configure_station(&mut self, creds: &WifiCredentials) -> Result<(), RadioError>;

    fn start(&mut self) -> Result<(), RadioError>;

    fn stop(&mut self) -> Result<(), RadioError>;

    /// Configures and starts an open access point.
    fn start_access_point(&mut self, ap: &AccessPointConfig) -> Result<(), RadioError>;
}

/// Counts consecutive disconnects of one station attempt and raises the
/// outcome bits.
#[derive(Debug)]
pub struct LinkMonitor {
    events: EventSet,
    disconnects: AtomicU8,
    max_retries: u8,
}

impl LinkMonitor {
    pub fn new(max_retries: u8) -> Self {
        Self {
            events: EventSet::new(),
            disconnects: AtomicU8::new(0),
            max_retries,
        }
    }

    pub fn handle(&self, event: RadioEvent) -> Reaction {
        match event {
            RadioEvent::StationStarted => Reaction::Connect,
            RadioEvent::Disconnected => {
                let count = self.disconnects.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                if count < self.max_retries {
                    log::info!("Retry {}/{}", count, self.max_retries);
                    Reaction::Connect
                } else {
                    log::warn!("Disconnected {} times in a row, giving up", count);
                    self.events.set(FAILED);
                    Reaction::Nothing
                }
            }
            RadioEvent::GotIp => {
                self.disconnects.store(0, Ordering::SeqCst);
                self.events.set(CONNECTED);
                Reaction::Nothing
            }
        }
    }

    pub fn disconnects(&self) -> u8 {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn wait(&self, timeout: std::time::Duration) -> u32 {
        self.events.wait_any(CONNECTED | FAILED, timeout)
    }
}

pub struct NetworkAttacher<R, M> {
    radio: R,
    settings: Arc<SettingsStore<M>>,
    policy: StationPolicy,
    ap: AccessPointConfig,
    fallback: Option<WifiCredentials>,
    state: NetworkState,
}

impl<R: Radio, M: StorageMedium> NetworkAttacher<R, M> {
    pub fn new(radio: R, settings: Arc<SettingsStore<M>>, policy: StationPolicy, ap: AccessPointConfig) -> Self {
        Self {
            radio,
            settings,
            policy,
            ap,
            fallback: None,
            state: NetworkState::Uninitialized,
        }
    }

    /// Credentials to try when the store holds none.
    pub fn with_fallback(mut self, fallback: Option<WifiCredentials>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn init(&mut self) -> Result<(), NetworkError> {
        if self.state != NetworkState::Uninitialized {
            return Err(NetworkError::InvalidState(self.state));
        }
        if let Err(e) = self.radio.init() {
            self.state = NetworkState::Failed;
            return Err(e.into());
        }
        self.state = NetworkState::Idle;
        Ok(())
    }

    /// Blocks until the station has an address, the retries are used up, or
    /// the timeout elapses. `Ok(false)` is a failed attempt, not an error;
    /// `Err` means the radio itself misbehaved.
    pub fn try_connect_station(&mut self) -> Result<bool, NetworkError> {
        if self.state != NetworkState::Idle {
            return Err(NetworkError::InvalidState(self.state));
        }

        let Some(creds) = self.station_credentials() else {
            return Ok(false);
        };
        log::info!("Connecting to SSID: {}", creds.ssid);

        let monitor = Arc::new(LinkMonitor::new(self.policy.max_retries));
        self.state = NetworkState::StationConnecting { retries: 0 };

        match self.attempt(&creds, &monitor) {
            Ok(bits) if bits & CONNECTED != 0 => {
                log::info!("Station connected to '{}'", creds.ssid);
                self.state = NetworkState::StationConnected;
                Ok(true)
            }
            Ok(bits) => {
                if bits & FAILED != 0 {
                    log::warn!("Station gave up after {} disconnects", monitor.disconnects());
                } else {
                    log::warn!(
                        "Station timed out after {:?} ({} disconnects)",
                        self.policy.connect_timeout,
                        monitor.disconnects()
                    );
                }
                self.state = NetworkState::StationConnecting { retries: monitor.disconnects() };
                if let Err(e) = self.radio.stop() {
                    log::warn!("Failed to stop radio after station failure: {e}");
                }
                self.state = NetworkState::Idle;
                Ok(false)
            }
            Err(e) => {
                log::error!("Station attempt aborted: {e}");
                if let Err(stop) = self.radio.stop() {
                    log::warn!("Failed to stop radio after aborted attempt: {stop}");
                }
                self.state = NetworkState::Failed;
                Err(e.into())
            }
        }
    }

    pub fn start_recovery_ap(&mut self) -> Result<(), NetworkError> {
        if self.state != NetworkState::Idle {
            return Err(NetworkError::InvalidState(self.state));
        }
        match self.radio.start_access_point(&self.ap) {
            Ok(()) => {
                log::info!(
                    "Recovery AP '{}' started (open, channel {}, max {} clients)",
                    self.ap.ssid,
                    self.ap.channel,
                    self.ap.max_clients
                );
                self.state = NetworkState::RecoveryAp;
                Ok(())
            }
            Err(e) => {
                self.state = NetworkState::Failed;
                Err(e.into())
            }
        }
    }

    fn station_credentials(&self) -> Option<WifiCredentials> {
        match self.settings.get_wifi_creds() {
            Ok(creds) => Some(creds),
            Err(StoreError::NotFound) => match &self.fallback {
                Some(creds) => {
                    log::info!("No credentials in store, using built-in network '{}'", creds.ssid);
                    Some(creds.clone())
                }
                None => {
                    log::warn!("No credentials in store.");
                    None
                }
            },
            Err(e) => {
                log::warn!("Stored credentials unusable: {e}");
                None
            }
        }
    }

    /// The subscription lives only inside this call, so it is released on
    /// every return path before the radio is touched again.
    fn attempt(&mut self, creds: &WifiCredentials, monitor: &Arc<LinkMonitor>) -> Result<u32, RadioError> {
        let _subscription = self.radio.subscribe(Arc::clone(monitor))?;
        self.radio.configure_station(creds)?;
        self.radio.start()?;
        log::info!("Waiting for WiFi...");
        Ok(monitor.wait(self.policy.connect_timeout))
    }
}
