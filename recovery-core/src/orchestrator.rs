//! Boot sequence for the recovery agent.
//!
//! Store first, then the radio, then a station attempt with fallback to the
//! recovery access point, then the control surface. A station attempt that
//! merely fails is the normal path into recovery mode; only a radio error
//! aborts the boot.

use std::fmt;
use std::sync::Arc;

use crate::network::{NetworkAttacher, NetworkError, NetworkState, Radio};
use crate::settings::{SettingsStore, StorageMedium, StoreError};

/// The outward-facing server. `start` runs once the network is attached and
/// must restore any persisted session before accepting requests.
pub trait ControlSurface {
    type Error: fmt::Display;

    fn start(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Station,
    RecoveryAp,
}

impl fmt::Display for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachment::Station => write!(f, "station"),
            Attachment::RecoveryAp => write!(f, "recovery access point"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    Store(StoreError),
    Radio(NetworkError),
    Station(NetworkError),
    AccessPoint(NetworkError),
    Server(String),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Store(e) => write!(f, "settings store init failed: {e}"),
            BootError::Radio(e) => write!(f, "radio init failed: {e}"),
            BootError::Station(e) => write!(f, "station attempt errored: {e}"),
            BootError::AccessPoint(e) => write!(f, "recovery AP failed to start: {e}"),
            BootError::Server(e) => write!(f, "control server failed to start: {e}"),
        }
    }
}

impl std::error::Error for BootError {}

pub struct Orchestrator<R, M> {
    settings: Arc<SettingsStore<M>>,
    network: NetworkAttacher<R, M>,
}

impl<R: Radio, M: StorageMedium> Orchestrator<R, M> {
    pub fn new(settings: Arc<SettingsStore<M>>, network: NetworkAttacher<R, M>) -> Self {
        Self { settings, network }
    }

    pub fn network(&self) -> &NetworkAttacher<R, M> {
        &self.network
    }

    /// Runs the whole startup sequence and returns how the device is
    /// reachable.
    pub fn boot<S: ControlSurface>(&mut self, surface: &mut S) -> Result<Attachment, BootError> {
        self.settings.init().map_err(BootError::Store)?;
        self.network.init().map_err(BootError::Radio)?;

        let attachment = self.attach()?;

        surface.start().map_err(|e| BootError::Server(e.to_string()))?;
        log::info!("Recovery agent ready on {attachment}");
        Ok(attachment)
    }

    /// Parks the calling thread for good; all further work happens on the
    /// server's threads.
    pub fn idle(self) -> ! {
        // Keep the radio and store alive for as long as the device runs.
        let _keep = self;
        loop {
            std::thread::park();
        }
    }

    fn attach(&mut self) -> Result<Attachment, BootError> {
        match self.network.try_connect_station() {
            Ok(true) => Ok(Attachment::Station),
            Ok(false) => {
                log::warn!("Station unavailable, starting recovery AP");
                self.network.start_recovery_ap().map_err(BootError::AccessPoint)?;
                debug_assert_eq!(self.network.state(), NetworkState::RecoveryAp);
                Ok(Attachment::RecoveryAp)
            }
            Err(e) => Err(BootError::Station(e)),
        }
    }
}
