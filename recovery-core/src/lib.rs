//! Recovery Core - hardware-independent logic for the ESP recovery agent
//!
//! Everything that decides *what* the device does lives here, written
//! against small driver traits so it can be tested on the host. The
//! firmware crate supplies the esp-idf implementations of those traits.

pub mod config;
pub mod deferred;
pub mod event_set;
pub mod http;
pub mod network;
pub mod orchestrator;
pub mod session;
pub mod settings;
pub mod update;

#[cfg(test)]
pub(crate) mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{AccessPointConfig, SessionPolicy, StationPolicy, StoreKeys, UpdatePolicy};
pub use deferred::{Restart, RestartScheduler};
pub use http::{RecoveryService, Reply, RequestParts, Route};
pub use network::{LinkMonitor, NetworkAttacher, NetworkError, NetworkState, Radio, RadioError, RadioEvent, Reaction};
pub use orchestrator::{Attachment, BootError, ControlSurface, Orchestrator};
pub use session::{AuthError, Clock, Entropy, SessionAuthority};
pub use settings::{MountError, SettingsStore, StorageMedium, StoreError, WifiCredentials};
pub use update::{
    ByteSource, DriverError, FirmwareSlots, ReadError, SlotInfo, SlotWriter, UpdateEngine, UpdateError, UpdateReport,
};
