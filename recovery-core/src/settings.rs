//! Persistent settings: WiFi credentials, master password, session token.
//!
//! The store is the only writable resource shared between components. All
//! access goes through [`SettingsStore`], which serializes transactions on
//! the medium and enforces the length bounds of every field.

use std::fmt;
use std::sync::Mutex;

use heapless::String as BoundedString;

use crate::config::{StoreKeys, KEY_MASTER_PASSWORD, KEY_SESSION_TOKEN, PASSWORD_MAX_LEN, SSID_MAX_LEN};
use crate::session::SessionToken;

/// Why mounting the medium failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountError {
    /// The partition has no free pages left.
    NoFreePages,
    /// The partition was written by a newer format version.
    VersionMismatch,
    /// Any other driver failure, with its raw code.
    Driver(i32),
}

impl MountError {
    /// Failures that an erase is expected to fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MountError::NoFreePages | MountError::VersionMismatch)
    }
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountError::NoFreePages => write!(f, "no free pages"),
            MountError::VersionMismatch => write!(f, "format version mismatch"),
            MountError::Driver(code) => write!(f, "driver error {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    InvalidLength,
    InvalidArgument,
    /// Mount failed and could not be healed.
    Mount(MountError),
    /// Open, read, write or commit failed in the driver.
    Driver(i32),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "key not found"),
            StoreError::InvalidLength => write!(f, "value exceeds its length bound"),
            StoreError::InvalidArgument => write!(f, "invalid argument"),
            StoreError::Mount(e) => write!(f, "store mount failed: {e}"),
            StoreError::Driver(code) => write!(f, "store driver error {code}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A non-volatile key/value medium bound to a single namespace.
///
/// Implementations must serialize their own driver access; the store adds
/// one more lock so that a read-modify sequence is never interleaved.
pub trait StorageMedium: Send + Sync {
    fn mount(&self) -> Result<(), MountError>;

    fn erase(&self) -> Result<(), StoreError>;

    /// Copies the value of `key` into `buf` and returns its length, or
    /// `None` when the key is absent. A stored value longer than `buf`
    /// fails with [`StoreError::InvalidLength`] and leaves `buf` untouched.
    fn read(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, StoreError>;

    /// Writes the entries in order and commits once. A failed entry may
    /// leave the ones before it written; [`SettingsStore`] restores them.
    fn write(&self, entries: &[(&str, &str)]) -> Result<(), StoreError>;

    /// Removes `key`. Removing an absent key succeeds.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: BoundedString<SSID_MAX_LEN>,
    pub password: BoundedString<PASSWORD_MAX_LEN>,
}

impl WifiCredentials {
    /// SSID must be 1-32 bytes, password at most 64 bytes.
    pub fn new(ssid: &str, password: &str) -> Result<Self, StoreError> {
        if ssid.is_empty() {
            return Err(StoreError::InvalidLength);
        }
        Ok(Self {
            ssid: BoundedString::try_from(ssid).map_err(|_| StoreError::InvalidLength)?,
            password: BoundedString::try_from(password).map_err(|_| StoreError::InvalidLength)?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

pub struct SettingsStore<M> {
    medium: M,
    keys: StoreKeys,
    default_master: BoundedString<PASSWORD_MAX_LEN>,
    lock: Mutex<()>,
}

impl<M: StorageMedium> SettingsStore<M> {
    /// `default_master` is the compiled-in master password used whenever the
    /// store has none.
    pub fn new(medium: M, keys: StoreKeys, default_master: &str) -> Result<Self, StoreError> {
        let default_master =
            BoundedString::try_from(default_master).map_err(|_| StoreError::InvalidLength)?;
        Ok(Self {
            medium,
            keys,
            default_master,
            lock: Mutex::new(()),
        })
    }

    /// Mounts the medium. A full or version-mismatched partition is erased
    /// and mounted again, once. Settings are lost but the device boots.
    pub fn init(&self) -> Result<(), StoreError> {
        let _guard = self.transaction();
        match self.medium.mount() {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                log::warn!("Settings store corrupt or full ({e}). Erasing...");
                self.medium.erase().map_err(|err| {
                    log::error!("Failed to erase settings store: {err}");
                    err
                })?;
                self.medium.mount().map_err(|err| {
                    log::error!("Settings store still unusable after erase: {err}");
                    StoreError::Mount(err)
                })?;
                log::info!("Settings store erased and remounted");
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to mount settings store: {e}");
                Err(StoreError::Mount(e))
            }
        }
    }

    /// Fails with `NotFound` when no SSID is stored. A missing password
    /// with an SSID present reads as an open network.
    pub fn get_wifi_creds(&self) -> Result<WifiCredentials, StoreError> {
        let _guard = self.transaction();
        let ssid = self
            .read_bounded::<SSID_MAX_LEN>(self.keys.ssid)?
            .filter(|ssid| !ssid.is_empty())
            .ok_or(StoreError::NotFound)?;
        let password = self
            .read_bounded::<PASSWORD_MAX_LEN>(self.keys.password)?
            .unwrap_or_default();
        Ok(WifiCredentials { ssid, password })
    }

    pub fn set_wifi_creds(&self, ssid: &str, password: &str) -> Result<(), StoreError> {
        let creds = WifiCredentials::new(ssid, password)?;
        let _guard = self.transaction();
        let previous = [
            (self.keys.ssid, self.snapshot::<SSID_MAX_LEN>(self.keys.ssid)),
            (self.keys.password, self.snapshot::<PASSWORD_MAX_LEN>(self.keys.password)),
        ];
        if let Err(e) = self.medium.write(&[
            (self.keys.ssid, creds.ssid.as_str()),
            (self.keys.password, creds.password.as_str()),
        ]) {
            log::error!("Writing WiFi credentials failed ({e}), restoring previous values");
            self.restore(&previous);
            return Err(e);
        }
        log::info!("WiFi credentials saved for SSID '{}'", creds.ssid);
        Ok(())
    }

    /// Never fails: an absent or unreadable value yields the compiled-in
    /// default.
    pub fn get_master_password(&self) -> BoundedString<PASSWORD_MAX_LEN> {
        let _guard = self.transaction();
        match self.read_bounded::<PASSWORD_MAX_LEN>(KEY_MASTER_PASSWORD) {
            Ok(Some(password)) => password,
            Ok(None) => self.default_master.clone(),
            Err(e) => {
                log::warn!("Master password unreadable ({e}), using built-in default");
                self.default_master.clone()
            }
        }
    }

    /// A stored value that is not a well-formed token reads as absent.
    pub fn get_session_token(&self) -> Result<Option<SessionToken>, StoreError> {
        let _guard = self.transaction();
        let Some(raw) = self.read_bounded::<{ crate::config::TOKEN_LEN }>(KEY_SESSION_TOKEN)? else {
            return Ok(None);
        };
        let token = SessionToken::parse(&raw);
        if token.is_none() && !raw.is_empty() {
            log::warn!("Ignoring malformed session token in store");
        }
        Ok(token)
    }

    pub fn set_session_token(&self, token: &str) -> Result<(), StoreError> {
        let token = SessionToken::parse(token).ok_or(StoreError::InvalidArgument)?;
        let _guard = self.transaction();
        self.medium.write(&[(KEY_SESSION_TOKEN, token.as_str())])
    }

    pub fn clear_session_token(&self) -> Result<(), StoreError> {
        let _guard = self.transaction();
        self.medium.remove(KEY_SESSION_TOKEN)
    }

    fn read_bounded<const N: usize>(&self, key: &str) -> Result<Option<BoundedString<N>>, StoreError> {
        let mut buf = [0u8; N];
        let Some(len) = self.medium.read(key, &mut buf)? else {
            return Ok(None);
        };
        let bytes = buf.get(..len).ok_or(StoreError::InvalidLength)?;
        let text = core::str::from_utf8(bytes).map_err(|_| StoreError::InvalidArgument)?;
        BoundedString::try_from(text)
            .map(Some)
            .map_err(|_| StoreError::InvalidLength)
    }

    fn snapshot<const N: usize>(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_bounded::<N>(key)?.map(|value| value.as_str().to_string()))
    }

    /// Puts back values captured by [`Self::snapshot`]. Keys whose previous
    /// value could not be read are left alone.
    fn restore(&self, previous: &[(&str, Result<Option<String>, StoreError>)]) {
        for (key, value) in previous {
            let result = match value {
                Ok(Some(value)) => self.medium.write(&[(*key, value.as_str())]),
                Ok(None) => self.medium.remove(key),
                Err(_) => continue,
            };
            if let Err(e) = result {
                log::error!("Could not restore '{key}': {e}");
            }
        }
    }

    fn transaction(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
