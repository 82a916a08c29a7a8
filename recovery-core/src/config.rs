/// Tunables and fixed identifiers shared by every component.
use std::time::Duration;

/// Longest SSID the radio accepts, in bytes.
pub const SSID_MAX_LEN: usize = 32;
/// Longest WPA passphrase, in bytes. The master password shares the bound.
pub const PASSWORD_MAX_LEN: usize = 64;
/// Length of a rendered session token.
pub const TOKEN_LEN: usize = 64;

pub const SETTINGS_NAMESPACE: &str = "app_settings";
pub const KEY_MASTER_PASSWORD: &str = "master_pass";
pub const KEY_SESSION_TOKEN: &str = "auth_token";

pub const RECOVERY_AP_SSID: &str = "ESP_RECOVERY";

/// Delay between sending the final response and restarting.
pub const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Names of the WiFi credential keys. These are chosen at build time so the
/// recovery image can read a store written by the main application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreKeys {
    pub ssid: &'static str,
    pub password: &'static str,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self {
            ssid: "CONFIG_WIFI_SSID",
            password: "CONFIG_WIFI_PASSWORD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationPolicy {
    /// Overall wait for an address.
    pub connect_timeout: Duration,
    /// Consecutive disconnects tolerated before the attempt is failed.
    pub max_retries: u8,
}

impl Default for StationPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: &'static str,
    pub channel: u8,
    pub max_clients: u16,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: RECOVERY_AP_SSID,
            channel: 1,
            max_clients: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub chunk_size: usize,
    pub max_consecutive_timeouts: u8,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            max_consecutive_timeouts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Idle time after which the session is dropped.
    pub idle_timeout: Duration,
    /// Punitive delay before answering a wrong password.
    pub failure_delay: Duration,
    /// `Max-Age` advertised in the cookie, in seconds.
    pub cookie_max_age_secs: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 24 * 60 * 60),
            failure_delay: Duration::from_secs(1),
            cookie_max_age_secs: 2_592_000,
        }
    }
}
