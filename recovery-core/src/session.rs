//! Single bearer-token session protecting the control endpoints.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use heapless::String as BoundedString;

use crate::config::{SessionPolicy, TOKEN_LEN};
use crate::settings::{SettingsStore, StorageMedium, StoreError};

/// Monotonic time since boot. Wall-clock time is not trusted across reboots.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Source of random bytes, the hardware RNG on the device.
pub trait Entropy: Send + Sync {
    fn fill_bytes(&self, buf: &mut [u8]);
}

/// 64 lowercase hex characters.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(BoundedString<TOKEN_LEN>);

impl SessionToken {
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed =
            raw.len() == TOKEN_LEN && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !well_formed {
            return None;
        }
        BoundedString::try_from(raw).ok().map(Self)
    }

    pub fn generate(entropy: &dyn Entropy) -> Self {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut raw = [0u8; TOKEN_LEN / 2];
        entropy.fill_bytes(&mut raw);

        let mut token = BoundedString::new();
        for byte in raw {
            // Capacity is exactly two characters per random byte.
            let _ = token.push(HEX[(byte >> 4) as usize] as char);
            let _ = token.push(HEX[(byte & 0x0f) as usize] as char);
        }
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({}…)", &self.0[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    WrongPassword,
    NoSession,
    Expired,
    MissingCookie,
    InvalidToken,
    /// The new token could not be persisted; no session was created.
    Store(StoreError),
}

impl AuthError {
    pub fn is_unauthorized(&self) -> bool {
        !matches!(self, AuthError::Store(_))
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::WrongPassword => write!(f, "Wrong Password"),
            AuthError::NoSession => write!(f, "No active session. Log in first."),
            AuthError::Expired => write!(f, "Session expired."),
            AuthError::MissingCookie => write!(f, "Missing Cookie Header."),
            AuthError::InvalidToken => write!(f, "Invalid Token."),
            AuthError::Store(e) => write!(f, "Failed to persist session: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

struct Session {
    token: SessionToken,
    last_activity: Duration,
}

/// Owns the only session. Other components get a verdict, never the token.
pub struct SessionAuthority<M, C, E> {
    settings: Arc<SettingsStore<M>>,
    clock: C,
    entropy: E,
    policy: SessionPolicy,
    session: Mutex<Option<Session>>,
}

impl<M, C, E> SessionAuthority<M, C, E>
where
    M: StorageMedium,
    C: Clock,
    E: Entropy,
{
    pub fn new(settings: Arc<SettingsStore<M>>, clock: C, entropy: E, policy: SessionPolicy) -> Self {
        Self {
            settings,
            clock,
            entropy,
            policy,
            session: Mutex::new(None),
        }
    }

    /// Restores a persisted token with a fresh idle window starting now.
    pub fn init(&self) {
        match self.settings.get_session_token() {
            Ok(Some(token)) => {
                *self.slot() = Some(Session {
                    token,
                    last_activity: self.clock.now(),
                });
                log::info!("Restored active session from store");
            }
            Ok(None) => log::debug!("No persisted session"),
            Err(e) => log::warn!("Could not read persisted session: {e}"),
        }
    }

    /// On success returns the `Set-Cookie` value for the new token.
    pub fn try_login(&self, submitted: &str) -> Result<String, AuthError> {
        let expected = self.settings.get_master_password();
        if !passwords_match(submitted, &expected) {
            log::warn!("Login failed. Wrong password.");
            std::thread::sleep(self.policy.failure_delay);
            return Err(AuthError::WrongPassword);
        }

        let token = SessionToken::generate(&self.entropy);
        let mut slot = self.slot();
        if let Err(e) = self.settings.set_session_token(token.as_str()) {
            log::error!("Login accepted but token could not be saved: {e}");
            return Err(AuthError::Store(e));
        }
        let cookie = format!(
            "access_token={}; Max-Age={}; Path=/; HttpOnly",
            token.as_str(),
            self.policy.cookie_max_age_secs
        );
        *slot = Some(Session {
            token,
            last_activity: self.clock.now(),
        });
        log::info!("User logged in. Session created.");
        Ok(cookie)
    }

    /// Checks the raw `Cookie` header of a request. The token may appear
    /// anywhere in the header; it is not parsed into name/value pairs.
    pub fn guard(&self, cookie_header: Option<&str>) -> Result<(), AuthError> {
        let now = self.clock.now();
        let mut slot = self.slot();
        let Some(session) = slot.as_mut() else {
            return Err(AuthError::NoSession);
        };

        if now.saturating_sub(session.last_activity) > self.policy.idle_timeout {
            *slot = None;
            if let Err(e) = self.settings.clear_session_token() {
                log::warn!("Expired session token could not be removed: {e}");
            }
            log::info!("Session expired");
            return Err(AuthError::Expired);
        }

        let cookie = cookie_header.ok_or(AuthError::MissingCookie)?;
        if !cookie.contains(session.token.as_str()) {
            return Err(AuthError::InvalidToken);
        }
        session.last_activity = now;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.slot().is_some()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Byte-for-byte equality that does not stop at the first mismatch.
fn passwords_match(submitted: &str, expected: &str) -> bool {
    submitted.len() == expected.len()
        && submitted
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
