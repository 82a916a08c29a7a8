//! HTTP route layer, independent of the server framework.
//!
//! This is the only place component errors become status codes. The
//! firmware copies the request headers into [`RequestParts`], hands the body
//! over as a [`ByteSource`] and writes the returned [`Reply`].

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::RESTART_DELAY;
use crate::deferred::RestartScheduler;
use crate::session::{AuthError, Clock, Entropy, SessionAuthority};
use crate::settings::{SettingsStore, StorageMedium, StoreError};
use crate::update::{parse_digest, ByteSource, FirmwareSlots, ReadError, UpdateEngine};

/// Upper bound for JSON form bodies.
pub const MAX_FORM_BODY: u64 = 256;
/// Optional request header carrying the expected image digest.
pub const IMAGE_DIGEST_HEADER: &str = "X-Image-Sha256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    Settings,
    Ota,
}

impl Route {
    pub const ALL: [Route; 3] = [Route::Login, Route::Settings, Route::Ota];

    /// Every route is a POST.
    pub fn path(&self) -> &'static str {
        match self {
            Route::Login => "/login",
            Route::Settings => "/settings",
            Route::Ota => "/ota",
        }
    }

    pub fn is_guarded(&self) -> bool {
        !matches!(self, Route::Login)
    }

    pub fn lookup(method: &str, path: &str) -> Option<Route> {
        if !method.eq_ignore_ascii_case("POST") {
            return None;
        }
        Route::ALL.into_iter().find(|route| route.path() == path)
    }
}

/// Headers the routes care about.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestParts<'a> {
    pub content_length: Option<u64>,
    pub cookie: Option<&'a str>,
    pub image_digest: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(&'static str, String)>,
    /// Restart the device once this reply has been sent.
    pub restart: bool,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: Vec::new(),
            restart: false,
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn bad_request(body: impl Into<String>) -> Self {
        Self::new(400, body)
    }

    pub fn unauthorized(body: impl Into<String>) -> Self {
        Self::new(401, body)
    }

    pub fn internal_error(body: impl Into<String>) -> Self {
        Self::new(500, body)
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn then_restart(mut self) -> Self {
        self.restart = true;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Deserialize)]
struct LoginForm {
    password: Option<String>,
}

#[derive(Deserialize)]
struct SettingsForm {
    ssid: Option<String>,
    password: Option<String>,
}

pub struct RecoveryService<M, C, E, S> {
    settings: Arc<SettingsStore<M>>,
    session: Arc<SessionAuthority<M, C, E>>,
    updates: UpdateEngine<S>,
    restarts: RestartScheduler,
    restart_delay: Duration,
}

impl<M, C, E, S> RecoveryService<M, C, E, S>
where
    M: StorageMedium,
    C: Clock,
    E: Entropy,
    S: FirmwareSlots,
{
    pub fn new(
        settings: Arc<SettingsStore<M>>,
        session: Arc<SessionAuthority<M, C, E>>,
        updates: UpdateEngine<S>,
        restarts: RestartScheduler,
    ) -> Self {
        Self {
            settings,
            session,
            updates,
            restarts,
            restart_delay: RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn session(&self) -> &SessionAuthority<M, C, E> {
        &self.session
    }

    pub fn dispatch(&self, route: Route, parts: RequestParts<'_>, body: &mut dyn ByteSource) -> Reply {
        if route.is_guarded() {
            if let Err(e) = self.session.guard(parts.cookie) {
                log::warn!("{} rejected: {e}", route.path());
                return auth_reply(e);
            }
        }
        match route {
            Route::Login => match read_form(body, parts.content_length) {
                Ok(form) => self.login(&form),
                Err(reply) => reply,
            },
            Route::Settings => match read_form(body, parts.content_length) {
                Ok(form) => self.save_settings(&form),
                Err(reply) => reply,
            },
            Route::Ota => self.flash(parts, body),
        }
    }

    /// Called by the server once `reply` has been written out.
    pub fn after_response(&self, reply: &Reply) {
        if reply.restart {
            self.restarts.schedule_restart(self.restart_delay);
        }
    }

    fn login(&self, form: &[u8]) -> Reply {
        let form: LoginForm = match serde_json::from_slice(form) {
            Ok(form) => form,
            Err(e) => {
                log::warn!("Login body is not valid JSON: {e}");
                return Reply::bad_request("Invalid JSON");
            }
        };
        let Some(password) = form.password else {
            return Reply::bad_request("Missing password field");
        };
        match self.session.try_login(&password) {
            Ok(cookie) => Reply::ok("Login Success").with_header("Set-Cookie", cookie),
            Err(e) => auth_reply(e),
        }
    }

    fn save_settings(&self, form: &[u8]) -> Reply {
        let form: SettingsForm = match serde_json::from_slice(form) {
            Ok(form) => form,
            Err(e) => {
                log::warn!("Settings body is not valid JSON: {e}");
                return Reply::bad_request("Invalid JSON");
            }
        };
        let (Some(ssid), Some(password)) = (form.ssid, form.password) else {
            return Reply::bad_request("Missing ssid or password");
        };
        match self.settings.set_wifi_creds(&ssid, &password) {
            Ok(()) => Reply::ok("Settings Saved. Rebooting...").then_restart(),
            Err(StoreError::InvalidLength | StoreError::InvalidArgument) => {
                log::warn!("Invalid SSID/Pass length");
                Reply::bad_request("Invalid SSID/Password length")
            }
            Err(e) => {
                log::error!("Failed to write Settings: {e}");
                Reply::internal_error("Failed to write Settings")
            }
        }
    }

    fn flash(&self, parts: RequestParts<'_>, body: &mut dyn ByteSource) -> Reply {
        let expected = match parts.image_digest {
            None => None,
            Some(raw) => match parse_digest(raw) {
                Some(digest) => Some(digest),
                None => return Reply::bad_request(format!("Invalid {IMAGE_DIGEST_HEADER} header")),
            },
        };
        let total_length = parts.content_length.unwrap_or(0);
        match self.updates.apply_update(body, total_length, expected) {
            Ok(report) => Reply::ok("Update Success. Rebooting...")
                .with_header(IMAGE_DIGEST_HEADER, report.sha256_hex())
                .then_restart(),
            Err(e) => {
                log::error!("OTA update failed: {e:?}");
                Reply::internal_error(e.to_string())
            }
        }
    }
}

fn auth_reply(e: AuthError) -> Reply {
    if e.is_unauthorized() {
        Reply::unauthorized(e.to_string())
    } else {
        Reply::internal_error(e.to_string())
    }
}

/// Reads a small JSON body in full.
fn read_form(body: &mut dyn ByteSource, content_length: Option<u64>) -> Result<Vec<u8>, Reply> {
    let len = match content_length {
        Some(len) if len > 0 && len <= MAX_FORM_BODY => len as usize,
        _ => {
            log::warn!("Invalid Content Length: {content_length:?}");
            return Err(Reply::bad_request("Invalid Content Length"));
        }
    };
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match body.read(&mut buf[filled..]) {
            Ok(0) => return Err(Reply::bad_request("Incomplete body")),
            Ok(read) => filled += read,
            Err(ReadError::Timeout) => return Err(Reply::new(408, "Request Timeout")),
            Err(ReadError::Failed(code)) => {
                log::warn!("Body receive failed with {code}");
                return Err(Reply::bad_request("Failed to read body"));
            }
        }
    }
    Ok(buf)
}
