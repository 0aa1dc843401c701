use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub access_token: Option<String>,
    pub typing_clear_ms: u64,
    pub typing_throttle_ms: u64,
    pub pending_timeout_ms: Option<u64>,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".into(),
            access_token: None,
            typing_clear_ms: 1500,
            typing_throttle_ms: 800,
            pending_timeout_ms: None,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            request_timeout_ms: 15_000,
        }
    }
}

/// Timer knobs the chat session runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub typing_clear_after: Duration,
    pub typing_throttle: Duration,
    /// `None` keeps unconfirmed messages pending forever.
    pub pending_timeout: Option<Duration>,
}

impl Default for SessionTiming {
    fn default() -> Self {
        ClientSettings::default().session_timing()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl ClientSettings {
    pub fn session_timing(&self) -> SessionTiming {
        SessionTiming {
            typing_clear_after: Duration::from_millis(self.typing_clear_ms),
            typing_throttle: Duration::from_millis(self.typing_throttle_ms),
            pending_timeout: self
                .pending_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts: self.reconnect_attempts,
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Loads settings from an optional TOML file, then applies environment overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = match path {
        Some(path) if path.exists() => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?;
            toml::from_str::<ClientSettings>(&raw)
                .with_context(|| format!("failed to parse config file '{}'", path.display()))?
        }
        _ => ClientSettings::default(),
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// `CHAT_*` and `APP__*` variables win over the file; `APP__` wins over `CHAT_`.
pub fn apply_env_overrides(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let var = |name: &str| {
        lookup(&format!("APP__{name}")).or_else(|| lookup(&format!("CHAT_{name}")))
    };
    let parsed = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(v) = var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }
    if let Some(v) = parsed("TYPING_CLEAR_MS") {
        settings.typing_clear_ms = v;
    }
    if let Some(v) = parsed("TYPING_THROTTLE_MS") {
        settings.typing_throttle_ms = v;
    }
    if let Some(v) = parsed("PENDING_TIMEOUT_MS") {
        settings.pending_timeout_ms = Some(v);
    }
    if let Some(v) = parsed("RECONNECT_ATTEMPTS") {
        settings.reconnect_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = parsed("RECONNECT_DELAY_MS") {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = parsed("REQUEST_TIMEOUT_MS") {
        settings.request_timeout_ms = v;
    }
}
