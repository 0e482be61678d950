//! Client configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use retriever_shared::is_local_address;
use thiserror::Error;
use url::Url;

use crate::auth_session::SessionConfig;
use crate::ws::{Backoff, ConnectionSettings};

const DEFAULT_API_URL: &str = "http://localhost:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid URL ({value}): {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the session and transport layers need to know about the
/// deployment they talk to.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API (token exchange, refresh, profile).
    pub api_url: String,
    /// Base URL for room WebSockets.
    pub ws_url: Url,
    /// Safety margin subtracted from token expiry when scheduling refresh.
    pub refresh_skew: Duration,
    pub backoff: Backoff,
    /// Upper bound on a single connect handshake.
    pub connect_timeout: Duration,
    /// Ping interval while connected; `None` disables keepalive.
    pub keepalive: Option<Duration>,
    /// Directory for the session document; `None` uses the platform default.
    pub storage_dir: Option<PathBuf>,
}

impl ClientConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RETRIEVER_API_URL`: REST base URL (default: "http://localhost:8000")
    /// - `RETRIEVER_WS_URL`: WebSocket base URL (default: API URL with http→ws)
    /// - `RETRIEVER_REFRESH_SKEW_SECS`: refresh safety margin (default: 60)
    /// - `RETRIEVER_RECONNECT_BASE_MS` / `_MAX_MS` / `_JITTER_MS`: backoff
    ///   (defaults: 1000 / 30000 / 1000)
    /// - `RETRIEVER_CONNECT_TIMEOUT_MS`: handshake bound (default: 10000)
    /// - `RETRIEVER_KEEPALIVE_SECS`: ping interval, 0 disables (default: 30)
    /// - `RETRIEVER_STORAGE_DIR`: session storage directory
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let number = |name: &str, default: u64| -> u64 {
            match lookup(name) {
                None => default,
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!(name, value = %raw, default, "ignoring invalid number");
                    default
                }),
            }
        };

        let api_url = lookup("RETRIEVER_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let ws_raw = lookup("RETRIEVER_WS_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| http_to_ws(&api_url));
        let ws_url = Url::parse(&ws_raw).map_err(|e| ConfigError::InvalidUrl {
            name: "RETRIEVER_WS_URL",
            value: ws_raw.clone(),
            reason: e.to_string(),
        })?;

        let keepalive = match number("RETRIEVER_KEEPALIVE_SECS", 30) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            api_url,
            ws_url,
            refresh_skew: Duration::from_secs(number("RETRIEVER_REFRESH_SKEW_SECS", 60)),
            backoff: Backoff {
                base: Duration::from_millis(number("RETRIEVER_RECONNECT_BASE_MS", 1000)),
                max: Duration::from_millis(number("RETRIEVER_RECONNECT_MAX_MS", 30_000)),
                jitter: Duration::from_millis(number("RETRIEVER_RECONNECT_JITTER_MS", 1000)),
            },
            connect_timeout: Duration::from_millis(number("RETRIEVER_CONNECT_TIMEOUT_MS", 10_000)),
            keepalive,
            storage_dir: lookup("RETRIEVER_STORAGE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_skew: self.refresh_skew,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            ws_base: self.ws_url.clone(),
            backoff: self.backoff.clone(),
            connect_timeout: self.connect_timeout,
            keepalive: self.keepalive,
        }
    }
}

/// Convert an HTTP/HTTPS base URL to WS/WSS. Bare hosts get `ws://` when
/// local and `wss://` otherwise.
pub fn http_to_ws(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if url.contains("://") {
        url.to_string()
    } else if is_local_address(url) {
        format!("ws://{url}")
    } else {
        format!("wss://{url}")
    }
}
