//! Shared error types.

use serde::Deserialize;
use thiserror::Error;

/// Error body produced by the API (`{"detail": ...}`).
///
/// `detail` is usually a string but validation failures carry a list or an
/// object, so it is kept as raw JSON.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub detail: serde_json::Value,
}

/// Attempt to parse an API error body into a user-facing message.
/// Prefers a string `detail`, falls back to an `error` field inside an object.
pub fn try_error_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok()?;
    match parsed.detail {
        serde_json::Value::String(detail) if !detail.trim().is_empty() => Some(detail),
        serde_json::Value::Object(map) => map
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// API error type for client-side use
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// True when the server rejected the presented credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401 | 403, .. })
    }

    /// Short message suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http { body, .. } => {
                try_error_detail(body).unwrap_or_else(|| self.to_string())
            }
            other => other.to_string(),
        }
    }
}
