//! Access-token claim decoding.
//!
//! The client never verifies signatures. It reads the payload segment to
//! learn the expiry and the identity claims the server embedded, and treats
//! anything it cannot read as "no session".

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use retriever_shared::UserProfile;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenDecodeError {
    #[error("token is not a three-part JWT")]
    Malformed,
    #[error("token payload is not base64url: {0}")]
    Encoding(String),
    #[error("token payload is not a claims object: {0}")]
    Claims(String),
    #[error("token expiry {0} is out of range")]
    Expiry(i64),
}

/// Claims issued by the Retriever backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct AccessClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    /// Seconds since the epoch.
    pub exp: i64,
    #[serde(default, rename = "type")]
    pub token_type: Option<String>,
}

impl AccessClaims {
    pub fn expires_at(&self) -> Result<DateTime<Utc>, TokenDecodeError> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .ok_or(TokenDecodeError::Expiry(self.exp))
    }

    /// The application user id, preferring `user_id` over the identity
    /// provider's `sub`.
    pub fn subject_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Profile fields that can be derived from the claims alone.
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.subject_id().unwrap_or_default().to_string(),
            name: self.name.clone(),
            email: self.email.clone(),
            picture: self.picture.clone(),
            ..Default::default()
        }
    }
}

/// Decode the payload segment of a JWT without checking its signature.
pub fn decode_claims(token: &str) -> Result<AccessClaims, TokenDecodeError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenDecodeError::Malformed);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenDecodeError::Encoding(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| TokenDecodeError::Claims(e.to_string()))
}
