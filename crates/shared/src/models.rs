//! Shared data models for the Retriever study-group API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Identity ---

/// User profile as returned by `/auth/me` and embedded in token responses.
///
/// Every field except `id` is optional on the wire; the server omits what it
/// does not know and the client fills gaps from the access token's claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub courses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl UserProfile {
    /// Keep every field already set on `self`, taking only the missing ones
    /// from `fallback`.
    pub fn merge_missing(mut self, fallback: &UserProfile) -> Self {
        if self.id.is_empty() {
            self.id = fallback.id.clone();
        }
        fill(&mut self.name, &fallback.name);
        fill(&mut self.email, &fallback.email);
        fill(&mut self.picture, &fallback.picture);
        fill(&mut self.bio, &fallback.bio);
        fill(&mut self.created_at, &fallback.created_at);
        if self.courses.is_empty() {
            self.courses = fallback.courses.clone();
        }
        self
    }

    /// Name to show for this user, falling back to the email's local part.
    pub fn display_name(&self) -> &str {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name;
        }
        self.email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or(&self.id)
    }
}

fn fill(slot: &mut Option<String>, fallback: &Option<String>) {
    let empty = slot.as_deref().map_or(true, |s| s.trim().is_empty());
    if empty && fallback.is_some() {
        *slot = fallback.clone();
    }
}

// --- Auth ---

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Response of both the token exchange and the token refresh endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Advisory lifetime in seconds. The client reads the real expiry from the
    /// access token itself.
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub user: UserProfile,
}

/// Body of `POST /auth/google_login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenLogin {
    pub id_token: String,
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

// --- Chat ---

/// Canonical chat message delivered to room listeners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Stable id used for deduplication within a room subscription.
    pub id: String,
    pub room_id: String,
    pub sender_id: Option<String>,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
