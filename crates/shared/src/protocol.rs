//! Real-time room protocol definitions.
//!
//! Server frames are decoded on the client side (see the client's
//! normalizer); this module holds what both sides agree on: paths, limits
//! and the client-to-server frame shape.

use serde::{Deserialize, Serialize};

/// Maximum number of characters in one chat message.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Display name used when a message carries no sender name.
pub const UNKNOWN_SENDER_NAME: &str = "Unknown User";

/// Path prefix of the per-room WebSocket endpoint (`/ws/groups/{group_id}`).
pub const WS_ROOM_PATH: &str = "/ws/groups";

/// Query parameter carrying the access token on connect.
pub const WS_TOKEN_PARAM: &str = "token";

/// Frame discriminants sent by the server.
pub const FRAME_CHAT_HISTORY: &str = "chat_history";
pub const FRAME_MESSAGE: &str = "message";
pub const FRAME_ERROR: &str = "error";
pub const FRAME_PONG: &str = "pong";

/// Client-to-server frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { content: String },
    Ping,
}

impl ClientFrame {
    /// Build a chat frame, truncating content to [`MAX_MESSAGE_LENGTH`].
    pub fn message(content: &str) -> Self {
        ClientFrame::Message {
            content: truncate_content(content).to_string(),
        }
    }
}

/// Truncate to at most [`MAX_MESSAGE_LENGTH`] characters on a char boundary.
pub fn truncate_content(content: &str) -> &str {
    match content.char_indices().nth(MAX_MESSAGE_LENGTH) {
        Some((byte_idx, _)) => &content[..byte_idx],
        None => content,
    }
}

/// Check if a host is a local/development address.
pub fn is_local_address(host: &str) -> bool {
    let host_part = host.split(':').next().unwrap_or(host);
    host_part == "localhost"
        || host_part == "127.0.0.1"
        || host_part == "0.0.0.0"
        || host_part.starts_with("192.168.")
        || host_part.starts_with("10.")
}
