//! Inbound frame decoding and message normalization.
//!
//! The server has shipped several field spellings over time (`messageId`,
//! `message_id`, `_id`, ...). Everything is folded into one
//! [`ChatMessage`] shape here so listeners never see the difference.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use retriever_shared::{
    truncate_content, ChatMessage, FRAME_CHAT_HISTORY, FRAME_ERROR, FRAME_MESSAGE, FRAME_PONG,
    UNKNOWN_SENDER_NAME,
};
use serde_json::{Map, Value};
use thiserror::Error;

const ID_FIELDS: [&str; 4] = ["messageId", "message_id", "id", "_id"];
const SENDER_ID_FIELDS: [&str; 4] = ["senderId", "sender_id", "userId", "user_id"];
const SENDER_NAME_FIELDS: [&str; 4] = ["senderName", "sender_name", "userName", "name"];
const CONTENT_FIELDS: [&str; 3] = ["content", "text", "body"];
const TIME_FIELDS: [&str; 3] = ["createdAt", "created_at", "timestamp"];
const HISTORY_FIELDS: [&str; 3] = ["messages", "history", "data"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("history frame carries no message list")]
    MissingHistory,
}

/// Error reported by the server inside the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNotice {
    pub code: Option<String>,
    pub message: String,
}

/// One decoded server frame, before per-message normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    History(Vec<Value>),
    Message(Value),
    ServerError(ServerNotice),
    Pong,
    /// Anything we do not recognise; carries the `type` tag if present.
    Unknown(String),
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
        Self::classify(value)
    }

    /// Classify by the explicit `type` tag, falling back to the frame's shape.
    pub fn classify(value: Value) -> Result<Self, FrameError> {
        let Value::Object(map) = value else {
            return Err(FrameError::NotAnObject);
        };

        let tag = map.get("type").and_then(Value::as_str).map(str::to_string);
        match tag.as_deref() {
            Some(FRAME_CHAT_HISTORY) => {
                let list = HISTORY_FIELDS
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_array))
                    .ok_or(FrameError::MissingHistory)?;
                Ok(InboundFrame::History(list.clone()))
            }
            Some(FRAME_MESSAGE) => Ok(InboundFrame::Message(Value::Object(map))),
            Some(FRAME_ERROR) => Ok(InboundFrame::ServerError(server_notice(&map))),
            Some(FRAME_PONG) => Ok(InboundFrame::Pong),
            Some(other) => Ok(InboundFrame::Unknown(other.to_string())),
            None if has_content(&map) => Ok(InboundFrame::Message(Value::Object(map))),
            None => Ok(InboundFrame::Unknown(String::new())),
        }
    }
}

fn server_notice(map: &Map<String, Value>) -> ServerNotice {
    let code = text_field(map, &["error", "code"]);
    let message = text_field(map, &["message", "detail"])
        .or_else(|| code.clone())
        .unwrap_or_else(|| "server error".to_string());
    ServerNotice { code, message }
}

fn has_content(map: &Map<String, Value>) -> bool {
    CONTENT_FIELDS.iter().any(|k| map.get(*k).is_some_and(Value::is_string))
}

/// First non-empty string (or number, rendered) among `fields`.
fn text_field(map: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|k| match map.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Map a raw message object onto [`ChatMessage`].
///
/// Returns `None` when the value carries no textual content. `now` stands in
/// for a missing or unparseable timestamp and seeds synthesized ids.
pub fn normalize_message(room_id: &str, raw: &Value, now: DateTime<Utc>) -> Option<ChatMessage> {
    let map = raw.as_object()?;
    let content = CONTENT_FIELDS
        .iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))?;

    let id = text_field(map, &ID_FIELDS).unwrap_or_else(|| {
        format!(
            "{room_id}:{}",
            now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros())
        )
    });

    let created_at = TIME_FIELDS
        .iter()
        .find_map(|k| map.get(*k).and_then(parse_timestamp))
        .unwrap_or(now);

    Some(ChatMessage {
        id,
        room_id: room_id.to_string(),
        sender_id: text_field(map, &SENDER_ID_FIELDS),
        sender_name: text_field(map, &SENDER_NAME_FIELDS)
            .unwrap_or_else(|| UNKNOWN_SENDER_NAME.to_string()),
        content: truncate_content(content).to_string(),
        created_at,
    })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                // Python's isoformat() without an offset.
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Message ids already delivered on one room subscription.
#[derive(Debug, Default)]
pub struct SeenIds {
    ids: HashSet<String>,
}

impl SeenIds {
    /// Record `id`; returns `false` if it was already seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string())
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
