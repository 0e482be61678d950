//! WebSocket layer for chat rooms.
//!
//! This module provides:
//! - Per-room connections with auto-reconnect and exponential backoff
//! - A manager that keeps at most one connection per room and closes them
//!   all when the session ends
//! - A pluggable transport so tests can run without a server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ConnectionManager               │
//! │   (watches SessionManager's auth stream)     │
//! └──────────────────────────────────────────────┘
//!                        │
//!         ┌──────────────┼──────────────┐
//!         ▼              ▼              ▼
//!  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!  │RoomConnection│ │RoomConnection│ │RoomConnection│
//!  │  (room A)    │ │  (room B)    │ │  (room C)    │
//!  └──────────────┘ └──────────────┘ └──────────────┘
//!         │              │              │
//!         ▼              ▼              ▼
//!     Connector ── one TransportLink per connect attempt
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(session, Arc::new(TungsteniteConnector), settings)?;
//! let room = manager.join("cmsc-341")?;
//! room.on_message(|msg| println!("{}: {}", msg.sender_name, msg.content));
//! manager.send("cmsc-341", "anyone at the library?");
//! ```

pub mod backoff;
mod connection;
mod manager;
pub mod transport;

pub use backoff::Backoff;
pub use connection::{
    room_url, ConnectionSettings, ConnectionState, ListenerId, RoomConnection, SendOutcome,
    TokenSource,
};
pub use manager::{ConnectionError, ConnectionManager};
pub use transport::{Connector, TransportError, TransportLink, TungsteniteConnector};
