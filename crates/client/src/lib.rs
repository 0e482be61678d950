//! Retriever Client - session and real-time transport core
//!
//! Keeps a signed access credential alive across restarts, timers and other
//! handles sharing the same storage, and runs one authenticated,
//! auto-reconnecting WebSocket per chat room being viewed.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod api_client;
pub mod auth_session;
pub mod config;
pub mod jwt;
pub mod normalizer;
pub mod storage;
pub mod ws;

pub use api_client::{AuthApi, HttpAuthApi};
pub use auth_session::{AuthState, Credential, SessionError, SessionManager};
pub use config::ClientConfig;
pub use storage::{CredentialStore, FileStorage, KeyValueStore, MemoryStorage};
pub use ws::{ConnectionError, ConnectionManager, ConnectionState, RoomConnection, SendOutcome};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
