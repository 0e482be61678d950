//! Cross-instance persistent storage.
//!
//! Provides a localStorage-like key/value API with mutation events:
//! - [`MemoryStorage`]: an in-process map. [`MemoryStorage::tab`] hands out
//!   another handle on the same map, the way browser tabs share an origin.
//! - [`FileStorage`]: one JSON document in the platform config directory:
//!   - Linux: `~/.config/retriever/`
//!   - macOS: `~/Library/Application Support/retriever/`
//!   - Windows: `%APPDATA%\retriever\`
//!
//! [`CredentialStore`] sits on top and always reads and writes the session
//! keys as one unit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retriever_shared::{TokenResponse, UserProfile};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::lock;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_KEY: &str = "user";
pub const AUTH_RESPONSE_KEY: &str = "auth_response";

const CREDENTIAL_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    USER_KEY,
    AUTH_RESPONSE_KEY,
];

const EVENT_CAPACITY: usize = 64;
const SESSION_FILE: &str = "session.json";

/// Origin of changes made by another process (seen by [`FileStorage::watch`]).
pub const EXTERNAL_ORIGIN: u64 = 0;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

fn next_origin() -> u64 {
    NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage document is corrupt: {0}")]
    Corrupt(String),
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("no platform config directory available")]
    NoConfigDir,
}

/// A set of keys changed by one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub keys: Vec<String>,
    /// Handle that made the change; lets a handle ignore its own writes.
    pub origin: u64,
}

/// Durable key/value storage shared between handles.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Read several keys from one consistent snapshot, in the order given.
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StorageError>;

    /// Apply all changes atomically. `None` removes the key.
    ///
    /// Emits one [`StorageEvent`] listing the keys that actually changed, or
    /// nothing if the write was a no-op.
    fn write_batch(&self, changes: &[(&str, Option<String>)]) -> Result<(), StorageError>;

    /// Mutation events from every handle, including this one.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;

    /// Identifier stamped on events produced by this handle.
    fn origin(&self) -> u64;
}

fn apply_changes(
    items: &mut BTreeMap<String, String>,
    changes: &[(&str, Option<String>)],
) -> Vec<String> {
    let mut changed = Vec::new();
    for (key, value) in changes {
        let previous = match value {
            Some(v) => items.insert((*key).to_string(), v.clone()),
            None => items.remove(*key),
        };
        if previous.as_ref() != value.as_ref() {
            changed.push((*key).to_string());
        }
    }
    changed
}

// =========================================
// In-memory implementation
// =========================================

struct MemoryShared {
    items: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

/// In-process storage; clones share a handle, [`tab`](Self::tab) creates a
/// new one over the same data.
#[derive(Clone)]
pub struct MemoryStorage {
    shared: Arc<MemoryShared>,
    origin: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(MemoryShared {
                items: Mutex::new(BTreeMap::new()),
                events,
            }),
            origin: next_origin(),
        }
    }

    /// Another handle on the same data with its own origin.
    pub fn tab(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            origin: next_origin(),
        }
    }

    /// Copy of every stored item.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.shared.items).clone()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.shared.items).get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StorageError> {
        let items = lock(&self.shared.items);
        Ok(keys.iter().map(|k| items.get(*k).cloned()).collect())
    }

    fn write_batch(&self, changes: &[(&str, Option<String>)]) -> Result<(), StorageError> {
        let mut items = lock(&self.shared.items);
        let keys = apply_changes(&mut items, changes);
        if !keys.is_empty() {
            // No receivers is fine.
            let _ = self.shared.events.send(StorageEvent {
                keys,
                origin: self.origin,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.shared.events.subscribe()
    }

    fn origin(&self) -> u64 {
        self.origin
    }
}

// =========================================
// File implementation
// =========================================

/// Storage backed by a single JSON document, replaced atomically on write.
pub struct FileStorage {
    path: PathBuf,
    origin: u64,
    events: broadcast::Sender<StorageEvent>,
    /// Raw document as last written or observed by this handle.
    last_seen: Mutex<Option<String>>,
}

impl FileStorage {
    /// Open (creating if needed) the storage document in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SESSION_FILE);
        let raw = read_raw(&path)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            path,
            origin: next_origin(),
            events,
            last_seen: Mutex::new(raw),
        })
    }

    /// Open the storage document in the platform config directory.
    pub fn open_default() -> Result<Self, StorageError> {
        let dir = dirs::config_dir()
            .ok_or(StorageError::NoConfigDir)?
            .join("retriever");
        Self::open(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll the document for changes made by other processes, emitting a
    /// [`StorageEvent`] with [`EXTERNAL_ORIGIN`] for each one. The task stops
    /// once the storage is dropped.
    pub fn watch(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(storage) = weak.upgrade() else {
                    break;
                };
                storage.poll_external();
            }
        })
    }

    fn poll_external(&self) {
        let current = match read_raw(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "storage poll failed");
                return;
            }
        };

        let mut last = lock(&self.last_seen);
        if *last == current {
            return;
        }

        let before = parse_document(last.as_deref()).unwrap_or_default();
        let after = parse_document(current.as_deref()).unwrap_or_default();
        let mut keys: Vec<String> = before
            .keys()
            .chain(after.keys())
            .filter(|k| before.get(*k) != after.get(*k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            // Unreadable on one side only; report every credential key.
            keys = CREDENTIAL_KEYS.iter().map(|k| k.to_string()).collect();
        }
        *last = current;

        let _ = self.events.send(StorageEvent {
            keys,
            origin: EXTERNAL_ORIGIN,
        });
    }
}

fn read_raw(path: &Path) -> Result<Option<String>, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_document(raw: Option<&str>) -> Result<BTreeMap<String, String>, StorageError> {
    match raw {
        None => Ok(BTreeMap::new()),
        Some(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| StorageError::Corrupt(e.to_string())),
    }
}

impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let raw = read_raw(&self.path)?;
        Ok(parse_document(raw.as_deref())?.get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StorageError> {
        let raw = read_raw(&self.path)?;
        let items = parse_document(raw.as_deref())?;
        Ok(keys.iter().map(|k| items.get(*k).cloned()).collect())
    }

    fn write_batch(&self, changes: &[(&str, Option<String>)]) -> Result<(), StorageError> {
        // Serializes writes through this handle. Other handles and processes
        // only ever observe whole documents because of the rename below.
        let mut last = lock(&self.last_seen);

        let raw = read_raw(&self.path)?;
        let (mut items, corrupt) = match parse_document(raw.as_deref()) {
            Ok(items) => (items, false),
            Err(e) => {
                tracing::warn!(error = %e, "replacing corrupt storage document");
                (BTreeMap::new(), true)
            }
        };
        let mut keys = apply_changes(&mut items, changes);
        if corrupt {
            // Every key in the batch differs from what an unreadable document held.
            keys = changes.iter().map(|(k, _)| (*k).to_string()).collect();
        }
        if keys.is_empty() {
            return Ok(());
        }

        let document =
            serde_json::to_string_pretty(&items).map_err(|e| StorageError::Encode(e.to_string()))?;
        let tmp = self.path.with_file_name(format!(
            "{SESSION_FILE}.{}.{}.tmp",
            std::process::id(),
            self.origin
        ));
        std::fs::write(&tmp, &document)?;
        std::fs::rename(&tmp, &self.path)?;
        *last = Some(document);

        let _ = self.events.send(StorageEvent {
            keys,
            origin: self.origin,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn origin(&self) -> u64 {
        self.origin
    }
}

// =========================================
// Credential adapter
// =========================================

/// The persisted session unit.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserProfile,
    /// Full exchange/refresh response the tokens came from.
    pub response: Option<TokenResponse>,
}

/// Result of reading the session unit.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredSession {
    Absent,
    Present(StoredCredential),
    /// Partial or unreadable state; callers treat it as absent.
    Corrupt(String),
}

/// Reads and writes the credential keys as one unit.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn load(&self) -> StoredSession {
        let values = match self.backend.get_many(&CREDENTIAL_KEYS) {
            Ok(values) => values,
            Err(e) => return StoredSession::Corrupt(e.to_string()),
        };
        let mut values = values.into_iter();
        let mut next = || values.next().flatten();
        let (access, refresh, user, response) = (next(), next(), next(), next());

        match (access, refresh, user) {
            (None, None, None) => StoredSession::Absent,
            (Some(access_token), Some(refresh_token), Some(user)) => {
                let user = match serde_json::from_str::<UserProfile>(&user) {
                    Ok(user) => user,
                    Err(e) => {
                        return StoredSession::Corrupt(format!("unparseable user profile: {e}"))
                    }
                };
                let response = response.and_then(|raw| serde_json::from_str(&raw).ok());
                StoredSession::Present(StoredCredential {
                    access_token,
                    refresh_token,
                    user,
                    response,
                })
            }
            _ => StoredSession::Corrupt("partial credential".to_string()),
        }
    }

    pub fn save(&self, credential: &StoredCredential) -> Result<(), StorageError> {
        let user = serde_json::to_string(&credential.user)
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        let response = credential
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Encode(e.to_string()))?;

        self.backend.write_batch(&[
            (ACCESS_TOKEN_KEY, Some(credential.access_token.clone())),
            (REFRESH_TOKEN_KEY, Some(credential.refresh_token.clone())),
            (USER_KEY, Some(user)),
            (AUTH_RESPONSE_KEY, response),
        ])
    }

    /// Remove every credential key. Emits nothing when already empty.
    pub fn clear(&self) -> Result<(), StorageError> {
        let changes: Vec<(&str, Option<String>)> =
            CREDENTIAL_KEYS.iter().map(|k| (*k, None)).collect();
        self.backend.write_batch(&changes)
    }

    /// Credential changes made through other handles.
    pub fn external_changes(&self) -> ExternalChanges {
        ExternalChanges {
            rx: self.backend.subscribe(),
            origin: self.backend.origin(),
        }
    }
}

/// Stream of credential-key changes made by other handles.
pub struct ExternalChanges {
    rx: broadcast::Receiver<StorageEvent>,
    origin: u64,
}

impl ExternalChanges {
    /// Next change, or `None` once the storage is gone.
    pub async fn next(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.origin => continue,
                Ok(event) => {
                    if event
                        .keys
                        .iter()
                        .any(|k| CREDENTIAL_KEYS.contains(&k.as_str()))
                    {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "storage events lagged, forcing re-read");
                    return Some(StorageEvent {
                        keys: CREDENTIAL_KEYS.iter().map(|k| k.to_string()).collect(),
                        origin: EXTERNAL_ORIGIN,
                    });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
