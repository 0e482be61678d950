//! Connection manager: at most one [`RoomConnection`] per room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::connection::{
    ConnectionSettings, ConnectionState, RoomConnection, SendOutcome, TokenSource,
};
use super::transport::Connector;
use crate::auth_session::{AuthState, SessionManager};
use crate::lock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("session manager has not been bootstrapped")]
    SessionNotInitialized,
    #[error("not signed in")]
    NotAuthenticated,
    #[error("connection manager must be created inside a tokio runtime")]
    NoRuntime,
}

/// An open room and the session generation it was joined under.
struct Joined {
    room: Arc<RoomConnection>,
    generation: u64,
}

struct ManagerInner {
    session: SessionManager,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    runtime: Handle,
    rooms: Mutex<HashMap<String, Joined>>,
    auth_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.auth_watcher).take() {
            watcher.abort();
        }
        for (_, joined) in lock(&self.rooms).drain() {
            joined.room.close();
        }
    }
}

/// Owns the open rooms and tears them all down when the session ends.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        session: SessionManager,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Result<Self, ConnectionError> {
        let runtime = Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
        let mut generations = session.watch_generation();

        let inner = Arc::new(ManagerInner {
            session,
            connector,
            settings,
            runtime: runtime.clone(),
            rooms: Mutex::new(HashMap::new()),
            auth_watcher: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let watcher = runtime.spawn(async move {
            // Every ended session moves the counter, so a sign-out followed
            // by a sign-in is still seen here.
            while generations.changed().await.is_ok() {
                let current = *generations.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionManager { inner }.close_before(current);
            }
        });
        *lock(&inner.auth_watcher) = Some(watcher);

        Ok(Self { inner })
    }

    /// Open `room_id`, or return the connection that is already open.
    pub fn join(&self, room_id: &str) -> Result<Arc<RoomConnection>, ConnectionError> {
        // Read before the auth check: a sign-out in between leaves the room
        // tagged with a stale generation, and the watcher closes it.
        let generation = self.inner.session.generation();
        if self.inner.session.state() == AuthState::Uninitialized {
            return Err(ConnectionError::SessionNotInitialized);
        }
        if !self.inner.session.is_authenticated() {
            return Err(ConnectionError::NotAuthenticated);
        }

        let mut rooms = lock(&self.inner.rooms);
        if let Some(existing) = rooms.get(room_id) {
            if existing.generation >= generation {
                return Ok(existing.room.clone());
            }
            // Left over from a session that has ended.
            existing.room.close();
        }

        let session = self.inner.session.clone();
        let token: TokenSource = Arc::new(move || session.access_token());
        let room = Arc::new(RoomConnection::spawn(
            &self.inner.runtime,
            room_id,
            self.inner.settings.clone(),
            self.inner.connector.clone(),
            token,
        ));
        rooms.insert(
            room_id.to_string(),
            Joined {
                room: room.clone(),
                generation,
            },
        );
        tracing::info!(room = %room_id, "joined room");
        Ok(room)
    }

    /// Close and forget `room_id`. Returns whether it was open.
    pub fn leave(&self, room_id: &str) -> bool {
        let removed = lock(&self.inner.rooms).remove(room_id);
        match removed {
            Some(joined) => {
                joined.room.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let rooms: Vec<Joined> = lock(&self.inner.rooms).drain().map(|(_, j)| j).collect();
        Self::close_rooms(rooms);
    }

    /// Close every room joined under a generation older than `generation`.
    fn close_before(&self, generation: u64) {
        let stale: Vec<Joined> = {
            let mut rooms = lock(&self.inner.rooms);
            let ids: Vec<String> = rooms
                .iter()
                .filter(|(_, joined)| joined.generation < generation)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| rooms.remove(id)).collect()
        };
        Self::close_rooms(stale);
    }

    fn close_rooms(rooms: Vec<Joined>) {
        if rooms.is_empty() {
            return;
        }
        tracing::info!(count = rooms.len(), "closing rooms");
        for joined in rooms {
            joined.room.close();
        }
    }

    pub fn send(&self, room_id: &str, content: &str) -> SendOutcome {
        match self.room(room_id) {
            Some(room) => room.send(content),
            None => SendOutcome::UnknownRoom,
        }
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<RoomConnection>> {
        lock(&self.inner.rooms)
            .get(room_id)
            .map(|joined| joined.room.clone())
    }

    /// Ids of every open room, sorted.
    pub fn rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.rooms).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn state(&self, room_id: &str) -> Option<ConnectionState> {
        self.room(room_id).map(|room| room.state())
    }
}
