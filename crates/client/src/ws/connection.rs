//! One chat room's WebSocket with state tracking and auto-reconnect.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use retriever_shared::{ChatMessage, ClientFrame, WS_ROOM_PATH, WS_TOKEN_PARAM};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use url::Url;

use super::backoff::Backoff;
use super::transport::{Connector, TransportError, TransportLink};
use crate::lock;
use crate::normalizer::{normalize_message, InboundFrame, SeenIds};

/// Connection state for a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Transport settings shared by every room.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// `ws://` or `wss://` base; the room path is appended to it.
    pub ws_base: Url,
    pub backoff: Backoff,
    /// Upper bound on a single handshake.
    pub connect_timeout: Duration,
    /// Ping interval while connected (`None` = no keepalive)
    pub keepalive: Option<Duration>,
}

impl ConnectionSettings {
    pub fn new(ws_base: Url) -> Self {
        Self {
            ws_base,
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
            keepalive: Some(Duration::from_secs(30)),
        }
    }
}

/// What happened to an outgoing chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Dropped because the room is not connected. Nothing is queued.
    NotConnected,
    UnknownRoom,
}

/// Supplies the access token at connect time.
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

type MessageListener = Arc<dyn Fn(&ChatMessage) + Send + Sync>;
type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    message: Vec<(u64, MessageListener)>,
    state: Vec<(u64, StateListener)>,
    streams: Vec<UnboundedSender<ChatMessage>>,
}

impl Listeners {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn clear(&mut self) {
        self.message.clear();
        self.state.clear();
        self.streams.clear();
    }
}

struct RoomShared {
    room_id: String,
    state: Mutex<ConnectionState>,
    attempt: AtomicU32,
    /// Set by `close`; nothing is emitted or retried afterwards.
    closed: AtomicBool,
    outgoing: Mutex<Option<UnboundedSender<String>>>,
    listeners: Mutex<Listeners>,
    seen: Mutex<SeenIds>,
}

/// A managed WebSocket subscription to one room.
///
/// The connect/reconnect loop runs in its own task from construction until
/// [`close`](Self::close). Messages are normalized and deduplicated across
/// reconnects before they reach listeners.
pub struct RoomConnection {
    shared: Arc<RoomShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomConnection {
    /// Start connecting to `room_id` on `runtime`.
    pub fn spawn(
        runtime: &Handle,
        room_id: impl Into<String>,
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        token: TokenSource,
    ) -> Self {
        let shared = Arc::new(RoomShared {
            room_id: room_id.into(),
            state: Mutex::new(ConnectionState::Connecting),
            attempt: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            outgoing: Mutex::new(None),
            listeners: Mutex::new(Listeners::default()),
            seen: Mutex::new(SeenIds::default()),
        });

        let task = runtime.spawn(run_loop(shared.clone(), settings, connector, token));

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    /// Consecutive failed or closed cycles since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn on_message(&self, listener: impl Fn(&ChatMessage) + Send + Sync + 'static) -> ListenerId {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id();
        listeners.message.push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn on_state_change(
        &self,
        listener: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id();
        listeners.state.push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.shared.listeners);
        let before = listeners.message.len() + listeners.state.len();
        listeners.message.retain(|(lid, _)| *lid != id.0);
        listeners.state.retain(|(lid, _)| *lid != id.0);
        before != listeners.message.len() + listeners.state.len()
    }

    /// Stream of delivered messages. Ends when the room is closed.
    pub fn messages(&self) -> UnboundedReceiver<ChatMessage> {
        let (tx, rx) = unbounded();
        if !self.is_closed() {
            lock(&self.shared.listeners).streams.push(tx);
        }
        rx
    }

    /// Send a chat message if connected. Content is truncated to the
    /// protocol limit.
    pub fn send(&self, content: &str) -> SendOutcome {
        if !self.state().is_connected() {
            return SendOutcome::NotConnected;
        }
        let Some(outgoing) = lock(&self.shared.outgoing).clone() else {
            return SendOutcome::NotConnected;
        };

        match serde_json::to_string(&ClientFrame::message(content)) {
            Ok(json) => match outgoing.unbounded_send(json) {
                Ok(()) => SendOutcome::Sent,
                Err(_) => SendOutcome::NotConnected,
            },
            Err(e) => {
                tracing::error!(room = %self.shared.room_id, error = %e, "failed to encode message");
                SendOutcome::NotConnected
            }
        }
    }

    /// Stop for good: cancel the loop, drop the socket and every listener.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        lock(&self.shared.outgoing).take();
        lock(&self.shared.listeners).clear();
        lock(&self.shared.seen).clear();
        *lock(&self.shared.state) = ConnectionState::Disconnected;
        tracing::info!(room = %self.shared.room_id, "room closed");
    }
}

impl Drop for RoomConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl RoomShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        if self.is_closed() {
            return;
        }
        {
            let mut state = lock(&self.state);
            if *state == next {
                return;
            }
            *state = next;
        }
        tracing::debug!(room = %self.room_id, state = ?next, "connection state changed");

        let listeners: Vec<StateListener> = lock(&self.listeners)
            .state
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if self.is_closed() {
                return;
            }
            listener(next);
        }
    }

    fn handle_frame(&self, text: &str) {
        match InboundFrame::decode(text) {
            Ok(InboundFrame::History(items)) => {
                tracing::debug!(room = %self.room_id, count = items.len(), "history replay");
                for raw in &items {
                    self.deliver(raw);
                }
            }
            Ok(InboundFrame::Message(raw)) => self.deliver(&raw),
            Ok(InboundFrame::ServerError(notice)) => {
                tracing::warn!(
                    room = %self.room_id,
                    code = ?notice.code,
                    message = %notice.message,
                    "server reported an error"
                );
                self.set_state(ConnectionState::Error);
            }
            Ok(InboundFrame::Pong) => tracing::trace!(room = %self.room_id, "pong"),
            Ok(InboundFrame::Unknown(tag)) => {
                tracing::warn!(room = %self.room_id, %tag, "dropping unrecognised frame");
            }
            Err(e) => {
                tracing::warn!(room = %self.room_id, error = %e, "dropping malformed frame");
            }
        }
    }

    fn deliver(&self, raw: &Value) {
        let Some(message) = normalize_message(&self.room_id, raw, Utc::now()) else {
            tracing::warn!(room = %self.room_id, "dropping message without content");
            return;
        };
        if !lock(&self.seen).insert(&message.id) {
            tracing::debug!(room = %self.room_id, id = %message.id, "duplicate message dropped");
            return;
        }
        if self.is_closed() {
            return;
        }

        let callbacks: Vec<MessageListener> = {
            let mut listeners = lock(&self.listeners);
            listeners
                .streams
                .retain(|tx| tx.unbounded_send(message.clone()).is_ok());
            listeners.message.iter().map(|(_, l)| l.clone()).collect()
        };
        for callback in callbacks {
            if self.is_closed() {
                return;
            }
            callback(&message);
        }
    }

    /// Forward frames until either side closes the link.
    async fn pump(&self, link: TransportLink, keepalive: Option<Duration>) {
        let TransportLink {
            outgoing,
            mut incoming,
        } = link;
        *lock(&self.outgoing) = Some(outgoing.clone());

        let mut ticker = keepalive.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                frame = incoming.next() => match frame {
                    Some(text) => self.handle_frame(&text),
                    None => break,
                },
                _ = tick(&mut ticker) => {
                    let ping = match serde_json::to_string(&ClientFrame::Ping) {
                        Ok(ping) => ping,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode ping");
                            continue;
                        }
                    };
                    if outgoing.unbounded_send(ping).is_err() {
                        break;
                    }
                }
            }
        }

        lock(&self.outgoing).take();
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// `{ws_base}/ws/groups/{room}?token={token}`
pub fn room_url(base: &Url, room_id: &str, token: &str) -> Url {
    let mut url = base.clone();
    let path = format!(
        "{}{}/{}",
        base.path().trim_end_matches('/'),
        WS_ROOM_PATH,
        urlencoding::encode(room_id)
    );
    url.set_path(&path);
    url.set_query(None);
    url.query_pairs_mut().append_pair(WS_TOKEN_PARAM, token);
    url
}

/// The URL with its token replaced, for logging.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(Some(&format!("{WS_TOKEN_PARAM}=redacted")));
    shown.to_string()
}

async fn connect_once(
    room: &RoomShared,
    settings: &ConnectionSettings,
    connector: &dyn Connector,
    token: &TokenSource,
) -> Result<TransportLink, TransportError> {
    let token = token().ok_or(TransportError::NoToken)?;
    let url = room_url(&settings.ws_base, &room.room_id, &token);
    tracing::debug!(room = %room.room_id, url = %redacted(&url), "connecting");

    match tokio::time::timeout(settings.connect_timeout, connector.connect(&url)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn run_loop(
    room: Arc<RoomShared>,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    token: TokenSource,
) {
    loop {
        if room.is_closed() {
            return;
        }
        room.set_state(ConnectionState::Connecting);

        let outcome = match connect_once(&room, &settings, connector.as_ref(), &token).await {
            Ok(link) => {
                if room.is_closed() {
                    return;
                }
                room.attempt.store(0, Ordering::SeqCst);
                room.set_state(ConnectionState::Connected);
                tracing::info!(room = %room.room_id, "room connected");
                room.pump(link, settings.keepalive).await;
                tracing::info!(room = %room.room_id, "room connection closed");
                ConnectionState::Disconnected
            }
            Err(e) => {
                tracing::warn!(room = %room.room_id, error = %e, "connect failed");
                ConnectionState::Error
            }
        };

        if room.is_closed() {
            return;
        }
        room.set_state(outcome);

        // The one place a reconnect is scheduled.
        let attempt = room.attempt.fetch_add(1, Ordering::SeqCst);
        let delay = settings.backoff.next_delay(attempt);
        tracing::info!(
            room = %room.room_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::time::sleep(delay).await;
    }
}
