//! Fakes and builders shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use retriever_client::api_client::AuthApi;
use retriever_client::auth_session::{SessionConfig, SessionManager};
use retriever_client::storage::{CredentialStore, MemoryStorage};
use retriever_client::ws::{Backoff, ConnectionSettings, Connector, TransportError, TransportLink};
use retriever_shared::{ApiError, TokenResponse, UserProfile};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use url::Url;

static TOKEN_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A backend-shaped access token expiring `expires_in` seconds from now.
pub fn access_token(user_id: &str, email: &str, expires_in: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "sub": user_id,
        "user_id": user_id,
        "email": email,
        "name": "Token Name",
        "exp": Utc::now().timestamp() + expires_in,
        "type": "access",
        "jti": TOKEN_SERIAL.fetch_add(1, Ordering::Relaxed),
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

pub fn token_response(user_id: &str, email: &str, expires_in: i64) -> TokenResponse {
    TokenResponse {
        access_token: access_token(user_id, email, expires_in),
        refresh_token: format!("refresh-{}", TOKEN_SERIAL.fetch_add(1, Ordering::Relaxed)),
        token_type: "bearer".to_string(),
        expires_in: expires_in.max(0) as u64,
        user: UserProfile {
            id: user_id.to_string(),
            email: Some(email.to_string()),
            ..Default::default()
        },
    }
}

fn unauthorized() -> ApiError {
    ApiError::Http {
        status: 401,
        body: r#"{"detail":"Invalid refresh token"}"#.to_string(),
    }
}

/// Scripted auth backend. Refreshes fail with 401 unless a result is queued.
#[derive(Default)]
pub struct FakeAuthApi {
    pub exchange_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    exchange_result: Mutex<Option<Result<TokenResponse, ApiError>>>,
    refresh_results: Mutex<VecDeque<Result<TokenResponse, ApiError>>>,
    refresh_gate: Mutex<Option<oneshot::Receiver<()>>>,
    profile: Mutex<Option<UserProfile>>,
}

impl FakeAuthApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_exchange(&self, result: Result<TokenResponse, ApiError>) {
        *self.exchange_result.lock().unwrap() = Some(result);
    }

    pub fn queue_refresh(&self, result: Result<TokenResponse, ApiError>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    /// Hold the next refresh call until the returned sender fires.
    pub fn gate_refresh(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.refresh_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn set_profile(&self, profile: UserProfile) {
        *self.profile.lock().unwrap() = Some(profile);
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for FakeAuthApi {
    async fn exchange_id_token(&self, _id_token: &str) -> Result<TokenResponse, ApiError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.exchange_result.lock().unwrap().take();
        result.unwrap_or_else(|| Err(unauthorized()))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.refresh_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let result = self.refresh_results.lock().unwrap().pop_front();
        result.unwrap_or_else(|| Err(unauthorized()))
    }

    async fn fetch_profile(&self, _access_token: &str) -> Result<UserProfile, ApiError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        let profile = self.profile.lock().unwrap().clone();
        profile.ok_or_else(|| ApiError::Network("profile endpoint unavailable".to_string()))
    }
}

pub fn session_on(storage: &MemoryStorage, api: Arc<FakeAuthApi>) -> SessionManager {
    SessionManager::new(
        CredentialStore::new(Arc::new(storage.clone())),
        api,
        SessionConfig::default(),
    )
}

/// A bootstrapped session signed in as `u1`.
pub async fn signed_in_session(api: Arc<FakeAuthApi>) -> (SessionManager, MemoryStorage) {
    let storage = MemoryStorage::new();
    let session = session_on(&storage, api);
    session.bootstrap().await;
    session
        .login(token_response("u1", "a@umbc.edu", 1800))
        .await
        .unwrap();
    (session, storage)
}

// =========================================
// Transport
// =========================================

/// What the fake connector does on one connect attempt.
pub enum Step {
    Fail,
    Accept,
    /// Never resolves.
    Hang,
    /// Accept once the sender fires.
    Gate(oneshot::Receiver<()>),
}

/// The server's end of an accepted link.
pub struct ServerSide {
    pub url: Url,
    pub to_client: UnboundedSender<String>,
    pub from_client: UnboundedReceiver<String>,
}

impl ServerSide {
    pub fn push(&self, frame: serde_json::Value) {
        self.to_client.unbounded_send(frame.to_string()).unwrap();
    }

    pub fn token(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    }
}

pub struct FakeConnector {
    script: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<(Url, Instant)>>,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

impl FakeConnector {
    /// Attempts beyond the script hang.
    pub fn new(steps: Vec<Step>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(steps.into()),
            attempts: Mutex::new(Vec::new()),
            accepted,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> Vec<(Url, Instant)> {
        self.attempts.lock().unwrap().clone()
    }

    fn accept(&self, url: &Url) -> TransportLink {
        let (to_client, incoming) = unbounded();
        let (outgoing, from_client) = unbounded();
        let _ = self.accepted.send(ServerSide {
            url: url.clone(),
            to_client,
            from_client,
        });
        TransportLink { outgoing, incoming }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<TransportLink, TransportError> {
        self.attempts.lock().unwrap().push((url.clone(), Instant::now()));
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Hang);
        match step {
            Step::Fail => Err(TransportError::Connect("connection refused".to_string())),
            Step::Accept => Ok(self.accept(url)),
            Step::Hang => std::future::pending().await,
            Step::Gate(gate) => {
                let _ = gate.await;
                Ok(self.accept(url))
            }
        }
    }
}

pub fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        ws_base: Url::parse("ws://localhost:8000").unwrap(),
        backoff: Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: Duration::ZERO,
        },
        connect_timeout: Duration::from_secs(60),
        keepalive: None,
    }
}

/// Let spawned tasks run without moving the paused clock meaningfully.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
