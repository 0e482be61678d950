//! Authentication session management.
//!
//! [`SessionManager`] is the single source of truth for "is the user signed
//! in" and "which access token should a new connection present". It owns
//! the credential in memory, mirrors it to a [`CredentialStore`], refreshes
//! it before it expires and follows changes other handles make to the same
//! store.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use retriever_shared::{ApiError, TokenResponse, UserProfile};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api_client::AuthApi;
use crate::jwt::{decode_claims, TokenDecodeError};
use crate::lock;
use crate::storage::{CredentialStore, StoredCredential, StoredSession};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Refresh this long before the access token expires.
    pub refresh_skew: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_skew: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session manager used before bootstrap()")]
    NotInitialized,
    #[error("sign-in failed: {}", .0.user_message())]
    Exchange(#[from] ApiError),
}

/// Authentication state as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// `bootstrap()` has not run yet.
    Uninitialized,
    Unauthenticated,
    Authenticated(UserProfile),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }
}

/// The signed-in user's tokens and profile. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Read from the access token's `exp` claim.
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
    /// Response the tokens were issued in, persisted alongside them.
    pub response: Option<TokenResponse>,
}

impl Credential {
    /// Build from a token response, filling profile gaps from the token's
    /// claims and then from `previous`.
    pub fn from_response(
        response: TokenResponse,
        previous: Option<&UserProfile>,
    ) -> Result<Self, TokenDecodeError> {
        let claims = decode_claims(&response.access_token)?;
        let mut user = response.user.clone().merge_missing(&claims.profile());
        if let Some(previous) = previous {
            user = user.merge_missing(previous);
        }
        Ok(Self {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_at: claims.expires_at()?,
            user,
            response: Some(response),
        })
    }

    pub fn from_stored(stored: StoredCredential) -> Result<Self, TokenDecodeError> {
        let claims = decode_claims(&stored.access_token)?;
        Ok(Self {
            expires_at: claims.expires_at()?,
            user: stored.user.merge_missing(&claims.profile()),
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
            response: stored.response,
        })
    }

    pub fn to_stored(&self) -> StoredCredential {
        StoredCredential {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            user: self.user.clone(),
            response: self.response.clone(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Time until a proactive refresh is due, or `None` if it is due now.
pub fn refresh_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>, skew: Duration) -> Option<Duration> {
    let skew_ms = i64::try_from(skew.as_millis()).unwrap_or(i64::MAX);
    let delay_ms = expires_at
        .timestamp_millis()
        .saturating_sub(now.timestamp_millis())
        .saturating_sub(skew_ms);
    u64::try_from(delay_ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[derive(Default)]
struct SessionState {
    initialized: bool,
    credential: Option<Credential>,
    /// Bumped on every credential mutation; async work started under an
    /// older epoch must not apply its result.
    epoch: u64,
    /// Bumped whenever a signed-in user's credential is dropped or replaced
    /// by another user's.
    generation: u64,
    refresh_timer: Option<JoinHandle<()>>,
    refresh_deadline: Option<Instant>,
    sync_task: Option<JoinHandle<()>>,
}

impl SessionState {
    fn cancel_refresh(&mut self) {
        if let Some(timer) = self.refresh_timer.take() {
            timer.abort();
        }
        self.refresh_deadline = None;
    }
}

struct SessionInner {
    store: CredentialStore,
    api: Arc<dyn AuthApi>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    auth_tx: watch::Sender<AuthState>,
    generation_tx: watch::Sender<u64>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.cancel_refresh();
        if let Some(task) = state.sync_task.take() {
            task.abort();
        }
    }
}

/// Owns the credential lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(store: CredentialStore, api: Arc<dyn AuthApi>, config: SessionConfig) -> Self {
        let (auth_tx, _) = watch::channel(AuthState::Uninitialized);
        let (generation_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(SessionInner {
                store,
                api,
                config,
                state: Mutex::new(SessionState::default()),
                auth_tx,
                generation_tx,
            }),
        }
    }

    // =========================================
    // Queries
    // =========================================

    pub fn state(&self) -> AuthState {
        self.inner.auth_tx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.inner.state).credential.is_some()
    }

    pub fn user(&self) -> Option<UserProfile> {
        lock(&self.inner.state)
            .credential
            .as_ref()
            .map(|c| c.user.clone())
    }

    /// The token new connections should present. Read on every connect.
    pub fn access_token(&self) -> Option<String> {
        lock(&self.inner.state)
            .credential
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    pub fn credential(&self) -> Option<Credential> {
        lock(&self.inner.state).credential.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.auth_tx.subscribe()
    }

    /// Counter that moves every time a user's session ends, even when a new
    /// one starts before anyone looks. Anything opened under an older value
    /// belongs to a session that is gone.
    pub fn generation(&self) -> u64 {
        lock(&self.inner.state).generation
    }

    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.inner.generation_tx.subscribe()
    }

    /// Time left until the armed refresh timer fires.
    pub fn refresh_scheduled_in(&self) -> Option<Duration> {
        lock(&self.inner.state)
            .refresh_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    // =========================================
    // Lifecycle
    // =========================================

    /// Restore the persisted session and start following other handles.
    ///
    /// Runs once; later calls return the current state.
    pub async fn bootstrap(&self) -> AuthState {
        {
            let mut state = lock(&self.inner.state);
            if state.initialized {
                drop(state);
                return self.state();
            }
            state.initialized = true;
            state.sync_task = Some(self.spawn_sync_listener());
        }

        let credential = match self.inner.store.load() {
            StoredSession::Absent => None,
            StoredSession::Corrupt(reason) => {
                tracing::warn!(%reason, "discarding unreadable stored session");
                None
            }
            StoredSession::Present(stored) => match Credential::from_stored(stored) {
                Ok(c) if c.is_expired_at(Utc::now()) => {
                    tracing::info!(expired_at = %c.expires_at, "stored session has expired");
                    None
                }
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(error = %e, "stored access token is unreadable");
                    None
                }
            },
        };

        let Some(credential) = credential else {
            if let Err(e) = self.inner.store.clear() {
                tracing::warn!(error = %e, "failed to clear stored session");
            }
            self.publish(AuthState::Unauthenticated);
            return self.state();
        };

        let due_now = refresh_delay(
            credential.expires_at,
            Utc::now(),
            self.inner.config.refresh_skew,
        )
        .is_none();
        tracing::info!(user = %credential.user.id, "restored session");

        if due_now {
            // Adopt without arming a timer, then refresh inline.
            let user = credential.user.clone();
            {
                let mut state = lock(&self.inner.state);
                state.epoch += 1;
                state.credential = Some(credential);
            }
            self.publish(AuthState::Authenticated(user));
            tracing::info!("access token is about to expire, refreshing");
            if let Err(e) = self.refresh().await {
                tracing::debug!(error = %e, "refresh during bootstrap failed");
            }
            return self.state();
        }

        if let Some(epoch) = self.install(credential, false, None) {
            self.reconcile_profile(epoch).await;
        }
        self.state()
    }

    /// Adopt a freshly issued token pair.
    pub async fn login(&self, response: TokenResponse) -> Result<AuthState, SessionError> {
        self.ensure_initialized()?;

        let credential = match Credential::from_response(response, None) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "login response carries an unreadable access token");
                self.logout();
                return Ok(self.state());
            }
        };

        let user_id = credential.user.id.clone();
        if let Some(epoch) = self.install(credential, true, None) {
            tracing::info!(user = %user_id, "signed in");
            self.reconcile_profile(epoch).await;
        }
        Ok(self.state())
    }

    /// Exchange an identity-provider token and log in with the result.
    pub async fn sign_in(&self, id_token: &str) -> Result<AuthState, SessionError> {
        self.ensure_initialized()?;
        let response = self.inner.api.exchange_id_token(id_token).await?;
        self.login(response).await
    }

    /// Drop the credential everywhere. Safe to call repeatedly.
    pub fn logout(&self) {
        let (was_signed_in, initialized) = {
            let mut state = lock(&self.inner.state);
            // Store and memory change under one lock, as in `install`.
            if let Err(e) = self.inner.store.clear() {
                tracing::warn!(error = %e, "failed to clear stored session");
            }
            (self.end_session(&mut state), state.initialized)
        };

        if was_signed_in {
            tracing::info!("signed out");
        }
        if initialized {
            self.publish(AuthState::Unauthenticated);
        }
    }

    /// Trade the refresh token for a new pair. Any failure signs out.
    pub async fn refresh(&self) -> Result<AuthState, SessionError> {
        let (epoch, current) = {
            let state = lock(&self.inner.state);
            if !state.initialized {
                return Err(SessionError::NotInitialized);
            }
            (state.epoch, state.credential.clone())
        };

        let Some(current) = current.filter(|c| !c.refresh_token.is_empty()) else {
            tracing::info!("no refresh token available, signing out");
            self.logout();
            return Ok(self.state());
        };

        match self.inner.api.refresh(&current.refresh_token).await {
            Ok(response) => match Credential::from_response(response, Some(&current.user)) {
                Ok(credential) => {
                    let expires_at = credential.expires_at;
                    match self.install(credential, true, Some(epoch)) {
                        Some(_) => tracing::info!(%expires_at, "access token refreshed"),
                        None => tracing::debug!("discarding refresh result for a replaced session"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "refresh returned an unreadable access token");
                    self.logout_if_current(epoch);
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed");
                self.logout_if_current(epoch);
            }
        }
        Ok(self.state())
    }

    // =========================================
    // Internals
    // =========================================

    fn ensure_initialized(&self) -> Result<(), SessionError> {
        if lock(&self.inner.state).initialized {
            Ok(())
        } else {
            Err(SessionError::NotInitialized)
        }
    }

    fn publish(&self, next: AuthState) {
        self.inner.auth_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Drop the in-memory credential. Returns whether one was held.
    fn end_session(&self, state: &mut SessionState) -> bool {
        state.epoch += 1;
        state.cancel_refresh();
        let was_signed_in = state.credential.take().is_some();
        if was_signed_in {
            self.bump_generation(state);
        }
        was_signed_in
    }

    fn bump_generation(&self, state: &mut SessionState) {
        state.generation += 1;
        self.inner.generation_tx.send_replace(state.generation);
    }

    fn logout_if_current(&self, epoch: u64) {
        if lock(&self.inner.state).epoch == epoch {
            self.logout();
        } else {
            tracing::debug!("session changed during refresh, keeping it");
        }
    }

    /// Replace the in-memory credential and re-arm the refresh timer.
    ///
    /// With `expect_epoch` set, nothing happens unless the session is still
    /// at that epoch. Returns the new epoch when installed.
    fn install(&self, credential: Credential, persist: bool, expect_epoch: Option<u64>) -> Option<u64> {
        let delay = refresh_delay(
            credential.expires_at,
            Utc::now(),
            self.inner.config.refresh_skew,
        );
        let user = credential.user.clone();

        let epoch = {
            let mut state = lock(&self.inner.state);
            if expect_epoch.is_some_and(|expected| expected != state.epoch) {
                return None;
            }
            if persist {
                if let Err(e) = self.inner.store.save(&credential.to_stored()) {
                    tracing::error!(error = %e, "failed to persist session");
                }
            }
            let switched_user = state
                .credential
                .as_ref()
                .is_some_and(|current| current.user.id != credential.user.id);
            if switched_user {
                self.bump_generation(&mut state);
            }
            state.epoch += 1;
            state.credential = Some(credential);
            self.arm_refresh(&mut state, delay.unwrap_or(Duration::ZERO));
            state.epoch
        };

        self.publish(AuthState::Authenticated(user));
        Some(epoch)
    }

    fn arm_refresh(&self, state: &mut SessionState, delay: Duration) {
        state.cancel_refresh();
        tracing::debug!(delay_secs = delay.as_secs(), "refresh scheduled");

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let epoch = state.epoch;
        state.refresh_deadline = Some(Instant::now() + delay);
        state.refresh_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let session = SessionManager { inner };
            if !session.take_refresh_timer(epoch) {
                return;
            }
            if let Err(e) = session.refresh().await {
                tracing::debug!(error = %e, "scheduled refresh skipped");
            }
        }));
    }

    /// Detach the firing timer so the refresh it starts does not abort it.
    fn take_refresh_timer(&self, epoch: u64) -> bool {
        let mut state = lock(&self.inner.state);
        if state.epoch != epoch {
            return false;
        }
        state.refresh_timer = None;
        state.refresh_deadline = None;
        true
    }

    /// Fold the server's profile into the current credential. Best effort:
    /// a failed lookup keeps the locally decoded profile.
    async fn reconcile_profile(&self, epoch: u64) {
        let Some(access_token) = self.access_token() else {
            return;
        };

        let server = match self.inner.api.fetch_profile(&access_token).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(error = %e, "profile lookup failed, keeping token claims");
                return;
            }
        };

        let updated = {
            let mut state = lock(&self.inner.state);
            if state.epoch != epoch {
                return;
            }
            let Some(current) = state.credential.as_mut() else {
                return;
            };
            let merged = server.merge_missing(&current.user);
            if merged == current.user {
                return;
            }
            current.user = merged.clone();
            if let Err(e) = self.inner.store.save(&current.to_stored()) {
                tracing::error!(error = %e, "failed to persist session");
            }
            merged
        };
        self.publish(AuthState::Authenticated(updated));
    }

    fn spawn_sync_listener(&self) -> JoinHandle<()> {
        let mut changes = self.inner.store.external_changes();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = changes.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tracing::debug!(keys = ?event.keys, "stored session changed elsewhere");
                SessionManager { inner }.sync_from_store();
            }
        })
    }

    /// Converge on whatever another handle left in the store, without
    /// calling the backend.
    fn sync_from_store(&self) {
        match self.inner.store.load() {
            StoredSession::Absent => {
                let was_signed_in = self.end_session(&mut lock(&self.inner.state));
                if was_signed_in {
                    tracing::info!("signed out by another session");
                }
                self.publish(AuthState::Unauthenticated);
            }
            StoredSession::Present(stored) => match Credential::from_stored(stored) {
                Ok(credential) if !credential.is_expired_at(Utc::now()) => {
                    if lock(&self.inner.state).credential.as_ref() == Some(&credential) {
                        return;
                    }
                    tracing::info!(user = %credential.user.id, "adopting session from another handle");
                    self.install(credential, false, None);
                }
                Ok(_) => {
                    tracing::info!("session from another handle has expired");
                    self.logout();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "session from another handle is unreadable");
                    self.logout();
                }
            },
            StoredSession::Corrupt(reason) => {
                tracing::warn!(%reason, "stored session is corrupt");
                self.logout();
            }
        }
    }
}
