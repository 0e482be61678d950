//! Retriever Chat - headless client
//!
//! Restores (or creates) a session, joins the rooms given on the command
//! line and relays stdin lines into the first one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use retriever_client::ws::TungsteniteConnector;
use retriever_client::{
    AuthState, ClientConfig, ConnectionManager, CredentialStore, FileStorage, HttpAuthApi,
    SendOutcome, SessionManager,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("retriever_client=info,retriever_chat=info")),
        )
        .init();

    let rooms: Vec<String> = std::env::args().skip(1).collect();
    if rooms.is_empty() {
        bail!("usage: retriever-chat <room-id> [room-id...]");
    }

    let config = ClientConfig::from_env().context("invalid configuration")?;

    let storage = Arc::new(match &config.storage_dir {
        Some(dir) => FileStorage::open(dir),
        None => FileStorage::open_default(),
    }
    .context("failed to open session storage")?);
    tracing::info!(path = %storage.path().display(), "using session storage");
    let _storage_watch = storage.watch(STORAGE_POLL_INTERVAL);

    let session = SessionManager::new(
        CredentialStore::new(storage),
        Arc::new(HttpAuthApi::new(config.api_url.clone())),
        config.session_config(),
    );

    let mut state = session.bootstrap().await;
    if !state.is_authenticated() {
        let id_token = std::env::var("RETRIEVER_ID_TOKEN")
            .context("not signed in and RETRIEVER_ID_TOKEN is not set")?;
        state = session.sign_in(&id_token).await?;
    }
    let AuthState::Authenticated(user) = state else {
        bail!("sign-in did not produce a session");
    };
    tracing::info!(user = %user.display_name(), "signed in");

    let manager = ConnectionManager::new(
        session.clone(),
        Arc::new(TungsteniteConnector),
        config.connection_settings(),
    )?;

    for room_id in &rooms {
        let room = manager.join(room_id)?;
        room.on_message(|msg| {
            println!(
                "[{}] {} {}: {}",
                msg.room_id,
                msg.created_at.format("%H:%M"),
                msg.sender_name,
                msg.content
            );
        });
        let id = room_id.clone();
        room.on_state_change(move |state| tracing::info!(room = %id, ?state, "room state"));
    }

    let target = &rooms[0];
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match manager.send(target, &line) {
                    SendOutcome::Sent => {}
                    outcome => tracing::warn!(room = %target, ?outcome, "message not sent"),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.close_all();
    Ok(())
}
