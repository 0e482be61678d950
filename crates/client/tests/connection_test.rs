mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    session_on, settle, signed_in_session, test_settings, token_response, FakeAuthApi,
    FakeConnector, Step,
};
use futures_util::{FutureExt, StreamExt};
use retriever_client::storage::MemoryStorage;
use retriever_client::ws::{ConnectionError, ConnectionManager, ConnectionState, SendOutcome};
use serde_json::json;
use tokio::sync::oneshot;

async fn manager_with(steps: Vec<Step>) -> (
    ConnectionManager,
    Arc<FakeConnector>,
    tokio::sync::mpsc::UnboundedReceiver<common::ServerSide>,
    retriever_client::SessionManager,
) {
    let api = FakeAuthApi::new();
    let (session, _storage) = signed_in_session(api).await;
    let (connector, accepted) = FakeConnector::new(steps);
    let manager =
        ConnectionManager::new(session.clone(), connector.clone(), test_settings()).unwrap();
    (manager, connector, accepted, session)
}

fn record_states(room: &retriever_client::RoomConnection) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    room.on_state_change(move |state| sink.lock().unwrap().push(state));
    seen
}

#[tokio::test(start_paused = true)]
async fn history_then_live_duplicate_is_delivered_once() {
    let (manager, _connector, mut accepted, _session) = manager_with(vec![Step::Accept]).await;
    let room = manager.join("g1").unwrap();
    let mut messages = room.messages();

    let server = accepted.recv().await.unwrap();
    server.push(json!({
        "type": "chat_history",
        "messages": [
            {"messageId": "m1", "senderName": "Ada", "content": "first"},
            {"messageId": "m2", "senderName": "Grace", "content": "second"},
        ],
    }));
    server.push(json!({"type": "message", "messageId": "m1", "content": "first"}));
    server.push(json!({"type": "message", "messageId": "m3", "content": "third"}));

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(messages.next().await.unwrap().id);
    }
    assert_eq!(ids, vec!["m1", "m2", "m3"]);

    settle().await;
    assert!(messages.next().now_or_never().is_none(), "no further deliveries expected");
}

#[tokio::test(start_paused = true)]
async fn dedup_survives_reconnect() {
    let (manager, _connector, mut accepted, _session) =
        manager_with(vec![Step::Accept, Step::Accept]).await;
    let room = manager.join("g1").unwrap();
    let states = record_states(&room);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    room.on_message(move |msg| sink.lock().unwrap().push(msg.id.clone()));

    let first = accepted.recv().await.unwrap();
    first.push(json!({"type": "chat_history", "messages": [{"messageId": "m1", "content": "a"}]}));
    settle().await;
    drop(first);

    let second = accepted.recv().await.unwrap();
    second.push(json!({
        "type": "chat_history",
        "messages": [
            {"messageId": "m1", "content": "a"},
            {"messageId": "m2", "content": "b"},
        ],
    }));
    settle().await;

    assert_eq!(*delivered.lock().unwrap(), vec!["m1", "m2"]);
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(room.attempt(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_exponentially() {
    let (manager, connector, _accepted, _session) =
        manager_with(vec![Step::Fail, Step::Fail, Step::Fail]).await;
    let room = manager.join("g1").unwrap();

    tokio::time::sleep(Duration::from_millis(750)).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1].1 - w[0].1).collect();
    for (gap, expected) in gaps.iter().zip([100u64, 200, 400]) {
        let expected = Duration::from_millis(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(5),
            "gap {gap:?}, expected {expected:?}"
        );
    }
    assert_eq!(room.attempt(), 3);
    assert_eq!(room.state(), ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn server_error_frame_moves_to_error_without_closing() {
    let (manager, _connector, mut accepted, _session) = manager_with(vec![Step::Accept]).await;
    let room = manager.join("g1").unwrap();
    let server = accepted.recv().await.unwrap();
    settle().await;
    assert_eq!(room.state(), ConnectionState::Connected);

    server.push(json!({"type": "error", "error": "NOT_MEMBER", "message": "Join the group first"}));
    server.push(json!("not an object"));
    server.to_client.unbounded_send("{broken".to_string()).unwrap();
    settle().await;
    assert_eq!(room.state(), ConnectionState::Error);

    // The link is still open: frames keep flowing.
    let mut messages = room.messages();
    server.push(json!({"id": "m9", "text": "still here"}));
    assert_eq!(messages.next().await.unwrap().content, "still here");
}

#[tokio::test(start_paused = true)]
async fn leave_suppresses_late_connect() {
    let (gate_tx, gate_rx) = oneshot::channel();
    let (manager, _connector, mut accepted, _session) =
        manager_with(vec![Step::Gate(gate_rx)]).await;
    let room = manager.join("g1").unwrap();
    let states = record_states(&room);
    let delivered = Arc::new(Mutex::new(0usize));
    let sink = delivered.clone();
    room.on_message(move |_| *sink.lock().unwrap() += 1);
    settle().await;

    assert!(manager.leave("g1"));
    assert!(!manager.leave("g1"));
    let _ = gate_tx.send(());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(accepted.try_recv().is_err());
    assert!(states.lock().unwrap().is_empty());
    assert_eq!(*delivered.lock().unwrap(), 0);
    assert!(room.is_closed());
    assert_eq!(room.state(), ConnectionState::Disconnected);
    assert!(manager.rooms().is_empty());
}

#[tokio::test(start_paused = true)]
async fn leave_drops_frames_in_flight() {
    let (manager, _connector, mut accepted, _session) = manager_with(vec![Step::Accept]).await;
    let room = manager.join("g1").unwrap();
    let mut messages = room.messages();
    let server = accepted.recv().await.unwrap();
    settle().await;

    manager.leave("g1");
    let _ = server.to_client.unbounded_send(json!({"id": "m1", "content": "late"}).to_string());
    settle().await;

    assert_eq!(messages.next().await, None);
}

#[tokio::test(start_paused = true)]
async fn send_requires_connection_and_truncates() {
    let (manager, _connector, mut accepted, _session) = manager_with(vec![Step::Accept]).await;
    let room = manager.join("g1").unwrap();

    assert_eq!(manager.send("g1", "too early"), SendOutcome::NotConnected);
    assert_eq!(manager.send("nowhere", "hi"), SendOutcome::UnknownRoom);

    let mut server = accepted.recv().await.unwrap();
    settle().await;
    assert!(room.state().is_connected());

    let long = "x".repeat(2500);
    assert_eq!(manager.send("g1", &long), SendOutcome::Sent);

    let frame: serde_json::Value =
        serde_json::from_str(&server.from_client.next().await.unwrap()).unwrap();
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["content"].as_str().unwrap().chars().count(), 2000);
}

#[tokio::test(start_paused = true)]
async fn reconnect_presents_latest_token() {
    let (manager, _connector, mut accepted, session) =
        manager_with(vec![Step::Accept, Step::Accept]).await;
    manager.join("cmsc 341").unwrap();

    let first = accepted.recv().await.unwrap();
    assert_eq!(first.url.path(), "/ws/groups/cmsc%20341");
    assert_eq!(first.token(), session.access_token());

    let renewed = token_response("u1", "a@umbc.edu", 1800);
    session.login(renewed.clone()).await.unwrap();
    drop(first);

    let second = accepted.recv().await.unwrap();
    assert_eq!(second.token(), Some(renewed.access_token));
}

#[tokio::test(start_paused = true)]
async fn join_is_idempotent() {
    let (manager, connector, _accepted, _session) = manager_with(vec![Step::Hang]).await;
    let a = manager.join("g1").unwrap();
    let b = manager.join("g1").unwrap();
    settle().await;

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(manager.rooms(), vec!["g1".to_string()]);
    assert_eq!(manager.state("g1"), Some(ConnectionState::Connecting));
}

#[tokio::test(start_paused = true)]
async fn logout_closes_every_room() {
    let (manager, _connector, mut accepted, session) =
        manager_with(vec![Step::Accept, Step::Accept]).await;
    let g1 = manager.join("g1").unwrap();
    let g2 = manager.join("g2").unwrap();
    let _s1 = accepted.recv().await.unwrap();
    let _s2 = accepted.recv().await.unwrap();
    settle().await;

    session.logout();
    settle().await;

    assert!(manager.rooms().is_empty());
    assert!(g1.is_closed() && g2.is_closed());
    assert!(matches!(manager.join("g1"), Err(ConnectionError::NotAuthenticated)));
}

#[tokio::test(start_paused = true)]
async fn logout_then_login_closes_rooms_of_the_ended_session() {
    let (manager, _connector, mut accepted, session) =
        manager_with(vec![Step::Accept, Step::Hang]).await;
    let g1 = manager.join("g1").unwrap();
    let _s1 = accepted.recv().await.unwrap();
    settle().await;

    session.logout();
    session
        .login(token_response("u2", "b@umbc.edu", 1800))
        .await
        .unwrap();
    settle().await;

    assert!(manager.rooms().is_empty());
    assert!(g1.is_closed());

    let g2 = manager.join("g2").unwrap();
    settle().await;
    assert_eq!(manager.rooms(), vec!["g2"]);
    assert!(!g2.is_closed());
}

#[tokio::test(start_paused = true)]
async fn switching_user_closes_rooms() {
    let (manager, _connector, mut accepted, session) = manager_with(vec![Step::Accept]).await;
    let g1 = manager.join("g1").unwrap();
    let _s1 = accepted.recv().await.unwrap();
    settle().await;

    session
        .login(token_response("u2", "b@umbc.edu", 1800))
        .await
        .unwrap();
    settle().await;

    assert!(g1.is_closed());
    assert!(manager.rooms().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejoin_after_sign_out_opens_a_fresh_room() {
    let (manager, _connector, _accepted, session) =
        manager_with(vec![Step::Hang, Step::Hang]).await;
    let before = manager.join("g1").unwrap();

    session.logout();
    session
        .login(token_response("u1", "a@umbc.edu", 1800))
        .await
        .unwrap();
    let after = manager.join("g1").unwrap();

    assert!(before.is_closed());
    assert!(!Arc::ptr_eq(&before, &after));
    settle().await;
    assert_eq!(manager.rooms(), vec!["g1"]);
    assert!(!after.is_closed());
}

#[tokio::test(start_paused = true)]
async fn refresh_without_refresh_token_closes_rooms() {
    let api = FakeAuthApi::new();
    let storage = MemoryStorage::new();
    let session = session_on(&storage, api.clone());
    session.bootstrap().await;
    let mut response = token_response("u1", "a@umbc.edu", 1800);
    response.refresh_token.clear();
    session.login(response).await.unwrap();

    let (connector, _accepted) = FakeConnector::new(vec![Step::Accept]);
    let manager = ConnectionManager::new(session.clone(), connector, test_settings()).unwrap();
    let room = manager.join("g1").unwrap();
    settle().await;

    session.refresh().await.unwrap();
    settle().await;

    assert_eq!(api.refreshes(), 0);
    assert!(storage.snapshot().is_empty());
    assert!(room.is_closed());
    assert!(manager.rooms().is_empty());
}

#[tokio::test(start_paused = true)]
async fn join_requires_a_session() {
    let api = FakeAuthApi::new();
    let session = session_on(&MemoryStorage::new(), api);
    let (connector, _accepted) = FakeConnector::new(vec![]);
    let manager = ConnectionManager::new(session.clone(), connector, test_settings()).unwrap();

    assert!(matches!(
        manager.join("g1"),
        Err(ConnectionError::SessionNotInitialized)
    ));
    session.bootstrap().await;
    assert!(matches!(manager.join("g1"), Err(ConnectionError::NotAuthenticated)));
}
