mod common;

use common::{closes_within, next_json, spawn_server, spawn_server_with_store, test_config, text};
use futures_util::SinkExt;
use playzy_messages::{Message, MessageError, MessageStore, NewMessage};
use playzy_server::config::IdentitySource;
use playzy_server::read_receipts::ReadReceiptOutcome;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;

fn rejection_status(result: Result<impl Sized, WsError>) -> u16 {
    match result {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("expected an HTTP rejection, got {other:?}"),
        Ok(_) => panic!("expected the upgrade to be rejected"),
    }
}

#[tokio::test]
async fn message_to_offline_user_lands_in_history_and_is_marked_read() {
    let server = spawn_server(test_config()).await;

    let mut alice = server.connect("alice").await;
    server.wait_online("alice").await;

    alice
        .send(text(json!({"content": "hello bob", "receiverId": "bob"})))
        .await
        .expect("send");

    let stored = server.wait_for_history("alice", "bob", 1).await;
    assert_eq!(stored[0].content, "hello bob");
    assert!(!stored[0].is_read);

    let mut outcomes = server.state.read_receipts.subscribe();
    let bob_token = server.token_for("bob");

    let (status, body) = server
        .get_json("/conversations?otherUserId=alice", &bob_token)
        .await;
    assert_eq!(status, 200);
    let page = body.as_array().expect("array body");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["content"], "hello bob");
    assert_eq!(page[0]["senderId"], "alice");
    assert_eq!(page[0]["receiverId"], "bob");
    assert_eq!(page[0]["isMine"], false);
    assert_eq!(page[0]["isRead"], false);

    let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
        .await
        .expect("mark-read should finish")
        .expect("outcome channel open");
    assert_eq!(
        outcome,
        ReadReceiptOutcome::Marked {
            owner: "bob".to_string(),
            counterpart: "alice".to_string(),
            updated: 1,
        }
    );

    let (_, body) = server
        .get_json("/conversations?otherUserId=alice", &bob_token)
        .await;
    assert_eq!(body[0]["isRead"], true);
}

#[tokio::test]
async fn online_receiver_gets_the_message_and_sender_gets_no_echo() {
    let server = spawn_server(test_config()).await;

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    server.wait_online("alice").await;
    server.wait_online("bob").await;

    alice
        .send(text(json!({"content": "queue up?", "receiverId": "bob"})))
        .await
        .expect("send");

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["content"], "queue up?");
    assert_eq!(frame["senderId"], "alice");
    assert_eq!(frame["receiverId"], "bob");
    assert_eq!(frame["isRead"], false);
    assert!(frame["id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(frame["timestamp"].is_string());

    let stored = server.wait_for_history("alice", "bob", 1).await;
    assert_eq!(frame["id"], stored[0].id.as_str());

    common::assert_silent(&mut alice, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn padded_receiver_id_is_routed_to_the_trimmed_user() {
    let server = spawn_server(test_config()).await;

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    server.wait_online("alice").await;
    server.wait_online("bob").await;

    alice
        .send(text(json!({"content": "gg", "receiverId": "  bob "})))
        .await
        .expect("send");

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["receiverId"], "bob");

    let stored = server.wait_for_history("alice", "bob", 1).await;
    assert_eq!(stored[0].receiver_id, "bob");
}

#[tokio::test]
async fn second_connection_closes_the_first() {
    let server = spawn_server(test_config()).await;

    let mut first = server.connect("alice").await;
    server.wait_online("alice").await;
    let first_id = server.state.registry.lookup("alice").await;

    let mut second = server.connect("alice").await;
    let registry = server.state.registry.clone();
    common::wait_for(|| {
        let registry = registry.clone();
        async move {
            let current = registry.lookup("alice").await;
            current.is_some() && current != first_id
        }
    })
    .await;

    assert!(
        closes_within(&mut first, Duration::from_secs(2)).await,
        "superseded socket should be closed"
    );
    assert_eq!(server.state.registry.len().await, 1);

    let mut bob = server.connect("bob").await;
    server.wait_online("bob").await;
    bob.send(text(json!({"content": "still there?", "receiverId": "alice"})))
        .await
        .expect("send");

    let frame = next_json(&mut second).await;
    assert_eq!(frame["content"], "still there?");
}

#[tokio::test]
async fn invalid_frames_are_dropped_without_closing_the_connection() {
    let mut config = test_config();
    config.gateway.max_frame_bytes = 256;
    let server = spawn_server(config).await;

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    server.wait_online("alice").await;
    server.wait_online("bob").await;

    let oversized = json!({"content": "x".repeat(300), "receiverId": "bob"});
    for frame in [
        text(oversized),
        "{not json".into(),
        text(json!({"content": "", "receiverId": "bob"})),
        text(json!({"content": "nobody"})),
    ] {
        alice.send(frame).await.expect("send");
    }
    alice
        .send(text(json!({"content": "this one counts", "receiverId": "bob"})))
        .await
        .expect("send");

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["content"], "this one counts");

    let stored = server.wait_for_history("alice", "bob", 1).await;
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn frame_at_the_size_limit_is_accepted() {
    let mut config = test_config();
    let body = json!({"content": "y".repeat(100), "receiverId": "bob"}).to_string();
    config.gateway.max_frame_bytes = body.len();
    let server = spawn_server(config).await;

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    server.wait_online("alice").await;
    server.wait_online("bob").await;

    alice.send(body.into()).await.expect("send");

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["content"], "y".repeat(100));
}

#[tokio::test]
async fn missing_user_id_is_rejected_with_400() {
    let server = spawn_server(test_config()).await;

    let result = connect_async(format!("ws://{}/ws", server.addr)).await;
    assert_eq!(rejection_status(result), 400);
    assert!(server.state.registry.is_empty().await);
}

#[tokio::test]
async fn rapid_reconnect_is_rejected_with_429() {
    let mut config = test_config();
    config.gateway.connect_cooldown_ms = 60_000;
    let server = spawn_server(config).await;

    let _alice = server.connect("alice").await;
    let result = connect_async(format!("ws://{}/ws?userID=alice", server.addr)).await;
    assert_eq!(rejection_status(result), 429);

    let _bob = server.connect("bob").await;
}

#[tokio::test]
async fn saturated_register_queue_is_rejected_with_503() {
    let mut config = test_config();
    config.registry.register_capacity = 1;
    let server = spawn_server(config).await;

    let _slot = server
        .state
        .registry
        .try_reserve_register()
        .expect("reserve the only slot");

    let result = connect_async(format!("ws://{}/ws?userID=alice", server.addr)).await;
    assert_eq!(rejection_status(result), 503);
}

#[tokio::test]
async fn busy_rejection_does_not_start_the_cooldown() {
    let mut config = test_config();
    config.registry.register_capacity = 1;
    config.gateway.connect_cooldown_ms = 60_000;
    let server = spawn_server(config).await;

    let slot = server
        .state
        .registry
        .try_reserve_register()
        .expect("reserve the only slot");
    let result = connect_async(format!("ws://{}/ws?userID=alice", server.addr)).await;
    assert_eq!(rejection_status(result), 503);

    drop(slot);
    let _alice = server.connect("alice").await;
    server.wait_online("alice").await;
}

#[tokio::test]
async fn token_mode_takes_identity_from_the_token() {
    let mut config = test_config();
    config.gateway.identity_source = IdentitySource::Token;
    let server = spawn_server(config).await;

    let token = server.token_for("alice");
    let (_alice, _) = connect_async(format!("ws://{}/ws?token={}", server.addr, token))
        .await
        .expect("token connect");
    server.wait_online("alice").await;

    let ignored_query = connect_async(format!("ws://{}/ws?userID=bob", server.addr)).await;
    assert_eq!(rejection_status(ignored_query), 400);

    let forged = connect_async(format!("ws://{}/ws?token=not.a.jwt", server.addr)).await;
    assert_eq!(rejection_status(forged), 400);
}

#[tokio::test]
async fn silent_client_is_dropped_after_the_read_deadline() {
    let mut config = test_config();
    config.gateway.pong_wait_secs = 2;
    config.gateway.ping_period_secs = 1;
    let server = spawn_server(config).await;

    // Never polled, so the client never answers pings.
    let _alice = server.connect("alice").await;
    server.wait_online("alice").await;

    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let registry = server.state.registry.clone();
    common::wait_for(|| {
        let registry = registry.clone();
        async move { registry.lookup("alice").await.is_none() }
    })
    .await;
}

#[tokio::test]
async fn server_pings_idle_clients() {
    let mut config = test_config();
    config.gateway.pong_wait_secs = 3;
    config.gateway.ping_period_secs = 1;
    let server = spawn_server(config).await;

    let mut alice = server.connect("alice").await;
    let ping = tokio::time::timeout(Duration::from_secs(3), async {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
        while let Some(Ok(frame)) = alice.next().await {
            if matches!(frame, WsMessage::Ping(_)) {
                return true;
            }
        }
        false
    })
    .await
    .expect("a ping should arrive within the ping period");
    assert!(ping);
}

struct FailingStore;

impl MessageStore for FailingStore {
    fn append(&self, _draft: &NewMessage) -> Result<Message, MessageError> {
        Err(MessageError::Database(rusqlite::Error::InvalidQuery))
    }

    fn list_between(
        &self,
        _a: &str,
        _b: &str,
        _limit: u32,
        _offset: u32,
    ) -> Result<Vec<Message>, MessageError> {
        Ok(Vec::new())
    }

    fn mark_read(&self, _owner: &str, _counterpart: &str) -> Result<usize, MessageError> {
        Ok(0)
    }
}

#[tokio::test]
async fn persistence_failure_does_not_block_live_delivery() {
    let server = spawn_server_with_store(test_config(), Arc::new(FailingStore)).await;

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    server.wait_online("alice").await;
    server.wait_online("bob").await;

    alice
        .send(text(json!({"content": "db is down", "receiverId": "bob"})))
        .await
        .expect("send");

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["content"], "db is down");
    assert!(frame["id"].as_str().is_some_and(|id| !id.is_empty()));
}
