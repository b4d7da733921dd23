mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use colabri_board::auth::OpenAccess;
use colabri_board::client::{
    ClientConfig, ClientError, ClientEvent, ClientHandle, ConnectionStatus, ReconnectPolicy,
    StaticToken, SyncClient, TokenFn, TokenSource,
};
use colabri_board::config::Config;
use colabri_board::db::{MemoryStore, StoreProvider};
use colabri_board::models::{ChangeSet, ClientMessage, Record, ServerMessage};
use colabri_board::ws::protocol;
use colabri_board::ws::RoomRegistry;
use colabri_board::{build_app, AppState};
use common::{connect, services_with, token};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

async fn spawn_server() -> String {
    let stores: Arc<dyn StoreProvider> = Arc::new(MemoryStore::new());
    let services = services_with(stores, Arc::new(OpenAccess), Duration::from_secs(60));
    let state = Arc::new(AppState::new(Config::default(), RoomRegistry::new(services)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_app(state)).await.unwrap();
    });
    format!("ws://{}/api", addr)
}

fn config(server: &str, room: &str, user: &str) -> ClientConfig {
    let mut config = ClientConfig::new(server, room, user, user.to_uppercase(), "#123456");
    config.reconnect = ReconnectPolicy {
        base: Duration::from_millis(50),
        max: Duration::from_millis(200),
        max_attempts: 5,
    };
    config
}

fn start(config: ClientConfig, tokens: impl TokenSource + 'static) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let (handle, events, _task) = SyncClient::new(config, tokens).spawn();
    (handle, events)
}

async fn wait_event(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("client stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_record(handle: &ClientHandle, id: &str) {
    for _ in 0..500 {
        if handle.snapshot().await.unwrap().records.contains_key(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record {} never arrived", id);
}

fn shape(id: &str) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.add(Record::new(id, "shape", json!({ "x": 5, "y": 8 })));
    changes
}

#[tokio::test]
async fn edits_flow_between_two_clients() {
    let server = spawn_server().await;
    let (alice, mut alice_events) = start(config(&server, "r1", "alice"), StaticToken(token("alice", None, 600)));
    alice.connected().await.unwrap();

    let (bob, _bob_events) = start(config(&server, "r1", "bob"), StaticToken(token("bob", None, 600)));
    bob.connected().await.unwrap();

    let joined = wait_event(&mut alice_events, |e| matches!(e, ClientEvent::UserJoined(_))).await;
    assert_eq!(joined, ClientEvent::UserJoined(colabri_board::models::UserInfo {
        id: "bob".into(),
        name: "BOB".into(),
        color: "#123456".into(),
    }));

    alice.edit(shape("shapeX")).unwrap();
    wait_record(&bob, "shapeX").await;

    // alice's own change is never played back to her
    let snapshot = alice.snapshot().await.unwrap();
    assert!(snapshot.records.contains_key("shapeX"));
    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, ClientEvent::RemoteUpdate { .. }), "echo: {:?}", event);
    }

    bob.disconnect().unwrap();
    let left = wait_event(&mut alice_events, |e| matches!(e, ClientEvent::UserLeft(_))).await;
    assert_eq!(left, ClientEvent::UserLeft("bob".into()));
    for _ in 0..500 {
        if bob.status() == ConnectionStatus::Disconnected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bob never settled as disconnected");
}

#[tokio::test]
async fn late_joiner_hydrates_existing_records() {
    let server = spawn_server().await;
    let (alice, _events) = start(config(&server, "r2", "alice"), StaticToken(token("alice", None, 600)));
    alice.connected().await.unwrap();
    alice.edit(shape("s1")).unwrap();

    let mut arrow = ChangeSet::default();
    arrow.add(Record::new("a1", "binding", json!({ "fromId": "s1", "toId": "s2" })));
    arrow.add(Record::new("s2", "shape", json!({})));
    alice.edit(arrow).unwrap();

    // Give the room a moment to apply both edits before bob joins.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (bob, mut bob_events) = start(config(&server, "r2", "bob"), StaticToken(token("bob", None, 600)));
    let hydrated = wait_event(&mut bob_events, |e| matches!(e, ClientEvent::Hydrated { .. })).await;
    assert_eq!(hydrated, ClientEvent::Hydrated { records: 3, users: 2 });
    assert_eq!(bob.snapshot().await.unwrap().records.len(), 3);
}

#[tokio::test]
async fn expired_connect_token_gets_retry_hint_and_close() {
    let server = spawn_server().await;
    let url = format!("{}/v1/rooms/r1/ws?token={}", server, token("alice", None, 600));
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let hello: ClientMessage = connect("alice", token("alice", None, -300));
    socket.send(Message::text(protocol::encode(&hello).unwrap())).await.unwrap();

    let mut got_error = false;
    let mut close_code = None;
    while let Some(Ok(frame)) = socket.next().await {
        match frame {
            Message::Text(text) => match protocol::decode_server(text.as_str()).unwrap() {
                ServerMessage::Error(err) => {
                    assert_eq!(err.error, "auth_expired");
                    assert_eq!(err.should_retry, Some(true));
                    got_error = true;
                }
                other => panic!("unexpected message {:?}", other),
            },
            Message::Close(frame) => {
                close_code = frame.map(|f| f.code);
                break;
            }
            _ => {}
        }
    }
    assert!(got_error);
    assert_eq!(close_code, Some(CloseCode::from(4401)));
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_connection() {
    let server = spawn_server().await;
    let url = format!("{}/v1/rooms/r1/ws?token={}", server, token("alice", None, 600));
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    socket.send(Message::text(r#"{"type":"teleport"}"#)).await.unwrap();
    let hello = connect("alice", token("alice", None, 600));
    socket.send(Message::text(protocol::encode(&hello).unwrap())).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => seen.push(protocol::decode_server(text.as_str()).unwrap()),
            Some(Ok(_)) => {}
            other => panic!("connection ended: {:?}", other),
        }
    }
    match &seen[0] {
        ServerMessage::Error(err) => {
            assert_eq!(err.error, "malformed_message");
            assert_eq!(err.should_retry, None);
        }
        other => panic!("unexpected message {:?}", other),
    }
    assert!(matches!(seen[1], ServerMessage::Init(_)));
}

#[tokio::test]
async fn expired_token_is_refreshed_immediately() {
    let server = spawn_server().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let tokens = TokenFn(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            // The first token handed out is already stale.
            let ttl = if n == 0 { -300 } else { 600 };
            Ok::<_, ClientError>(token("alice", None, ttl))
        }
    });

    let mut config = config(&server, "r1", "alice");
    config.reconnect.base = Duration::from_secs(30);
    config.reconnect.max = Duration::from_secs(30);

    let started = Instant::now();
    let (alice, _events) = start(config, tokens);
    tokio::time::timeout(Duration::from_secs(5), alice.connected()).await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn offline_edits_are_replayed_after_init() {
    let server = spawn_server().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let tokens = TokenFn(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Err(ClientError::Token("identity provider offline".into()))
            } else {
                Ok(token("alice", None, 600))
            }
        }
    });

    let mut alice_config = config(&server, "r3", "alice");
    alice_config.reconnect.base = Duration::from_millis(300);
    let (alice, mut alice_events) = start(alice_config, tokens);
    wait_event(&mut alice_events, |e| matches!(e, ClientEvent::Status(ConnectionStatus::Reconnecting { .. }))).await;
    alice.edit(shape("offline-1")).unwrap();
    alice.connected().await.unwrap();

    let (bob, _bob_events) = start(config(&server, "r3", "bob"), StaticToken(token("bob", None, 600)));
    bob.connected().await.unwrap();
    wait_record(&bob, "offline-1").await;
}

#[tokio::test]
async fn unreachable_server_ends_in_failed_state() {
    // Bind and drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = config(&format!("ws://{}/api", addr), "r1", "alice");
    config.reconnect = ReconnectPolicy {
        base: Duration::from_millis(10),
        max: Duration::from_millis(20),
        max_attempts: 2,
    };
    let (alice, _events) = start(config, StaticToken(token("alice", None, 600)));

    let result = tokio::time::timeout(Duration::from_secs(5), alice.connected()).await.unwrap();
    assert!(matches!(result, Err(ClientError::ReconnectExhausted)));
    assert_eq!(alice.status(), ConnectionStatus::Failed);
}

#[tokio::test]
async fn malformed_token_waits_for_normal_backoff() {
    let server = spawn_server().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let tokens = TokenFn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, ClientError>("not-a-jwt".to_string()) }
    });

    let mut config = config(&server, "r1", "alice");
    config.reconnect.base = Duration::from_secs(30);
    config.reconnect.max = Duration::from_secs(30);

    let (alice, mut events) = start(config, tokens);
    let status = wait_event(&mut events, |e| matches!(e, ClientEvent::Status(ConnectionStatus::Reconnecting { .. }))).await;
    assert_eq!(status, ClientEvent::Status(ConnectionStatus::Reconnecting { attempt: 1 }));

    // No silent re-auth: the next attempt only comes after the backoff delay.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(alice.status(), ConnectionStatus::Reconnecting { attempt: 1 });
}
