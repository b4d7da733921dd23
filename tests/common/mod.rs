#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use colabri_board::auth::{AuthGate, OpenAccess, RoomAccess};
use colabri_board::db::StoreProvider;
use colabri_board::models::{ClientMessage, ConnectMessage, ServerMessage};
use colabri_board::ws::persist::RetryPolicy;
use colabri_board::ws::protocol;
use colabri_board::ws::{ConnId, Outbound, OutboundTx, RoomServices};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const SECRET: &str = "integration-secret";

/// An HS256 token for `subject`, valid for `ttl_secs` (negative means
/// already expired).
pub fn token(subject: &str, org: Option<&str>, ttl_secs: i64) -> String {
    let claims = json!({
        "sub": subject,
        "org": org,
        "email": format!("{}@example.com", subject),
        "exp": Utc::now().timestamp() + ttl_secs,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

pub fn admin_token(subject: &str) -> String {
    let claims = json!({
        "sub": subject,
        "roles": ["Colabri-CloudAdmin"],
        "exp": Utc::now().timestamp() + 600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

pub fn services(stores: Arc<dyn StoreProvider>) -> RoomServices {
    services_with(stores, Arc::new(OpenAccess), Duration::from_secs(60))
}

pub fn services_with(
    stores: Arc<dyn StoreProvider>,
    access: Arc<dyn RoomAccess>,
    idle: Duration,
) -> RoomServices {
    RoomServices {
        gate: Arc::new(AuthGate::new(SECRET, 0)),
        access,
        stores,
        retry: RetryPolicy { limit: 1, base: Duration::from_millis(1) },
        idle,
    }
}

pub fn connect(subject: &str, token: String) -> ClientMessage {
    ClientMessage::Connect(ConnectMessage {
        user_id: format!("display-{}", subject),
        user_name: subject.to_uppercase(),
        user_color: "#336699".to_string(),
        token,
    })
}

/// The far end of one connection, as the coordinator sees it.
pub struct Peer {
    pub conn_id: ConnId,
    pub tx: OutboundTx,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Peer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { conn_id: Uuid::new_v4(), tx, rx }
    }

    /// Everything queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn drain_messages(&mut self) -> Vec<ServerMessage> {
        self.drain().iter().filter_map(decode).collect()
    }

    pub async fn next(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection channel closed")
    }

    pub async fn next_message(&mut self) -> ServerMessage {
        loop {
            if let Some(msg) = decode(&self.next().await) {
                return msg;
            }
        }
    }
}

pub fn decode(frame: &Outbound) -> Option<ServerMessage> {
    match frame {
        Outbound::Text(text) => Some(protocol::decode_server(text).unwrap()),
        Outbound::Close { .. } => None,
    }
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
