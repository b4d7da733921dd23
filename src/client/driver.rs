//! Websocket driver for one room.
//!
//! A single task owns the [`Mirror`], the [`CursorThrottle`] and the
//! [`Reconnector`]. The application talks to it through a [`ClientHandle`]
//! and listens to [`ClientEvent`]s.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::{header, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::mirror::{Mirror, RemoteCursor};
use crate::client::reconnect::{ConnectionStatus, ReconnectPolicy, ReconnectStep, Reconnector};
use crate::client::throttle::{CursorThrottle, DEFAULT_CURSOR_INTERVAL};
use crate::client::tokens::TokenSource;
use crate::models::{
    ChangeSet, ClientMessage, ConnectMessage, CursorMessage, DisconnectMessage, ErrorMessage,
    ErrorResponse, Record, ServerMessage, UpdateMessage, UserInfo,
};
use crate::ws::protocol;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("token fetch failed: {0}")]
    Token(String),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid server url: {0}")]
    Url(String),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection closed")]
    TransportClosed,

    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,

    #[error("client stopped")]
    Stopped,
}

impl ClientError {
    /// The upgrade was refused because the token we presented had expired.
    /// Invalid or malformed tokens are not worth an immediate retry.
    pub fn is_expired_token(&self) -> bool {
        match self {
            ClientError::Transport(tungstenite::Error::Http(response)) if response.status().as_u16() == 401 => {
                refusal_code(response).as_deref() == Some("auth_expired")
            }
            _ => false,
        }
    }
}

/// Error code of a refused upgrade, from the `WWW-Authenticate` challenge
/// or else from the JSON body.
fn refusal_code(response: &Response<Option<Vec<u8>>>) -> Option<String> {
    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split("error_description=\"").nth(1))
        .and_then(|rest| rest.split('"').next());
    if let Some(code) = challenge {
        return Some(code.to_string());
    }
    let body = response.body().as_ref()?;
    serde_json::from_slice::<ErrorResponse>(body).ok().map(|e| e.error)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base of the API, e.g. `ws://localhost:3000/api`
    pub server_url: String,
    pub room_id: String,
    /// Display only; the room keys presence by the token subject.
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub reconnect: ReconnectPolicy,
    pub cursor_interval: Duration,
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        user_color: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_color: user_color.into(),
            reconnect: ReconnectPolicy::default(),
            cursor_interval: DEFAULT_CURSOR_INTERVAL,
        }
    }

    pub fn room_url(&self, token: &str) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.server_url).map_err(|e| ClientError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Url(self.server_url.clone()))?
            .pop_if_empty()
            .extend(["v1", "rooms", self.room_id.as_str(), "ws"]);
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

/// Everything the application hears about the room.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    Hydrated { records: usize, users: usize },
    RemoteUpdate { user_id: String, changes: ChangeSet },
    UserJoined(UserInfo),
    UserLeft(String),
    Cursor(CursorMessage),
    ServerError(ErrorMessage),
}

#[derive(Debug, Clone, Default)]
pub struct MirrorSnapshot {
    pub records: HashMap<String, Record>,
    pub users: Vec<UserInfo>,
    pub cursors: HashMap<String, RemoteCursor>,
}

enum Command {
    Edit(ChangeSet),
    Cursor { x: f64, y: f64 },
    ReconnectNow,
    Disconnect,
    Snapshot(oneshot::Sender<MirrorSnapshot>),
}

#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ClientHandle {
    fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.commands.send(cmd).map_err(|_| ClientError::Stopped)
    }

    /// Apply a local edit. Sent right away when connected, otherwise
    /// queued and replayed after the next `init`.
    pub fn edit(&self, changes: ChangeSet) -> Result<(), ClientError> {
        self.send(Command::Edit(changes))
    }

    pub fn move_cursor(&self, x: f64, y: f64) -> Result<(), ClientError> {
        self.send(Command::Cursor { x, y })
    }

    pub fn reconnect_now(&self) -> Result<(), ClientError> {
        self.send(Command::ReconnectNow)
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect)
    }

    pub async fn snapshot(&self) -> Result<MirrorSnapshot, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Wait until the room has sent `init`.
    pub async fn connected(&self) -> Result<(), ClientError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| matches!(s, ConnectionStatus::Connected | ConnectionStatus::Failed))
            .await
            .map_err(|_| ClientError::Stopped)?;
        match *reached {
            ConnectionStatus::Failed => Err(ClientError::ReconnectExhausted),
            _ => Ok(()),
        }
    }
}

pub struct SyncClient {
    config: ClientConfig,
    tokens: Arc<dyn TokenSource>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, tokens: impl TokenSource + 'static) -> Self {
        Self {
            config,
            tokens: Arc::new(tokens),
        }
    }

    /// Start connecting in the background.
    pub fn spawn(self) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let driver = Driver {
            throttle: CursorThrottle::new(self.config.cursor_interval),
            reconnector: Reconnector::new(self.config.reconnect),
            config: self.config,
            tokens: self.tokens,
            mirror: Mirror::new(),
            offline: VecDeque::new(),
            commands,
            events,
            status: status_tx,
        };
        let task = tokio::spawn(driver.run());

        let handle = ClientHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (handle, events_rx, task)
    }
}

enum SessionEnd {
    Closed { auth_expired: bool },
    ReconnectNow,
    Disconnected,
    Stopped,
}

enum Wake {
    Elapsed,
    Continue,
    ReconnectNow,
    Disconnected,
    Stopped,
}

struct Driver {
    config: ClientConfig,
    tokens: Arc<dyn TokenSource>,
    mirror: Mirror,
    throttle: CursorThrottle,
    reconnector: Reconnector,
    /// Local edits made while not connected, oldest first
    offline: VecDeque<ChangeSet>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl Driver {
    async fn run(mut self) {
        let mut parked = false;
        loop {
            if parked {
                match self.park().await {
                    Wake::Stopped => return,
                    _ => self.reconnector.reconnect_now(),
                }
                parked = false;
            }

            self.reconnector.on_connecting();
            self.publish();
            let end = match self.open().await {
                Ok(socket) => self.serve(socket).await,
                Err(e) => {
                    warn!("Connection to room {} failed: {}", self.config.room_id, e);
                    SessionEnd::Closed { auth_expired: e.is_expired_token() }
                }
            };

            match end {
                SessionEnd::Stopped => return,
                SessionEnd::ReconnectNow => self.reconnector.reconnect_now(),
                SessionEnd::Disconnected => {
                    self.reconnector.on_disconnect();
                    self.publish();
                    parked = true;
                }
                SessionEnd::Closed { auth_expired } => {
                    let step = if auth_expired {
                        self.reconnector.on_auth_expired()
                    } else {
                        self.reconnector.on_unexpected_close()
                    };
                    self.publish();
                    match step {
                        ReconnectStep::Exhausted => parked = true,
                        ReconnectStep::Retry { attempt, delay } => {
                            info!("Reconnecting to room {} (attempt {}) in {:?}", self.config.room_id, attempt, delay);
                            match self.backoff(delay).await {
                                Wake::Stopped => return,
                                Wake::ReconnectNow => self.reconnector.reconnect_now(),
                                Wake::Disconnected => {
                                    self.reconnector.on_disconnect();
                                    self.publish();
                                    parked = true;
                                }
                                Wake::Elapsed | Wake::Continue => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fetch a fresh token, open the socket and introduce ourselves.
    async fn open(&mut self) -> Result<Socket, ClientError> {
        let token = self.tokens.fetch().await?;
        let url = self.config.room_url(&token)?;
        debug!("Connecting to room {}", self.config.room_id);
        let (mut socket, _) = connect_async(url.as_str()).await?;

        let connect = ClientMessage::Connect(ConnectMessage {
            user_id: self.config.user_id.clone(),
            user_name: self.config.user_name.clone(),
            user_color: self.config.user_color.clone(),
            token,
        });
        socket.send(Message::text(protocol::encode(&connect)?)).await?;
        Ok(socket)
    }

    async fn serve(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let mut ready = false;
        let mut auth_expired = false;
        self.throttle.reset();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match protocol::decode_server(text.as_str()) {
                        Ok(msg) => {
                            if let Err(e) = self.on_server_message(msg, &mut sink, &mut ready, &mut auth_expired).await {
                                warn!("Room {}: {}", self.config.room_id, e);
                                return SessionEnd::Closed { auth_expired };
                            }
                        }
                        Err(e) => warn!("Ignoring frame from room {}: {}", self.config.room_id, e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Room {} closed the connection: {:?}", self.config.room_id, frame);
                        return SessionEnd::Closed { auth_expired };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Transport error in room {}: {}", self.config.room_id, e);
                        return SessionEnd::Closed { auth_expired };
                    }
                    None => return SessionEnd::Closed { auth_expired },
                },
                cmd = self.commands.recv() => match cmd {
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Stopped;
                    }
                    Some(Command::Edit(changes)) => {
                        self.mirror.apply_local(changes);
                        if let Some(out) = self.mirror.take_outbound() {
                            if !ready {
                                self.offline.push_back(out);
                            } else if let Err(e) = self.send_update(&mut sink, out).await {
                                warn!("Room {}: {}", self.config.room_id, e);
                                return SessionEnd::Closed { auth_expired };
                            }
                        }
                    }
                    Some(Command::Cursor { x, y }) => {
                        if ready && self.throttle.should_send(x, y, Instant::now()) {
                            let cursor = ClientMessage::Cursor(CursorMessage {
                                user_id: self.config.user_id.clone(),
                                user_name: self.config.user_name.clone(),
                                user_color: self.config.user_color.clone(),
                                x,
                                y,
                            });
                            if send(&mut sink, &cursor).await.is_err() {
                                return SessionEnd::Closed { auth_expired };
                            }
                        }
                    }
                    Some(Command::ReconnectNow) => {
                        let _ = sink.close().await;
                        return SessionEnd::ReconnectNow;
                    }
                    Some(Command::Disconnect) => {
                        let bye = ClientMessage::Disconnect(DisconnectMessage {
                            user_id: self.config.user_id.clone(),
                        });
                        let _ = send(&mut sink, &bye).await;
                        let _ = sink.close().await;
                        return SessionEnd::Disconnected;
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                },
            }
        }
    }

    async fn on_server_message(
        &mut self,
        msg: ServerMessage,
        sink: &mut SocketSink,
        ready: &mut bool,
        auth_expired: &mut bool,
    ) -> Result<(), ClientError> {
        match msg {
            ServerMessage::Init(init) => {
                let users = init.users.len();
                let applied = self.mirror.hydrate(init.records, init.users);
                *ready = true;
                self.reconnector.on_connected();
                self.publish();
                self.emit(ClientEvent::Hydrated { records: applied.len(), users });

                // Replay what was edited while offline on top of the fresh state.
                let queued = self.offline.len();
                while let Some(changes) = self.offline.pop_front() {
                    self.mirror.apply_local(changes);
                }
                if let Some(out) = self.mirror.take_outbound() {
                    info!("Replaying {} offline edits to room {}", queued, self.config.room_id);
                    self.send_update(sink, out).await?;
                }
            }
            ServerMessage::Update(update) => {
                self.mirror.apply_remote(&update.changes);
                self.emit(ClientEvent::RemoteUpdate {
                    user_id: update.user_id,
                    changes: update.changes,
                });
            }
            ServerMessage::UserJoined(joined) => {
                let user = UserInfo {
                    id: joined.user_id,
                    name: joined.user_name,
                    color: joined.user_color,
                };
                self.mirror.user_joined(user.clone());
                self.emit(ClientEvent::UserJoined(user));
            }
            ServerMessage::UserLeft(left) => {
                self.mirror.user_left(&left.user_id);
                self.emit(ClientEvent::UserLeft(left.user_id));
            }
            ServerMessage::Cursor(cursor) => {
                self.mirror.cursor_moved(cursor.clone());
                self.emit(ClientEvent::Cursor(cursor));
            }
            ServerMessage::Error(error) => {
                warn!("Room {} reported {}: {}", self.config.room_id, error.error, error.message);
                if error.error == "auth_expired" {
                    *auth_expired = true;
                }
                self.emit(ClientEvent::ServerError(error));
            }
        }
        Ok(())
    }

    async fn send_update(&self, sink: &mut SocketSink, changes: ChangeSet) -> Result<(), ClientError> {
        let update = ClientMessage::Update(UpdateMessage {
            user_id: self.config.user_id.clone(),
            changes,
        });
        send(sink, &update).await
    }

    /// Sleep out a backoff delay while still serving the handle.
    async fn backoff(&mut self, delay: Duration) -> Wake {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Wake::Elapsed,
                cmd = self.commands.recv() => match self.offline_command(cmd) {
                    Wake::Continue => {}
                    wake => return wake,
                },
            }
        }
    }

    /// Stay offline until asked to reconnect.
    async fn park(&mut self) -> Wake {
        loop {
            let cmd = self.commands.recv().await;
            match self.offline_command(cmd) {
                Wake::ReconnectNow => return Wake::ReconnectNow,
                Wake::Stopped => return Wake::Stopped,
                _ => {}
            }
        }
    }

    fn offline_command(&mut self, cmd: Option<Command>) -> Wake {
        match cmd {
            None => Wake::Stopped,
            Some(Command::Edit(changes)) => {
                self.mirror.apply_local(changes);
                if let Some(out) = self.mirror.take_outbound() {
                    self.offline.push_back(out);
                }
                Wake::Continue
            }
            Some(Command::Cursor { .. }) => Wake::Continue,
            Some(Command::ReconnectNow) => Wake::ReconnectNow,
            Some(Command::Disconnect) => Wake::Disconnected,
            Some(Command::Snapshot(reply)) => {
                let _ = reply.send(self.snapshot());
                Wake::Continue
            }
        }
    }

    fn snapshot(&self) -> MirrorSnapshot {
        MirrorSnapshot {
            records: self.mirror.records().clone(),
            users: self.mirror.users().to_vec(),
            cursors: self.mirror.cursors().clone(),
        }
    }

    fn publish(&self) {
        let status = self.reconnector.status();
        if *self.status.borrow() != status {
            self.status.send_replace(status);
            self.emit(ClientEvent::Status(status));
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

async fn send(sink: &mut SocketSink, msg: &ClientMessage) -> Result<(), ClientError> {
    let text = protocol::encode(msg)?;
    sink.send(Message::text(text))
        .await
        .map_err(|_| ClientError::TransportClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_url_carries_the_token_and_encodes_the_room() {
        let config = ClientConfig::new("ws://localhost:3000/api", "acme/board-1", "u1", "Ada", "#f00");
        let url = config.room_url("a.b.c").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3000/api/v1/rooms/acme%2Fboard-1/ws?token=a.b.c");

        let trailing = ClientConfig::new("ws://localhost:3000/api/", "r1", "u1", "Ada", "#f00");
        assert_eq!(
            trailing.room_url("t").unwrap().as_str(),
            "ws://localhost:3000/api/v1/rooms/r1/ws?token=t"
        );
    }

    #[test]
    fn bad_server_url_is_reported() {
        let config = ClientConfig::new("not a url", "r1", "u1", "Ada", "#f00");
        assert!(matches!(config.room_url("t"), Err(ClientError::Url(_))));
    }

    fn refused(status: u16, challenge: Option<&str>, body: Option<&str>) -> ClientError {
        let mut builder = Response::builder().status(status);
        if let Some(challenge) = challenge {
            builder = builder.header(header::WWW_AUTHENTICATE, challenge);
        }
        let response = builder.body(body.map(|b| b.as_bytes().to_vec())).unwrap();
        ClientError::Transport(tungstenite::Error::Http(Box::new(response)))
    }

    #[test]
    fn only_expired_tokens_are_retried_at_once() {
        let expired = r#"Bearer error="invalid_token", error_description="auth_expired""#;
        let malformed = r#"Bearer error="invalid_token", error_description="auth_malformed""#;
        assert!(refused(401, Some(expired), None).is_expired_token());
        assert!(!refused(401, Some(malformed), None).is_expired_token());
        assert!(!refused(403, Some(expired), None).is_expired_token());
        assert!(!refused(401, None, None).is_expired_token());
        assert!(!ClientError::TransportClosed.is_expired_token());
        assert!(!ClientError::Token("offline".into()).is_expired_token());
    }

    #[test]
    fn refusal_code_falls_back_to_the_body() {
        let body = r#"{"code":401,"status":"401 Unauthorized","error":"auth_expired","shouldRetry":true}"#;
        assert!(refused(401, None, Some(body)).is_expired_token());
        assert!(!refused(401, None, Some("not json")).is_expired_token());
    }
}
