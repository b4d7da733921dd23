//! The per-room coordinator.
//!
//! One coordinator task owns a room's canonical record map and its session
//! registry. Every command for the room goes through one channel and is
//! handled to completion before the next one starts, so all sessions see
//! updates in the order they were applied.
//!
//! ```text
//! conn A ──┐                        ┌── WriteQueue ── RecordStore
//!          ├── mpsc ── Coordinator ─┤
//! conn B ──┘                        └── SessionRegistry ── conn A, conn B
//! ```
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthGate, RoomAccess};
use crate::db::{RecordStore, StoreError, StoreProvider};
use crate::error::SyncError;
use crate::models::{
    ChangeSet, ClientMessage, ConnectMessage, CursorMessage, InitMessage, Record, ServerMessage,
    UpdateMessage, UserJoinedMessage, UserLeftMessage,
};
use crate::ws::persist::{PersistOp, RetryPolicy, WriteQueue};
use crate::ws::protocol::{self, ProtocolError};
use crate::ws::registry::RoomLifecycle;
use crate::ws::sessions::{ConnId, Outbound, OutboundTx, SessionRegistry};

/// Close codes sent with rejected connections.
pub const CLOSE_AUTH_FAILED: u16 = 4401;
pub const CLOSE_FORBIDDEN: u16 = 4403;
pub const CLOSE_TRY_AGAIN: u16 = 1013;

/// Services every coordinator needs, shared across rooms.
pub struct RoomServices {
    pub gate: Arc<AuthGate>,
    pub access: Arc<dyn RoomAccess>,
    pub stores: Arc<dyn StoreProvider>,
    pub retry: RetryPolicy,
    pub idle: Duration,
}

#[derive(Debug)]
pub enum RoomCommand {
    /// A transport connection was opened for this room.
    Attach { conn_id: ConnId, connection: OutboundTx },
    /// A decoded envelope from an attached connection.
    Inbound { conn_id: ConnId, message: ClientMessage },
    /// The transport closed or failed.
    Detach { conn_id: ConnId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Uninitialized,
    Hydrating,
    Ready,
}

/// Counters read by diagnostics.
#[derive(Debug, Default)]
pub struct RoomStats {
    pub sessions: AtomicUsize,
    pub connections: AtomicUsize,
    pub applied_updates: AtomicU64,
    pub persist_failures: AtomicU64,
    pub pending_writes: AtomicU64,
}

pub struct RoomCoordinator {
    room_id: String,
    phase: RoomPhase,
    records: HashMap<String, Record>,
    sessions: SessionRegistry,
    connections: HashMap<ConnId, OutboundTx>,
    pending: VecDeque<RoomCommand>,
    store: Arc<dyn RecordStore>,
    writes: Option<WriteQueue>,
    writer: Option<JoinHandle<()>>,
    services: Arc<RoomServices>,
    stats: Arc<RoomStats>,
}

impl RoomCoordinator {
    pub fn new(room_id: &str, services: Arc<RoomServices>, stats: Arc<RoomStats>) -> Self {
        let store = services.stores.room_store(room_id);
        let (writes, writer) =
            WriteQueue::spawn(room_id.to_string(), store.clone(), services.retry, stats.clone());
        Self {
            room_id: room_id.to_string(),
            phase: RoomPhase::Uninitialized,
            records: HashMap::new(),
            sessions: SessionRegistry::new(),
            connections: HashMap::new(),
            pending: VecDeque::new(),
            store,
            writes: Some(writes),
            writer: Some(writer),
            services,
            stats,
        }
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn records(&self) -> &HashMap<String, Record> {
        &self.records
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Load the room from its store, then release queued commands.
    pub async fn hydrate(&mut self) -> Result<(), StoreError> {
        self.phase = RoomPhase::Hydrating;
        let records = self.store.clone().hydrate().await?;
        self.finish_hydration(records).await;
        Ok(())
    }

    async fn finish_hydration(&mut self, records: Vec<Record>) {
        self.records = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        self.phase = RoomPhase::Ready;
        info!(
            "Room {} hydrated with {} records, releasing {} queued commands",
            self.room_id,
            self.records.len(),
            self.pending.len()
        );
        while let Some(cmd) = self.pending.pop_front() {
            self.handle(cmd).await;
        }
    }

    /// Process one command as a single step. Commands arriving before the
    /// room is ready are queued.
    pub async fn handle(&mut self, cmd: RoomCommand) {
        if self.phase != RoomPhase::Ready {
            self.pending.push_back(cmd);
            return;
        }
        match cmd {
            RoomCommand::Attach { conn_id, connection } => {
                self.connections.insert(conn_id, connection);
                self.stats.connections.store(self.connections.len(), Ordering::Relaxed);
                debug!("Connection {} attached to room {}", conn_id, self.room_id);
            }
            RoomCommand::Inbound { conn_id, message } => self.on_message(conn_id, message).await,
            RoomCommand::Detach { conn_id } => {
                self.connections.remove(&conn_id);
                self.stats.connections.store(self.connections.len(), Ordering::Relaxed);
                self.end_session(conn_id);
            }
        }
    }

    async fn on_message(&mut self, conn_id: ConnId, message: ClientMessage) {
        let is_connect = matches!(message, ClientMessage::Connect(_));
        if !is_connect && self.sessions.get(&conn_id).is_none() {
            let err = SyncError::UnregisteredSender(conn_id);
            warn!("Ignoring '{}' in room {}: {}", message.type_name(), self.room_id, err);
            return;
        }

        match message {
            ClientMessage::Connect(connect) => self.on_connect(conn_id, connect).await,
            ClientMessage::Update(update) => self.on_update(conn_id, update.changes),
            ClientMessage::Cursor(cursor) => self.on_cursor(conn_id, cursor),
            ClientMessage::Disconnect(_) => self.end_session(conn_id),
        }
    }

    async fn on_connect(&mut self, conn_id: ConnId, connect: ConnectMessage) {
        let Some(connection) = self.connections.get(&conn_id).cloned() else {
            warn!("Connect from unattached connection {} in room {}", conn_id, self.room_id);
            return;
        };

        if self.sessions.get(&conn_id).is_some() {
            let err = SyncError::MalformedMessage(ProtocolError::AlreadyConnected);
            warn!("Connection {} in room {}: {}", conn_id, self.room_id, err);
            if let Some(frame) = frame(&err.to_envelope()) {
                let _ = connection.send(Outbound::Text(frame));
            }
            return;
        }

        let identity = match self.services.gate.verify(&connect.token) {
            Ok(identity) => identity,
            Err(failure) => {
                warn!("Rejecting connection {} to room {}: {}", conn_id, self.room_id, failure);
                self.reject(conn_id, &connection, SyncError::from(failure));
                return;
            }
        };

        if !self.services.access.may_open(&self.room_id, &identity).await {
            warn!("Identity {} may not open room {}", identity.subject, self.room_id);
            self.reject(conn_id, &connection, SyncError::Forbidden(self.room_id.clone()));
            return;
        }

        let subject = identity.subject.clone();
        let first_for_subject = !self.sessions.has_subject(&subject);
        self.sessions.register(
            conn_id,
            identity,
            connect.user_name.clone(),
            connect.user_color.clone(),
            connection,
        );
        self.stats.sessions.store(self.sessions.len(), Ordering::Relaxed);

        let init = ServerMessage::Init(InitMessage {
            records: self.records.values().cloned().collect(),
            users: self.sessions.roster(),
        });
        if let Some(frame) = frame(&init) {
            self.sessions.send_to(&conn_id, frame);
        }

        // Peers already know this subject when it opens another connection.
        if first_for_subject {
            let joined = ServerMessage::UserJoined(UserJoinedMessage {
                user_id: subject.clone(),
                user_name: connect.user_name,
                user_color: connect.user_color,
            });
            if let Some(frame) = frame(&joined) {
                self.sessions.broadcast(frame, Some(&conn_id));
            }
        }
        info!(
            "User {} joined room {} ({} sessions)",
            subject,
            self.room_id,
            self.sessions.len()
        );
    }

    fn reject(&mut self, conn_id: ConnId, connection: &OutboundTx, err: SyncError) {
        if let Some(frame) = frame(&err.to_envelope()) {
            let _ = connection.send(Outbound::Text(frame));
        }
        let code = match err {
            SyncError::Forbidden(_) => CLOSE_FORBIDDEN,
            SyncError::RoomUnavailable(_) => CLOSE_TRY_AGAIN,
            _ => CLOSE_AUTH_FAILED,
        };
        let _ = connection.send(Outbound::Close {
            code,
            reason: err.error_code().to_string(),
        });
        self.connections.remove(&conn_id);
        self.stats.connections.store(self.connections.len(), Ordering::Relaxed);
    }

    fn on_update(&mut self, conn_id: ConnId, mut changes: ChangeSet) {
        let Some(user_id) = self.sessions.get(&conn_id).map(|s| s.identity.subject.clone()) else {
            return;
        };

        for record in changes.added.values_mut().chain(changes.updated.values_mut()) {
            record.stamp();
        }

        for record in changes.upserts() {
            self.records.insert(record.id.clone(), record.clone());
            self.persist(PersistOp::Upsert(record.clone()));
        }
        for id in changes.removed_ids() {
            self.records.remove(id);
            self.persist(PersistOp::Delete(id.clone()));
        }
        self.stats.applied_updates.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Applied update from {} in room {}: +{} ~{} -{}",
            user_id,
            self.room_id,
            changes.added.len(),
            changes.updated.len(),
            changes.removed.len()
        );

        let update = ServerMessage::Update(UpdateMessage { user_id, changes });
        if let Some(frame) = frame(&update) {
            self.sessions.broadcast(frame, Some(&conn_id));
        }
    }

    fn on_cursor(&mut self, conn_id: ConnId, mut cursor: CursorMessage) {
        // Presence is keyed by the verified subject, same as the roster.
        if let Some(session) = self.sessions.get(&conn_id) {
            cursor.user_id = session.identity.subject.clone();
        }
        if let Some(frame) = frame(&ServerMessage::Cursor(cursor)) {
            self.sessions.broadcast(frame, Some(&conn_id));
        }
    }

    fn end_session(&mut self, conn_id: ConnId) {
        let Some(session) = self.sessions.remove(&conn_id) else {
            return;
        };
        self.stats.sessions.store(self.sessions.len(), Ordering::Relaxed);

        if !self.sessions.has_subject(&session.identity.subject) {
            let left = ServerMessage::UserLeft(UserLeftMessage {
                user_id: session.identity.subject.clone(),
            });
            if let Some(frame) = frame(&left) {
                self.sessions.broadcast(frame, None);
            }
        }
        info!(
            "User {} left room {} ({} sessions)",
            session.identity.subject,
            self.room_id,
            self.sessions.len()
        );
    }

    fn persist(&self, op: PersistOp) {
        if let Some(writes) = &self.writes {
            writes.push(op);
        }
    }

    /// Actor loop: wait for the previous owner of the room to retire,
    /// hydrate, serve commands until idle, then retire.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>, mut lifecycle: RoomLifecycle) {
        lifecycle.wait_for_previous(&self.room_id).await;

        self.phase = RoomPhase::Hydrating;
        let store = self.store.clone();
        let load = store.hydrate();
        tokio::pin!(load);
        let loaded = loop {
            tokio::select! {
                result = &mut load => break result,
                Some(cmd) = rx.recv() => self.pending.push_back(cmd),
            }
        };

        match loaded {
            Ok(records) => self.finish_hydration(records).await,
            Err(e) => {
                error!("Failed to hydrate room {}: {}", self.room_id, e);
                self.abandon(rx, lifecycle).await;
                return;
            }
        }

        loop {
            let idle = self.connections.is_empty();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = tokio::time::sleep(self.services.idle), if idle => {
                    if let Some(retired) = lifecycle.try_retire(&self.room_id, &rx) {
                        rx.close();
                        self.shutdown(retired, &lifecycle).await;
                        return;
                    }
                }
            }
        }

        // Every handle was dropped, the registry is gone.
        let retired = lifecycle.force_retire(&self.room_id);
        self.shutdown(retired, &lifecycle).await;
    }

    /// Hydration failed: turn away everyone queued and retire so that the
    /// next activity starts a fresh coordinator.
    async fn abandon(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>, lifecycle: RoomLifecycle) {
        let retired = loop {
            while let Ok(cmd) = rx.try_recv() {
                self.pending.push_back(cmd);
            }
            for cmd in std::mem::take(&mut self.pending) {
                if let RoomCommand::Attach { conn_id, connection } = cmd {
                    self.reject(conn_id, &connection, SyncError::RoomUnavailable(self.room_id.clone()));
                }
            }
            if let Some(retired) = lifecycle.try_retire(&self.room_id, &rx) {
                break retired;
            }
        };
        rx.close();
        self.shutdown(retired, &lifecycle).await;
    }

    async fn shutdown(mut self, retired: watch::Sender<()>, lifecycle: &RoomLifecycle) {
        self.writes.take();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                error!("Write queue for room {} ended abnormally: {}", self.room_id, e);
            }
        }
        drop(retired);
        lifecycle.retired(&self.room_id);
        info!("Room {} retired", self.room_id);
    }
}

fn frame(msg: &ServerMessage) -> Option<Arc<str>> {
    match protocol::encode(msg) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            error!("Failed to encode outbound message: {}", e);
            None
        }
    }
}
