use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::auth::Identity;
use crate::models::UserInfo;

pub type ConnId = Uuid;

/// A frame queued for one connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Close { code: u16, reason: String },
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

/// An authenticated connection and its display identity.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub display_name: String,
    pub color: String,
    pub connection: OutboundTx,
    joined: u64,
}

impl Session {
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            id: self.identity.subject.clone(),
            name: self.display_name.clone(),
            color: self.color.clone(),
        }
    }
}

/// Live sessions of one room. Only the room's coordinator touches it.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnId, Session>,
    next_join: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any earlier one on the same connection.
    pub fn register(
        &mut self,
        conn_id: ConnId,
        identity: Identity,
        display_name: String,
        color: String,
        connection: OutboundTx,
    ) -> Option<Session> {
        self.next_join += 1;
        self.sessions.insert(
            conn_id,
            Session {
                identity,
                display_name,
                color,
                connection,
                joined: self.next_join,
            },
        )
    }

    pub fn remove(&mut self, conn_id: &ConnId) -> Option<Session> {
        self.sessions.remove(conn_id)
    }

    pub fn get(&self, conn_id: &ConnId) -> Option<&Session> {
        self.sessions.get(conn_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether any live session belongs to `subject`.
    pub fn has_subject(&self, subject: &str) -> bool {
        self.sessions.values().any(|s| s.identity.subject == subject)
    }

    /// Current presence roster in join order, one entry per subject. A
    /// subject with several connections is listed as its earliest session.
    pub fn roster(&self) -> Vec<UserInfo> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.joined);
        let mut seen = HashSet::new();
        sessions
            .into_iter()
            .filter(|s| seen.insert(s.identity.subject.as_str()))
            .map(Session::user_info)
            .collect()
    }

    pub fn send_to(&self, conn_id: &ConnId, frame: Arc<str>) -> bool {
        match self.sessions.get(conn_id) {
            Some(session) => session.connection.send(Outbound::Text(frame)).is_ok(),
            None => false,
        }
    }

    /// Best-effort fan-out. Returns how many sessions accepted the frame.
    pub fn broadcast(&self, frame: Arc<str>, except: Option<&ConnId>) -> usize {
        let mut delivered = 0;
        for (conn_id, session) in &self.sessions {
            if Some(conn_id) == except {
                continue;
            }
            if session.connection.send(Outbound::Text(frame.clone())).is_ok() {
                delivered += 1;
            } else {
                debug!("Dropping frame for closed connection {}", conn_id);
            }
        }
        delivered
    }
}
