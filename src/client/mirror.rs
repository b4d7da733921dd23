//! Peer-side copy of a room.
//!
//! Local edits go through [`Mirror::put`] and [`Mirror::delete`], which also
//! record them in an outbox for the next outbound `update`. Remote changes
//! are applied through the same calls while a [`Suppressed`] guard is held,
//! so nothing a peer sent is ever queued to be sent back.
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

use crate::models::{ChangeSet, CursorMessage, Record, UserInfo};

/// Last known position of a remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub user_name: String,
    pub user_color: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Default)]
pub struct Mirror {
    records: HashMap<String, Record>,
    users: Vec<UserInfo>,
    cursors: HashMap<String, RemoteCursor>,
    outbox: ChangeSet,
    suppressed: bool,
}

/// Holds change detection off until dropped.
pub struct Suppressed<'a> {
    mirror: &'a mut Mirror,
}

impl Deref for Suppressed<'_> {
    type Target = Mirror;

    fn deref(&self) -> &Mirror {
        self.mirror
    }
}

impl DerefMut for Suppressed<'_> {
    fn deref_mut(&mut self) -> &mut Mirror {
        self.mirror
    }
}

impl Drop for Suppressed<'_> {
    fn drop(&mut self) {
        self.mirror.suppressed = false;
    }
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &HashMap<String, Record> {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn users(&self) -> &[UserInfo] {
        &self.users
    }

    pub fn cursors(&self) -> &HashMap<String, RemoteCursor> {
        &self.cursors
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn suppress(&mut self) -> Suppressed<'_> {
        self.suppressed = true;
        Suppressed { mirror: self }
    }

    /// Create or replace a record.
    pub fn put(&mut self, record: Record) {
        let existed = self.records.contains_key(&record.id);
        if !self.suppressed {
            let mut change = ChangeSet::default();
            if existed {
                change.update(record.clone());
            } else {
                change.add(record.clone());
            }
            self.outbox.merge(change);
        }
        self.records.insert(record.id.clone(), record);
    }

    pub fn delete(&mut self, id: &str) -> Option<Record> {
        let removed = self.records.remove(id);
        if removed.is_some() && !self.suppressed {
            let mut change = ChangeSet::default();
            change.remove(id);
            self.outbox.merge(change);
        }
        removed
    }

    /// Apply an edit made on this peer.
    pub fn apply_local(&mut self, changes: ChangeSet) {
        let ChangeSet { added, updated, removed } = changes;
        for record in added.into_values().chain(updated.into_values()) {
            self.put(record);
        }
        for id in removed.keys() {
            self.delete(id);
        }
    }

    /// Apply a change a peer made. Never produces outbound changes.
    pub fn apply_remote(&mut self, changes: &ChangeSet) {
        let mut mirror = self.suppress();
        for record in changes.upserts() {
            mirror.put(record.clone());
        }
        for id in changes.removed_ids() {
            mirror.delete(id);
        }
    }

    /// Local changes not yet sent, if any.
    pub fn take_outbound(&mut self) -> Option<ChangeSet> {
        if self.outbox.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.outbox))
    }

    /// Replace the whole mirror with a room's `init` payload.
    ///
    /// Records without references are applied first. A record pointing at
    /// other records is applied once all of them exist. Records whose
    /// endpoints never show up are still kept, applied last, so the mirror
    /// holds exactly what the room holds. Returns the ids in the order they
    /// were applied.
    pub fn hydrate(&mut self, records: Vec<Record>, users: Vec<UserInfo>) -> Vec<String> {
        let mut mirror = self.suppress();
        mirror.records.clear();
        mirror.cursors.clear();
        mirror.users = users;

        let (mut waiting, ready): (Vec<Record>, Vec<Record>) =
            records.into_iter().partition(|r| !r.references().is_empty());

        let mut order = Vec::with_capacity(ready.len() + waiting.len());
        for record in ready {
            order.push(record.id.clone());
            mirror.put(record);
        }

        loop {
            let (now, later): (Vec<Record>, Vec<Record>) = {
                let present: HashSet<&str> = mirror.records.keys().map(String::as_str).collect();
                waiting
                    .into_iter()
                    .partition(|r| r.references().iter().all(|id| present.contains(id)))
            };
            waiting = later;
            if now.is_empty() {
                break;
            }
            for record in now {
                order.push(record.id.clone());
                mirror.put(record);
            }
        }

        for record in waiting {
            warn!(
                "Record {} ({}) references {:?} that never arrived",
                record.id,
                record.kind,
                record.references()
            );
            order.push(record.id.clone());
            mirror.put(record);
        }
        debug!("Hydrated mirror with {} records", order.len());
        order
    }

    pub fn user_joined(&mut self, user: UserInfo) {
        self.users.retain(|u| u.id != user.id);
        self.users.push(user);
    }

    pub fn user_left(&mut self, user_id: &str) {
        self.users.retain(|u| u.id != user_id);
        self.cursors.remove(user_id);
    }

    pub fn cursor_moved(&mut self, cursor: CursorMessage) {
        self.cursors.insert(
            cursor.user_id,
            RemoteCursor {
                user_name: cursor.user_name,
                user_color: cursor.user_color,
                x: cursor.x,
                y: cursor.y,
            },
        );
    }
}
