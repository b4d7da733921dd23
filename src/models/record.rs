use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A single document record (shape, page, binding, ...).
///
/// `payload` is opaque to the sync engine. Only the dependency fields
/// `fromId` / `toId` are ever looked at, and only by the client mirror.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub updated_at: i64,
}

impl Record {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
            updated_at: Utc::now().timestamp_millis(),
        }
    }

    /// Ids of the records this one points at (a connector's endpoints).
    pub fn references(&self) -> Vec<&str> {
        ["fromId", "toId"]
            .iter()
            .filter_map(|key| self.payload.get(*key).and_then(|v| v.as_str()))
            .collect()
    }

    /// Stamp the record with the current time if the sender left it empty.
    pub fn stamp(&mut self) {
        if self.updated_at <= 0 {
            self.updated_at = Utc::now().timestamp_millis();
        }
    }
}

/// One atomic client-originated mutation.
///
/// `removed` carries tombstones keyed by id; the tombstone value itself is
/// not interpreted.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, ToSchema)]
pub struct ChangeSet {
    #[serde(default)]
    pub added: HashMap<String, Record>,
    #[serde(default)]
    pub updated: HashMap<String, Record>,
    #[serde(default)]
    pub removed: HashMap<String, Value>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn add(&mut self, record: Record) {
        self.added.insert(record.id.clone(), record);
    }

    pub fn update(&mut self, record: Record) {
        self.updated.insert(record.id.clone(), record);
    }

    pub fn remove(&mut self, id: impl Into<String>) {
        self.removed.insert(id.into(), Value::Bool(true));
    }

    /// Records to upsert, adds first.
    pub fn upserts(&self) -> impl Iterator<Item = &Record> {
        self.added.values().chain(self.updated.values())
    }

    pub fn removed_ids(&self) -> impl Iterator<Item = &String> {
        self.removed.keys()
    }

    /// Fold `other` into this set; later operations on an id win.
    pub fn merge(&mut self, other: ChangeSet) {
        for (id, record) in other.added {
            self.removed.remove(&id);
            self.added.insert(id, record);
        }
        for (id, record) in other.updated {
            self.removed.remove(&id);
            if self.added.contains_key(&id) {
                self.added.insert(id, record);
            } else {
                self.updated.insert(id, record);
            }
        }
        for (id, tombstone) in other.removed {
            let was_added = self.added.remove(&id).is_some();
            self.updated.remove(&id);
            if !was_added {
                self.removed.insert(id, tombstone);
            }
        }
    }

    /// Check that every map key matches the id of the record it holds.
    pub fn validate(&self) -> Result<(), String> {
        for (key, record) in self.added.iter().chain(self.updated.iter()) {
            if key.is_empty() {
                return Err("record id must not be empty".to_string());
            }
            if key != &record.id {
                return Err(format!("record key '{}' does not match id '{}'", key, record.id));
            }
            if record.kind.is_empty() {
                return Err(format!("record '{}' has no kind", key));
            }
        }
        if self.removed.keys().any(|id| id.is_empty()) {
            return Err("removed id must not be empty".to_string());
        }
        Ok(())
    }
}
