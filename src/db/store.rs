use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::models::Record;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable record table for one room.
///
/// `upsert` and `delete` are insert-or-replace by id, so repeating them is
/// harmless.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the schema if needed, then return every stored record.
    async fn hydrate(&self) -> Result<Vec<Record>, StoreError>;

    async fn upsert(&self, record: &Record) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Hands out one [`RecordStore`] per room.
pub trait StoreProvider: Send + Sync {
    fn room_store(&self, room_id: &str) -> Arc<dyn RecordStore>;
}

type RoomTables = Arc<Mutex<HashMap<String, HashMap<String, Record>>>>;

/// Process-local store used when no database is configured.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rooms: RoomTables,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room's table, replacing whatever was there.
    pub fn seed(&self, room_id: &str, records: Vec<Record>) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.insert(
            room_id.to_string(),
            records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        );
    }

    pub fn snapshot(&self, room_id: &str) -> HashMap<String, Record> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned().unwrap_or_default()
    }
}

impl StoreProvider for MemoryStore {
    fn room_store(&self, room_id: &str) -> Arc<dyn RecordStore> {
        Arc::new(MemoryRoomStore {
            room_id: room_id.to_string(),
            rooms: self.rooms.clone(),
        })
    }
}

struct MemoryRoomStore {
    room_id: String,
    rooms: RoomTables,
}

#[async_trait]
impl RecordStore for MemoryRoomStore {
    async fn hydrate(&self) -> Result<Vec<Record>, StoreError> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rooms
            .get(&self.room_id)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, record: &Record) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(self.room_id.clone())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(table) = rooms.get_mut(&self.room_id) {
            table.remove(id);
        }
        Ok(())
    }
}
