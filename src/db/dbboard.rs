use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Error as SqlxError, Row};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::store::{RecordStore, StoreError, StoreProvider};
use crate::models::Record;

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS board_records (
        room_id    TEXT NOT NULL,
        id         TEXT NOT NULL,
        kind       TEXT NOT NULL,
        payload    TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (room_id, id)
    )
"#;

/// Sqlite connection pool shared by every room.
#[derive(Clone)]
pub struct DbBoard {
    pool: SqlitePool,
}

impl DbBoard {
    /// Open (and create if missing) the database at `database_url`.
    ///
    /// # Arguments
    /// * `database_url` - sqlite connection string, e.g. `sqlite://data/boards.db`
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));

        // In-memory databases live and die with their single connection.
        let pool_options = if database_url.contains(":memory:") {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        info!("Database connection pool created successfully");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool. Later operations fail with `PoolClosed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl StoreProvider for DbBoard {
    fn room_store(&self, room_id: &str) -> Arc<dyn RecordStore> {
        Arc::new(SqliteRoomStore {
            room_id: room_id.to_string(),
            pool: self.pool.clone(),
        })
    }
}

/// The rows of one room.
pub struct SqliteRoomStore {
    room_id: String,
    pool: SqlitePool,
}

#[async_trait]
impl RecordStore for SqliteRoomStore {
    async fn hydrate(&self) -> Result<Vec<Record>, StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;

        let rows = sqlx::query(
            "SELECT id, kind, payload, updated_at FROM board_records WHERE room_id = ?",
        )
        .bind(&self.room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load records for room {}: {}", self.room_id, e);
            e
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            records.push(Record {
                id: row.try_get("id")?,
                kind: row.try_get("kind")?,
                payload: serde_json::from_str(&payload)?,
                updated_at: row.try_get("updated_at")?,
            });
        }

        info!("Loaded {} records for room {}", records.len(), self.room_id);
        Ok(records)
    }

    async fn upsert(&self, record: &Record) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record.payload)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO board_records (room_id, id, kind, payload, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.room_id)
        .bind(&record.id)
        .bind(&record.kind)
        .bind(payload)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Persisted record {} in room {}", record.id, self.room_id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM board_records WHERE room_id = ? AND id = ?")
            .bind(&self.room_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!("Deleted record {} in room {}", id, self.room_id);
        Ok(())
    }
}
