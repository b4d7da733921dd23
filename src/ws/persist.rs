//! Best-effort persistence side channel.
//!
//! The coordinator pushes writes here and never waits for them: a slow or
//! failing store must not hold up apply and broadcast. In-memory state stays
//! authoritative when a write is finally given up, until the next successful
//! write for the same id.
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{RecordStore, StoreError};
use crate::error::SyncError;
use crate::models::Record;
use crate::ws::room::RoomStats;

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    Upsert(Record),
    Delete(String),
}

impl PersistOp {
    pub fn id(&self) -> &str {
        match self {
            PersistOp::Upsert(record) => &record.id,
            PersistOp::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub limit: u32,
    /// Delay before the first retry, doubled for every further one
    pub base: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        self.base.saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            base: Duration::from_millis(100),
        }
    }
}

/// Sending half of one room's write queue.
pub struct WriteQueue {
    room_id: String,
    tx: mpsc::UnboundedSender<PersistOp>,
    stats: Arc<RoomStats>,
}

impl WriteQueue {
    /// Start the writer task. Writes are applied in push order.
    pub fn spawn(
        room_id: String,
        store: Arc<dyn RecordStore>,
        retry: RetryPolicy,
        stats: Arc<RoomStats>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(room_id.clone(), store, retry, stats.clone(), rx));
        (Self { room_id, tx, stats }, writer)
    }

    /// Queue a write without waiting for it.
    pub fn push(&self, op: PersistOp) {
        self.stats.pending_writes.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.send(op) {
            self.stats.pending_writes.fetch_sub(1, Ordering::Relaxed);
            error!("Write queue for room {} is closed, dropping write for {}", self.room_id, e.0.id());
        }
    }
}

async fn run_writer(
    room_id: String,
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    stats: Arc<RoomStats>,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = rx.recv().await {
        if let Err(e) = write_with_retry(store.as_ref(), &op, retry).await {
            stats.persist_failures.fetch_add(1, Ordering::Relaxed);
            let err = SyncError::PersistenceWriteFailure(e);
            error!("Giving up write for {} in room {}: {}", op.id(), room_id, err);
        }
        stats.pending_writes.fetch_sub(1, Ordering::Relaxed);
    }
    info!("Write queue for room {} drained", room_id);
}

async fn write_with_retry(
    store: &dyn RecordStore,
    op: &PersistOp,
    retry: RetryPolicy,
) -> Result<(), StoreError> {
    let mut retries = 0;
    loop {
        let result = match op {
            PersistOp::Upsert(record) => store.upsert(record).await,
            PersistOp::Delete(id) => store.delete(id).await,
        };
        match result {
            Ok(()) => {
                debug!("Wrote {} after {} retries", op.id(), retries);
                return Ok(());
            }
            Err(e) if retries < retry.limit => {
                retries += 1;
                let delay = retry.delay(retries);
                warn!("Write for {} failed ({}), retry {} in {:?}", op.id(), e, retries, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
