use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::error::SyncError;
use crate::ws::room::{RoomCommand, RoomCoordinator, RoomServices, RoomStats};
use crate::ws::sessions::{ConnId, OutboundTx};

/// Sending side of a running coordinator.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<RoomCommand>,
    stats: Arc<RoomStats>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn stats(&self) -> &RoomStats {
        &self.stats
    }

    pub fn send(&self, cmd: RoomCommand) -> Result<(), SyncError> {
        self.tx
            .send(cmd)
            .map_err(|_| SyncError::RoomUnavailable(self.room_id.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct Slots {
    active: HashMap<String, RoomHandle>,
    /// Rooms whose last coordinator is still draining its write queue.
    retiring: HashMap<String, (u64, watch::Receiver<()>)>,
    next_generation: u64,
}

type SharedSlots = Arc<Mutex<Slots>>;

fn lock(slots: &SharedSlots) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

/// Room id to coordinator lookup. Coordinators are spawned on first use and
/// remove themselves when they retire.
pub struct RoomRegistry {
    services: Arc<RoomServices>,
    slots: SharedSlots,
}

impl RoomRegistry {
    pub fn new(services: RoomServices) -> Self {
        Self {
            services: Arc::new(services),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    pub fn services(&self) -> &Arc<RoomServices> {
        &self.services
    }

    /// Attach a connection to a room, spawning its coordinator if needed.
    ///
    /// The attach is queued while the registry lock is held, so a
    /// coordinator deciding to retire either sees it or is already gone.
    pub fn attach(
        &self,
        room_id: &str,
        conn_id: ConnId,
        connection: OutboundTx,
    ) -> Result<RoomHandle, SyncError> {
        let mut slots = lock(&self.slots);
        let handle = match slots.active.get(room_id) {
            Some(handle) if !handle.is_closed() => handle.clone(),
            _ => self.spawn_locked(&mut slots, room_id),
        };
        handle.send(RoomCommand::Attach { conn_id, connection })?;
        Ok(handle)
    }

    fn spawn_locked(&self, slots: &mut Slots, room_id: &str) -> RoomHandle {
        slots.next_generation += 1;
        let generation = slots.next_generation;
        let previous = slots.retiring.remove(room_id).map(|(_, rx)| rx);

        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RoomStats::default());
        let coordinator = RoomCoordinator::new(room_id, self.services.clone(), stats.clone());
        let lifecycle = RoomLifecycle {
            slots: self.slots.clone(),
            generation,
            previous,
        };
        tokio::spawn(coordinator.run(rx, lifecycle));

        info!("Spawned coordinator for room {} (generation {})", room_id, generation);
        let handle = RoomHandle {
            room_id: room_id.to_string(),
            generation,
            tx,
            stats,
        };
        slots.active.insert(room_id.to_string(), handle.clone());
        handle
    }

    pub fn get(&self, room_id: &str) -> Option<RoomHandle> {
        lock(&self.slots).active.get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        lock(&self.slots).active.len()
    }

    pub fn handles(&self) -> Vec<RoomHandle> {
        lock(&self.slots).active.values().cloned().collect()
    }
}

/// A coordinator's link back to the registry that spawned it.
pub struct RoomLifecycle {
    slots: SharedSlots,
    generation: u64,
    previous: Option<watch::Receiver<()>>,
}

impl RoomLifecycle {
    /// Wait until the room's previous coordinator has flushed its writes.
    pub async fn wait_for_previous(&mut self, room_id: &str) {
        if let Some(mut previous) = self.previous.take() {
            info!("Room {} waits for its previous coordinator to drain", room_id);
            while previous.changed().await.is_ok() {}
        }
    }

    /// Leave the registry if no command is queued. The returned sender is
    /// dropped once the coordinator's writes are flushed.
    pub fn try_retire(
        &self,
        room_id: &str,
        rx: &mpsc::UnboundedReceiver<RoomCommand>,
    ) -> Option<watch::Sender<()>> {
        let mut slots = lock(&self.slots);
        if !rx.is_empty() {
            return None;
        }
        Some(self.retire_locked(&mut slots, room_id))
    }

    pub fn force_retire(&self, room_id: &str) -> watch::Sender<()> {
        let mut slots = lock(&self.slots);
        self.retire_locked(&mut slots, room_id)
    }

    fn retire_locked(&self, slots: &mut Slots, room_id: &str) -> watch::Sender<()> {
        if slots.active.get(room_id).map(|h| h.generation) == Some(self.generation) {
            slots.active.remove(room_id);
        }
        let (tx, rx) = watch::channel(());
        slots.retiring.insert(room_id.to_string(), (self.generation, rx));
        tx
    }

    /// Writes are flushed; forget the retiring marker unless a newer
    /// coordinator already took it over.
    pub fn retired(&self, room_id: &str) {
        let mut slots = lock(&self.slots);
        if slots.retiring.get(room_id).map(|(g, _)| *g) == Some(self.generation) {
            slots.retiring.remove(room_id);
        }
    }
}
