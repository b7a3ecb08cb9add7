//! Debounced snapshot writes.
//!
//! Every document change calls [`PersistenceCoordinator::touch`], which
//! re-arms a single per-room timer. When the room has been quiet for the
//! configured delay the coordinator encodes the full document and upserts it
//! into the [`RoomStore`]. This is debounce, not throttle: a steady stream of
//! changes keeps pushing the write back.
//!
//! Writes run on the blocking pool and never on the message path. A failed
//! write is logged and counted; the next `touch` schedules another attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::storage::{RoomRecord, RoomStore, StoreError};

/// Something that can produce the full encoded state of a room.
pub trait SnapshotSource: Send + Sync {
    fn encode_snapshot(&self) -> Vec<u8>;
}

/// A cancellable delayed task with cancel-and-restart semantics.
///
/// Only the delay is cancellable. Once the delay elapses the task is
/// detached and runs to completion even if `schedule` is called again.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `task` after the delay, cancelling any timer still waiting.
    pub fn schedule<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(task);
        });
        if let Some(previous) = self.pending.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Cancel the waiting timer, if any. Returns whether one was waiting.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(timer) if !timer.is_finished() => {
                timer.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(timer) = self.pending.get_mut().take() {
            timer.abort();
        }
    }
}

/// Write counters shared by every room of a registry.
#[derive(Debug, Default)]
pub struct PersistenceStats {
    writes: AtomicU64,
    failures: AtomicU64,
}

impl PersistenceStats {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Per-room debounced writer.
pub struct PersistenceCoordinator {
    room_id: String,
    store: Arc<dyn RoomStore>,
    source: Weak<dyn SnapshotSource>,
    debouncer: Debouncer,
    /// Set by `touch`, cleared when a write takes its snapshot
    dirty: AtomicBool,
    /// Serializes writes so an older snapshot never lands after a newer one
    write_lock: tokio::sync::Mutex<()>,
    stats: Arc<PersistenceStats>,
}

impl PersistenceCoordinator {
    pub fn new(
        room_id: impl Into<String>,
        store: Arc<dyn RoomStore>,
        source: Weak<dyn SnapshotSource>,
        delay: Duration,
        stats: Arc<PersistenceStats>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            store,
            source,
            debouncer: Debouncer::new(delay),
            dirty: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
            stats,
        }
    }

    /// Mark the room changed and (re)arm the save timer.
    pub fn touch(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::SeqCst);
        let coordinator = Arc::clone(self);
        self.debouncer.schedule(async move {
            if let Err(e) = coordinator.write().await {
                log::error!("Failed to persist room {}: {e}", coordinator.room_id);
            }
        });
    }

    /// Cancel the timer and write immediately if anything changed.
    ///
    /// Returns the stored record, or `None` when there was nothing to write.
    pub async fn flush(&self) -> Result<Option<RoomRecord>, StoreError> {
        self.debouncer.cancel();
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.write().await
    }

    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn write(&self) -> Result<Option<RoomRecord>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(source) = self.source.upgrade() else {
            log::debug!("Room {} is gone, skipping write", self.room_id);
            return Ok(None);
        };
        self.dirty.store(false, Ordering::SeqCst);
        let data = source.encode_snapshot();
        drop(source);

        let store = Arc::clone(&self.store);
        let room_id = self.room_id.clone();
        let result = tokio::task::spawn_blocking(move || store.upsert(&room_id, &data))
            .await
            .map_err(StoreError::from)
            .and_then(|r| r);

        match result {
            Ok(record) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Persisted room {} ({} bytes)",
                    self.room_id,
                    record.data.len()
                );
                Ok(Some(record))
            }
            Err(e) => {
                // Keep the room dirty so a shutdown flush still tries again
                self.dirty.store(true, Ordering::SeqCst);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
