//! Room table: one [`Session`] per room id for the life of the process.
//!
//! The first caller for a room loads its stored record; concurrent callers
//! for the same room wait on that one load instead of starting their own.
//! Sessions are never evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::persistence::PersistenceStats;
use crate::session::{LoadOutcome, Session};
use crate::storage::{RoomRecord, RoomStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to load room {room_id}: {source}")]
    Load {
        room_id: String,
        #[source]
        source: StoreError,
    },
}

type Slot = Arc<OnceCell<Arc<Session>>>;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Slot>>,
    store: Arc<dyn RoomStore>,
    save_delay: Duration,
    stats: Arc<PersistenceStats>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn RoomStore>, save_delay: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            save_delay,
            stats: Arc::new(PersistenceStats::default()),
        }
    }

    /// Return the room's session, loading it from the store on first use.
    ///
    /// A failed load leaves nothing cached, so the next caller retries.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Session>, SessionError> {
        let slot = {
            let mut sessions = self.sessions.lock();
            Arc::clone(sessions.entry(room_id.to_string()).or_default())
        };
        slot.get_or_try_init(|| self.load(room_id))
            .await
            .map(Arc::clone)
    }

    async fn load(&self, room_id: &str) -> Result<Arc<Session>, SessionError> {
        let load_error = |source| SessionError::Load {
            room_id: room_id.to_string(),
            source,
        };

        let stored = match self.read(room_id).await {
            Ok(record) => record.map(|r| r.data),
            Err(e) if e.is_corruption() => {
                log::error!("Stored record for room {room_id} is unreadable ({e}); starting empty");
                self.discard(room_id).await;
                None
            }
            Err(e) => return Err(load_error(e)),
        };

        let (session, outcome) = Session::open(
            room_id,
            Arc::clone(&self.store),
            self.save_delay,
            Arc::clone(&self.stats),
            stored.as_deref(),
        );
        match outcome {
            LoadOutcome::Empty => log::info!("Created room {room_id}"),
            LoadOutcome::Restored { bytes } => {
                log::info!("Loaded room {room_id} from storage ({bytes} bytes)")
            }
            LoadOutcome::Discarded(e) => {
                log::error!("Stored state for room {room_id} was rejected ({e}); starting empty");
                self.discard(room_id).await;
            }
        }
        Ok(session)
    }

    async fn read(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let store = Arc::clone(&self.store);
        let room_id = room_id.to_string();
        tokio::task::spawn_blocking(move || store.find_by_id(&room_id)).await?
    }

    async fn discard(&self, room_id: &str) {
        let store = Arc::clone(&self.store);
        let id = room_id.to_string();
        match tokio::task::spawn_blocking(move || store.delete(&id)).await {
            Ok(Ok(_)) => log::warn!("Discarded stored record for room {room_id}"),
            Ok(Err(e)) => log::error!("Failed to discard record for room {room_id}: {e}"),
            Err(e) => log::error!("Failed to discard record for room {room_id}: {e}"),
        }
    }

    /// Resident session, without loading.
    pub fn get(&self, room_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(room_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Every resident session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn persistence_stats(&self) -> &Arc<PersistenceStats> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Write every room with unsaved changes now. Returns how many were written.
    pub async fn flush_all(&self) -> usize {
        let mut written = 0;
        for session in self.sessions() {
            match session.flush().await {
                Ok(Some(_)) => written += 1,
                Ok(None) => {}
                Err(e) => log::error!("Failed to flush room {}: {e}", session.room_id()),
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, WriteTxn};

    /// Counts reads and can be told to fail them.
    struct CountingStore {
        inner: MemoryStore,
        reads: AtomicUsize,
        fail_reads: bool,
    }

    impl CountingStore {
        fn new(fail_reads: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                reads: AtomicUsize::new(0),
                fail_reads,
            }
        }
    }

    impl RoomStore for CountingStore {
        fn find_by_id(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            // Widen the race window
            std::thread::sleep(Duration::from_millis(20));
            if self.fail_reads {
                return Err(StoreError::Unavailable("offline".into()));
            }
            self.inner.find_by_id(room_id)
        }
        fn upsert(&self, room_id: &str, data: &[u8]) -> Result<RoomRecord, StoreError> {
            self.inner.upsert(room_id, data)
        }
        fn delete(&self, room_id: &str) -> Result<bool, StoreError> {
            self.inner.delete(room_id)
        }
        fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_rooms()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_touch_loads_once() {
        let store = Arc::new(CountingStore::new(false));
        let registry = Arc::new(SessionRegistry::new(store.clone(), Duration::from_secs(60)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("shared").await.unwrap() })
            })
            .collect();
        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }

        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let a = registry.get_or_create("a").await.unwrap();
        let b = registry.get_or_create("b").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
    }

    #[tokio::test]
    async fn test_restores_stored_state() {
        let store = Arc::new(MemoryStore::new());
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_text("content").push(&mut txn, "hello");
        }
        store.seed("saved", doc.transact().encode_state_as_update_v1(&StateVector::default()));

        let registry = SessionRegistry::new(store, Duration::from_secs(60));
        let session = registry.get_or_create("saved").await.unwrap();
        let text = session.with_document(|d| {
            let txn = d.doc().transact();
            txn.get_text("content")
                .map(|t| t.get_string(&txn))
                .unwrap_or_default()
        });
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_rejected_record_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.seed("broken", vec![0x01, 0x05]);

        let registry = SessionRegistry::new(store.clone(), Duration::from_secs(60));
        let session = registry.get_or_create("broken").await.unwrap();

        assert_eq!(store.find_by_id("broken").unwrap(), None);
        // An empty document encodes as zero clients and an empty delete set
        assert_eq!(session.snapshot(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_record_with_impossible_counts_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.seed("hostile", vec![0, 1, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);

        let registry = SessionRegistry::new(store.clone(), Duration::from_secs(60));
        let session = registry.get_or_create("hostile").await.unwrap();

        assert_eq!(store.find_by_id("hostile").unwrap(), None);
        assert_eq!(session.snapshot(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_read_failure_is_not_cached() {
        let store = Arc::new(CountingStore::new(true));
        let registry = SessionRegistry::new(store.clone(), Duration::from_secs(60));

        let err = registry.get_or_create("down").await.err().unwrap();
        assert!(matches!(err, SessionError::Load { .. }));
        assert_eq!(registry.room_count(), 0);

        assert!(registry.get_or_create("down").await.is_err());
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_all_writes_dirty_rooms() {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(store.clone(), Duration::from_secs(60));
        registry.get_or_create("clean").await.unwrap();
        let dirty = registry.get_or_create("dirty").await.unwrap();
        dirty.persistence().touch();

        assert_eq!(registry.flush_all().await, 1);
        assert_eq!(store.list_rooms().unwrap(), vec!["dirty"]);
        assert_eq!(registry.persistence_stats().writes(), 1);
    }
}
