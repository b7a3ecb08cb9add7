//! In-process room store. Used when no storage path is configured and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{RoomRecord, RoomStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, RoomRecord>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful upserts since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Store `data` without touching the write counter.
    pub fn seed(&self, room_id: &str, data: Vec<u8>) {
        self.records
            .write()
            .insert(room_id.to_string(), RoomRecord::new(room_id, data));
    }
}

impl RoomStore for MemoryStore {
    fn find_by_id(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.records.read().get(room_id).cloned())
    }

    fn upsert(&self, room_id: &str, data: &[u8]) -> Result<RoomRecord, StoreError> {
        let record = RoomRecord::new(room_id, data.to_vec());
        self.records.write().insert(room_id.to_string(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    fn delete(&self, room_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(room_id).is_some())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let mut rooms: Vec<String> = self.records.read().keys().cloned().collect();
        rooms.sort();
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_overwrites() {
        let store = MemoryStore::new();
        store.upsert("lobby", b"one").unwrap();
        let second = store.upsert("lobby", b"two").unwrap();

        let found = store.find_by_id("lobby").unwrap().unwrap();
        assert_eq!(found.data, b"two");
        assert_eq!(found.updated_at, second.updated_at);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_missing_room() {
        let store = MemoryStore::new();
        assert_eq!(store.find_by_id("nowhere").unwrap(), None);
        assert!(!store.delete("nowhere").unwrap());
    }

    #[test]
    fn test_seed_and_list() {
        let store = MemoryStore::new();
        store.seed("b", vec![1]);
        store.seed("a", vec![2]);
        assert_eq!(store.list_rooms().unwrap(), vec!["a", "b"]);
        assert_eq!(store.write_count(), 0);
        assert!(store.delete("a").unwrap());
        assert_eq!(store.list_rooms().unwrap(), vec!["b"]);
    }
}
