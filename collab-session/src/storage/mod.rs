//! Durable room storage.
//!
//! ```text
//! ┌──────────────────────┐   upsert (debounced)   ┌──────────────┐
//! │ PersistenceCoordinator│ ────────────────────► │ RoomStore    │
//! └──────────────────────┘                        │  RocksStore  │
//! ┌──────────────────────┐   find_by_id (once)    │  MemoryStore │
//! │ SessionRegistry      │ ◄──────────────────── └──────────────┘
//! └──────────────────────┘
//! ```
//!
//! A record holds the full encoded document, never deltas: every write is a
//! complete snapshot that overwrites the previous one.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Persisted state of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: String,
    /// Full document state (v1 update encoding)
    pub data: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

impl RoomRecord {
    pub fn new(room_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            room_id: room_id.into(),
            data,
            updated_at: now_millis(),
        }
    }
}

/// Blocking key-value contract for room records.
///
/// Implementations must be safe to call from `spawn_blocking` threads.
pub trait RoomStore: Send + Sync {
    fn find_by_id(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;

    /// Create or overwrite the record, stamping `updated_at` with now.
    fn upsert(&self, room_id: &str, data: &[u8]) -> Result<RoomRecord, StoreError>;

    /// Returns whether a record existed.
    fn delete(&self, room_id: &str) -> Result<bool, StoreError>;

    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// The bytes were read but cannot be interpreted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Deserialization(_) | StoreError::Compression(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
