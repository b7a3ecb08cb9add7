//! RocksDB-backed room store.
//!
//! Column families:
//! - `rooms`: one record per room, keyed by room id (UTF-8). The value is a
//!   bincode envelope carrying the update timestamp and the LZ4-compressed
//!   document state.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{now_millis, RoomRecord, RoomStore, StoreError};

const CF_ROOMS: &str = "rooms";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk envelope for one room.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRoom {
    updated_at: u64,
    /// Uncompressed document size in bytes
    raw_size: u64,
    /// LZ4 block with the uncompressed size prepended
    compressed: Vec<u8>,
}

impl StoredRoom {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (stored, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(stored)
    }
}

/// Durable room store.
pub struct RocksStore {
    /// Single-threaded mode; callers reach it through `spawn_blocking`
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column family if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptor = ColumnFamilyDescriptor::new(CF_ROOMS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![descriptor],
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 blocks
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_ROOMS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_ROOMS}' not found")))
    }
}

impl RoomStore for RocksStore {
    fn find_by_id(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let cf = self.cf()?;
        let Some(bytes) = self.db.get_cf(cf, room_id.as_bytes())? else {
            return Ok(None);
        };

        let stored = StoredRoom::decode(&bytes)?;
        let data = lz4_flex::decompress_size_prepended(&stored.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        if data.len() as u64 != stored.raw_size {
            return Err(StoreError::Compression(format!(
                "expected {} bytes, got {}",
                stored.raw_size,
                data.len()
            )));
        }

        Ok(Some(RoomRecord {
            room_id: room_id.to_string(),
            data,
            updated_at: stored.updated_at,
        }))
    }

    fn upsert(&self, room_id: &str, data: &[u8]) -> Result<RoomRecord, StoreError> {
        let cf = self.cf()?;
        let updated_at = now_millis();
        let stored = StoredRoom {
            updated_at,
            raw_size: data.len() as u64,
            compressed: lz4_flex::compress_prepend_size(data),
        };

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, room_id.as_bytes(), stored.encode()?, &write_opts)?;

        log::debug!(
            "Stored room {room_id}: {} bytes ({} compressed)",
            data.len(),
            stored.compressed.len()
        );
        Ok(RoomRecord {
            room_id: room_id.to_string(),
            data: data.to_vec(),
            updated_at,
        })
    }

    fn delete(&self, room_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf()?;
        let existed = self.db.get_pinned_cf(cf, room_id.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf(cf, room_id.as_bytes())?;
        }
        Ok(existed)
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
