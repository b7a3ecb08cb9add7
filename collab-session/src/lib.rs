//! # collab-session: Real-time collaboration session engine
//!
//! Many clients co-edit one shared Yrs document per room over WebSocket.
//! The server keeps the authoritative replica, fans changes out to the other
//! members, tracks presence, and writes the merged state to durable storage
//! once edits quiet down.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ws://host/<room>  ┌───────────────────┐
//! │ Client A │ ◄────────────────► │ SyncServer        │
//! └──────────┘                    │  ConnectionHandler│ (one per socket)
//! ┌──────────┐                    └─────────┬─────────┘
//! │ Client B │ ◄───────┐                    │ get_or_create(room)
//! └──────────┘         │          ┌─────────▼─────────┐
//!                      │          │ SessionRegistry   │ (single-flight load)
//!                      │          └─────────┬─────────┘
//!                      │          ┌─────────▼─────────┐
//!                      └───────── │ Session           │
//!                  BroadcastGroup │  Document (Yrs)   │──► PersistenceCoordinator
//!                  (skip origin)  │  AwarenessTracker │      (debounced upsert)
//!                                 └───────────────────┘            │
//!                                                            RoomStore (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Varint-tagged binary frames
//! - [`validation`]: Property update schema checks
//! - [`awareness`]: Clocked presence table
//! - [`broadcast`]: Per-room fan-out over bounded queues
//! - [`document`]: Yrs document with per-change events
//! - [`persistence`]: Debounced snapshot writer
//! - [`storage`]: Room records in RocksDB or memory
//! - [`session`]: One room's state behind a single lock
//! - [`handler`]: Per-connection state machine
//! - [`registry`]: Room table
//! - [`server`]: WebSocket server
//! - [`config`]: Environment-driven configuration

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod document;
pub mod handler;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod validation;

// Re-exports for convenience
pub use awareness::{AwarenessTracker, AwarenessUpdate, AwarenessUpdateEntry, ClientId};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionHandle, ConnectionId};
pub use config::{ConfigError, ServerConfig};
pub use document::{Document, DocumentError, MutationEvent, Origin};
pub use handler::{ConnectionHandler, ConnectionState, FrameError};
pub use persistence::{Debouncer, PersistenceCoordinator, PersistenceStats};
pub use protocol::{Frame, MessageType, ProtocolError, SyncMessage, DEFAULT_ROOM};
pub use registry::{SessionError, SessionRegistry};
pub use server::{ServerStats, SyncServer};
pub use session::{LoadOutcome, Session};
pub use storage::{MemoryStore, RocksStore, RoomRecord, RoomStore, StoreConfig, StoreError};
pub use validation::{validate, PropertyUpdate, UpdateKind, ValidationError};
