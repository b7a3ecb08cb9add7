//! One room: document, members and awareness.
//!
//! ```text
//!              ┌──────────── Session ────────────┐
//!  frame ────► │ Mutex<SessionState>             │
//!              │   Document ── on_update ──┬─────┼──► PersistenceCoordinator::touch
//!              │   AwarenessTracker        │     │
//!              │                           └─────┼──► BroadcastGroup::send (skip origin)
//!              └─────────────────────────────────┘
//! ```
//!
//! Every mutation of the document or the awareness table happens with the
//! state lock held, so changes to one room are applied one at a time. The
//! lock is never held across an await.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::awareness::{AwarenessTracker, AwarenessUpdate, ClientId};
use crate::broadcast::{BroadcastGroup, ConnectionHandle, ConnectionId};
use crate::document::{Document, DocumentError, Origin};
use crate::persistence::{PersistenceCoordinator, PersistenceStats, SnapshotSource};
use crate::protocol::{Frame, SyncMessage};
use crate::storage::{RoomRecord, RoomStore, StoreError};
use crate::validation::PropertyUpdate;

/// How a session's initial state was obtained.
#[derive(Debug)]
pub enum LoadOutcome {
    /// No stored record, or an empty one
    Empty,
    /// Stored state was applied
    Restored { bytes: usize },
    /// Stored state was rejected; the session started empty
    Discarded(DocumentError),
}

struct SessionState {
    document: Document,
    awareness: AwarenessTracker,
}

pub struct Session {
    room_id: String,
    state: Mutex<SessionState>,
    members: Arc<BroadcastGroup>,
    persistence: Arc<PersistenceCoordinator>,
}

impl Session {
    /// Build a session and apply `stored` state, if any.
    pub fn open(
        room_id: impl Into<String>,
        store: Arc<dyn RoomStore>,
        save_delay: Duration,
        stats: Arc<PersistenceStats>,
        stored: Option<&[u8]>,
    ) -> (Arc<Self>, LoadOutcome) {
        let room_id = room_id.into();
        let session = Arc::new_cyclic(|weak: &Weak<Session>| {
            let source: Weak<dyn SnapshotSource> = weak.clone();
            let persistence = Arc::new(PersistenceCoordinator::new(
                room_id.clone(),
                store,
                source,
                save_delay,
                stats,
            ));
            let members = Arc::new(BroadcastGroup::new());
            let document = build_document(&members, &persistence);
            Session {
                room_id,
                state: Mutex::new(SessionState {
                    document,
                    awareness: AwarenessTracker::new(),
                }),
                members,
                persistence,
            }
        });

        let outcome = match stored {
            Some(bytes) if !bytes.is_empty() => session.restore(bytes),
            _ => LoadOutcome::Empty,
        };
        (session, outcome)
    }

    fn restore(&self, bytes: &[u8]) -> LoadOutcome {
        let mut state = self.state.lock();
        match state.document.apply_update(bytes, Origin::Storage) {
            Ok(_) => LoadOutcome::Restored { bytes: bytes.len() },
            Err(e) => {
                // The rejected update may have left partial state behind
                state.document = build_document(&self.members, &self.persistence);
                LoadOutcome::Discarded(e)
            }
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn members(&self) -> &Arc<BroadcastGroup> {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.member_count()
    }

    pub fn persistence(&self) -> &Arc<PersistenceCoordinator> {
        &self.persistence
    }

    /// Register a connection and queue the handshake for it.
    ///
    /// The handshake is a state summary request, followed by the current
    /// presence snapshot when anyone is present. Returns the number of
    /// frames queued.
    pub fn join(&self, handle: &ConnectionHandle) -> usize {
        self.members.add_member(handle);
        let state = self.state.lock();

        let mut frames = vec![Frame::Sync(SyncMessage::SyncStep1(
            state.document.encode_state_summary(),
        ))];
        if let Some(snapshot) = state.awareness.snapshot() {
            frames.push(Frame::Awareness(snapshot));
        }

        let queued = frames
            .into_iter()
            .filter(|frame| self.members.send_to(&handle.id(), Arc::new(frame.encode())))
            .count();
        log::info!(
            "Connection {} joined room {} ({} members)",
            handle.id(),
            self.room_id,
            self.members.member_count()
        );
        queued
    }

    /// Apply a sync sub-message from `connection`.
    ///
    /// Returns the encoded reply frame for the requester, if any. Replies
    /// are never broadcast.
    pub fn apply_sync(
        &self,
        connection: ConnectionId,
        message: SyncMessage,
    ) -> Result<Option<Vec<u8>>, DocumentError> {
        let state = self.state.lock();
        match message {
            SyncMessage::SyncStep1(summary) => {
                let diff = state.document.encode_diff(&summary)?;
                Ok(Some(Frame::Sync(SyncMessage::SyncStep2(diff)).encode()))
            }
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                let changed = state
                    .document
                    .apply_update(&update, Origin::Connection(connection))?;
                if !changed {
                    log::trace!("No-op update from {connection} in room {}", self.room_id);
                }
                Ok(None)
            }
        }
    }

    /// Apply a presence delta. Returns how many peers received the change.
    pub fn apply_awareness(&self, connection: ConnectionId, update: &AwarenessUpdate) -> usize {
        let mut state = self.state.lock();
        match state.awareness.apply(update, connection) {
            Some(delta) => self
                .members
                .send(Arc::new(Frame::Awareness(delta).encode()), Some(connection)),
            None => 0,
        }
    }

    /// Relay an ephemeral payload to everyone but the sender.
    pub fn relay_ephemeral(&self, connection: ConnectionId, payload: Vec<u8>) -> usize {
        self.members
            .send(Arc::new(Frame::Ephemeral(payload).encode()), Some(connection))
    }

    /// Write a validated property update into the document.
    pub fn apply_property_update(&self, connection: ConnectionId, update: &PropertyUpdate) -> bool {
        let state = self.state.lock();
        state
            .document
            .apply_properties(update, Origin::Connection(connection))
    }

    /// Remove a connection along with the presence it published.
    ///
    /// The removal delta goes to the remaining members. Returns `false` if
    /// the connection was not a member.
    pub fn leave(&self, connection: ConnectionId) -> bool {
        let was_member = self.members.remove_member(&connection);
        let mut state = self.state.lock();
        if let Some(removed) = state.awareness.remove_connection(connection) {
            let recipients = self
                .members
                .send(Arc::new(Frame::Awareness(removed).encode()), Some(connection));
            log::debug!(
                "Retired presence of {connection} in room {} for {recipients} peers",
                self.room_id
            );
        }
        if was_member {
            log::info!(
                "Connection {connection} left room {} ({} members)",
                self.room_id,
                self.members.member_count()
            );
        }
        was_member
    }

    /// Retire presence entries idle for longer than `timeout`, broadcasting
    /// the removal to every member. Returns the number of entries retired.
    pub fn expire_idle_awareness(&self, timeout: Duration) -> usize {
        let mut state = self.state.lock();
        match state.awareness.expire_idle(Instant::now(), timeout) {
            Some(removed) => {
                let count = removed.entries.len();
                self.members
                    .send(Arc::new(Frame::Awareness(removed).encode()), None);
                log::debug!("Expired {count} idle presence entries in room {}", self.room_id);
                count
            }
            None => 0,
        }
    }

    pub fn mark_seen(&self, connection: &ConnectionId) {
        self.members.mark_seen(connection);
    }

    /// Number of clients with live presence.
    pub fn awareness_len(&self) -> usize {
        self.state.lock().awareness.len()
    }

    pub fn awareness_clock(&self, client_id: ClientId) -> Option<u64> {
        self.state.lock().awareness.clock(client_id)
    }

    /// Full document state as a single update.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().document.encode_full_state()
    }

    pub fn state_summary(&self) -> Vec<u8> {
        self.state.lock().document.encode_state_summary()
    }

    /// Run `f` against the document with the state lock held.
    pub fn with_document<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.state.lock().document)
    }

    /// Write pending changes now instead of waiting for the debounce.
    pub async fn flush(&self) -> Result<Option<RoomRecord>, StoreError> {
        self.persistence.flush().await
    }
}

impl SnapshotSource for Session {
    fn encode_snapshot(&self) -> Vec<u8> {
        self.snapshot()
    }
}

/// A document whose changes are persisted and, unless they came from
/// storage, broadcast to every member except the one that made them.
fn build_document(
    members: &Arc<BroadcastGroup>,
    persistence: &Arc<PersistenceCoordinator>,
) -> Document {
    let members = Arc::clone(members);
    let persistence = Arc::clone(persistence);
    let mut document = Document::new();
    document.on_update(move |event| {
        persistence.touch();
        if let Origin::Connection(origin) = event.origin {
            let frame = Frame::Sync(SyncMessage::Update(event.update.clone())).encode();
            members.send(Arc::new(frame), Some(origin));
        }
    });
    document
}
