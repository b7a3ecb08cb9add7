//! Server-side awareness (presence) tracking for a room.
//!
//! Each client publishes an opaque JSON state (cursor, selection, user
//! profile) tagged with a per-client clock. The tracker keeps the newest
//! state per client and reports only what changed, so fan-out cost is
//! bounded by the number of clients that actually moved.
//!
//! ```text
//! inbound AwarenessUpdate ──► apply() ──► changed subset ──► broadcast
//!                               │
//!                     clock <= stored? drop
//! ```
//!
//! Update wire format (one frame may carry several clients):
//! ```text
//! [varint count] { [varint client_id][varint clock][varstring state] }*
//! ```
//! A state of `null` retires the client.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::broadcast::ConnectionId;
use crate::protocol::ProtocolError;

/// Client identifier chosen by the peer (the Yrs client id).
pub type ClientId = u64;

const NULL_STATE: &str = "null";

/// One client's slot in an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessUpdateEntry {
    pub client_id: ClientId,
    pub clock: u64,
    /// `None` means the client has left.
    pub state: Option<String>,
}

/// Batch of per-client awareness changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessUpdateEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.entries.len() as u64);
        for entry in &self.entries {
            buf.write_var(entry.client_id);
            buf.write_var(entry.clock);
            buf.write_string(entry.state.as_deref().unwrap_or(NULL_STATE));
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let count: u64 = cursor.read_var()?;
        // Each entry needs at least three bytes; reject counts the buffer cannot hold.
        if count > bytes.len() as u64 {
            return Err(ProtocolError::Malformed(format!(
                "awareness update claims {count} entries in {} bytes",
                bytes.len()
            )));
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let client_id: u64 = cursor.read_var()?;
            let clock: u64 = cursor.read_var()?;
            let state = cursor.read_string()?;
            entries.push(AwarenessUpdateEntry {
                client_id,
                clock,
                state: (state != NULL_STATE).then(|| state.to_string()),
            });
        }
        Ok(Self { entries })
    }
}

/// Stored presence for one client.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub clock: u64,
    /// `None` is a tombstone: the client left, but its clock is kept so
    /// late or duplicated updates stay rejected.
    pub state: Option<String>,
    pub last_updated: Instant,
    /// Connection that last published this entry.
    pub owner: Option<ConnectionId>,
}

/// What an accepted entry did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessChange {
    Added,
    Updated,
    Removed,
}

/// Per-room awareness table.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    entries: HashMap<ClientId, AwarenessEntry>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one client's entry.
    ///
    /// Accepted only when `clock` is below `u64::MAX` and the client is
    /// unseen or `clock` is strictly newer than the stored clock. Returns
    /// `None` for discarded entries and for accepted entries that changed
    /// nothing observable (a removal of a client that had no live state).
    pub fn apply_entry(
        &mut self,
        client_id: ClientId,
        clock: u64,
        state: Option<String>,
        origin: ConnectionId,
    ) -> Option<AwarenessChange> {
        // Retirement bumps the clock, so the ceiling itself is never stored
        if clock == u64::MAX {
            return None;
        }
        let previous = self.entries.get(&client_id);
        if let Some(prev) = previous {
            if clock <= prev.clock {
                return None;
            }
        }
        let was_live = previous.is_some_and(|p| p.state.is_some());

        let change = match (&state, was_live) {
            (Some(_), false) => Some(AwarenessChange::Added),
            (Some(_), true) => Some(AwarenessChange::Updated),
            (None, true) => Some(AwarenessChange::Removed),
            (None, false) => None,
        };
        let owner = state.is_some().then_some(origin);
        self.entries.insert(
            client_id,
            AwarenessEntry {
                clock,
                state,
                last_updated: Instant::now(),
                owner,
            },
        );
        change
    }

    /// Apply a batch update from `origin`.
    ///
    /// Returns the subset of entries that changed, ready to broadcast, or
    /// `None` when nothing did.
    pub fn apply(&mut self, update: &AwarenessUpdate, origin: ConnectionId) -> Option<AwarenessUpdate> {
        let mut changed = AwarenessUpdate::default();
        for entry in &update.entries {
            if let Some(change) =
                self.apply_entry(entry.client_id, entry.clock, entry.state.clone(), origin)
            {
                log::trace!("Awareness client {} {:?} at clock {}", entry.client_id, change, entry.clock);
                changed.entries.push(entry.clone());
            }
        }
        (!changed.is_empty()).then_some(changed)
    }

    /// Full snapshot of live entries, used for the join handshake.
    pub fn snapshot(&self) -> Option<AwarenessUpdate> {
        let entries: Vec<AwarenessUpdateEntry> = self
            .entries
            .iter()
            .filter_map(|(client_id, entry)| {
                entry.state.as_ref().map(|state| AwarenessUpdateEntry {
                    client_id: *client_id,
                    clock: entry.clock,
                    state: Some(state.clone()),
                })
            })
            .collect();
        (!entries.is_empty()).then_some(AwarenessUpdate { entries })
    }

    /// Retire every live entry published by `connection`.
    ///
    /// Each removal bumps the client's clock so peers accept it.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Option<AwarenessUpdate> {
        self.retire(|entry| entry.owner == Some(connection))
    }

    /// Retire live entries that have not been refreshed within `timeout`.
    pub fn expire_idle(&mut self, now: Instant, timeout: Duration) -> Option<AwarenessUpdate> {
        self.retire(|entry| now.saturating_duration_since(entry.last_updated) > timeout)
    }

    fn retire<F>(&mut self, mut should_retire: F) -> Option<AwarenessUpdate>
    where
        F: FnMut(&AwarenessEntry) -> bool,
    {
        let now = Instant::now();
        let mut removed = AwarenessUpdate::default();
        for (client_id, entry) in self.entries.iter_mut() {
            if entry.state.is_none() || !should_retire(entry) {
                continue;
            }
            entry.clock = entry.clock.saturating_add(1);
            entry.state = None;
            entry.owner = None;
            entry.last_updated = now;
            removed.entries.push(AwarenessUpdateEntry {
                client_id: *client_id,
                clock: entry.clock,
                state: None,
            });
        }
        (!removed.is_empty()).then_some(removed)
    }

    /// Stored clock for a client, including retired clients.
    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.entries.get(&client_id).map(|e| e.clock)
    }

    /// Live state for a client.
    pub fn state(&self, client_id: ClientId) -> Option<&str> {
        self.entries.get(&client_id).and_then(|e| e.state.as_deref())
    }

    /// Number of clients with live state.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
