//! Fan-out of encoded frames to the members of one room.
//!
//! Every connection owns a bounded outbound queue. The room only keeps a
//! weak sender per member, so membership never extends a connection's
//! lifetime: once the connection task drops its handle, sends to it are
//! skipped.
//!
//! Delivery is best-effort. A full queue drops the frame for that member
//! and counts it; there is no retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Identity of one live connection.
pub type ConnectionId = Uuid;

/// Encoded frame shared between all recipients.
pub type Outbound = Arc<Vec<u8>>;

/// Strong end of a connection's outbound queue. Held by the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh id and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// A room member: weak outbound sender plus a last-seen marker.
#[derive(Debug)]
struct Member {
    sender: mpsc::WeakSender<Outbound>,
    last_seen: Instant,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Membership and fan-out for a single room.
#[derive(Default)]
pub struct BroadcastGroup {
    members: RwLock<HashMap<ConnectionId, Member>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Re-adding an id replaces the old sender.
    pub fn add_member(&self, handle: &ConnectionHandle) {
        self.members.write().insert(
            handle.id,
            Member {
                sender: handle.sender.downgrade(),
                last_seen: Instant::now(),
            },
        );
    }

    pub fn remove_member(&self, id: &ConnectionId) -> bool {
        self.members.write().remove(id).is_some()
    }

    /// Refresh the last-seen marker of a member.
    pub fn mark_seen(&self, id: &ConnectionId) {
        if let Some(member) = self.members.write().get_mut(id) {
            member.last_seen = Instant::now();
        }
    }

    pub fn last_seen(&self, id: &ConnectionId) -> Option<Instant> {
        self.members.read().get(id).map(|m| m.last_seen)
    }

    /// Send `frame` to every open member except `exclude`.
    ///
    /// Returns the number of members the frame was queued for.
    pub fn send(&self, frame: Outbound, exclude: Option<ConnectionId>) -> usize {
        let members = self.members.read();
        let mut delivered = 0;
        for (id, member) in members.iter() {
            if Some(*id) == exclude {
                continue;
            }
            if self.deliver(id, member, frame.clone()) {
                delivered += 1;
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Send `frame` to a single member.
    pub fn send_to(&self, id: &ConnectionId, frame: Outbound) -> bool {
        let members = self.members.read();
        match members.get(id) {
            Some(member) => self.deliver(id, member, frame),
            None => false,
        }
    }

    fn deliver(&self, id: &ConnectionId, member: &Member, frame: Outbound) -> bool {
        let Some(sender) = member.sender.upgrade() else {
            log::trace!("Skipping closed connection {id}");
            return false;
        };
        match sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue full for connection {id}, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("Skipping closed connection {id}");
                false
            }
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn has_member(&self, id: &ConnectionId) -> bool {
        self.members.read().contains_key(id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }
}
