//! Per-connection protocol state machine.
//!
//! ```text
//! CONNECTING ──open()──► SYNCING ──first sync frame──► ACTIVE
//!      │                    │                            │
//!      └────────────────────┴──────────close()───────────┴──► CLOSED
//! ```
//!
//! The handler is transport-agnostic: it takes raw inbound frames and
//! returns the reply, if any, that must go back to this connection only.
//! Broadcasts go through the session's member queues.

use std::sync::Arc;

use thiserror::Error;

use crate::broadcast::{ConnectionHandle, ConnectionId};
use crate::document::DocumentError;
use crate::protocol::{Frame, ProtocolError};
use crate::session::Session;
use crate::validation::{PropertyUpdate, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Syncing,
    Active,
    Closed,
}

/// Why a single frame was rejected. None of these close the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("rejected property update: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("connection is closed")]
    Closed,
}

pub struct ConnectionHandler {
    session: Arc<Session>,
    handle: ConnectionHandle,
    state: ConnectionState,
    max_frame_bytes: usize,
}

impl ConnectionHandler {
    pub fn new(session: Arc<Session>, handle: ConnectionHandle, max_frame_bytes: usize) -> Self {
        Self {
            session,
            handle,
            state: ConnectionState::Connecting,
            max_frame_bytes,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Join the room and queue the handshake. Returns the frames queued.
    pub fn open(&mut self) -> usize {
        if self.state != ConnectionState::Connecting {
            return 0;
        }
        let queued = self.session.join(&self.handle);
        self.state = ConnectionState::Syncing;
        queued
    }

    /// Process one inbound frame.
    ///
    /// `Ok(Some(bytes))` is a reply for this connection alone.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        if self.state == ConnectionState::Closed {
            return Err(FrameError::Closed);
        }
        if bytes.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_frame_bytes,
            }
            .into());
        }

        let id = self.id();
        self.session.mark_seen(&id);

        match Frame::decode(bytes)? {
            Frame::Sync(message) => {
                let reply = self.session.apply_sync(id, message)?;
                if self.state == ConnectionState::Syncing {
                    self.state = ConnectionState::Active;
                    log::debug!("Connection {id} is active in room {}", self.session.room_id());
                }
                Ok(reply)
            }
            Frame::Awareness(update) => {
                self.session.apply_awareness(id, &update);
                Ok(None)
            }
            Frame::Ephemeral(payload) => {
                self.session.relay_ephemeral(id, payload);
                Ok(None)
            }
            Frame::PropertyUpdate(payload) => {
                let update = PropertyUpdate::try_from(&payload)?;
                self.session.apply_property_update(id, &update);
                Ok(None)
            }
        }
    }

    /// Leave the room. Safe to call more than once; only the first call
    /// retires the connection's presence.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        let was_open = self.state != ConnectionState::Connecting;
        self.state = ConnectionState::Closed;
        if was_open {
            self.session.leave(self.id());
        }
        was_open
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.close();
    }
}
