//! Binary framing for the session protocol.
//!
//! Wire format:
//! ```text
//! ┌──────────────┬────────────────────────────────────┐
//! │ varint type  │ payload (depends on type)          │
//! └──────────────┴────────────────────────────────────┘
//!
//! 0 Sync            [varint sub-type][varint len][bytes]
//!                   sub-type 0 = state summary request (state vector)
//!                   sub-type 1 = state summary response (diff)
//!                   sub-type 2 = raw update
//! 1 Awareness       [varint len][awareness update]
//! 2 Ephemeral       opaque remainder, relayed untouched
//! 3 PropertyUpdate  UTF-8 JSON object remainder
//! ```
//!
//! Varints use the same LEB128 encoding as the Yrs update format, so the
//! primitives come from `yrs::encoding`.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::awareness::AwarenessUpdate;

/// Room used when the connection path carries no room segment.
pub const DEFAULT_ROOM: &str = "default";

/// Top-level frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Document synchronization (summary request, diff, update)
    Sync = 0,
    /// Presence delta
    Awareness = 1,
    /// Low-latency relay, never merged or persisted
    Ephemeral = 2,
    /// Structured property change, validated before it is applied
    PropertyUpdate = 3,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            2 => Some(Self::Ephemeral),
            3 => Some(Self::PropertyUpdate),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

const SYNC_STEP1: u32 = 0;
const SYNC_STEP2: u32 = 1;
const SYNC_UPDATE: u32 = 2;

/// Sync sub-messages carried inside a [`MessageType::Sync`] frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector: "tell me what I am missing"
    SyncStep1(Vec<u8>),
    /// Encoded update answering a `SyncStep1`
    SyncStep2(Vec<u8>),
    /// Incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        let (tag, payload) = match self {
            SyncMessage::SyncStep1(sv) => (SYNC_STEP1, sv),
            SyncMessage::SyncStep2(diff) => (SYNC_STEP2, diff),
            SyncMessage::Update(update) => (SYNC_UPDATE, update),
        };
        buf.write_var(tag);
        buf.write_buf(payload);
    }

    fn decode_from(cursor: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        let tag: u32 = cursor.read_var()?;
        let payload = cursor.read_buf()?.to_vec();
        match tag {
            SYNC_STEP1 => Ok(SyncMessage::SyncStep1(payload)),
            SYNC_STEP2 => Ok(SyncMessage::SyncStep2(payload)),
            SYNC_UPDATE => Ok(SyncMessage::Update(payload)),
            other => Err(ProtocolError::UnknownSyncMessageType(other)),
        }
    }
}

/// A decoded inbound or outbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
    Ephemeral(Vec<u8>),
    /// Raw JSON. Handlers must pass it through
    /// [`crate::validation::PropertyUpdate::try_from`] before use.
    PropertyUpdate(serde_json::Value),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
            Frame::Ephemeral(_) => MessageType::Ephemeral,
            Frame::PropertyUpdate(_) => MessageType::PropertyUpdate,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.message_type().tag());
        match self {
            Frame::Sync(msg) => msg.encode_into(&mut buf),
            Frame::Awareness(update) => buf.write_buf(&update.encode()),
            Frame::Ephemeral(payload) => buf.extend_from_slice(payload),
            Frame::PropertyUpdate(value) => {
                // Value serialization into a Vec cannot fail
                buf.extend_from_slice(value.to_string().as_bytes());
            }
        }
        buf
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var()?;
        let kind = MessageType::from_tag(tag).ok_or(ProtocolError::UnknownMessageType(tag))?;
        let frame = match kind {
            MessageType::Sync => Frame::Sync(SyncMessage::decode_from(&mut cursor)?),
            MessageType::Awareness => {
                let update = cursor.read_buf()?;
                Frame::Awareness(AwarenessUpdate::decode(update)?)
            }
            MessageType::Ephemeral => Frame::Ephemeral(bytes[cursor.next..].to_vec()),
            MessageType::PropertyUpdate => {
                Frame::PropertyUpdate(serde_json::from_slice(&bytes[cursor.next..])?)
            }
        };
        Ok(frame)
    }
}

/// Map a request path to a room id.
///
/// Everything after the leading `/` names the room; an empty remainder
/// maps to `default_room`.
pub fn room_from_path(path: &str, default_room: &str) -> String {
    let room = path.strip_prefix('/').unwrap_or(path);
    if room.is_empty() {
        default_room.to_string()
    } else {
        room.to_string()
    }
}

/// Frame decoding errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("unknown sync message type {0}")]
    UnknownSyncMessageType(u32),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("property update is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
