//! Authoritative room document backed by a Yrs `Doc`.
//!
//! All mutation goes through [`Document::apply_update`] or
//! [`Document::apply_properties`]. Each applied change that alters the
//! document is reported once to every registered handler as a
//! [`MutationEvent`], tagged with the [`Origin`] that caused it.

mod preflight;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, ReadTxn, StateVector, Transact, Update, WriteTxn};

use crate::broadcast::ConnectionId;
use crate::validation::PropertyUpdate;

/// v1 encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Prefix of the root map holding one object's properties.
pub const OBJECT_MAP_PREFIX: &str = "object:";

/// Who caused a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Replayed from the durable store while opening the room
    Storage,
    /// Sent by a live connection
    Connection(ConnectionId),
}

/// One applied change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    /// v1-encoded update containing exactly this change
    pub update: Vec<u8>,
    pub origin: Origin,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("undecodable update: {0}")]
    Decode(String),
    #[error("update rejected by the document: {0}")]
    Apply(String),
    #[error("undecodable state vector: {0}")]
    StateVector(String),
}

type UpdateHandler = Box<dyn Fn(&MutationEvent) + Send + Sync>;

/// The document handle owned by a session.
pub struct Document {
    doc: Doc,
    handlers: Vec<UpdateHandler>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            handlers: Vec::new(),
        }
    }

    /// Register a handler invoked after every change.
    pub fn on_update<F>(&mut self, handler: F)
    where
        F: Fn(&MutationEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Decode and merge a v1 update.
    ///
    /// Returns `true` when the document changed. Duplicates and updates
    /// still waiting on missing dependencies report `false` and emit nothing.
    pub fn apply_update(&self, bytes: &[u8], origin: Origin) -> Result<bool, DocumentError> {
        preflight::check_update(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let update = Update::decode_v1(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let changes = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
            txn.encode_update_v1()
        };
        Ok(self.emit(changes, origin))
    }

    /// Write a validated property update into the object's root map.
    ///
    /// Properties merge per key, so concurrent edits to different
    /// properties of the same object both survive.
    pub fn apply_properties(&self, update: &PropertyUpdate, origin: Origin) -> bool {
        let changes = {
            let mut txn = self.doc.transact_mut();
            let object = txn.get_or_insert_map(object_map_name(&update.object_id));
            if let Some(kind) = update.kind {
                object.insert(&mut txn, "type", kind.as_str());
            }
            for (name, value) in &update.properties {
                object.insert(&mut txn, name.as_str(), json_to_any(value));
            }
            txn.encode_update_v1()
        };
        self.emit(changes, origin)
    }

    fn emit(&self, update: Vec<u8>, origin: Origin) -> bool {
        if update.as_slice() == EMPTY_UPDATE {
            return false;
        }
        let event = MutationEvent { update, origin };
        for handler in &self.handlers {
            handler(&event);
        }
        true
    }

    /// Full document state as a single v1 update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector describing which updates this replica holds.
    pub fn encode_state_summary(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `remote_summary` lacks.
    pub fn encode_diff(&self, remote_summary: &[u8]) -> Result<Vec<u8>, DocumentError> {
        preflight::check_state_vector(remote_summary)
            .map_err(|e| DocumentError::StateVector(e.to_string()))?;
        let remote = StateVector::decode_v1(remote_summary)
            .map_err(|e| DocumentError::StateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Underlying Yrs document, for read-only inspection.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

pub fn object_map_name(object_id: &str) -> String {
    format!("{OBJECT_MAP_PREFIX}{object_id}")
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => Any::Number(n.as_f64().unwrap_or_default()),
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(fields) => Any::Map(Arc::new(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<HashMap<String, Any>>(),
        )),
    }
}
