//! Schema checks for inbound property updates.
//!
//! Property updates arrive as loosely typed JSON. [`validate`] runs the
//! checks in a fixed order and reports the first failure; [`PropertyUpdate`]
//! is the typed form handed to the document once the checks pass.

use serde_json::{Map, Value};
use thiserror::Error;

/// Numeric properties that carry geometric meaning.
const NUMERIC_PROPERTIES: [&str; 5] = ["width", "height", "rotation", "scaleX", "scaleY"];

/// Properties that must be strictly positive when present.
const POSITIVE_PROPERTIES: [&str; 2] = ["width", "height"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("objectId must be a non-empty string")]
    InvalidObjectId,
    #[error("type must be one of resize, rotate, update (got {0})")]
    InvalidType(String),
    #[error("properties must be an object")]
    InvalidProperties,
    #[error("properties.{0} must be a number")]
    NotNumeric(&'static str),
    #[error("properties.{0} must be positive")]
    NotPositive(&'static str),
}

/// Kind of edit a property update describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Resize,
    Rotate,
    Update,
}

impl UpdateKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resize" => Some(Self::Resize),
            "rotate" => Some(Self::Rotate),
            "update" => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::Rotate => "rotate",
            Self::Update => "update",
        }
    }
}

/// Validate a property update payload.
pub fn validate(payload: &Value) -> Result<(), ValidationError> {
    let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;

    match object.get("objectId").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => {}
        _ => return Err(ValidationError::InvalidObjectId),
    }

    if let Some(kind) = object.get("type") {
        if kind.as_str().and_then(UpdateKind::parse).is_none() {
            return Err(ValidationError::InvalidType(kind.to_string()));
        }
    }

    let properties = object
        .get("properties")
        .and_then(Value::as_object)
        .ok_or(ValidationError::InvalidProperties)?;

    for name in NUMERIC_PROPERTIES {
        if let Some(value) = properties.get(name) {
            if !value.is_number() {
                return Err(ValidationError::NotNumeric(name));
            }
        }
    }

    for name in POSITIVE_PROPERTIES {
        if let Some(value) = properties.get(name).and_then(Value::as_f64) {
            if value <= 0.0 {
                return Err(ValidationError::NotPositive(name));
            }
        }
    }

    Ok(())
}

/// A validated property update.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub object_id: String,
    pub kind: Option<UpdateKind>,
    pub properties: Map<String, Value>,
}

impl TryFrom<&Value> for PropertyUpdate {
    type Error = ValidationError;

    fn try_from(payload: &Value) -> Result<Self, Self::Error> {
        validate(payload)?;
        // validate() guarantees the shape below
        let object_id = payload["objectId"].as_str().unwrap_or_default().to_string();
        let kind = payload.get("type").and_then(Value::as_str).and_then(UpdateKind::parse);
        let properties = payload["properties"].as_object().cloned().unwrap_or_default();
        Ok(Self {
            object_id,
            kind,
            properties,
        })
    }
}
