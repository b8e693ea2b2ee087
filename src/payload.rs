//! Structured request/response payloads.
//!
//! Everything that is cached or queued must be representable as a JSON
//! object or array. Values that cannot be serialized (maps with non-string
//! keys, failing `Serialize` impls) are rejected when the payload is built,
//! not later when it is persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field name used to carry a client-generated idempotency key.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotency_key";

/// Error type for payload construction.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
  /// The value could not be serialized.
  #[error("payload is not serializable: {0}")]
  NotSerializable(#[from] serde_json::Error),

  /// The value serialized to a bare scalar.
  #[error("payload must be a JSON object or array, got {0}")]
  NotStructured(&'static str),
}

/// A structured JSON value that is safe to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
  /// Serialize any value into a payload.
  pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, PayloadError> {
    Self::from_value(serde_json::to_value(value)?)
  }

  /// Wrap an already-built JSON value.
  pub fn from_value(value: Value) -> Result<Self, PayloadError> {
    match &value {
      Value::Object(_) | Value::Array(_) => Ok(Self(value)),
      Value::Null => Err(PayloadError::NotStructured("null")),
      Value::Bool(_) => Err(PayloadError::NotStructured("bool")),
      Value::Number(_) => Err(PayloadError::NotStructured("number")),
      Value::String(_) => Err(PayloadError::NotStructured("string")),
    }
  }

  /// Stamp a caller-generated idempotency key into an object payload.
  ///
  /// Replays after a crash may deliver the same mutation twice; endpoints
  /// that are not naturally idempotent (e.g. `POST /bookings`) need this key
  /// to deduplicate.
  pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Result<Self, PayloadError> {
    match &mut self.0 {
      Value::Object(map) => {
        map.insert(IDEMPOTENCY_KEY_FIELD.to_string(), Value::String(key.into()));
        Ok(self)
      }
      _ => Err(PayloadError::NotStructured("array")),
    }
  }

  pub fn idempotency_key(&self) -> Option<&str> {
    self.0.get(IDEMPOTENCY_KEY_FIELD).and_then(Value::as_str)
  }

  pub fn is_object(&self) -> bool {
    self.0.is_object()
  }

  pub fn as_value(&self) -> &Value {
    &self.0
  }

  pub fn into_value(self) -> Value {
    self.0
  }
}

impl TryFrom<Value> for Payload {
  type Error = PayloadError;

  fn try_from(value: Value) -> Result<Self, Self::Error> {
    Self::from_value(value)
  }
}
