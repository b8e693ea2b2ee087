//! Remote transport abstraction.
//!
//! Provides a trait-based transport layer that enables:
//! - Real HTTP calls against the household API for production
//! - Scripted transports for unit testing

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub use http::HttpTransport;

use crate::payload::Payload;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether this method changes remote state and must go through the outbox.
  pub fn is_mutation(self) -> bool {
    !matches!(self, Method::Get)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// A response received from the remote API, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
  pub status: u16,
  /// Decoded JSON body (`Null` when empty, a string when not JSON)
  pub body: Value,
}

impl TransportResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Human-readable error text, preferring the API's `message` field.
  pub fn error_message(&self) -> String {
    self
      .body
      .get("message")
      .or_else(|| self.body.get("error"))
      .and_then(Value::as_str)
      .map(String::from)
      .unwrap_or_else(|| format!("HTTP {}", self.status))
  }
}

/// Error type for transport operations. Each of these means no usable
/// response was received.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
  /// The call exceeded its timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// Could not reach the remote or the connection broke mid-call.
  #[error("connection failed: {0}")]
  Connection(String),

  /// The endpoint could not be turned into a URL.
  #[error("invalid endpoint '{0}'")]
  InvalidEndpoint(String),

  /// The request body could not be encoded. Nothing was sent.
  #[error("could not encode request body: {0}")]
  Encode(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport trait for request/response calls to the remote API.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Send a request and wait at most `timeout` for the response.
  async fn send(
    &self,
    method: Method,
    endpoint: &str,
    payload: Option<&Payload>,
    timeout: Duration,
  ) -> TransportResult<TransportResponse>;
}

/// How the outcome of a call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  /// 2xx: confirmed by the remote.
  Success,
  /// Timeouts, connection errors, 5xx, 408, 429: worth trying again.
  Retryable,
  /// Other 4xx and malformed requests: the remote will keep rejecting it.
  Terminal,
}

/// Classify a transport result.
pub fn classify(result: &TransportResult<TransportResponse>) -> Disposition {
  match result {
    Ok(response) => classify_status(response.status),
    Err(TransportError::InvalidEndpoint(_)) | Err(TransportError::Encode(_)) => {
      Disposition::Terminal
    }
    Err(_) => Disposition::Retryable,
  }
}

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> Disposition {
  match status {
    200..=299 => Disposition::Success,
    408 | 429 => Disposition::Retryable,
    400..=499 => Disposition::Terminal,
    _ => Disposition::Retryable,
  }
}
