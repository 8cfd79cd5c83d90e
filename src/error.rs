//! Error taxonomy for the sync engine.
//!
//! Every failure that reaches a subscriber is a [`SyncError`]. It is `Clone`
//! because a single failed flight is fanned out to all coalesced subscribers.

use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the registry, mapper and engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// The resource key is not registered. Programmer error, never retried.
  #[error("unknown resource key: {0}")]
  UnknownKey(String),

  /// Network, DNS or timeout failure reported by the transport.
  #[error("transport error: {0}")]
  Transport(String),

  /// The response body could not be decoded.
  #[error("decode error: {0}")]
  Decode(String),

  /// The status-code hook rejected the response.
  #[error("HTTP status {status}: {message}")]
  Status { status: u16, message: String },

  /// An item could not be mapped. Aborts the whole batch.
  #[error("mapping error: {0}")]
  Mapping(String),

  /// Repository or ledger persistence failure.
  #[error("storage error: {0}")]
  Storage(String),

  /// Invalid registry or configuration contents.
  #[error("configuration error: {0}")]
  Config(String),

  /// A bug in a hook or the engine, e.g. a panic inside a flight.
  #[error("internal error: {0}")]
  Internal(String),
}

impl SyncError {
  /// Create a status error from an HTTP status code.
  pub fn status(status: u16) -> Self {
    let message = match status {
      400 => "bad request",
      401 => "unauthorized",
      403 => "forbidden",
      404 => "not found",
      409 => "conflict",
      429 => "too many requests",
      500..=599 => "server error",
      _ => "unexpected status",
    };
    Self::Status {
      status,
      message: message.to_string(),
    }
  }

  /// Wrap a storage-layer report (SQLite, filesystem) into a sync error.
  pub fn storage(report: impl std::fmt::Display) -> Self {
    Self::Storage(report.to_string())
  }
}

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<TransportError> for SyncError {
  fn from(err: TransportError) -> Self {
    SyncError::Transport(err.0)
  }
}

impl From<reqwest::Error> for TransportError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      TransportError(format!("request timed out: {}", err))
    } else if err.is_connect() {
      TransportError(format!("connection failed: {}", err))
    } else {
      TransportError(err.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_error_message() {
    let err = SyncError::status(404);
    assert_eq!(err.to_string(), "HTTP status 404: not found");
  }

  #[test]
  fn test_transport_error_converts() {
    let err: SyncError = TransportError("dns failure".to_string()).into();
    assert_eq!(err, SyncError::Transport("dns failure".to_string()));
  }
}
