//! Error types for queue operations

use std::time::Duration;
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Error returned by a task handler. Any error type works.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Connection to the log backend failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Startup gave up after exhausting its connection attempts
    #[error("Connection failed after {attempts} attempts: {reason}")]
    ConnectRetriesExhausted { attempts: u32, reason: String },

    /// Payload could not be turned into a flat field record
    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    /// Field record could not be parsed into the expected payload type
    #[error("Decode failed for entry {id}: {reason}")]
    DecodeFailed { id: String, reason: String },

    /// Caller-supplied handler reported a failure
    #[error("Handler failed for entry {id}: {reason}")]
    HandlerFailed { id: String, reason: String },

    /// No new entry or no matching reply arrived within the window
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Queue descriptor string is malformed
    #[error("Invalid queue descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Entry identifier is not of the form `<ms>-<seq>`
    #[error("Invalid entry id: {0}")]
    InvalidEntryId(String),

    /// Backend-specific error (Redis, etc.)
    #[error("Backend error: {0}")]
    BackendError(String),
}

impl QueueError {
    /// Timeouts are ordinary outcomes: an idle block window or a reply that
    /// did not show up in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::Timeout(_))
    }

    /// Only an unrecoverable startup connection failure is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::ConnectRetriesExhausted { .. })
    }

    pub(crate) fn decode(id: impl ToString, reason: impl ToString) -> Self {
        QueueError::DecodeFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            QueueError::ConnectionFailed(err.to_string())
        } else {
            QueueError::BackendError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::EncodeFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_fatal() {
        let err = QueueError::Timeout(Duration::from_millis(50));
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_exhausted_retries_is_fatal() {
        let err = QueueError::ConnectRetriesExhausted {
            attempts: 3,
            reason: "refused".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_decode_error_message() {
        let err = QueueError::decode("1-0", "missing field `image`");
        assert!(err.to_string().contains("1-0"));
        assert!(err.to_string().contains("image"));
    }
}
