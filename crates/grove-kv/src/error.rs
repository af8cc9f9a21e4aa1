//! Store error types.

use thiserror::Error;

/// Errors raised by a backing-store connection.
///
/// All of these are transport or store failures; contention on a
/// conditional command is reported through the reply, never as an error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("failed to connect to store: {reason}")]
    ConnectionFailed { reason: String },
    #[error("store operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("store command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },
    #[error("key '{key}' holds a value of the wrong type for '{command}'")]
    WrongType { key: String, command: String },
    #[error("unexpected reply to '{command}': {reply}")]
    UnexpectedReply { command: String, reply: String },
    #[error("connection is closed")]
    Closed,
}

impl StoreError {
    /// Whether the error indicates the connection itself is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StoreError::ConnectionFailed { .. } | StoreError::Timeout { .. } | StoreError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let err = StoreError::CommandFailed {
            command: "get".into(),
            reason: "broken pipe".into(),
        };
        assert_eq!(err.to_string(), "store command 'get' failed: broken pipe");
    }

    #[test]
    fn connection_error_classification() {
        assert!(StoreError::Closed.is_connection_error());
        assert!(StoreError::Timeout { duration_ms: 10 }.is_connection_error());
        assert!(
            !StoreError::WrongType {
                key: "k".into(),
                command: "get".into()
            }
            .is_connection_error()
        );
    }
}
