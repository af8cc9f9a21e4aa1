//! Error types for coordination primitives.

use grove_kv::StoreError;
use snafu::Snafu;

/// Errors from coordination primitives.
///
/// Lock contention is not represented here: a contended acquisition is an
/// ordinary [`LockAttempt::Contended`](crate::LockAttempt::Contended) value.
/// Only [`LockManager::with_lock`](crate::LockManager::with_lock) turns it into
/// [`CoordinationError::LockNotAcquired`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The backing store rejected a command or the transport failed.
    #[snafu(display("store error: {source}"))]
    Store {
        /// The underlying error.
        source: StoreError,
    },

    /// Caller supplied an invalid argument or configuration.
    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// No pooled connection became available in time.
    #[snafu(display("timed out after {waited_ms}ms waiting for a pooled connection"))]
    PoolTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The pool has been closed.
    #[snafu(display("connection pool is closed"))]
    PoolClosed,

    /// A scoped lock could not be acquired.
    #[snafu(display("failed to acquire lock '{key}': {reason}"))]
    LockNotAcquired {
        /// The lock key.
        key: String,
        /// Why acquisition gave up.
        reason: String,
    },

    /// A stored record could not be parsed.
    #[snafu(display("corrupted record '{key}': {reason}"))]
    CorruptedRecord {
        /// The store key.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        CoordinationError::Store { source }
    }
}
