//! Shared helpers for coordination primitives.

use std::fmt;

use tracing::warn;

/// Current wall-clock time in Unix milliseconds.
///
/// Falls back to 0 if the system clock is before the epoch.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Milliseconds in a duration, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_to_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Log a failed store interaction with the operation and key it targeted.
///
/// Meant for `Result::inspect_err` ahead of `?`.
pub(crate) fn log_failure<E: fmt::Display>(operation: &'static str, key: &str) -> impl FnOnce(&E) {
    move |error| warn!(operation, key, error = %error, "store operation failed")
}
