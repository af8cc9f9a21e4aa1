//! Pure decision functions for coordination primitives.
//!
//! The async components are an imperative shell around these functions.
//! Everything here is deterministic: time is passed in explicitly and all
//! arithmetic saturates, so every function is total.

use crate::events::EvictionReason;

// ============================================================================
// Lock acquisition
// ============================================================================

/// Delay before the next lock acquisition attempt, or `None` to give up.
///
/// Acquisition stops after `max_retries` retries or once `wait_timeout_ms`
/// has elapsed, whichever comes first. The delay is clipped so the next
/// attempt never starts after the wait deadline.
///
/// ```ignore
/// assert_eq!(next_lock_retry_delay_ms(0, 10, 0, 2_000, 100), Some(100));
/// assert_eq!(next_lock_retry_delay_ms(10, 10, 1_000, 2_000, 100), None);
/// ```
#[inline]
pub fn next_lock_retry_delay_ms(
    retries_done: u32,
    max_retries: u32,
    elapsed_ms: u64,
    wait_timeout_ms: u64,
    retry_delay_ms: u64,
) -> Option<u64> {
    if retries_done >= max_retries || elapsed_ms >= wait_timeout_ms {
        return None;
    }
    Some(retry_delay_ms.min(wait_timeout_ms.saturating_sub(elapsed_ms)))
}

// ============================================================================
// Connection pool
// ============================================================================

/// Whether a connection must be evicted instead of reused.
///
/// Errors take precedence over idleness. The error threshold is exclusive:
/// a connection is evicted once its count *exceeds* `max_errors`.
#[inline]
pub fn eviction_reason(error_count: u32, max_errors: u32, idle_ms: u64, idle_timeout_ms: u64) -> Option<EvictionReason> {
    if error_count > max_errors {
        Some(EvictionReason::Errors)
    } else if idle_ms > idle_timeout_ms {
        Some(EvictionReason::Idle)
    } else {
        None
    }
}

/// Fraction of requests that were served, in `[0.0, 1.0]`.
///
/// Returns 0.0 before any request has been made.
#[inline]
pub fn hit_rate(total_requests: u64, failed_requests: u64) -> f64 {
    if total_requests == 0 {
        return 0.0;
    }
    let served = total_requests.saturating_sub(failed_requests);
    served as f64 / total_requests as f64
}

/// Mean of `samples` waits totalling `total_wait_ms`; 0.0 with no samples.
#[inline]
pub fn average_wait_ms(total_wait_ms: u64, samples: u64) -> f64 {
    if samples == 0 {
        return 0.0;
    }
    total_wait_ms as f64 / samples as f64
}

// ============================================================================
// Registry and discovery
// ============================================================================

/// Whether a service record has gone stale.
///
/// A record is stale once strictly more than `ttl_ms` has elapsed since its
/// last heartbeat. Heartbeats from the future (clock skew) count as fresh.
#[inline]
pub fn is_service_stale(last_heartbeat_ms: u64, ttl_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(last_heartbeat_ms) > ttl_ms
}

/// Milliseconds until a record goes stale, 0 if it already has.
#[inline]
pub fn service_remaining_ttl_ms(last_heartbeat_ms: u64, ttl_ms: u64, now_ms: u64) -> u64 {
    last_heartbeat_ms.saturating_add(ttl_ms).saturating_sub(now_ms)
}

/// Whether a cached discovery result is still usable.
#[inline]
pub fn is_cache_fresh(cached_at_ms: u64, cache_ttl_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(cached_at_ms) < cache_ttl_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_stops_at_max_retries() {
        assert_eq!(next_lock_retry_delay_ms(0, 10, 0, 2_000, 100), Some(100));
        assert_eq!(next_lock_retry_delay_ms(9, 10, 900, 2_000, 100), Some(100));
        assert_eq!(next_lock_retry_delay_ms(10, 10, 1_000, 2_000, 100), None);
    }

    #[test]
    fn retry_stops_at_wait_timeout() {
        assert_eq!(next_lock_retry_delay_ms(3, 10, 2_000, 2_000, 100), None);
        // Clipped to the remaining budget.
        assert_eq!(next_lock_retry_delay_ms(3, 10, 1_950, 2_000, 100), Some(50));
    }

    #[test]
    fn zero_retries_means_single_attempt() {
        assert_eq!(next_lock_retry_delay_ms(0, 0, 0, 10_000, 100), None);
    }

    #[test]
    fn eviction_threshold_is_exclusive() {
        assert_eq!(eviction_reason(3, 3, 0, 60_000), None);
        assert_eq!(eviction_reason(4, 3, 0, 60_000), Some(EvictionReason::Errors));
        assert_eq!(eviction_reason(0, 3, 60_001, 60_000), Some(EvictionReason::Idle));
        assert_eq!(eviction_reason(9, 3, 60_001, 60_000), Some(EvictionReason::Errors));
    }

    #[test]
    fn hit_rate_edges() {
        assert_eq!(hit_rate(0, 0), 0.0);
        assert_eq!(hit_rate(4, 1), 0.75);
        assert_eq!(hit_rate(2, 5), 0.0);
    }

    #[test]
    fn staleness_is_strict() {
        assert!(!is_service_stale(1_000, 500, 1_500));
        assert!(is_service_stale(1_000, 500, 1_501));
        assert!(!is_service_stale(2_000, 500, 1_000));
        assert_eq!(service_remaining_ttl_ms(1_000, 500, 1_200), 300);
        assert_eq!(service_remaining_ttl_ms(1_000, 500, 9_000), 0);
    }

    #[test]
    fn cache_freshness() {
        assert!(is_cache_fresh(1_000, 100, 1_099));
        assert!(!is_cache_fresh(1_000, 100, 1_100));
    }
}
