//! Connection pool statistics.

use std::time::Duration;

use serde::Serialize;

use crate::pure;
use crate::types::duration_to_ms;

/// Point-in-time snapshot of a pool's state and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Connections tracked by the pool (idle + active).
    pub total: u32,
    /// Connections currently handed out.
    pub active: u32,
    /// Connections sitting in the available set.
    pub idle: u32,
    /// Callers queued for a connection.
    pub waiting: u32,
    /// Mean wait of successful acquisitions, in milliseconds.
    pub avg_wait_ms: f64,
    /// Longest wait of a successful acquisition, in milliseconds.
    pub max_wait_ms: u64,
    pub total_requests: u64,
    /// Requests that timed out, hit a closed pool, or failed to connect.
    pub failed_requests: u64,
    /// Fraction of requests served; 0.0 before any request.
    pub hit_rate: f64,
    /// Connections evicted since the pool was created.
    pub evicted: u64,
}

/// Running counters kept under the pool's state lock.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) total_requests: u64,
    pub(crate) failed_requests: u64,
    pub(crate) evicted: u64,
    total_wait_ms: u64,
    wait_samples: u64,
    max_wait_ms: u64,
}

impl PoolCounters {
    /// Record the wait of a successful acquisition.
    pub(crate) fn record_wait(&mut self, waited: Duration) {
        let ms = duration_to_ms(waited);
        self.total_wait_ms = self.total_wait_ms.saturating_add(ms);
        self.wait_samples = self.wait_samples.saturating_add(1);
        self.max_wait_ms = self.max_wait_ms.max(ms);
    }

    pub(crate) fn snapshot(&self, active: u32, idle: u32, waiting: u32) -> PoolStats {
        PoolStats {
            total: active.saturating_add(idle),
            active,
            idle,
            waiting,
            avg_wait_ms: pure::average_wait_ms(self.total_wait_ms, self.wait_samples),
            max_wait_ms: self.max_wait_ms,
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            hit_rate: pure::hit_rate(self.total_requests, self.failed_requests),
            evicted: self.evicted,
        }
    }
}
