//! Default values and fixed bounds for coordination primitives.
//!
//! Every default here is also the default of the matching configuration
//! field, so a zero-config deployment behaves exactly as documented below.

// ============================================================================
// Distributed lock
// ============================================================================

/// Default lock time-to-live (30 seconds).
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

/// Fixed delay between lock acquisition attempts.
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 100;

/// Retries after the first acquisition attempt.
pub const DEFAULT_LOCK_MAX_RETRIES: u32 = 10;

/// Upper bound on the total time spent acquiring a lock.
pub const DEFAULT_LOCK_WAIT_TIMEOUT_MS: u64 = 10_000;

/// Store key prefix for lock records.
pub const LOCK_KEY_PREFIX: &str = "lock:";

// ============================================================================
// Connection pool
// ============================================================================

/// Default number of connections held by a pool.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Hard upper bound on pool size.
pub const MAX_POOL_SIZE: u32 = 1_024;

/// Timeout for opening one connection.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Connections unused for longer than this are evicted.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Maximum time a caller waits in the pool queue.
pub const DEFAULT_MAX_WAIT_MS: u64 = 5_000;

/// Connect attempts before giving up on creating a connection.
pub const DEFAULT_CONNECT_RETRY_ATTEMPTS: u32 = 3;

pub const DEFAULT_CONNECT_RETRY_DELAY_MS: u64 = 100;

/// A connection whose error count exceeds this is evicted on release.
pub const DEFAULT_MAX_CONNECTION_ERRORS: u32 = 3;

// ============================================================================
// Service registry and discovery
// ============================================================================

/// Interval between heartbeats sent by a [`HeartbeatHandle`](crate::HeartbeatHandle).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// A service record without a heartbeat for this long is stale.
pub const DEFAULT_SERVICE_TTL_MS: u64 = 30_000;

/// Lifetime of a cached discovery result.
pub const DEFAULT_DISCOVERY_CACHE_TTL_MS: u64 = 5_000;

/// Store key prefix for service instance records.
pub const SERVICE_INSTANCE_PREFIX: &str = "service:instance:";

/// Store key prefix for per-name membership sets.
pub const SERVICE_MEMBERS_PREFIX: &str = "service:members:";

// ============================================================================
// Events
// ============================================================================

/// Capacity of the coordination event channel. Lagging subscribers lose events.
pub const EVENT_BUFFER_SIZE: usize = 256;

const _: () = assert!(DEFAULT_POOL_SIZE > 0);
const _: () = assert!(DEFAULT_POOL_SIZE <= MAX_POOL_SIZE);
const _: () = assert!(DEFAULT_LOCK_RETRY_DELAY_MS < DEFAULT_LOCK_WAIT_TIMEOUT_MS);
const _: () = assert!(DEFAULT_HEARTBEAT_INTERVAL_MS < DEFAULT_SERVICE_TTL_MS);
const _: () = assert!(DEFAULT_DISCOVERY_CACHE_TTL_MS < DEFAULT_SERVICE_TTL_MS);
const _: () = assert!(EVENT_BUFFER_SIZE > 0);
