//! Distributed mutual exclusion on a named resource.
//!
//! A lock is a single store key `lock:{key}` whose value is the owner's
//! token. Acquisition is an atomic set-if-absent with expiry; release and
//! extension are atomic compare-and-delete / compare-and-expire conditioned
//! on the token. The store's expiry is the only authority on a lock's
//! lifetime: if an owner crashes, the key becomes acquirable again no later
//! than `ttl` after acquisition.
//!
//! Contention is not an error. [`DistributedLock::acquire`] returns
//! [`LockAttempt::Contended`] when it gives up, including when the pool
//! stays exhausted past the wait budget; `Err` is reserved for store
//! failures and a closed pool.

mod guard;
mod manager;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub use guard::LockGuard;
use grove_kv::KeyTtl;
use grove_kv::StoreConnection;
pub use manager::LockManager;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::constants::LOCK_KEY_PREFIX;
use crate::error::CoordinationError;
use crate::events;
use crate::events::CoordinationEvents;
use crate::events::EventPayload;
use crate::pool::ConnectionPool;
use crate::pure;
use crate::types::duration_to_ms;
use crate::types::log_failure;

/// Ownership credential for one successful acquisition.
///
/// Whoever holds the token can release or extend that acquisition, so it is
/// deliberately not `Clone` and its `Debug` output hides the secret part.
#[derive(PartialEq, Eq)]
pub struct LockToken {
    value: String,
    owner_len: usize,
}

impl LockToken {
    fn generate(instance_id: &str) -> Self {
        Self {
            value: format!("{instance_id}:{}", Uuid::new_v4()),
            owner_len: instance_id.len(),
        }
    }

    /// The instance id of the manager that issued the token.
    pub fn owner(&self) -> &str {
        &self.value[..self.owner_len]
    }

    /// The full token as stored in the backing store.
    pub fn expose_secret(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({}:<redacted>)", self.owner())
    }
}

/// Outcome of a lock acquisition.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockToken),
    /// Another owner held the lock for the whole retry budget.
    Contended {
        /// Attempts made, including the first.
        attempts: u32,
        waited: Duration,
    },
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAttempt::Acquired(_))
    }

    pub fn into_token(self) -> Option<LockToken> {
        match self {
            LockAttempt::Acquired(token) => Some(token),
            LockAttempt::Contended { .. } => None,
        }
    }
}

/// Per-call acquisition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Lifetime of the lock once acquired.
    pub ttl: Duration,
    /// Give up once this much time has passed.
    pub wait_timeout: Duration,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Retries after the first attempt; 0 means a single attempt.
    pub max_retries: u32,
}

impl AcquireOptions {
    /// Single attempt with the given TTL.
    pub fn once(ttl: Duration) -> Self {
        Self {
            ttl,
            wait_timeout: ttl,
            retry_delay: Duration::ZERO,
            max_retries: 0,
        }
    }

    fn validate(&self) -> Result<(), CoordinationError> {
        if self.ttl.is_zero() {
            return Err(CoordinationError::InvalidArgument {
                message: "lock ttl must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl From<&LockConfig> for AcquireOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: config.default_ttl(),
            wait_timeout: config.wait_timeout(),
            retry_delay: config.retry_delay(),
            max_retries: config.max_retries,
        }
    }
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

/// Handle to one named distributed lock.
///
/// Cheap to clone; clones share the local "held" flag.
#[derive(Clone)]
pub struct DistributedLock {
    pool: ConnectionPool,
    key: String,
    store_key: String,
    defaults: AcquireOptions,
    held: Arc<AtomicBool>,
    events: Option<CoordinationEvents>,
    instance_id: String,
}

impl DistributedLock {
    /// Create a lock handle for `key`. Fails on an empty key; performs no I/O.
    pub fn new(
        pool: ConnectionPool,
        key: impl Into<String>,
        instance_id: impl Into<String>,
        config: &LockConfig,
    ) -> Result<Self, CoordinationError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(CoordinationError::InvalidArgument {
                message: "lock key must not be empty".to_string(),
            });
        }
        config.validate()?;
        Ok(Self {
            pool,
            store_key: format!("{LOCK_KEY_PREFIX}{key}"),
            key,
            defaults: AcquireOptions::from(config),
            held: Arc::new(AtomicBool::new(false)),
            events: None,
            instance_id: instance_id.into(),
        })
    }

    pub(crate) fn with_events(mut self, events: Option<CoordinationEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Options derived from the lock configuration.
    pub fn default_options(&self) -> AcquireOptions {
        self.defaults
    }

    /// Acquire the lock, retrying on a fixed delay.
    ///
    /// Stops after `max_retries` retries or once `wait_timeout` has elapsed,
    /// whichever is first, and then returns [`LockAttempt::Contended`]. Time
    /// spent waiting for a pooled connection counts against `wait_timeout`,
    /// and a pool that stays exhausted is reported as contention.
    pub async fn acquire(&self, options: &AcquireOptions) -> Result<LockAttempt, CoordinationError> {
        options.validate()?;
        let started = Instant::now();
        // `None` when the wait budget is too large to represent: unbounded.
        let deadline = started.checked_add(options.wait_timeout);
        let token = LockToken::generate(&self.instance_id);
        let mut retries_done: u32 = 0;

        loop {
            // The deadline bounds the wait for a connection only. A SET NX
            // in flight always runs to completion.
            let connection = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.pool.acquire()).await,
                None => Ok(self.pool.acquire().await),
            };
            let acquired = match connection {
                Ok(Ok(mut conn)) => conn
                    .set_if_absent(&self.store_key, token.expose_secret(), options.ttl)
                    .await
                    .inspect_err(log_failure("lock_acquire", &self.store_key))?,
                Ok(Err(CoordinationError::PoolTimeout { waited_ms })) => {
                    debug!(key = %self.key, waited_ms, "no pooled connection for lock attempt");
                    return Ok(self.contended(retries_done + 1, started.elapsed()));
                }
                Ok(Err(error)) => {
                    log_failure("lock_acquire", &self.store_key)(&error);
                    return Err(error);
                }
                Err(_) => {
                    debug!(key = %self.key, "wait timeout reached while waiting for a pooled connection");
                    return Ok(self.contended(retries_done + 1, started.elapsed()));
                }
            };
            if acquired {
                self.held.store(true, Ordering::SeqCst);
                debug!(key = %self.key, ttl_ms = duration_to_ms(options.ttl), attempts = retries_done + 1, "lock acquired");
                events::emit(self.events.as_ref(), EventPayload::LockAcquired { key: self.key.clone() });
                return Ok(LockAttempt::Acquired(token));
            }

            let elapsed = started.elapsed();
            match pure::next_lock_retry_delay_ms(
                retries_done,
                options.max_retries,
                duration_to_ms(elapsed),
                duration_to_ms(options.wait_timeout),
                duration_to_ms(options.retry_delay),
            ) {
                Some(delay_ms) => {
                    debug!(key = %self.key, retry = retries_done + 1, delay_ms, "lock held, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    retries_done += 1;
                }
                None => return Ok(self.contended(retries_done + 1, elapsed)),
            }
        }
    }

    fn contended(&self, attempts: u32, waited: Duration) -> LockAttempt {
        debug!(key = %self.key, attempts, waited_ms = duration_to_ms(waited), "lock contended, giving up");
        events::emit(self.events.as_ref(), EventPayload::LockContended {
            key: self.key.clone(),
            attempts,
        });
        LockAttempt::Contended { attempts, waited }
    }

    /// Acquire with the configured defaults.
    pub async fn acquire_default(&self) -> Result<LockAttempt, CoordinationError> {
        self.acquire(&self.defaults).await
    }

    /// Single acquisition attempt.
    pub async fn try_acquire(&self, ttl: Duration) -> Result<LockAttempt, CoordinationError> {
        self.acquire(&AcquireOptions::once(ttl)).await
    }

    /// Release the lock if `token` still owns it.
    ///
    /// Returns `false` without side effects if the lock expired, was never
    /// held by this token, or now belongs to someone else.
    pub async fn release(&self, token: &LockToken) -> Result<bool, CoordinationError> {
        let released = {
            let mut conn = self.pool.acquire().await.inspect_err(log_failure("lock_release", &self.store_key))?;
            conn.compare_and_delete(&self.store_key, token.expose_secret())
                .await
                .inspect_err(log_failure("lock_release", &self.store_key))?
        };
        self.held.store(false, Ordering::SeqCst);
        if released {
            debug!(key = %self.key, "lock released");
            events::emit(self.events.as_ref(), EventPayload::LockReleased { key: self.key.clone() });
        } else {
            debug!(key = %self.key, "lock release skipped: not the current owner");
        }
        Ok(released)
    }

    /// Reset the lock's expiry to `ttl` if `token` still owns it.
    pub async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<bool, CoordinationError> {
        AcquireOptions::once(ttl).validate()?;
        let extended = {
            let mut conn = self.pool.acquire().await.inspect_err(log_failure("lock_extend", &self.store_key))?;
            conn.compare_and_expire(&self.store_key, token.expose_secret(), ttl)
                .await
                .inspect_err(log_failure("lock_extend", &self.store_key))?
        };
        if extended {
            debug!(key = %self.key, ttl_ms = duration_to_ms(ttl), "lock extended");
            events::emit(self.events.as_ref(), EventPayload::LockExtended {
                key: self.key.clone(),
                ttl_ms: duration_to_ms(ttl),
            });
        } else {
            self.held.store(false, Ordering::SeqCst);
            debug!(key = %self.key, "lock extend failed: ownership lapsed");
        }
        Ok(extended)
    }

    /// Whether anyone currently holds the lock, according to the store.
    pub async fn is_locked(&self) -> Result<bool, CoordinationError> {
        let mut conn = self.pool.acquire().await.inspect_err(log_failure("lock_exists", &self.store_key))?;
        Ok(conn.exists(&self.store_key).await.inspect_err(log_failure("lock_exists", &self.store_key))?)
    }

    /// Time until the lock expires, or `None` if it is not held.
    pub async fn remaining_ttl(&self) -> Result<Option<Duration>, CoordinationError> {
        let mut conn = self.pool.acquire().await.inspect_err(log_failure("lock_ttl", &self.store_key))?;
        Ok(match conn.ttl(&self.store_key).await.inspect_err(log_failure("lock_ttl", &self.store_key))? {
            KeyTtl::Missing => None,
            KeyTtl::Persistent => Some(Duration::MAX),
            KeyTtl::Expires(ms) => Some(Duration::from_millis(ms)),
        })
    }

    /// Local best-effort view of whether this handle holds the lock.
    ///
    /// Not authoritative: the lock may have expired in the store.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// An unacquired guard for this lock.
    pub fn guard(&self) -> LockGuard {
        LockGuard::new(self.clone())
    }

    pub(crate) fn store_key(&self) -> &str {
        &self.store_key
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn mark_released(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use grove_kv::InMemoryStore;

    use super::*;
    use crate::config::PoolConfig;

    fn lock(store: &Arc<InMemoryStore>, key: &str) -> DistributedLock {
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default()).unwrap();
        DistributedLock::new(pool, key, "test-instance", &LockConfig::default()).unwrap()
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = LockToken::generate("node-a");
        let debug = format!("{token:?}");
        assert_eq!(debug, "LockToken(node-a:<redacted>)");
        assert!(!debug.contains(&token.expose_secret()[7..]));
        assert_eq!(token.owner(), "node-a");
    }

    #[test]
    fn tokens_are_unique() {
        let a = LockToken::generate("node");
        let b = LockToken::generate("node");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = InMemoryStore::new();
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default()).unwrap();
        let result = DistributedLock::new(pool, " ", "i", &LockConfig::default());
        assert!(matches!(result, Err(CoordinationError::InvalidArgument { .. })));
        assert_eq!(store.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let store = InMemoryStore::new();
        let lock = lock(&store, "resource");

        let token = lock.try_acquire(Duration::from_secs(5)).await.unwrap().into_token().unwrap();
        assert!(lock.is_held());
        assert!(lock.is_locked().await.unwrap());
        let remaining = lock.remaining_ttl().await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(5));

        assert!(lock.release(&token).await.unwrap());
        assert!(!lock.is_held());
        assert!(!lock.is_locked().await.unwrap());
        assert_eq!(lock.remaining_ttl().await.unwrap(), None);

        // Second release is a no-op.
        assert!(!lock.release(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_attempt_reports_contention() {
        let store = InMemoryStore::new();
        let a = lock(&store, "resource");
        let b = lock(&store, "resource");

        let _token = a.try_acquire(Duration::from_secs(5)).await.unwrap().into_token().unwrap();
        match b.try_acquire(Duration::from_secs(5)).await.unwrap() {
            LockAttempt::Contended { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected contention, got {other:?}"),
        }
        assert!(!b.is_held());
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let store = InMemoryStore::new();
        let lock = lock(&store, "resource");
        let result = lock.try_acquire(Duration::ZERO).await;
        assert!(matches!(result, Err(CoordinationError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let store = InMemoryStore::new();
        let lock = lock(&store, "resource");
        store.fail_next_commands(1);
        let result = lock.try_acquire(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CoordinationError::Store { .. })));
    }
}
