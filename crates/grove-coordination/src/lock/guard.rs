//! Scoped ownership of a distributed lock.

use grove_kv::StoreConnection;
use tracing::debug;

use super::AcquireOptions;
use super::DistributedLock;
use super::LockAttempt;
use super::LockToken;
use crate::error::CoordinationError;

/// Wraps acquire and release of one [`DistributedLock`].
///
/// `release` is idempotent and safe to call whether or not acquisition
/// succeeded. A guard that still holds the lock when dropped releases it in a
/// spawned task; if that fails the lock expires via its TTL.
pub struct LockGuard {
    lock: DistributedLock,
    token: Option<LockToken>,
}

impl LockGuard {
    pub(crate) fn new(lock: DistributedLock) -> Self {
        Self { lock, token: None }
    }

    pub(crate) fn holding(lock: DistributedLock, token: LockToken) -> Self {
        Self {
            lock,
            token: Some(token),
        }
    }

    /// Try to acquire. Returns `true` if this guard now holds the lock.
    ///
    /// Calling this while already holding the lock is a no-op returning `true`.
    pub async fn acquire(&mut self, options: &AcquireOptions) -> Result<bool, CoordinationError> {
        if self.token.is_some() {
            return Ok(true);
        }
        match self.lock.acquire(options).await? {
            LockAttempt::Acquired(token) => {
                self.token = Some(token);
                Ok(true)
            }
            LockAttempt::Contended { .. } => Ok(false),
        }
    }

    /// Release the lock if held. Returns whether the store record was removed.
    pub async fn release(&mut self) -> Result<bool, CoordinationError> {
        match self.token.take() {
            Some(token) => self.lock.release(&token).await,
            None => Ok(false),
        }
    }

    /// Extend the held lock. Returns `false` if not held or ownership lapsed.
    pub async fn extend(&self, ttl: std::time::Duration) -> Result<bool, CoordinationError> {
        match self.token.as_ref() {
            Some(token) => self.lock.extend(token, ttl).await,
            None => Ok(false),
        }
    }

    /// Whether this guard holds a token.
    pub fn is_acquired(&self) -> bool {
        self.token.is_some()
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %self.lock.key(), "no runtime to release lock on drop (will expire via TTL)");
            return;
        };
        self.lock.mark_released();
        let pool = self.lock.pool().clone();
        let key = self.lock.key().to_string();
        let store_key = self.lock.store_key().to_string();

        // Best-effort release; the lock expires via TTL anyway.
        runtime.spawn(async move {
            let result = match pool.acquire().await {
                Ok(mut conn) => conn
                    .compare_and_delete(&store_key, token.expose_secret())
                    .await
                    .map_err(CoordinationError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(released) => debug!(key = %key, released, "lock released on drop"),
                Err(e) => debug!(key = %key, error = %e, "lock release on drop failed (will expire via TTL)"),
            }
        });
    }
}
