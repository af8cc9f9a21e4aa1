//! Lock manager: named locks and scoped critical sections.

use std::future::Future;

use tracing::warn;
use uuid::Uuid;

use super::AcquireOptions;
use super::DistributedLock;
use super::LockAttempt;
use super::LockGuard;
use crate::config::LockConfig;
use crate::error::CoordinationError;
use crate::events::CoordinationEvents;
use crate::pool::ConnectionPool;

/// Issues [`DistributedLock`] handles that share one pool and configuration.
///
/// Each manager has its own instance id, used as the owner prefix of every
/// token it issues. Managers are independent; several can coexist against
/// the same or different stores.
#[derive(Clone)]
pub struct LockManager {
    pool: ConnectionPool,
    config: LockConfig,
    instance_id: String,
    events: Option<CoordinationEvents>,
}

impl LockManager {
    /// Create a manager with a random instance id. Validates `config`.
    pub fn new(pool: ConnectionPool, config: LockConfig) -> Result<Self, CoordinationError> {
        Self::with_instance_id(pool, config, Uuid::new_v4().to_string())
    }

    /// Create a manager with an explicit instance id.
    pub fn with_instance_id(
        pool: ConnectionPool,
        config: LockConfig,
        instance_id: impl Into<String>,
    ) -> Result<Self, CoordinationError> {
        config.validate()?;
        let instance_id = instance_id.into();
        if instance_id.is_empty() {
            return Err(CoordinationError::InvalidArgument {
                message: "instance id must not be empty".to_string(),
            });
        }
        Ok(Self {
            pool,
            config,
            instance_id,
            events: None,
        })
    }

    /// Report lock lifecycle events to `events`.
    pub fn with_events(mut self, events: CoordinationEvents) -> Self {
        self.events = Some(events);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Acquisition options derived from the manager's configuration.
    pub fn default_options(&self) -> AcquireOptions {
        AcquireOptions::from(&self.config)
    }

    /// A lock handle for `key`.
    pub fn lock(&self, key: impl Into<String>) -> Result<DistributedLock, CoordinationError> {
        Ok(DistributedLock::new(self.pool.clone(), key, self.instance_id.clone(), &self.config)?
            .with_events(self.events.clone()))
    }

    /// Run `f` while holding the lock on `key`.
    ///
    /// If the lock cannot be acquired, `f` is never called and
    /// [`CoordinationError::LockNotAcquired`] is returned. Otherwise the lock
    /// is released exactly once after `f` completes, whether it returns
    /// `Ok` or `Err`; `f`'s result is returned unchanged. If `f` panics or
    /// the future is dropped, the guard releases the lock in the background.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, options: Option<AcquireOptions>, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordinationError>,
    {
        let options = options.unwrap_or_else(|| self.default_options());
        let lock = self.lock(key)?;
        let token = match lock.acquire(&options).await? {
            LockAttempt::Acquired(token) => token,
            LockAttempt::Contended { attempts, waited } => {
                return Err(CoordinationError::LockNotAcquired {
                    key: key.to_string(),
                    reason: format!("contended after {attempts} attempts over {}ms", waited.as_millis()),
                }
                .into());
            }
        };
        let mut guard = LockGuard::holding(lock, token);

        let result = f().await;

        if let Err(e) = guard.release().await {
            // The lock expires via TTL; the closure's outcome still stands.
            warn!(key, error = %e, "failed to release lock after critical section");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use grove_kv::InMemoryStore;

    use super::*;
    use crate::config::PoolConfig;

    fn manager(store: &Arc<InMemoryStore>) -> LockManager {
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default()).unwrap();
        LockManager::new(pool, LockConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_lock_handles_share_instance_id() {
        let store = InMemoryStore::new();
        let manager = manager(&store);
        let lock = manager.lock("a").unwrap();
        let token = lock.try_acquire(Duration::from_secs(1)).await.unwrap().into_token().unwrap();
        assert_eq!(token.owner(), manager.instance_id());
        assert!(manager.lock("").is_err());
    }

    #[tokio::test]
    async fn test_with_lock_returns_closure_value_and_releases() {
        let store = InMemoryStore::new();
        let manager = manager(&store);

        let value: Result<u32, CoordinationError> = manager
            .with_lock("job", None, || async {
                Ok(7)
            })
            .await;
        assert_eq!(value.unwrap(), 7);
        assert!(!manager.lock("job").unwrap().is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_skips_closure_when_contended() {
        let store = InMemoryStore::new();
        let manager = manager(&store);
        let holder = manager.lock("busy").unwrap();
        let _token = holder.try_acquire(Duration::from_secs(5)).await.unwrap().into_token().unwrap();

        let calls = AtomicU32::new(0);
        let result: Result<(), CoordinationError> = manager
            .with_lock("busy", Some(AcquireOptions::once(Duration::from_secs(1))), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CoordinationError::LockNotAcquired { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
