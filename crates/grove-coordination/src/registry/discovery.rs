//! Service lookup with a short-lived local cache.

use std::collections::HashMap;

use grove_kv::StoreConnection;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;
use tracing::warn;

use super::ServiceRecord;
use super::instance_key;
use super::members_key;
use crate::config::DiscoveryConfig;
use crate::error::CoordinationError;
use crate::pool::ConnectionPool;
use crate::pure;
use crate::types::log_failure;
use crate::types::now_unix_ms;

struct CacheEntry {
    records: Vec<ServiceRecord>,
    cached_at_ms: u64,
}

/// Finds registered instances of a service.
///
/// Results of [`find_services`](Self::find_services) are cached per service
/// name for `cache_ttl`. Health is evaluated against the current time even
/// for cached records, so a cached instance still drops out of
/// [`find_healthy_services`](Self::find_healthy_services) once its TTL lapses.
pub struct ServiceDiscovery {
    pool: ConnectionPool,
    config: DiscoveryConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ServiceDiscovery {
    /// Create a discovery client. Validates `config`.
    pub fn new(pool: ConnectionPool, config: DiscoveryConfig) -> Result<Self, CoordinationError> {
        config.validate()?;
        Ok(Self {
            pool,
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// All registered instances of `name`, stale ones included.
    ///
    /// Members whose record is missing or unreadable are skipped.
    pub async fn find_services(&self, name: &str, use_cache: bool) -> Result<Vec<ServiceRecord>, CoordinationError> {
        if use_cache && let Some(records) = self.cached(name) {
            return Ok(records);
        }

        let set_key = members_key(name);
        let mut conn = self.pool.acquire().await.inspect_err(log_failure("find_services", &set_key))?;
        let members = conn
            .set_members(&set_key)
            .await
            .inspect_err(log_failure("find_services", &set_key))?;
        let mut records = Vec::with_capacity(members.len());
        for instance_id in members {
            let key = instance_key(&instance_id);
            let fields = conn.hash_get_all(&key).await.inspect_err(log_failure("find_services", &key))?;
            if fields.is_empty() {
                debug!(service = %name, instance_id = %instance_id, "member has no record, skipping");
                continue;
            }
            match ServiceRecord::from_fields(&key, &fields) {
                Ok(record) => records.push(record),
                Err(e) => warn!(service = %name, error = %e, "skipping unreadable service record"),
            }
        }
        drop(conn);

        if use_cache {
            self.cache.lock().insert(name.to_string(), CacheEntry {
                records: records.clone(),
                cached_at_ms: now_unix_ms(),
            });
        }
        Ok(records)
    }

    /// Instances of `name` that are `Healthy` and within their TTL.
    pub async fn find_healthy_services(&self, name: &str) -> Result<Vec<ServiceRecord>, CoordinationError> {
        let now = now_unix_ms();
        let mut records = self.find_services(name, true).await?;
        records.retain(|record| record.is_healthy(now));
        Ok(records)
    }

    /// A uniformly random healthy instance of `name`, if any.
    pub async fn get_random_service(&self, name: &str) -> Result<Option<ServiceRecord>, CoordinationError> {
        let mut healthy = self.find_healthy_services(name).await?;
        if healthy.is_empty() {
            return Ok(None);
        }
        let index = rand::rng().random_range(0..healthy.len());
        Ok(Some(healthy.swap_remove(index)))
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Drop the cached result for `name`.
    pub fn invalidate(&self, name: &str) {
        self.cache.lock().remove(name);
    }

    fn cached(&self, name: &str) -> Option<Vec<ServiceRecord>> {
        let mut cache = self.cache.lock();
        let entry = cache.get(name)?;
        if pure::is_cache_fresh(entry.cached_at_ms, self.config.cache_ttl_ms, now_unix_ms()) {
            return Some(entry.records.clone());
        }
        cache.remove(name);
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use grove_kv::InMemoryStore;

    use super::*;
    use crate::config::PoolConfig;
    use crate::config::RegistryConfig;
    use crate::registry::ServiceDescriptor;
    use crate::registry::ServiceRegistry;
    use crate::registry::ServiceStatus;

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: ServiceRegistry,
        discovery: ServiceDiscovery,
    }

    fn fixture(service_ttl_ms: u64, cache_ttl_ms: u64) -> Fixture {
        let store = InMemoryStore::new();
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default()).unwrap();
        let registry = ServiceRegistry::new(pool.clone(), RegistryConfig {
            heartbeat_interval_ms: service_ttl_ms / 2,
            service_ttl_ms,
        })
        .unwrap();
        let discovery = ServiceDiscovery::new(pool, DiscoveryConfig { cache_ttl_ms }).unwrap();
        Fixture {
            store,
            registry,
            discovery,
        }
    }

    #[tokio::test]
    async fn test_find_services_returns_all_members() {
        let f = fixture(30_000, 5_000);
        let a = f.registry.register(ServiceDescriptor::new("api", "1", "a", 80)).await.unwrap();
        let b = f.registry.register(ServiceDescriptor::new("api", "1", "b", 80)).await.unwrap();
        f.registry.register(ServiceDescriptor::new("db", "1", "c", 5432)).await.unwrap();

        let ids: HashSet<String> = f
            .discovery
            .find_services("api", false)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        assert_eq!(ids, HashSet::from([a, b]));
        assert!(f.discovery.find_services("missing", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_members_are_skipped() {
        let f = fixture(30_000, 5_000);
        let good = f.registry.register(ServiceDescriptor::new("api", "1", "a", 80)).await.unwrap();

        let mut conn = f.discovery.pool.acquire().await.unwrap();
        conn.set_add(&members_key("api"), "dangling").await.unwrap();
        conn.set_add(&members_key("api"), "partial").await.unwrap();
        conn.hash_set(&instance_key("partial"), vec![("name".into(), "api".into())]).await.unwrap();
        drop(conn);

        let records = f.discovery.find_services("api", false).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_id, good);
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let f = fixture(30_000, 60_000);
        f.registry.register(ServiceDescriptor::new("api", "1", "a", 80)).await.unwrap();
        assert_eq!(f.discovery.find_services("api", true).await.unwrap().len(), 1);

        f.registry.register(ServiceDescriptor::new("api", "1", "b", 80)).await.unwrap();
        assert_eq!(f.discovery.find_services("api", true).await.unwrap().len(), 1);
        assert_eq!(f.discovery.find_services("api", false).await.unwrap().len(), 2);

        f.discovery.invalidate("api");
        assert_eq!(f.discovery.find_services("api", true).await.unwrap().len(), 2);

        f.registry.register(ServiceDescriptor::new("api", "1", "c", 80)).await.unwrap();
        f.discovery.clear_cache();
        assert_eq!(f.discovery.find_services("api", true).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let f = fixture(30_000, 30);
        f.registry.register(ServiceDescriptor::new("api", "1", "a", 80)).await.unwrap();
        assert_eq!(f.discovery.find_services("api", true).await.unwrap().len(), 1);

        f.registry.register(ServiceDescriptor::new("api", "1", "b", 80)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(f.discovery.find_services("api", true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_instances_are_not_healthy() {
        let f = fixture(100, 5_000);
        let stale = f.registry.register(ServiceDescriptor::new("api", "1", "a", 80)).await.unwrap();
        let draining = f.registry.register(ServiceDescriptor::new("api", "1", "b", 80)).await.unwrap();
        f.registry.update_status(&draining, ServiceStatus::Draining).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = f.registry.register(ServiceDescriptor::new("api", "1", "c", 80)).await.unwrap();

        let healthy = f.discovery.find_healthy_services("api").await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].instance_id, fresh);

        // The stale record is still registered; expiry is lazy.
        let all = f.discovery.find_services("api", false).await.unwrap();
        assert!(all.iter().any(|r| r.instance_id == stale));
        assert_eq!(all.len(), 3);
        assert!(f.store.key_count() >= 4);
    }

    #[tokio::test]
    async fn test_random_service_picks_healthy_instance() {
        let f = fixture(30_000, 5_000);
        assert!(f.discovery.get_random_service("api").await.unwrap().is_none());

        let a = f.registry.register(ServiceDescriptor::new("api", "1", "a", 80)).await.unwrap();
        let b = f.registry.register(ServiceDescriptor::new("api", "1", "b", 80)).await.unwrap();
        f.discovery.invalidate("api");
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let pick = f.discovery.get_random_service("api").await.unwrap().unwrap();
            seen.insert(pick.instance_id);
        }
        assert!(seen.is_subset(&HashSet::from([a, b])));
        assert!(!seen.is_empty());
    }
}
