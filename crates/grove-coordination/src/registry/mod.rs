//! Service registry and discovery.
//!
//! Each instance is a hash at `service:instance:{instance_id}` holding its
//! [`ServiceRecord`] fields; each service name has a membership set at
//! `service:members:{name}` listing its instance ids. Liveness is a
//! heartbeat timestamp compared against the record's TTL at query time, so
//! a crashed instance drops out of healthy results without any sweeper.

mod discovery;
mod heartbeat;
mod types;

pub use discovery::ServiceDiscovery;
use grove_kv::StoreConnection;
pub use heartbeat::HeartbeatHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
pub use types::ServiceDescriptor;
pub use types::ServiceRecord;
pub use types::ServiceStatus;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::constants::SERVICE_INSTANCE_PREFIX;
use crate::constants::SERVICE_MEMBERS_PREFIX;
use crate::error::CoordinationError;
use crate::events;
use crate::events::CoordinationEvents;
use crate::events::EventPayload;
use crate::pool::ConnectionPool;
use crate::types::duration_to_ms;
use crate::types::log_failure;
use crate::types::now_unix_ms;

pub(crate) fn instance_key(instance_id: &str) -> String {
    format!("{SERVICE_INSTANCE_PREFIX}{instance_id}")
}

pub(crate) fn members_key(name: &str) -> String {
    format!("{SERVICE_MEMBERS_PREFIX}{name}")
}

/// Registers service instances and keeps their heartbeats current.
#[derive(Clone)]
pub struct ServiceRegistry {
    pool: ConnectionPool,
    config: RegistryConfig,
    events: Option<CoordinationEvents>,
}

impl ServiceRegistry {
    /// Create a registry. Validates `config`.
    pub fn new(pool: ConnectionPool, config: RegistryConfig) -> Result<Self, CoordinationError> {
        config.validate()?;
        Ok(Self {
            pool,
            config,
            events: None,
        })
    }

    /// Report registrations and deregistrations to `events`.
    pub fn with_events(mut self, events: CoordinationEvents) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an instance and return its generated instance id.
    ///
    /// The record starts `Healthy` with `last_heartbeat_ms` set to now. If
    /// the membership write fails the record is removed again, so a failed
    /// registration leaves nothing discoverable behind.
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<String, CoordinationError> {
        descriptor.validate()?;
        let now = now_unix_ms();
        let instance_id = format!("{}-{}", descriptor.name, Uuid::new_v4());
        let record = ServiceRecord {
            instance_id: instance_id.clone(),
            name: descriptor.name,
            version: descriptor.version,
            host: descriptor.host,
            port: descriptor.port,
            status: ServiceStatus::Healthy,
            registered_at_ms: now,
            last_heartbeat_ms: now,
            ttl_ms: duration_to_ms(self.config.service_ttl()),
        };
        let key = instance_key(&instance_id);

        let mut conn = self.pool.acquire().await.inspect_err(log_failure("register", &key))?;
        conn.hash_set(&key, record.to_fields()).await.inspect_err(log_failure("register", &key))?;
        if let Err(error) = conn.set_add(&members_key(&record.name), &instance_id).await {
            warn!(
                key = %key,
                service = %record.name,
                instance_id = %instance_id,
                error = %error,
                "membership write failed, removing service record"
            );
            if let Err(cleanup) = conn.delete(&key).await {
                warn!(key = %key, error = %cleanup, "orphaned service record left in store");
            }
            return Err(error.into());
        }

        info!(
            service = %record.name,
            instance_id = %instance_id,
            address = %record.address(),
            ttl_ms = record.ttl_ms,
            "service registered"
        );
        events::emit(self.events.as_ref(), EventPayload::ServiceRegistered {
            name: record.name,
            instance_id: instance_id.clone(),
        });
        Ok(instance_id)
    }

    /// Refresh the heartbeat timestamp and TTL of a registered instance.
    ///
    /// Returns `false` if the instance is not registered. The refresh is a
    /// single conditional write, so a heartbeat racing a deregister never
    /// recreates the record. The stored status is left as is, so a draining
    /// instance stays draining.
    pub async fn heartbeat(&self, instance_id: &str) -> Result<bool, CoordinationError> {
        let key = instance_key(instance_id);
        let mut conn = self.pool.acquire().await.inspect_err(log_failure("heartbeat", &key))?;
        let refreshed = conn
            .hash_set_if_exists(&key, vec![
                ("last_heartbeat_ms".to_string(), now_unix_ms().to_string()),
                ("ttl_ms".to_string(), duration_to_ms(self.config.service_ttl()).to_string()),
            ])
            .await
            .inspect_err(log_failure("heartbeat", &key))?;
        if !refreshed {
            debug!(instance_id, "heartbeat for unknown instance");
        }
        Ok(refreshed)
    }

    /// Remove an instance and its membership entry.
    ///
    /// Returns `false` if the instance was not registered.
    pub async fn deregister(&self, instance_id: &str) -> Result<bool, CoordinationError> {
        let key = instance_key(instance_id);
        let mut conn = self.pool.acquire().await.inspect_err(log_failure("deregister", &key))?;
        let fields = conn.hash_get_all(&key).await.inspect_err(log_failure("deregister", &key))?;
        if fields.is_empty() {
            return Ok(false);
        }
        conn.delete(&key).await.inspect_err(log_failure("deregister", &key))?;

        let Some(name) = fields.get("name") else {
            debug!(instance_id, "deregistered record had no service name");
            return Ok(true);
        };
        let members = members_key(name);
        conn.set_remove(&members, instance_id)
            .await
            .inspect_err(log_failure("deregister", &members))?;

        info!(service = %name, instance_id, "service deregistered");
        events::emit(self.events.as_ref(), EventPayload::ServiceDeregistered {
            name: name.clone(),
            instance_id: instance_id.to_string(),
        });
        Ok(true)
    }

    /// Set the stored status of an instance. `Stale` is derived and cannot be set.
    ///
    /// Returns `false` if the instance is not registered.
    pub async fn update_status(&self, instance_id: &str, status: ServiceStatus) -> Result<bool, CoordinationError> {
        if status == ServiceStatus::Stale {
            return Err(CoordinationError::InvalidArgument {
                message: "stale is derived from heartbeats and cannot be set".to_string(),
            });
        }
        let key = instance_key(instance_id);
        let mut conn = self.pool.acquire().await.inspect_err(log_failure("update_status", &key))?;
        let updated = conn
            .hash_set_if_exists(&key, vec![("status".to_string(), status.as_str().to_string())])
            .await
            .inspect_err(log_failure("update_status", &key))?;
        if updated {
            info!(instance_id, %status, "service status updated");
        }
        Ok(updated)
    }

    /// Read one instance record.
    pub async fn get_service(&self, instance_id: &str) -> Result<Option<ServiceRecord>, CoordinationError> {
        let key = instance_key(instance_id);
        let mut conn = self.pool.acquire().await.inspect_err(log_failure("get_service", &key))?;
        let fields = conn.hash_get_all(&key).await.inspect_err(log_failure("get_service", &key))?;
        if fields.is_empty() {
            return Ok(None);
        }
        ServiceRecord::from_fields(&key, &fields).map(Some)
    }

    /// Names of all services with at least one registered instance.
    pub async fn list_services(&self) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .inspect_err(log_failure("list_services", SERVICE_MEMBERS_PREFIX))?;
        let keys = conn
            .scan_prefix(SERVICE_MEMBERS_PREFIX)
            .await
            .inspect_err(log_failure("list_services", SERVICE_MEMBERS_PREFIX))?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(SERVICE_MEMBERS_PREFIX))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Heartbeat `instance_id` every `heartbeat_interval` in the background.
    ///
    /// The task stops when the handle is stopped or dropped, or when the
    /// instance is found to be deregistered.
    pub fn start_heartbeat(&self, instance_id: impl Into<String>) -> HeartbeatHandle {
        HeartbeatHandle::spawn(self.clone(), instance_id.into(), self.config.heartbeat_interval())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use grove_kv::Command;
    use grove_kv::ConnectionFactory;
    use grove_kv::InMemoryStore;
    use grove_kv::Reply;
    use grove_kv::StoreError;

    use super::*;
    use crate::config::PoolConfig;
    use crate::events::EventKind;

    fn registry(store: &Arc<InMemoryStore>) -> ServiceRegistry {
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default()).unwrap();
        ServiceRegistry::new(pool, RegistryConfig::default()).unwrap()
    }

    /// Another process's action that lands just before a command.
    #[derive(Clone, Copy)]
    enum Interleave {
        /// Deregister the instance right before its conditional heartbeat write.
        DeregisterBeforeRefresh,
        /// Drop the connection while the membership entry is being written.
        FailMembershipWrite,
    }

    struct InterleavingStore {
        store: Arc<InMemoryStore>,
        interleave: Interleave,
    }

    struct InterleavingConnection {
        inner: Box<dyn StoreConnection>,
        store: Arc<InMemoryStore>,
        interleave: Interleave,
    }

    #[async_trait]
    impl ConnectionFactory for InterleavingStore {
        async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
            Ok(Box::new(InterleavingConnection {
                inner: self.store.connect().await?,
                store: self.store.clone(),
                interleave: self.interleave,
            }))
        }
    }

    #[async_trait]
    impl StoreConnection for InterleavingConnection {
        async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
            match (self.interleave, &command) {
                (Interleave::DeregisterBeforeRefresh, Command::HashSetIfExists { key, .. }) => {
                    let mut other = self.store.connect().await?;
                    let fields = other.hash_get_all(key).await?;
                    other.delete(key).await?;
                    if let (Some(name), Some(id)) = (fields.get("name"), fields.get("instance_id")) {
                        other.set_remove(&members_key(name), id).await?;
                    }
                }
                (Interleave::FailMembershipWrite, Command::SetAdd { .. }) => {
                    return Err(StoreError::CommandFailed {
                        command: command.name().to_string(),
                        reason: "connection reset by peer".to_string(),
                    });
                }
                _ => {}
            }
            self.inner.execute(command).await
        }

        async fn close(&mut self) -> Result<(), StoreError> {
            self.inner.close().await
        }
    }

    fn interleaving_registry(store: &Arc<InMemoryStore>, interleave: Interleave) -> ServiceRegistry {
        let factory = InterleavingStore {
            store: store.clone(),
            interleave,
        };
        let pool = ConnectionPool::new(Arc::new(factory), PoolConfig::default()).unwrap();
        ServiceRegistry::new(pool, RegistryConfig {
            heartbeat_interval_ms: 20,
            service_ttl_ms: 1_000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_racing_deregister_does_not_resurrect_record() {
        let store = InMemoryStore::new();
        let id = registry(&store)
            .register(ServiceDescriptor::new("gateway", "1.0.0", "10.0.0.5", 8080))
            .await
            .unwrap();
        assert_eq!(store.key_count(), 2);

        let racing = interleaving_registry(&store, Interleave::DeregisterBeforeRefresh);
        assert!(!racing.heartbeat(&id).await.unwrap());
        assert!(!racing.heartbeat(&id).await.unwrap());
        assert!(racing.get_service(&id).await.unwrap().is_none());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_task_stops_when_deregistered_mid_refresh() {
        let store = InMemoryStore::new();
        let id = registry(&store)
            .register(ServiceDescriptor::new("gateway", "1.0.0", "10.0.0.5", 8080))
            .await
            .unwrap();

        let racing = interleaving_registry(&store, Interleave::DeregisterBeforeRefresh);
        let handle = racing.start_heartbeat(id.clone());
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat loop kept running after deregister");
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_membership_write_removes_record() {
        let store = InMemoryStore::new();
        let registry = interleaving_registry(&store, Interleave::FailMembershipWrite);

        let result = registry.register(ServiceDescriptor::new("gateway", "1.0.0", "10.0.0.5", 8080)).await;
        assert!(matches!(result, Err(CoordinationError::Store { .. })));
        assert_eq!(store.key_count(), 0);
        assert!(registry.list_services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_ttl_follows_config() {
        let store = InMemoryStore::new();
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default()).unwrap();
        let config = RegistryConfig {
            heartbeat_interval_ms: 500,
            service_ttl_ms: 2_500,
        };
        let registry = ServiceRegistry::new(pool, config.clone()).unwrap();

        let id = registry.register(ServiceDescriptor::new("worker", "1", "h", 9000)).await.unwrap();
        let record = registry.get_service(&id).await.unwrap().unwrap();
        assert_eq!(record.ttl_ms, duration_to_ms(config.service_ttl()));
        assert_eq!(record.ttl_ms, 2_500);
    }

    #[tokio::test]
    async fn test_register_get_deregister() {
        let store = InMemoryStore::new();
        let events = CoordinationEvents::new();
        let mut registered = events.subscribe(EventKind::ServiceRegistered);
        let mut deregistered = events.subscribe(EventKind::ServiceDeregistered);
        let registry = registry(&store).with_events(events);

        let id = registry
            .register(ServiceDescriptor::new("gateway", "1.0.0", "10.0.0.5", 8080))
            .await
            .unwrap();
        assert!(id.starts_with("gateway-"));

        let record = registry.get_service(&id).await.unwrap().unwrap();
        assert_eq!(record.name, "gateway");
        assert_eq!(record.status, ServiceStatus::Healthy);
        assert_eq!(record.ttl_ms, RegistryConfig::default().service_ttl_ms);
        assert_eq!(record.registered_at_ms, record.last_heartbeat_ms);
        assert_eq!(registry.list_services().await.unwrap(), vec!["gateway".to_string()]);

        assert!(registry.deregister(&id).await.unwrap());
        assert!(registry.get_service(&id).await.unwrap().is_none());
        assert!(!registry.deregister(&id).await.unwrap());
        assert!(registry.list_services().await.unwrap().is_empty());

        let event = registered.next().await.unwrap();
        assert_eq!(event.payload, EventPayload::ServiceRegistered {
            name: "gateway".into(),
            instance_id: id.clone(),
        });
        let event = deregistered.next().await.unwrap();
        assert_eq!(event.payload, EventPayload::ServiceDeregistered {
            name: "gateway".into(),
            instance_id: id,
        });
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_rejected() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        let result = registry.register(ServiceDescriptor::new("gateway", "1", "h", 0)).await;
        assert!(matches!(result, Err(CoordinationError::InvalidArgument { .. })));
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_instance() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        assert!(!registry.heartbeat("ghost").await.unwrap());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_advances_timestamp_and_keeps_status() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        let id = registry.register(ServiceDescriptor::new("worker", "2", "h", 9000)).await.unwrap();
        let before = registry.get_service(&id).await.unwrap().unwrap();

        assert!(registry.update_status(&id, ServiceStatus::Draining).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(registry.heartbeat(&id).await.unwrap());

        let after = registry.get_service(&id).await.unwrap().unwrap();
        assert!(after.last_heartbeat_ms > before.last_heartbeat_ms);
        assert_eq!(after.status, ServiceStatus::Draining);
        assert_eq!(after.registered_at_ms, before.registered_at_ms);
    }

    #[tokio::test]
    async fn test_update_status_rejects_stale() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        let id = registry.register(ServiceDescriptor::new("worker", "2", "h", 9000)).await.unwrap();
        assert!(registry.update_status(&id, ServiceStatus::Stale).await.is_err());
        assert!(!registry.update_status("ghost", ServiceStatus::Healthy).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = InMemoryStore::new();
        let pool = ConnectionPool::new(store.clone(), PoolConfig::default()).unwrap();
        let config = RegistryConfig {
            heartbeat_interval_ms: 5_000,
            service_ttl_ms: 5_000,
        };
        assert!(ServiceRegistry::new(pool, config).is_err());
    }
}
