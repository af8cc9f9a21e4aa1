//! Distributed coordination primitives over a shared key-value store.
//!
//! - `ConnectionPool` - Bounded pool of store connections with FIFO waiters
//! - `DistributedLock` - Mutual exclusion with owner tokens and expiry
//! - `LockManager` - Named locks and scoped critical sections
//! - `ServiceRegistry` - Instance registration with heartbeats
//! - `ServiceDiscovery` - Cached lookup of healthy instances
//! - `CoordinationEvents` - Lifecycle events as filtered streams
//!
//! Every primitive reaches the store through a [`ConnectionPool`] built on an
//! injected [`grove_kv::ConnectionFactory`], so the same code runs against
//! Redis or the in-memory store.
//!
//! ## Lock Example
//!
//! ```ignore
//! use grove_coordination::{ConnectionPool, LockManager, CoordinationConfig};
//!
//! let config = CoordinationConfig::load(None)?;
//! let pool = ConnectionPool::new(factory, config.pool.clone())?;
//! let locks = LockManager::new(pool, config.lock.clone())?;
//!
//! let rows = locks
//!     .with_lock("reindex", None, || async { reindex().await })
//!     .await?;
//! ```
//!
//! ## Discovery Example
//!
//! ```ignore
//! use grove_coordination::{ServiceDescriptor, ServiceDiscovery, ServiceRegistry};
//!
//! let registry = ServiceRegistry::new(pool.clone(), config.registry.clone())?;
//! let id = registry.register(ServiceDescriptor::new("api", "1.4.0", "10.0.0.7", 8080)).await?;
//! let _heartbeat = registry.start_heartbeat(id);
//!
//! let discovery = ServiceDiscovery::new(pool, config.discovery.clone())?;
//! if let Some(api) = discovery.get_random_service("api").await? {
//!     connect(api.address()).await?;
//! }
//! ```

pub mod config;
pub mod constants;
mod error;
pub mod events;
mod lock;
mod pool;
pub mod pure;
mod registry;
mod types;

pub use config::ConfigError;
pub use config::CoordinationConfig;
pub use config::DiscoveryConfig;
pub use config::LockConfig;
pub use config::PoolConfig;
pub use config::RegistryConfig;
pub use config::StoreConfig;
pub use error::CoordinationError;
pub use events::CoordinationEvent;
pub use events::CoordinationEvents;
pub use events::EventKind;
pub use events::EventPayload;
pub use events::EvictionReason;
pub use lock::AcquireOptions;
pub use lock::DistributedLock;
pub use lock::LockAttempt;
pub use lock::LockGuard;
pub use lock::LockManager;
pub use lock::LockToken;
pub use pool::ConnectionPool;
pub use pool::PoolStats;
pub use pool::PooledConnection;
pub use registry::HeartbeatHandle;
pub use registry::ServiceDescriptor;
pub use registry::ServiceDiscovery;
pub use registry::ServiceRecord;
pub use registry::ServiceRegistry;
pub use registry::ServiceStatus;
pub use types::now_unix_ms;
