//! Shared fixtures for grove-coordination integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use grove_coordination::ConnectionPool;
use grove_coordination::CoordinationEvents;
use grove_coordination::LockConfig;
use grove_coordination::LockManager;
use grove_coordination::PoolConfig;
use grove_kv::InMemoryStore;

static TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn pool(store: &Arc<InMemoryStore>, pool_size: u32) -> ConnectionPool {
    ConnectionPool::new(store.clone(), PoolConfig {
        pool_size,
        ..PoolConfig::default()
    })
    .expect("valid pool config")
}

/// A lock manager with its own instance id, as a separate process would have.
pub fn manager(store: &Arc<InMemoryStore>, instance_id: &str, config: LockConfig) -> LockManager {
    LockManager::with_instance_id(pool(store, 4), config, instance_id).expect("valid lock config")
}

pub fn manager_with_events(store: &Arc<InMemoryStore>, instance_id: &str, events: CoordinationEvents) -> LockManager {
    manager(store, instance_id, LockConfig::default()).with_events(events)
}
