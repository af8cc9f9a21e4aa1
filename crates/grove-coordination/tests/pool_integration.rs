//! Integration tests for the connection pool used by several primitives at once.

mod common;

use std::time::Duration;

use grove_coordination::ConnectionPool;
use grove_coordination::CoordinationError;
use grove_coordination::LockConfig;
use grove_coordination::LockManager;
use grove_coordination::PoolConfig;
use grove_kv::InMemoryStore;
use grove_kv::StoreConnection;

/// With two slots, a third concurrent acquire resolves only after a release.
#[tokio::test]
async fn test_third_acquire_resolves_after_release() {
    common::init_tracing();
    let store = InMemoryStore::new();
    let pool = common::pool(&store, 2);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();

    let third_pool = pool.clone();
    let third = tokio::spawn(async move {
        let mut conn = third_pool.acquire().await?;
        conn.ping().await?;
        Ok::<u64, CoordinationError>(conn.id())
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!third.is_finished());
    let stats = pool.stats();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.waiting, 1);

    let handed_over = second.id();
    pool.release(second);
    assert_eq!(third.await.unwrap().unwrap(), handed_over);

    drop(first);
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(store.connect_count(), 2);
}

/// A lock manager sharing a size-one pool never deadlocks: connections are
/// only held for the duration of each store command.
#[tokio::test]
async fn test_single_connection_pool_serves_lock_traffic() {
    let store = InMemoryStore::new();
    let pool = ConnectionPool::new(store.clone(), PoolConfig {
        pool_size: 1,
        ..PoolConfig::default()
    })
    .unwrap();
    let manager = LockManager::with_instance_id(pool.clone(), LockConfig::default(), "solo").unwrap();

    let value: Result<u32, CoordinationError> = manager
        .with_lock("a", None, || async {
            // The pool slot is free while the lock is held.
            let mut conn = pool.acquire().await?;
            conn.ping().await?;
            Ok(1)
        })
        .await;
    assert_eq!(value.unwrap(), 1);
    assert_eq!(pool.stats().total, 1);
    assert_eq!(store.connect_count(), 1);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let store = InMemoryStore::new();
    let pool = ConnectionPool::new(store.clone(), PoolConfig {
        pool_size: 1,
        max_wait_ms: 40,
        ..PoolConfig::default()
    })
    .unwrap();

    let _held = pool.acquire().await.unwrap();
    match pool.acquire().await {
        Err(CoordinationError::PoolTimeout { waited_ms }) => assert!(waited_ms >= 40),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("pool should be exhausted"),
    }
    assert_eq!(pool.stats().failed_requests, 1);
}

#[tokio::test]
async fn test_close_drains_idle_connections() {
    let store = InMemoryStore::new();
    let pool = common::pool(&store, 3);
    pool.initialize().await.unwrap();
    assert_eq!(pool.stats().idle, 3);

    pool.close().await;
    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert!(matches!(pool.acquire().await, Err(CoordinationError::PoolClosed)));
}
