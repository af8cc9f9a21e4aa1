//! Bounded connection pool for the backing store.
//!
//! # Architecture
//!
//! - `ConnectionPool`: cheap-to-clone handle around shared pool state
//! - `PooledConnection`: RAII handle, returned to the pool on drop
//! - Waiting queue: callers beyond capacity queue strictly FIFO and are
//!   handed a connection directly on release
//! - Eviction: connections with too many errors, or idle past the timeout,
//!   are closed instead of being reused
//!
//! Every connection is tracked in exactly one of the available set or the
//! in-use set, and `available + in_use + creating` never exceeds the pool
//! size. A queued caller is removed from the queue exactly once: either by a
//! grant or by its own timeout/cancellation.

mod connection;
mod stats;


use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub use connection::PooledConnection;
use connection::ConnectionMeta;
use connection::IdleConnection;
use grove_kv::ConnectionFactory;
use grove_kv::StoreConnection;
use grove_kv::StoreError;
use parking_lot::Mutex;
pub use stats::PoolStats;
use stats::PoolCounters;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::PoolConfig;
use crate::error::CoordinationError;
use crate::events::CoordinationEvents;
use crate::events::EventPayload;
use crate::events::EvictionReason;
use crate::pure;
use crate::types::duration_to_ms;

/// Bounded pool of store connections with a FIFO waiting queue.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    events: Option<CoordinationEvents>,
    next_connection_id: AtomicU64,
    state: Mutex<PoolState>,
}

/// What an `acquire` call does after leaving the state lock.
enum NextStep {
    Create,
    Wait(u64, oneshot::Receiver<IdleConnection>),
}

struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<IdleConnection>,
}

#[derive(Default)]
struct PoolState {
    available: VecDeque<IdleConnection>,
    in_use: HashSet<u64>,
    /// Connections being opened; they count against capacity.
    creating: u32,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
    counters: PoolCounters,
}

impl PoolState {
    fn reserved(&self) -> u32 {
        let tracked = self.available.len().saturating_add(self.in_use.len());
        u32::try_from(tracked).unwrap_or(u32::MAX).saturating_add(self.creating)
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

impl ConnectionPool {
    /// Create a pool. Validates `config` without performing any I/O.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Result<Self, CoordinationError> {
        Self::build(factory, config, None)
    }

    /// Create a pool that reports evictions to `events`.
    pub fn with_events(
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
        events: CoordinationEvents,
    ) -> Result<Self, CoordinationError> {
        Self::build(factory, config, Some(events))
    }

    fn build(
        factory: Arc<dyn ConnectionFactory>,
        config: PoolConfig,
        events: Option<CoordinationEvents>,
    ) -> Result<Self, CoordinationError> {
        config.validate()?;
        info!(
            store = %factory.describe(),
            pool_size = config.pool_size,
            "connection pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                events,
                next_connection_id: AtomicU64::new(1),
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Eagerly open connections until the pool holds `pool_size` of them.
    pub async fn initialize(&self) -> Result<(), CoordinationError> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(CoordinationError::PoolClosed);
                }
                if state.reserved() >= self.inner.config.pool_size {
                    break;
                }
                state.creating += 1;
            }
            let mut slot = CreateSlot::new(&self.inner);
            let idle = self.inner.create_connection().await?;
            slot.disarm();
            let mut state = self.inner.state.lock();
            state.creating -= 1;
            if state.closed {
                spawn_close(idle.conn);
                return Err(CoordinationError::PoolClosed);
            }
            self.inner.hand_off(&mut state, idle);
        }
        debug!(pool_size = self.inner.config.pool_size, "connection pool initialized");
        Ok(())
    }

    /// Check out a connection.
    ///
    /// Reuses an available connection, opens a new one while below capacity,
    /// or queues until a connection is released. Fails with
    /// [`CoordinationError::PoolTimeout`] if nothing is available within
    /// `max_wait`, and with [`CoordinationError::PoolClosed`] after `close`.
    pub async fn acquire(&self) -> Result<PooledConnection, CoordinationError> {
        let started = Instant::now();
        let next = {
            let mut state = self.inner.state.lock();
            state.counters.total_requests += 1;
            if state.closed {
                state.counters.failed_requests += 1;
                return Err(CoordinationError::PoolClosed);
            }
            self.inner.evict_idle(&mut state);
            if let Some(idle) = state.available.pop_back() {
                state.in_use.insert(idle.meta.id);
                state.counters.record_wait(started.elapsed());
                return Ok(self.inner.checkout(idle));
            }
            if state.reserved() < self.inner.config.pool_size {
                state.creating += 1;
                NextStep::Create
            } else {
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    id,
                    enqueued_at: started,
                    tx,
                });
                debug!(waiter_id = id, waiting = state.waiters.len(), "pool exhausted, queueing request");
                NextStep::Wait(id, rx)
            }
        };

        match next {
            NextStep::Wait(id, rx) => self.wait_for_grant(id, rx, started).await,
            NextStep::Create => self.create_for_caller(started).await,
        }
    }

    /// Return a connection to the pool. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close the pool.
    ///
    /// Queued callers fail with `PoolClosed`, available connections are
    /// closed, and connections still checked out are closed when returned.
    pub async fn close(&self) {
        let (available, rejected) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let rejected = state.waiters.len();
            // Dropping the senders wakes every waiter with a closed channel.
            state.waiters.clear();
            (std::mem::take(&mut state.available), rejected)
        };
        let closed = available.len();
        for mut idle in available {
            if let Err(e) = idle.conn.close().await {
                debug!(connection_id = idle.meta.id, error = %e, "error closing pooled connection");
            }
        }
        info!(closed, rejected_waiters = rejected, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        state.counters.snapshot(
            u32::try_from(state.in_use.len()).unwrap_or(u32::MAX),
            u32::try_from(state.available.len()).unwrap_or(u32::MAX),
            u32::try_from(state.waiters.len()).unwrap_or(u32::MAX),
        )
    }

    async fn create_for_caller(&self, started: Instant) -> Result<PooledConnection, CoordinationError> {
        let mut slot = CreateSlot::new(&self.inner);
        let result = self.inner.create_connection().await;
        slot.disarm();

        let mut state = self.inner.state.lock();
        state.creating -= 1;
        match result {
            Ok(idle) if state.closed => {
                state.counters.failed_requests += 1;
                spawn_close(idle.conn);
                Err(CoordinationError::PoolClosed)
            }
            Ok(idle) => {
                state.in_use.insert(idle.meta.id);
                state.counters.record_wait(started.elapsed());
                Ok(self.inner.checkout(idle))
            }
            Err(e) => {
                state.counters.failed_requests += 1;
                self.inner.maybe_replenish(&mut state, false);
                Err(e)
            }
        }
    }

    async fn wait_for_grant(
        &self,
        waiter_id: u64,
        rx: oneshot::Receiver<IdleConnection>,
        started: Instant,
    ) -> Result<PooledConnection, CoordinationError> {
        let mut guard = WaiterGuard {
            pool: Arc::clone(&self.inner),
            waiter_id,
            rx,
            finished: false,
        };
        let max_wait = self.inner.config.max_wait();
        let outcome = tokio::time::timeout(max_wait, &mut guard.rx).await;
        guard.finished = true;

        match outcome {
            Ok(Ok(idle)) => Ok(self.inner.checkout(idle)),
            Ok(Err(_)) => {
                self.inner.state.lock().counters.failed_requests += 1;
                Err(CoordinationError::PoolClosed)
            }
            Err(_) => {
                let mut state = self.inner.state.lock();
                if state.remove_waiter(waiter_id) {
                    state.counters.failed_requests += 1;
                    let waited_ms = duration_to_ms(started.elapsed());
                    debug!(waiter_id, waited_ms, "pool acquire timed out");
                    return Err(CoordinationError::PoolTimeout { waited_ms });
                }
                // Granted between the timer firing and taking the lock.
                match guard.rx.try_recv() {
                    Ok(idle) => {
                        drop(state);
                        Ok(self.inner.checkout(idle))
                    }
                    Err(_) => {
                        state.counters.failed_requests += 1;
                        Err(CoordinationError::PoolClosed)
                    }
                }
            }
        }
    }
}

impl PoolInner {
    fn checkout(self: &Arc<Self>, idle: IdleConnection) -> PooledConnection {
        PooledConnection::new(idle, Arc::downgrade(self))
    }

    /// Open a connection, retrying with a fixed delay.
    async fn create_connection(&self) -> Result<IdleConnection, CoordinationError> {
        let attempts = self.config.retry_attempts.max(1);
        let connect_timeout = self.config.connect_timeout();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let error = match tokio::time::timeout(connect_timeout, self.factory.connect()).await {
                Ok(Ok(conn)) => {
                    let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    debug!(connection_id = id, attempt, "pooled connection opened");
                    return Ok(IdleConnection {
                        meta: ConnectionMeta::new(id),
                        conn,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout {
                    duration_ms: self.config.connect_timeout_ms,
                },
            };
            warn!(
                store = %self.factory.describe(),
                attempt,
                attempts,
                error = %error,
                "failed to open store connection"
            );
            last_error = Some(error);
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        Err(last_error
            .unwrap_or(StoreError::ConnectionFailed {
                reason: "no connection attempts made".to_string(),
            })
            .into())
    }

    /// Give a connection to the longest-waiting caller, or make it available.
    fn hand_off(&self, state: &mut PoolState, mut idle: IdleConnection) {
        while let Some(waiter) = state.waiters.pop_front() {
            let id = idle.meta.id;
            state.in_use.insert(id);
            match waiter.tx.send(idle) {
                Ok(()) => {
                    state.counters.record_wait(waiter.enqueued_at.elapsed());
                    debug!(connection_id = id, waiter_id = waiter.id, "connection handed to waiter");
                    return;
                }
                Err(returned) => {
                    // Receiver gone; try the next waiter.
                    state.in_use.remove(&id);
                    idle = returned;
                }
            }
        }
        state.available.push_back(idle);
    }

    /// Called when a `PooledConnection` is dropped.
    pub(crate) fn return_connection(self: &Arc<Self>, mut idle: IdleConnection) {
        let mut state = self.state.lock();
        state.in_use.remove(&idle.meta.id);

        if state.closed {
            drop(state);
            spawn_close(idle.conn);
            return;
        }
        if idle.meta.discarded {
            debug!(connection_id = idle.meta.id, "discarding closed pooled connection");
            self.maybe_replenish(&mut state, false);
            return;
        }

        let now = Instant::now();
        let idle_ms = duration_to_ms(now.saturating_duration_since(idle.meta.last_used_at));
        if let Some(reason) = pure::eviction_reason(
            idle.meta.error_count,
            self.config.max_connection_errors,
            idle_ms,
            self.config.idle_timeout_ms,
        ) {
            self.evict(&mut state, idle, reason);
            self.maybe_replenish(&mut state, reason == EvictionReason::Errors);
            return;
        }

        idle.meta.last_used_at = now;
        self.hand_off(&mut state, idle);
    }

    /// Drop available connections that sat idle past the timeout.
    fn evict_idle(&self, state: &mut PoolState) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut index = 0;
        while index < state.available.len() {
            let expired = state
                .available
                .get(index)
                .is_some_and(|c| now.saturating_duration_since(c.meta.last_used_at) > idle_timeout);
            if expired {
                if let Some(idle) = state.available.remove(index) {
                    self.evict(state, idle, EvictionReason::Idle);
                }
            } else {
                index += 1;
            }
        }
    }

    fn evict(&self, state: &mut PoolState, idle: IdleConnection, reason: EvictionReason) {
        state.counters.evicted += 1;
        let age_ms = duration_to_ms(idle.meta.created_at.elapsed());
        match reason {
            EvictionReason::Errors => warn!(
                connection_id = idle.meta.id,
                error_count = idle.meta.error_count,
                age_ms,
                "evicting pooled connection after repeated errors"
            ),
            EvictionReason::Idle => debug!(connection_id = idle.meta.id, age_ms, "evicting idle pooled connection"),
        }
        crate::events::emit(self.events.as_ref(), EventPayload::ConnectionEvicted {
            connection_id: idle.meta.id,
            reason,
        });
        spawn_close(idle.conn);
    }

    /// Open a replacement connection in the background when capacity was freed.
    ///
    /// Replaces when callers are queued, or after an error eviction if
    /// `replenish_evicted` is set.
    fn maybe_replenish(self: &Arc<Self>, state: &mut PoolState, after_error_eviction: bool) {
        if state.closed || state.reserved() >= self.config.pool_size {
            return;
        }
        let wanted = !state.waiters.is_empty() || (after_error_eviction && self.config.replenish_evicted);
        if !wanted {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        state.creating += 1;
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            let result = inner.create_connection().await;
            let mut state = inner.state.lock();
            state.creating -= 1;
            match result {
                Ok(idle) if state.closed => spawn_close(idle.conn),
                Ok(idle) => {
                    debug!(connection_id = idle.meta.id, "replacement connection opened");
                    inner.hand_off(&mut state, idle);
                }
                Err(e) => warn!(error = %e, "failed to open replacement connection"),
            }
        });
    }
}

/// Releases a reserved creation slot if connection creation is abandoned.
struct CreateSlot<'a> {
    pool: &'a Arc<PoolInner>,
    armed: bool,
}

impl<'a> CreateSlot<'a> {
    fn new(pool: &'a Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CreateSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.creating = state.creating.saturating_sub(1);
            self.pool.maybe_replenish(&mut state, false);
        }
    }
}

/// Removes a queued waiter if its `acquire` future is dropped.
struct WaiterGuard {
    pool: Arc<PoolInner>,
    waiter_id: u64,
    rx: oneshot::Receiver<IdleConnection>,
    finished: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.pool.state.lock();
        if state.remove_waiter(self.waiter_id) {
            state.counters.failed_requests += 1;
            debug!(waiter_id = self.waiter_id, "cancelled pool acquire removed from queue");
            return;
        }
        drop(state);
        // Already granted: put the connection back.
        if let Ok(idle) = self.rx.try_recv() {
            self.pool.return_connection(idle);
        }
    }
}

/// Close a connection without blocking the caller.
pub(crate) fn spawn_close(mut conn: Box<dyn StoreConnection>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "error closing store connection");
            }
        });
    }
}
