//! Pooled connection handle.

use std::sync::Weak;

use async_trait::async_trait;
use grove_kv::Command;
use grove_kv::Reply;
use grove_kv::StoreConnection;
use grove_kv::StoreError;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use super::PoolInner;

/// Local bookkeeping for one pooled connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionMeta {
    pub(crate) id: u64,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) error_count: u32,
    /// Closed by its holder; never returned to the available set.
    pub(crate) discarded: bool,
}

impl ConnectionMeta {
    pub(crate) fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            error_count: 0,
            discarded: false,
        }
    }
}

/// A connection owned by the pool while not handed out.
pub(crate) struct IdleConnection {
    pub(crate) meta: ConnectionMeta,
    pub(crate) conn: Box<dyn StoreConnection>,
}

/// A connection checked out of a [`ConnectionPool`](super::ConnectionPool).
///
/// Implements [`StoreConnection`], so every typed store helper is available
/// on it directly. Failed commands are counted against this connection; once
/// the count exceeds the pool's threshold the connection is evicted when it
/// is returned. Dropping the handle returns it to the pool.
pub struct PooledConnection {
    conn: Option<Box<dyn StoreConnection>>,
    meta: ConnectionMeta,
    pool: Weak<PoolInner>,
}

impl PooledConnection {
    pub(crate) fn new(idle: IdleConnection, pool: Weak<PoolInner>) -> Self {
        Self {
            conn: Some(idle.conn),
            meta: idle.meta,
            pool,
        }
    }

    /// Pool-unique connection identifier.
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Failed commands issued on this connection so far.
    pub fn error_count(&self) -> u32 {
        self.meta.error_count
    }
}

#[async_trait]
impl StoreConnection for PooledConnection {
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        let conn = self.conn.as_mut().ok_or(StoreError::Closed)?;
        let name = command.name();
        let key = command.key().map(str::to_string);
        let result = conn.execute(command).await;
        self.meta.last_used_at = Instant::now();
        if let Err(ref e) = result {
            self.meta.error_count = self.meta.error_count.saturating_add(1);
            // A broken transport is not worth handing out again.
            if e.is_connection_error() {
                self.meta.discarded = true;
            }
            warn!(
                connection_id = self.meta.id,
                command = name,
                key = key.as_deref().unwrap_or(""),
                error_count = self.meta.error_count,
                discarded = self.meta.discarded,
                error = %e,
                "pooled connection command failed"
            );
        }
        result
    }

    /// Close the underlying connection. The pool drops it on return.
    async fn close(&mut self) -> Result<(), StoreError> {
        self.meta.discarded = true;
        match self.conn.as_mut() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let idle = IdleConnection {
            meta: self.meta.clone(),
            conn,
        };
        match self.pool.upgrade() {
            Some(pool) => pool.return_connection(idle),
            None => {
                debug!(connection_id = self.meta.id, "pool dropped, closing returned connection");
                super::spawn_close(idle.conn);
            }
        }
    }
}
