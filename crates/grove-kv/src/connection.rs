//! Connection and factory traits for the backing store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::Command;
use crate::command::KeyTtl;
use crate::command::Reply;
use crate::error::StoreError;

/// A single client connection to the backing store.
///
/// Implementors provide [`execute`](StoreConnection::execute) and
/// [`close`](StoreConnection::close); the typed helpers are derived from
/// `execute` and reject replies of the wrong shape.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Execute one command.
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError>;

    /// Close the connection. Further commands fail with [`StoreError::Closed`].
    async fn close(&mut self) -> Result<(), StoreError>;

    /// Atomically create `key` with `value` if absent, expiring after `ttl`.
    ///
    /// Returns `true` if the key was created.
    async fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let command = Command::SetIfAbsent {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: duration_ms(ttl),
        };
        expect_bool(self.execute(command).await?, "set_if_absent")
    }

    /// Atomically delete `key` if its value equals `expected`.
    async fn compare_and_delete(&mut self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let command = Command::CompareAndDelete {
            key: key.to_string(),
            expected: expected.to_string(),
        };
        expect_bool(self.execute(command).await?, "compare_and_delete")
    }

    /// Atomically reset the expiry of `key` if its value equals `expected`.
    async fn compare_and_expire(&mut self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        let command = Command::CompareAndExpire {
            key: key.to_string(),
            expected: expected.to_string(),
            ttl_ms: duration_ms(ttl),
        };
        expect_bool(self.execute(command).await?, "compare_and_expire")
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.execute(Command::Get { key: key.to_string() }).await? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected("get", &other)),
        }
    }

    async fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        expect_bool(self.execute(Command::Delete { key: key.to_string() }).await?, "delete")
    }

    async fn exists(&mut self, key: &str) -> Result<bool, StoreError> {
        expect_bool(self.execute(Command::Exists { key: key.to_string() }).await?, "exists")
    }

    async fn ttl(&mut self, key: &str) -> Result<KeyTtl, StoreError> {
        match self.execute(Command::Ttl { key: key.to_string() }).await? {
            Reply::Ttl(ttl) => Ok(ttl),
            other => Err(unexpected("ttl", &other)),
        }
    }

    async fn hash_set(&mut self, key: &str, fields: Vec<(String, String)>) -> Result<(), StoreError> {
        match self
            .execute(Command::HashSet {
                key: key.to_string(),
                fields,
            })
            .await?
        {
            Reply::Ok => Ok(()),
            other => Err(unexpected("hash_set", &other)),
        }
    }

    /// Atomically set hash fields if `key` exists.
    ///
    /// Returns `false`, leaving the store untouched, when the hash is missing.
    async fn hash_set_if_exists(&mut self, key: &str, fields: Vec<(String, String)>) -> Result<bool, StoreError> {
        let command = Command::HashSetIfExists {
            key: key.to_string(),
            fields,
        };
        expect_bool(self.execute(command).await?, "hash_set_if_exists")
    }

    /// Read every field of a hash. A missing key yields an empty map.
    async fn hash_get_all(&mut self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        match self.execute(Command::HashGetAll { key: key.to_string() }).await? {
            Reply::Hash(fields) => Ok(fields),
            other => Err(unexpected("hash_get_all", &other)),
        }
    }

    async fn set_add(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let command = Command::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        };
        expect_bool(self.execute(command).await?, "set_add")
    }

    async fn set_remove(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let command = Command::SetRemove {
            key: key.to_string(),
            member: member.to_string(),
        };
        expect_bool(self.execute(command).await?, "set_remove")
    }

    async fn set_members(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.execute(Command::SetMembers { key: key.to_string() }).await? {
            Reply::Members(members) => Ok(members),
            other => Err(unexpected("set_members", &other)),
        }
    }

    async fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<String>, StoreError> {
        match self
            .execute(Command::ScanPrefix {
                prefix: prefix.to_string(),
            })
            .await?
        {
            Reply::Keys(keys) => Ok(keys),
            other => Err(unexpected("scan_prefix", &other)),
        }
    }

    async fn ping(&mut self) -> Result<(), StoreError> {
        match self.execute(Command::Ping).await? {
            Reply::Pong => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }
}

#[async_trait]
impl<T: StoreConnection + ?Sized> StoreConnection for Box<T> {
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        (**self).execute(command).await
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        (**self).close().await
    }
}

/// Opens new connections to the backing store.
///
/// This is the store handle injected into pools; each call to
/// [`connect`](ConnectionFactory::connect) yields an independent connection.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError>;

    /// Human-readable description of the target store for logs.
    fn describe(&self) -> String {
        "store".to_string()
    }
}

#[async_trait]
impl<T: ConnectionFactory + ?Sized> ConnectionFactory for Arc<T> {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        (**self).connect().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

fn expect_bool(reply: Reply, command: &str) -> Result<bool, StoreError> {
    match reply {
        Reply::Bool(b) => Ok(b),
        other => Err(unexpected(command, &other)),
    }
}

fn unexpected(command: &str, reply: &Reply) -> StoreError {
    StoreError::UnexpectedReply {
        command: command.to_string(),
        reply: reply.to_string(),
    }
}

/// Milliseconds in `d`, saturating at `u64::MAX` and never below 1.
///
/// A zero TTL would mean "no expiry" on some backends, so it is clamped.
pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
