//! Redis backend.
//!
//! Each [`RedisConnection`] owns one multiplexed connection. The conditional
//! commands that have no native Redis form run as Lua scripts so that the
//! compare and the mutation happen in one atomic step on the server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use redis::aio::MultiplexedConnection;
use tracing::debug;
use tracing::info;

use crate::command::Command;
use crate::command::KeyTtl;
use crate::command::Reply;
use crate::connection::ConnectionFactory;
use crate::connection::StoreConnection;
use crate::error::StoreError;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const HASH_SET_IF_EXISTS_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    redis.call("HSET", KEYS[1], unpack(ARGV))
    return 1
else
    return 0
end
"#;

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// Opens connections to a Redis server.
pub struct RedisConnectionFactory {
    client: Client,
    url: String,
    command_timeout: Duration,
}

impl RedisConnectionFactory {
    /// Create a factory for `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// Only parses the URL; no connection is made until
    /// [`connect`](ConnectionFactory::connect) is called.
    pub fn new(url: &str, command_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::ConnectionFailed {
            reason: format!("invalid redis url: {e}"),
        })?;
        info!(url, "redis connection factory created");
        Ok(Self {
            client,
            url: url.to_string(),
            command_timeout,
        })
    }
}

#[async_trait]
impl ConnectionFactory for RedisConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                reason: format!("failed to connect to redis at {}: {e}", self.url),
            })?;
        debug!(url = %self.url, "redis connection opened");
        Ok(Box::new(RedisConnection {
            conn: Some(conn),
            command_timeout: self.command_timeout,
        }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A single connection to Redis.
pub struct RedisConnection {
    conn: Option<MultiplexedConnection>,
    command_timeout: Duration,
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        let timeout = self.command_timeout;
        let conn = self.conn.as_mut().ok_or(StoreError::Closed)?;
        match tokio::time::timeout(timeout, run(conn, &command)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.conn = None;
        Ok(())
    }
}

async fn run(conn: &mut MultiplexedConnection, command: &Command) -> Result<Reply, StoreError> {
    let map_err = |e: redis::RedisError| map_redis_error(command, e);
    match command {
        Command::SetIfAbsent { key, value, ttl_ms } => {
            let set: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(*ttl_ms)
                .query_async(conn)
                .await
                .map_err(map_err)?;
            Ok(Reply::Bool(set.is_some()))
        }
        Command::CompareAndDelete { key, expected } => {
            let deleted: i64 = redis::cmd("EVAL")
                .arg(COMPARE_AND_DELETE_SCRIPT)
                .arg(1)
                .arg(key)
                .arg(expected)
                .query_async(conn)
                .await
                .map_err(map_err)?;
            Ok(Reply::Bool(deleted == 1))
        }
        Command::CompareAndExpire { key, expected, ttl_ms } => {
            let updated: i64 = redis::cmd("EVAL")
                .arg(COMPARE_AND_EXPIRE_SCRIPT)
                .arg(1)
                .arg(key)
                .arg(expected)
                .arg(*ttl_ms)
                .query_async(conn)
                .await
                .map_err(map_err)?;
            Ok(Reply::Bool(updated == 1))
        }
        Command::Get { key } => {
            let value: Option<String> = redis::cmd("GET").arg(key).query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Value(value))
        }
        Command::Delete { key } => {
            let removed: i64 = redis::cmd("DEL").arg(key).query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Bool(removed > 0))
        }
        Command::Exists { key } => {
            let count: i64 = redis::cmd("EXISTS").arg(key).query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Bool(count > 0))
        }
        Command::Ttl { key } => {
            let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Ttl(ttl_from_pttl(pttl)))
        }
        Command::HashSet { key, fields } => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            let _: i64 = cmd.query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Ok)
        }
        Command::HashSetIfExists { key, fields } => {
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(HASH_SET_IF_EXISTS_SCRIPT).arg(1).arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            let updated: i64 = cmd.query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Bool(updated == 1))
        }
        Command::HashGetAll { key } => {
            let fields: BTreeMap<String, String> =
                redis::cmd("HGETALL").arg(key).query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Hash(fields))
        }
        Command::SetAdd { key, member } => {
            let added: i64 = redis::cmd("SADD").arg(key).arg(member).query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Bool(added > 0))
        }
        Command::SetRemove { key, member } => {
            let removed: i64 = redis::cmd("SREM").arg(key).arg(member).query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Bool(removed > 0))
        }
        Command::SetMembers { key } => {
            let mut members: Vec<String> =
                redis::cmd("SMEMBERS").arg(key).query_async(conn).await.map_err(map_err)?;
            members.sort();
            Ok(Reply::Members(members))
        }
        Command::ScanPrefix { prefix } => {
            let pattern = format!("{}*", escape_glob(prefix));
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(conn)
                    .await
                    .map_err(map_err)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            // SCAN may return duplicates across iterations.
            keys.sort();
            keys.dedup();
            Ok(Reply::Keys(keys))
        }
        Command::Ping => {
            let _: String = redis::cmd("PING").query_async(conn).await.map_err(map_err)?;
            Ok(Reply::Pong)
        }
    }
}

fn map_redis_error(command: &Command, e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        return StoreError::ConnectionFailed { reason: e.to_string() };
    }
    let message = e.to_string();
    if message.contains("WRONGTYPE") {
        return StoreError::WrongType {
            key: command.key().unwrap_or_default().to_string(),
            command: command.name().to_string(),
        };
    }
    StoreError::CommandFailed {
        command: command.name().to_string(),
        reason: message,
    }
}

/// Map a PTTL reply onto [`KeyTtl`]: -2 means missing, -1 means no expiry.
fn ttl_from_pttl(pttl: i64) -> KeyTtl {
    match pttl {
        -1 => KeyTtl::Persistent,
        ms if ms >= 0 => KeyTtl::Expires(ms.unsigned_abs()),
        _ => KeyTtl::Missing,
    }
}

/// Escape glob metacharacters so `prefix` matches literally in SCAN MATCH.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
