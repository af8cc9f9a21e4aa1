//! Deterministic in-memory backing store.
//!
//! Thread-safe and shared across every connection it hands out, so multiple
//! pools (standing in for multiple processes) can coordinate through one
//! instance. Expiry is measured on `tokio::time::Instant`, which makes TTL
//! behaviour controllable with a paused tokio clock.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::command::Command;
use crate::command::KeyTtl;
use crate::command::Reply;
use crate::connection::ConnectionFactory;
use crate::connection::StoreConnection;
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum StoredValue {
    Str(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

struct Shared {
    /// Every command runs under this lock, which makes the conditional commands atomic.
    data: Mutex<BTreeMap<String, Entry>>,
    fail_commands: AtomicU32,
    fail_connects: AtomicU32,
    connects: AtomicU64,
}

/// A deterministic in-memory store implementing [`ConnectionFactory`].
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl InMemoryStore {
    /// Create a new store wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    fn new_inner() -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(BTreeMap::new()),
                fail_commands: AtomicU32::new(0),
                fail_connects: AtomicU32::new(0),
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next `n` commands (on any connection) fail with a transport error.
    pub fn fail_next_commands(&self, n: u32) {
        self.shared.fail_commands.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful connects performed so far.
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.shared.data.lock().values().filter(|e| !e.is_expired(now)).count()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryStore {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        if take_fault(&self.shared.fail_connects) {
            return Err(StoreError::ConnectionFailed {
                reason: "injected connect fault".to_string(),
            });
        }
        let id = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(connection_id = id, "in-memory connection opened");
        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// A connection to an [`InMemoryStore`].
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    closed: bool,
}

#[async_trait]
impl StoreConnection for InMemoryConnection {
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        if take_fault(&self.shared.fail_commands) {
            return Err(StoreError::CommandFailed {
                command: command.name().to_string(),
                reason: "injected fault".to_string(),
            });
        }
        apply(&mut self.shared.data.lock(), command, Instant::now())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

/// Drop `key` if it has expired, then return the live entry.
fn live<'a>(data: &'a mut BTreeMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(|e| e.is_expired(now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn wrong_type(key: &str, command: &Command) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        command: command.name().to_string(),
    }
}

fn apply(data: &mut BTreeMap<String, Entry>, command: Command, now: Instant) -> Result<Reply, StoreError> {
    match &command {
        Command::SetIfAbsent { key, value, ttl_ms } => {
            if live(data, key, now).is_some() {
                return Ok(Reply::Bool(false));
            }
            data.insert(key.clone(), Entry {
                value: StoredValue::Str(value.clone()),
                expires_at: Some(now + Duration::from_millis(*ttl_ms)),
            });
            Ok(Reply::Bool(true))
        }
        Command::CompareAndDelete { key, expected } => {
            let matches = matches!(
                live(data, key, now),
                Some(Entry { value: StoredValue::Str(current), .. }) if current == expected
            );
            if matches {
                data.remove(key);
            }
            Ok(Reply::Bool(matches))
        }
        Command::CompareAndExpire { key, expected, ttl_ms } => match live(data, key, now) {
            Some(entry) if matches!(&entry.value, StoredValue::Str(current) if current == expected) => {
                entry.expires_at = Some(now + Duration::from_millis(*ttl_ms));
                Ok(Reply::Bool(true))
            }
            _ => Ok(Reply::Bool(false)),
        },
        Command::Get { key } => match live(data, key, now) {
            None => Ok(Reply::Value(None)),
            Some(Entry {
                value: StoredValue::Str(v),
                ..
            }) => Ok(Reply::Value(Some(v.clone()))),
            Some(_) => Err(wrong_type(key, &command)),
        },
        Command::Delete { key } => {
            let existed = live(data, key, now).is_some();
            data.remove(key);
            Ok(Reply::Bool(existed))
        }
        Command::Exists { key } => Ok(Reply::Bool(live(data, key, now).is_some())),
        Command::Ttl { key } => {
            let ttl = match live(data, key, now) {
                None => KeyTtl::Missing,
                Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(deadline),
                    ..
                }) => {
                    let remaining = deadline.saturating_duration_since(now);
                    KeyTtl::Expires(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX))
                }
            };
            Ok(Reply::Ttl(ttl))
        }
        Command::HashSet { key, fields } => {
            match live(data, key, now) {
                Some(Entry {
                    value: StoredValue::Hash(hash),
                    ..
                }) => {
                    hash.extend(fields.iter().cloned());
                }
                Some(_) => return Err(wrong_type(key, &command)),
                None => {
                    data.insert(key.clone(), Entry {
                        value: StoredValue::Hash(fields.iter().cloned().collect()),
                        expires_at: None,
                    });
                }
            }
            Ok(Reply::Ok)
        }
        Command::HashSetIfExists { key, fields } => match live(data, key, now) {
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => {
                hash.extend(fields.iter().cloned());
                Ok(Reply::Bool(true))
            }
            Some(_) => Err(wrong_type(key, &command)),
            None => Ok(Reply::Bool(false)),
        },
        Command::HashGetAll { key } => match live(data, key, now) {
            None => Ok(Reply::Hash(BTreeMap::new())),
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => Ok(Reply::Hash(hash.clone())),
            Some(_) => Err(wrong_type(key, &command)),
        },
        Command::SetAdd { key, member } => match live(data, key, now) {
            Some(Entry {
                value: StoredValue::Set(set),
                ..
            }) => Ok(Reply::Bool(set.insert(member.clone()))),
            Some(_) => Err(wrong_type(key, &command)),
            None => {
                data.insert(key.clone(), Entry {
                    value: StoredValue::Set(BTreeSet::from([member.clone()])),
                    expires_at: None,
                });
                Ok(Reply::Bool(true))
            }
        },
        Command::SetRemove { key, member } => {
            let (removed, now_empty) = match live(data, key, now) {
                None => (false, false),
                Some(Entry {
                    value: StoredValue::Set(set),
                    ..
                }) => (set.remove(member), set.is_empty()),
                Some(_) => return Err(wrong_type(key, &command)),
            };
            // Empty sets cease to exist, matching Redis.
            if now_empty {
                data.remove(key);
            }
            Ok(Reply::Bool(removed))
        }
        Command::SetMembers { key } => match live(data, key, now) {
            None => Ok(Reply::Members(Vec::new())),
            Some(Entry {
                value: StoredValue::Set(set),
                ..
            }) => Ok(Reply::Members(set.iter().cloned().collect())),
            Some(_) => Err(wrong_type(key, &command)),
        },
        Command::ScanPrefix { prefix } => {
            let keys = data
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                .filter(|(_, e)| !e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            Ok(Reply::Keys(keys))
        }
        Command::Ping => Ok(Reply::Pong),
    }
}
