//! Command and reply types for the backing store.
//!
//! Every primitive the coordination layer needs from its store is one variant
//! of [`Command`]. Backends map each variant onto their native operation; the
//! conditional variants must stay atomic on every backend.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A single command against the backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    /// Create `key` with `value` only if it does not exist, expiring after `ttl_ms`.
    SetIfAbsent { key: String, value: String, ttl_ms: u64 },
    /// Delete `key` only if its stored value equals `expected`.
    CompareAndDelete { key: String, expected: String },
    /// Reset the expiry of `key` to `ttl_ms` only if its stored value equals `expected`.
    CompareAndExpire { key: String, expected: String, ttl_ms: u64 },
    /// Read a string value.
    Get { key: String },
    /// Delete a key of any type.
    Delete { key: String },
    /// Check whether a key exists.
    Exists { key: String },
    /// Query the remaining time-to-live of a key.
    Ttl { key: String },
    /// Set one or more hash fields.
    HashSet { key: String, fields: Vec<(String, String)> },
    /// Set hash fields only if the hash already exists. Never creates the key.
    HashSetIfExists { key: String, fields: Vec<(String, String)> },
    /// Read every field of a hash.
    HashGetAll { key: String },
    /// Add a member to a set.
    SetAdd { key: String, member: String },
    /// Remove a member from a set.
    SetRemove { key: String, member: String },
    /// List the members of a set.
    SetMembers { key: String },
    /// Enumerate keys starting with `prefix`.
    ScanPrefix { prefix: String },
    /// Liveness probe.
    Ping,
}

impl Command {
    /// Short command name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetIfAbsent { .. } => "set_if_absent",
            Command::CompareAndDelete { .. } => "compare_and_delete",
            Command::CompareAndExpire { .. } => "compare_and_expire",
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::Exists { .. } => "exists",
            Command::Ttl { .. } => "ttl",
            Command::HashSet { .. } => "hash_set",
            Command::HashSetIfExists { .. } => "hash_set_if_exists",
            Command::HashGetAll { .. } => "hash_get_all",
            Command::SetAdd { .. } => "set_add",
            Command::SetRemove { .. } => "set_remove",
            Command::SetMembers { .. } => "set_members",
            Command::ScanPrefix { .. } => "scan_prefix",
            Command::Ping => "ping",
        }
    }

    /// The key (or prefix) the command targets, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Command::SetIfAbsent { key, .. }
            | Command::CompareAndDelete { key, .. }
            | Command::CompareAndExpire { key, .. }
            | Command::Get { key }
            | Command::Delete { key }
            | Command::Exists { key }
            | Command::Ttl { key }
            | Command::HashSet { key, .. }
            | Command::HashSetIfExists { key, .. }
            | Command::HashGetAll { key }
            | Command::SetAdd { key, .. }
            | Command::SetRemove { key, .. }
            | Command::SetMembers { key } => Some(key),
            Command::ScanPrefix { prefix } => Some(prefix),
            Command::Ping => None,
        }
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or has expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after this many milliseconds.
    Expires(u64),
}

/// Reply to a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Bool(bool),
    Value(Option<String>),
    Ttl(KeyTtl),
    Hash(BTreeMap<String, String>),
    Members(Vec<String>),
    Keys(Vec<String>),
    Pong,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "ok"),
            Reply::Bool(b) => write!(f, "bool({b})"),
            Reply::Value(v) => write!(f, "value({})", if v.is_some() { "some" } else { "none" }),
            Reply::Ttl(ttl) => write!(f, "ttl({ttl:?})"),
            Reply::Hash(h) => write!(f, "hash({} fields)", h.len()),
            Reply::Members(m) => write!(f, "members({})", m.len()),
            Reply::Keys(k) => write!(f, "keys({})", k.len()),
            Reply::Pong => write!(f, "pong"),
        }
    }
}
