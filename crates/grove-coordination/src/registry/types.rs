//! Type definitions for the service registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::CoordinationError;
use crate::pure;

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Heartbeats are arriving within the TTL.
    #[default]
    Healthy,
    /// No heartbeat within the TTL. Derived at query time, never stored.
    Stale,
    /// Shutting down; excluded from healthy results while still registered.
    Draining,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Stale => "stale",
            Self::Draining => "draining",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(Self::Healthy),
            "stale" => Ok(Self::Stale),
            "draining" => Ok(Self::Draining),
            other => Err(format!("unknown service status '{other}'")),
        }
    }
}

/// What an instance announces when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            host: host.into(),
            port,
        }
    }

    /// Reject empty names or hosts and port 0.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        let message = if self.name.trim().is_empty() {
            "service name must not be empty"
        } else if self.name.contains(':') {
            "service name must not contain ':'"
        } else if self.host.trim().is_empty() {
            "service host must not be empty"
        } else if self.port == 0 {
            "service port must be non-zero"
        } else {
            return Ok(());
        };
        Err(CoordinationError::InvalidArgument {
            message: message.to_string(),
        })
    }
}

/// A registered service instance as stored in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub instance_id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    /// Stored status; see [`ServiceRecord::effective_status`] for staleness.
    pub status: ServiceStatus,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,
    pub ttl_ms: u64,
}

impl ServiceRecord {
    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the last heartbeat is older than the TTL at `now_ms`.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        pure::is_service_stale(self.last_heartbeat_ms, self.ttl_ms, now_ms)
    }

    /// Healthy and heartbeating within the TTL.
    pub fn is_healthy(&self, now_ms: u64) -> bool {
        self.status == ServiceStatus::Healthy && !self.is_stale(now_ms)
    }

    /// Stored status, overridden by `Stale` once the TTL lapses.
    pub fn effective_status(&self, now_ms: u64) -> ServiceStatus {
        if self.is_stale(now_ms) {
            ServiceStatus::Stale
        } else {
            self.status
        }
    }

    pub fn remaining_ttl_ms(&self, now_ms: u64) -> u64 {
        pure::service_remaining_ttl_ms(self.last_heartbeat_ms, self.ttl_ms, now_ms)
    }

    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("instance_id".to_string(), self.instance_id.clone()),
            ("name".to_string(), self.name.clone()),
            ("version".to_string(), self.version.clone()),
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
            ("status".to_string(), self.status.as_str().to_string()),
            ("registered_at_ms".to_string(), self.registered_at_ms.to_string()),
            ("last_heartbeat_ms".to_string(), self.last_heartbeat_ms.to_string()),
            ("ttl_ms".to_string(), self.ttl_ms.to_string()),
        ]
    }

    /// Parse a record from its stored hash fields.
    pub(crate) fn from_fields(key: &str, fields: &BTreeMap<String, String>) -> Result<Self, CoordinationError> {
        let text = |field: &str| -> Result<String, CoordinationError> {
            fields.get(field).cloned().ok_or_else(|| CoordinationError::CorruptedRecord {
                key: key.to_string(),
                reason: format!("missing field '{field}'"),
            })
        };
        fn parse<T: FromStr>(key: &str, field: &str, raw: String) -> Result<T, CoordinationError> {
            raw.parse().map_err(|_| CoordinationError::CorruptedRecord {
                key: key.to_string(),
                reason: format!("invalid value for '{field}': {raw}"),
            })
        }

        Ok(Self {
            instance_id: text("instance_id")?,
            name: text("name")?,
            version: text("version")?,
            host: text("host")?,
            port: parse(key, "port", text("port")?)?,
            status: parse(key, "status", text("status")?)?,
            registered_at_ms: parse(key, "registered_at_ms", text("registered_at_ms")?)?,
            last_heartbeat_ms: parse(key, "last_heartbeat_ms", text("last_heartbeat_ms")?)?,
            ttl_ms: parse(key, "ttl_ms", text("ttl_ms")?)?,
        })
    }
}
