//! Coordination lifecycle events.
//!
//! Pools, lock managers, and registries can be given a [`CoordinationEvents`]
//! sink. Consumers call [`CoordinationEvents::subscribe`] with the kind of
//! event they care about and receive a stream of matching events.
//!
//! ```text
//! ConnectionPool / LockManager / ServiceRegistry
//!        |
//!        v
//! CoordinationEvents (broadcast::Sender)
//!        |
//!        v
//! subscribe(kind) -> Stream<CoordinationEvent>
//! ```
//!
//! The channel is bounded by [`EVENT_BUFFER_SIZE`]. Sends never block; a
//! subscriber that falls behind skips the events it missed.

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use crate::constants::EVENT_BUFFER_SIZE;
use crate::types::now_unix_ms;

/// Kinds of coordination events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LockAcquired,
    LockReleased,
    LockExtended,
    /// An acquisition gave up because another owner held the lock.
    LockContended,
    ConnectionEvicted,
    ServiceRegistered,
    ServiceDeregistered,
}

/// Why a pooled connection was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Error count exceeded the configured threshold.
    Errors,
    /// Unused for longer than the idle timeout.
    Idle,
}

/// Payload of a coordination event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    LockAcquired { key: String },
    LockReleased { key: String },
    LockExtended { key: String, ttl_ms: u64 },
    LockContended { key: String, attempts: u32 },
    ConnectionEvicted { connection_id: u64, reason: EvictionReason },
    ServiceRegistered { name: String, instance_id: String },
    ServiceDeregistered { name: String, instance_id: String },
}

/// A coordination event with its emission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub payload: EventPayload,
    /// Wall-clock emission time (Unix ms).
    pub timestamp_ms: u64,
}

impl CoordinationEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp_ms: now_unix_ms(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::LockAcquired { .. } => EventKind::LockAcquired,
            EventPayload::LockReleased { .. } => EventKind::LockReleased,
            EventPayload::LockExtended { .. } => EventKind::LockExtended,
            EventPayload::LockContended { .. } => EventKind::LockContended,
            EventPayload::ConnectionEvicted { .. } => EventKind::ConnectionEvicted,
            EventPayload::ServiceRegistered { .. } => EventKind::ServiceRegistered,
            EventPayload::ServiceDeregistered { .. } => EventKind::ServiceDeregistered,
        }
    }
}

/// Broadcaster for coordination events.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct CoordinationEvents {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl Default for CoordinationEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationEvents {
    /// Create a broadcaster with [`EVENT_BUFFER_SIZE`] capacity.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER_SIZE)
    }

    /// Create a broadcaster with a custom buffer capacity (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events of one kind.
    ///
    /// Only events emitted after this call are delivered.
    pub fn subscribe(&self, kind: EventKind) -> BoxStream<'static, CoordinationEvent> {
        self.stream()
            .filter(move |event| futures::future::ready(event.kind() == kind))
            .boxed()
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> BoxStream<'static, CoordinationEvent> {
        self.stream().boxed()
    }

    /// Number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, payload: EventPayload) {
        // Non-blocking: having no subscribers is normal.
        match self.sender.send(CoordinationEvent::new(payload)) {
            Ok(count) => debug!(receivers = count, "coordination event sent"),
            Err(_) => debug!("coordination event dropped (no receivers)"),
        }
    }

    fn stream(&self) -> impl futures::Stream<Item = CoordinationEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| {
            futures::future::ready(match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "coordination event subscriber lagged");
                    None
                }
            })
        })
    }
}

/// Emit to an optional sink.
pub(crate) fn emit(events: Option<&CoordinationEvents>, payload: EventPayload) {
    if let Some(events) = events {
        events.emit(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_filters_by_kind() {
        let events = CoordinationEvents::new();
        let mut released = events.subscribe(EventKind::LockReleased);

        events.emit(EventPayload::LockAcquired { key: "a".into() });
        events.emit(EventPayload::LockReleased { key: "a".into() });

        let event = released.next().await.unwrap();
        assert_eq!(event.kind(), EventKind::LockReleased);
        assert_eq!(event.payload, EventPayload::LockReleased { key: "a".into() });
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_missed_events() {
        let events = CoordinationEvents::with_capacity(2);
        let mut all = events.subscribe_all();

        for i in 0..5u32 {
            events.emit(EventPayload::LockContended {
                key: "k".into(),
                attempts: i,
            });
        }

        let first = all.next().await.unwrap();
        assert_eq!(first.payload, EventPayload::LockContended {
            key: "k".into(),
            attempts: 3
        });
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let event = CoordinationEvent {
            payload: EventPayload::ConnectionEvicted {
                connection_id: 7,
                reason: EvictionReason::Idle,
            },
            timestamp_ms: 1_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "connection_evicted");
        assert_eq!(json["payload"]["reason"], "idle");
        let back: CoordinationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let events = CoordinationEvents::new();
        assert_eq!(events.receiver_count(), 0);
        events.emit(EventPayload::ServiceRegistered {
            name: "gateway".into(),
            instance_id: "i-1".into(),
        });
    }
}
