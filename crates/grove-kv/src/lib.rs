//! Backing key-value store surface for grove coordination primitives.
//!
//! The coordination layer never talks to a concrete store directly. It issues
//! [`Command`]s through a [`StoreConnection`] obtained from an injected
//! [`ConnectionFactory`]. Two backends are provided:
//!
//! - [`InMemoryStore`]: deterministic, shared in-process store for tests and
//!   single-process deployments.
//! - `RedisConnectionFactory` (feature `redis`): a Redis server.

pub mod command;
pub mod connection;
pub mod error;
pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use command::Command;
pub use command::KeyTtl;
pub use command::Reply;
pub use connection::ConnectionFactory;
pub use connection::StoreConnection;
pub use error::StoreError;
pub use inmemory::InMemoryConnection;
pub use inmemory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisConnection;
#[cfg(feature = "redis")]
pub use redis_store::RedisConnectionFactory;
