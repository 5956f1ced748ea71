//! # Connections Module
//!
//! Shared infrastructure the hub talks to: the cluster publish/subscribe bus
//! and the daily statistics store.

/// The `ClusterBus` abstraction.
pub mod bus;

/// In-process bus for single-instance runs and tests.
pub mod memory_bus;

/// Redis pub/sub bus and Redis statistics store.
pub mod cache_redis;

pub use bus::{BusMessage, BusStream, ClusterBus};
pub use cache_redis::{RedisBus, RedisStatsStore};
pub use memory_bus::MemoryBus;
