//! # Core Gateway Module
//!
//! Everything the hub owns at runtime lives here. The components are layered
//! leaves first:
//!
//! - **`envelope`**: wire types shared by local delivery and the cluster bus
//!   (`Envelope`, `Room`, inbound `ClientMessage`, `Handshake`).
//! - **`registry`**: the in-memory connection registry and its presence counters.
//! - **`dispatcher`**: the `Hub` itself and the single dispatch loop that applies
//!   every mutation and broadcast in arrival order.
//! - **`bridge`**: publishes broadcasts on the cluster bus and relays sibling
//!   instances' messages into local delivery.
//! - **`router`**: connect/message/disconnect rules for the `public` and `admin`
//!   channels.
//! - **`log_stream`**: per-admin-connection tails of the process log.
//! - **`stats`**: best-effort daily online statistics.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Hub error taxonomy.
pub mod error;
/// Wire envelope, rooms and inbound client messages.
pub mod envelope;
/// Connection registry and presence counters.
pub mod registry;
/// The hub handle and its dispatch loop.
pub mod dispatcher;
/// Cluster fan-out over the pub/sub bus.
pub mod bridge;
/// Public/admin channel handling.
pub mod router;
/// Live log streaming to admin connections.
pub mod log_stream;
/// Daily online statistics.
pub mod stats;

// --- Public API Re-exports ---
pub use dispatcher::{
    Hub, HubConfig, HubDeps, HubStats, TokenValidator, LEAVE_PRESENCE, VISITOR_OFFLINE,
    VISITOR_ONLINE,
};
pub use envelope::{
    ClientMessage, ConnectionId, ConnectionSender, Envelope, Handshake, Outbound, Room,
};
pub use error::HubError;
pub use log_stream::{LogStreams, STDOUT};
pub use registry::{PresenceDelta, Registry};
pub use router::{AUTH_FAILED, GATEWAY_CONNECT};
pub use stats::{day_key, MemoryStatsStore, StatsStore};
