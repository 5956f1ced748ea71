//! # lib_gateway
//!
//! The realtime gateway hub behind the site's WebSocket endpoints.
//!
//! - **`core`**: connection registry, the ordered dispatch loop, cluster fan-out,
//!   the public/admin channel router and live log streaming.
//! - **`connections`**: cluster bus backends (Redis pub/sub and an in-process bus)
//!   and the Redis-backed daily statistics store.
//! - **`loggers`**: `tracing` setup with a daily rolling file and the in-process
//!   log broadcaster that feeds admin log tails.
//! - **`configs`**: layered gateway configuration (defaults, JSON file, env, CLI).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod connections;
pub mod core;
pub mod loggers;

pub use crate::core::{
    ConnectionId, ConnectionSender, Envelope, Handshake, Hub, HubConfig, HubDeps, HubError,
    HubStats, Outbound, Room,
};
