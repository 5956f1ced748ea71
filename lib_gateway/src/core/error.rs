use thiserror::Error;

/// Errors surfaced by hub internals and its infrastructure backends.
///
/// None of these are fatal. Callers of the outbound API never see them:
/// the hub logs and swallows them at the boundary.
#[derive(Debug, Error)]
pub enum HubError {
    /// The dispatch queue stayed full for longer than the enqueue timeout.
    #[error("dispatch queue full, event dropped after {0:?}")]
    QueueTimeout(std::time::Duration),

    /// The dispatch loop has stopped (hub cancelled).
    #[error("hub is shut down")]
    Closed,

    /// A Redis command or subscription failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The in-process bus has no live endpoint.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// Reading an on-disk log segment failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
