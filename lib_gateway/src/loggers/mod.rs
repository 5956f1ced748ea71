/// In-process fan-out of formatted log lines to live subscribers.
pub mod log_broadcast;
/// `tracing` subscriber setup: console, plus JSON lines to the daily rolling
/// file and the broadcaster.
pub mod logsetup;

pub use log_broadcast::{LogBroadcaster, LogStream};
pub use logsetup::{json_lines, setup_logging};
