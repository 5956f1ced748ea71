use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt::format::{Format, Json, JsonFields};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::loggers::log_broadcast::LogBroadcaster;

/// JSON-lines fmt layer writing to `writer`.
///
/// Used for both the rolling file and the admin log tee, so a replayed segment
/// and the live tail carry the same line format.
pub fn json_lines<S, W>(writer: W) -> fmt::Layer<S, JsonFields, Format<Json>, W>
where
    W: for<'writer> MakeWriter<'writer> + 'static,
{
    fmt::layer().with_ansi(false).with_writer(writer).json()
}

/// # Setup Logging
///
/// Installs the global `tracing` subscriber:
/// - console layer, human-readable with ANSI colors;
/// - JSON layer on a daily rotating file `{log_dir}/{file_prefix}.YYYY-MM-DD`;
/// - the same JSON layer teeing every line into `broadcaster`, which feeds
///   admin log tails.
///
/// The level comes from `RUST_LOG`, falling back to `log_level`.
///
/// # Returns
/// The appender's `WorkerGuard`. Keep it alive for the life of the process or
/// buffered file output is lost.
pub fn setup_logging(
    log_dir: &Path,
    file_prefix: &str,
    log_level: &str,
    broadcaster: LogBroadcaster,
) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(json_lines(non_blocking_appender))
        .with(json_lines(broadcaster))
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    info!(
        "Logging initialized with level: {} (files in {})",
        log_level,
        log_dir.display()
    );
    Ok(guard)
}
