//! # Live Log Streaming
//!
//! Admin connections can tail the process log. Each tail is one forwarding
//! task that reads from its own bounded `LogBroadcaster` stream and sends every
//! frame to the connection as a `STDOUT` envelope.
//!
//! With replay requested, the task first streams every file in the log
//! directory modified at or after process startup, oldest first, in fixed-size
//! chunks. Each segment's length is recorded just before the live stream is
//! opened and replay stops at that offset, so a line logged while the replay
//! runs reaches the admin once, through the live stream. Both sources carry
//! the same JSON lines (see `loggers::json_lines`).
//!
//! The file writer is non-blocking, so a line still queued for disk when the
//! tail starts may appear in neither source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::envelope::{ConnectionId, ConnectionSender, Envelope, Outbound};
use crate::core::error::HubError;
use crate::loggers::log_broadcast::{LogBroadcaster, LogStream};

/// Event name of log frames sent to admin connections.
pub const STDOUT: &str = "STDOUT";

/// An on-disk log file and the length it had when the tail started.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    path: PathBuf,
    len: u64,
}

struct LogSubscription {
    stream_id: u64,
    stop: CancellationToken,
}

/// Registry of active log tails, at most one per connection.
pub struct LogStreams {
    broadcaster: LogBroadcaster,
    active: Mutex<HashMap<ConnectionId, LogSubscription>>,
    next_stream: AtomicU64,
    log_dir: Option<PathBuf>,
    started_at: Mutex<SystemTime>,
    buffer_frames: usize,
    chunk_bytes: usize,
}

impl LogStreams {
    /// Creates an empty registry.
    pub fn new(
        broadcaster: LogBroadcaster,
        log_dir: Option<PathBuf>,
        started_at: SystemTime,
        buffer_frames: usize,
        chunk_bytes: usize,
    ) -> Self {
        Self {
            broadcaster,
            active: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            log_dir,
            started_at: Mutex::new(started_at),
            buffer_frames: buffer_frames.max(1),
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub(crate) fn set_started_at(&self, started_at: SystemTime) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = started_at;
    }

    fn started_at(&self) -> SystemTime {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<ConnectionId, LogSubscription>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a tail for `id`. Returns `false` if one is already running.
    pub async fn subscribe(
        self: &Arc<Self>,
        id: ConnectionId,
        sender: ConnectionSender,
        replay_previous: bool,
    ) -> bool {
        if self.is_subscribed(&id) {
            return false;
        }
        let segments = if replay_previous {
            self.segments_since_startup().await.unwrap_or_else(|e| {
                warn!(error = %e, "could not list log segments");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let mut active = self.active();
        if active.contains_key(&id) {
            return false;
        }
        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        active.insert(
            id.clone(),
            LogSubscription {
                stream_id,
                stop: stop.clone(),
            },
        );
        let live = self.broadcaster.subscribe(self.buffer_frames);
        drop(active);

        debug!(connection = %id, stream_id, replay_previous, "log tail started");
        tokio::spawn(forward(
            Arc::clone(self),
            id,
            stream_id,
            sender,
            live,
            segments,
            stop,
        ));
        true
    }

    /// Stops the tail for `id`. Returns `false` if there was none.
    pub fn unsubscribe(&self, id: &ConnectionId) -> bool {
        let removed = self.active().remove(id);
        match removed {
            Some(sub) => {
                sub.stop.cancel();
                debug!(connection = %id, stream_id = sub.stream_id, "log tail stopped");
                true
            }
            None => false,
        }
    }

    /// Whether `id` has a running tail.
    pub fn is_subscribed(&self, id: &ConnectionId) -> bool {
        self.active().contains_key(id)
    }

    /// Stops every tail.
    pub(crate) fn shutdown(&self) {
        for (_, sub) in self.active().drain() {
            sub.stop.cancel();
        }
    }

    fn finish(&self, id: &ConnectionId, stream_id: u64) {
        let mut active = self.active();
        if active.get(id).map(|s| s.stream_id) == Some(stream_id) {
            active.remove(id);
        }
    }

    /// Log files modified at or after startup, oldest first.
    async fn segments_since_startup(&self) -> Result<Vec<Segment>, HubError> {
        let Some(dir) = &self.log_dir else {
            return Ok(Vec::new());
        };
        let since = self.started_at();
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified()?;
            if modified >= since {
                found.push((modified, entry.path(), meta.len()));
            }
        }
        found.sort();
        Ok(found
            .into_iter()
            .map(|(_, path, len)| Segment { path, len })
            .collect())
    }
}

/// Sends one `STDOUT` frame, waiting for room in the connection's buffer.
/// `false` means the connection is gone or the tail was stopped meanwhile.
async fn send_stdout(sender: &ConnectionSender, bytes: &[u8], stop: &CancellationToken) -> bool {
    let envelope = Envelope::new(STDOUT, Value::String(String::from_utf8_lossy(bytes).into_owned()));
    let Ok(frame) = envelope.to_frame() else {
        return true;
    };
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        sent = sender.send(Outbound::Frame(frame)) => sent.is_ok(),
    }
}

/// Streams the first `segment.len` bytes of one file in `chunk_bytes`
/// pieces. `Ok(false)` means the connection is gone or the tail was stopped.
async fn replay_segment(
    segment: &Segment,
    chunk_bytes: usize,
    sender: &ConnectionSender,
    stop: &CancellationToken,
) -> Result<bool, HubError> {
    let mut file = tokio::fs::File::open(&segment.path).await?.take(segment.len);
    let mut buf = vec![0u8; chunk_bytes];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(true);
        }
        if !send_stdout(sender, &buf[..filled], stop).await {
            return Ok(false);
        }
        if filled < buf.len() {
            return Ok(true);
        }
    }
}

async fn forward(
    streams: Arc<LogStreams>,
    id: ConnectionId,
    stream_id: u64,
    sender: ConnectionSender,
    mut live: LogStream,
    segments: Vec<Segment>,
    stop: CancellationToken,
) {
    let mut open = true;

    for segment in &segments {
        match replay_segment(segment, streams.chunk_bytes, &sender, &stop).await {
            Ok(true) => {}
            Ok(false) => {
                open = false;
                break;
            }
            Err(e) => warn!(path = %segment.path.display(), error = %e, "log replay failed"),
        }
    }

    while open {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = live.recv() => match frame {
                Some(bytes) => open = send_stdout(&sender, &bytes, &stop).await,
                None => break,
            }
        }
    }

    streams.finish(&id, stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn streams(dir: Option<PathBuf>, since: SystemTime) -> Arc<LogStreams> {
        Arc::new(LogStreams::new(LogBroadcaster::new(), dir, since, 8, 4))
    }

    async fn next_payload(rx: &mut mpsc::Receiver<Outbound>) -> String {
        let out = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outbound::Frame(text) = out else {
            panic!("unexpected close");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], STDOUT);
        value["payload"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn one_tail_per_connection() {
        let streams = streams(None, SystemTime::now());
        let (tx, _rx) = mpsc::channel(8);
        let id = ConnectionId::new("adm");
        assert!(streams.subscribe(id.clone(), tx.clone(), false).await);
        assert!(!streams.subscribe(id.clone(), tx, false).await);
        assert!(streams.unsubscribe(&id));
        assert!(!streams.unsubscribe(&id));
        assert!(!streams.is_subscribed(&id));
    }

    #[tokio::test]
    async fn replay_chunks_then_live() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("gateway.old");
        std::fs::write(&old, b"stale").unwrap();
        let file = std::fs::File::options().write(true).open(&old).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
        drop(file);

        let since = SystemTime::now() - Duration::from_secs(60);
        std::fs::write(dir.path().join("gateway.today"), b"abcdefghij").unwrap();

        let streams = streams(Some(dir.path().to_path_buf()), since);
        let (tx, mut rx) = mpsc::channel(16);
        let id = ConnectionId::new("adm");
        assert!(streams.subscribe(id.clone(), tx, true).await);

        // chunk size 4: "abcd", "efgh", "ij"
        assert_eq!(next_payload(&mut rx).await, "abcd");
        assert_eq!(next_payload(&mut rx).await, "efgh");
        assert_eq!(next_payload(&mut rx).await, "ij");

        streams.broadcaster.publish(b"live line\n");
        assert_eq!(next_payload(&mut rx).await, "live line\n");

        streams.unsubscribe(&id);
    }

    #[tokio::test]
    async fn tail_ends_when_connection_drops() {
        let streams = streams(None, SystemTime::now());
        let (tx, rx) = mpsc::channel(1);
        let id = ConnectionId::new("adm");
        streams.subscribe(id.clone(), tx, false).await;
        drop(rx);
        for _ in 0..100 {
            streams.broadcaster.publish(b"x");
            if !streams.is_subscribed(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!streams.is_subscribed(&id));
    }

    #[tokio::test]
    async fn replay_stops_at_length_seen_when_tail_started() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("gateway.today");
        std::fs::write(&segment, b"abcdefghij").unwrap();

        let streams = streams(Some(dir.path().to_path_buf()), SystemTime::now() - Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(16);
        let id = ConnectionId::new("adm");
        assert!(streams.subscribe(id.clone(), tx, true).await);

        // the same line lands in the file and in the live stream
        let mut file = std::fs::OpenOptions::new().append(true).open(&segment).unwrap();
        std::io::Write::write_all(&mut file, b"klmn").unwrap();
        drop(file);
        streams.broadcaster.publish(b"klmn");

        assert_eq!(next_payload(&mut rx).await, "abcd");
        assert_eq!(next_payload(&mut rx).await, "efgh");
        assert_eq!(next_payload(&mut rx).await, "ij");
        assert_eq!(next_payload(&mut rx).await, "klmn");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "line delivered twice"
        );
        streams.unsubscribe(&id);
    }

    #[tokio::test]
    async fn unsubscribe_interrupts_send_to_full_connection() {
        let streams = streams(None, SystemTime::now());
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Outbound::Close).unwrap();
        let id = ConnectionId::new("adm");
        assert!(streams.subscribe(id.clone(), tx, false).await);

        // the forwarder parks on the full buffer
        streams.broadcaster.publish(b"stuck");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(streams.unsubscribe(&id));

        let mut ended = false;
        for _ in 0..100 {
            if streams.broadcaster.subscriber_count() == 0 {
                ended = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ended, "tail kept waiting on a full buffer after unsubscribe");
    }
}
