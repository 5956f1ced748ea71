//! # Log Broadcaster
//!
//! A process-wide tee for formatted log output. It plugs into
//! `tracing-subscriber` as a `MakeWriter`, so every line the fmt layer emits is
//! offered to each live subscriber through its own bounded channel.
//!
//! The writer side never blocks: if a subscriber's buffer is full the newest
//! frame is dropped for that subscriber only. Closed subscribers are pruned on
//! the next write.
//!
//! Nothing in this module may emit `tracing` events itself, since it runs
//! inside the subscriber's write path.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;

/// Receiving half of a log subscription.
pub type LogStream = mpsc::Receiver<Bytes>;

/// Cloneable handle to the process log tee.
#[derive(Clone, Default)]
pub struct LogBroadcaster {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Bytes>>>>,
}

impl LogBroadcaster {
    /// Creates a broadcaster with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a stream buffering at most `capacity` frames.
    pub fn subscribe(&self, capacity: usize) -> LogStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.lock().push(tx);
        rx
    }

    /// Offers `frame` to every subscriber. Returns how many accepted it.
    pub fn publish(&self, frame: &[u8]) -> usize {
        let mut subscribers = self.lock();
        if subscribers.is_empty() {
            return 0;
        }
        let frame = Bytes::copy_from_slice(frame);
        let mut accepted = 0;
        subscribers.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                accepted += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        accepted
    }

    /// Number of live subscribers (closed ones are pruned lazily).
    pub fn subscriber_count(&self) -> usize {
        self.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<Bytes>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `io::Write` adapter handed out by `MakeWriter`.
pub struct LogBroadcastWriter {
    broadcaster: LogBroadcaster,
}

impl io::Write for LogBroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.broadcaster.publish(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBroadcaster {
    type Writer = LogBroadcastWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBroadcastWriter {
            broadcaster: self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn full_subscriber_drops_newest() {
        let logs = LogBroadcaster::new();
        let mut rx = logs.subscribe(2);
        assert_eq!(logs.publish(b"one"), 1);
        assert_eq!(logs.publish(b"two"), 1);
        assert_eq!(logs.publish(b"three"), 0);

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"two"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let logs = LogBroadcaster::new();
        let rx = logs.subscribe(4);
        let mut keep = logs.subscribe(4);
        drop(rx);
        assert_eq!(logs.publish(b"line"), 1);
        assert_eq!(logs.subscriber_count(), 1);
        assert_eq!(keep.try_recv().unwrap(), Bytes::from_static(b"line"));
    }

    #[test]
    fn writer_tees_into_subscribers() {
        let logs = LogBroadcaster::new();
        let mut rx = logs.subscribe(4);
        let mut writer = logs.make_writer();
        writer.write_all(b"INFO hello\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"INFO hello\n"));
    }
}
