//! # In-Process Bus
//!
//! A `ClusterBus` backed by a `tokio::sync::broadcast` channel. Hubs sharing
//! one `MemoryBus` behave like instances sharing one Redis server, which is how
//! the fan-out tests simulate a fleet. A lone hub on its own `MemoryBus` is a
//! single-instance deployment.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tracing::warn;

use crate::connections::bus::{BusMessage, BusStream, ClusterBus};
use crate::core::error::HubError;

const DEFAULT_CAPACITY: usize = 1024;

/// Cloneable handle to an in-process bus.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusMessage>,
    published: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Creates a bus with the default buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` messages per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: Arc::new(AtomicUsize::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of successful `publish` calls so far.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Live subscriptions, taps included.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Simulates losing (or regaining) connectivity: while offline every
    /// publish and subscribe fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Injects a message as if a sibling instance had published it.
    pub fn inject(&self, channel: &str, payload: Vec<u8>) {
        let _ = self.sender.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
    }

    /// Opens a raw subscription that sees every message on every channel.
    pub fn tap(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    fn check_online(&self) -> Result<(), HubError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(HubError::BusUnavailable("memory bus is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ClusterBus for MemoryBus {
    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            self.check_online()?;
            // No subscribers is not an error: nobody else is listening.
            let _ = self.sender.send(BusMessage {
                channel: channel.to_string(),
                payload,
            });
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channels: &'a [String],
    ) -> BoxFuture<'a, Result<BusStream, HubError>> {
        Box::pin(async move {
            self.check_online()?;
            let rx = self.sender.subscribe();
            let wanted = channels.to_vec();
            let stream = futures_util::stream::unfold((rx, wanted), |(mut rx, wanted)| async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) if wanted.contains(&msg.channel) => return Some((msg, (rx, wanted))),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "memory bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}
