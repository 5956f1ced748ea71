//! # Cluster Fan-out Bridge
//!
//! Every broadcast that originates on this instance is published on the bus
//! channel of its target room (`{prefix}:public`, `{prefix}:admin`, or both
//! when no room is set). Each instance runs one subscriber on both channels
//! that feeds received envelopes back into the dispatch queue as *relayed*
//! deliveries. Relayed deliveries go to the room of the channel they arrived
//! on and are never published again, so N instances converge without echo.
//!
//! Frames carry the publishing instance's id in `_origin`; an instance skips
//! its own frames because it already delivered them locally. Frames without
//! `_origin` are plain envelopes and are always accepted.
//!
//! Delivery is at-most-once and unordered across instances. A publish that
//! fails or times out is logged and forgotten.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::connections::bus::BusMessage;
use crate::core::dispatcher::{Delivery, HubEvent, HubInner};
use crate::core::envelope::{Envelope, Room};

/// Bus channel carrying broadcasts for `room`.
pub fn bus_channel(prefix: &str, room: Room) -> String {
    format!("{}:{}", prefix, room.as_str())
}

/// Bus channels a broadcast addressed to `target` is published on.
pub fn channels_for(prefix: &str, target: Option<Room>) -> Vec<String> {
    match target {
        Some(room) => vec![bus_channel(prefix, room)],
        None => Room::ALL.iter().map(|room| bus_channel(prefix, *room)).collect(),
    }
}

fn room_of_channel(prefix: &str, channel: &str) -> Option<Room> {
    channel
        .strip_prefix(prefix)?
        .strip_prefix(':')?
        .parse()
        .ok()
}

/// Envelope plus the id of the instance that published it.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BusFrame {
    #[serde(flatten)]
    pub(crate) envelope: Envelope,
    #[serde(rename = "_origin", default, skip_serializing_if = "Option::is_none")]
    pub(crate) origin: Option<String>,
}

impl HubInner {
    /// Publishes `envelope` for sibling instances. Failures are warnings.
    pub(crate) async fn publish(&self, envelope: &Envelope) {
        let frame = BusFrame {
            envelope: envelope.clone(),
            origin: Some(self.config.instance_id.clone()),
        };
        let payload = match serde_json::to_vec(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event = %envelope.event, error = %e, "failed to encode bus frame");
                return;
            }
        };

        for channel in channels_for(&self.config.channel_prefix, envelope.room) {
            match tokio::time::timeout(
                self.config.publish_timeout,
                self.bus.publish(&channel, payload.clone()),
            )
            .await
            {
                Ok(Ok(())) => trace!(channel = %channel, event = %envelope.event, "published"),
                Ok(Err(e)) => {
                    warn!(channel = %channel, event = %envelope.event, error = %e, "bus publish failed")
                }
                Err(_) => warn!(channel = %channel, event = %envelope.event, "bus publish timed out"),
            }
        }
    }

    /// Turns one inbound bus message into a relayed delivery.
    async fn relay(&self, msg: BusMessage) {
        let Some(room) = room_of_channel(&self.config.channel_prefix, &msg.channel) else {
            trace!(channel = %msg.channel, "ignoring message on foreign channel");
            return;
        };
        let frame: BusFrame = match serde_json::from_slice(&msg.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "undecodable bus frame");
                return;
            }
        };
        if frame.origin.as_deref() == Some(self.config.instance_id.as_str()) {
            return;
        }
        debug!(channel = %msg.channel, event = %frame.envelope.event, "relaying remote broadcast");
        if let Err(e) = self
            .enqueue(HubEvent::Broadcast {
                envelope: frame.envelope,
                delivery: Delivery::Relayed(room),
            })
            .await
        {
            warn!(channel = %msg.channel, error = %e, "remote broadcast dropped");
        }
    }
}

/// Background subscriber: (re)subscribes to both room channels and relays
/// everything it receives until the hub is cancelled.
pub(crate) async fn run_bus_subscriber(inner: Arc<HubInner>) {
    let prefix = inner.config.channel_prefix.clone();
    let channels = channels_for(&prefix, None);

    loop {
        let subscribed = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            result = inner.bus.subscribe(&channels) => result,
        };

        match subscribed {
            Ok(mut stream) => {
                info!(channels = ?channels, "subscribed to cluster bus");
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => return,
                        msg = stream.next() => match msg {
                            Some(msg) => inner.relay(msg).await,
                            None => break,
                        }
                    }
                }
                warn!("cluster bus subscription ended, fan-out is local only until it recovers");
            }
            Err(e) => warn!(error = %e, "cluster bus subscribe failed"),
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.config.bus_retry_delay) => {}
        }
    }
}
