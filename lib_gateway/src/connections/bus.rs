use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::core::error::HubError;

/// One message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Stream of inbound bus messages. Ends when the subscription is lost.
pub type BusStream = BoxStream<'static, BusMessage>;

/// A distributed publish/subscribe backbone shared by every gateway instance.
///
/// Delivery is fire-and-forget: implementations never retry a publish.
pub trait ClusterBus: Send + Sync + 'static {
    /// Publish `payload` on `channel`.
    fn publish<'a>(&'a self, channel: &'a str, payload: Vec<u8>)
        -> BoxFuture<'a, Result<(), HubError>>;

    /// Open a subscription to every channel in `channels`.
    fn subscribe<'a>(&'a self, channels: &'a [String]) -> BoxFuture<'a, Result<BusStream, HubError>>;
}
