//! # Redis Backends
//!
//! Redis serves two roles for the gateway fleet:
//!
//! - **`RedisBus`**: pub/sub transport for cross-instance broadcast fan-out.
//!   Publishes go through a shared `ConnectionManager` (auto-reconnecting);
//!   every `subscribe` opens its own dedicated pub/sub connection.
//! - **`RedisStatsStore`**: daily online counters shared by all instances.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};

use crate::connections::bus::{BusMessage, BusStream, ClusterBus};
use crate::core::error::HubError;
use crate::core::stats::StatsStore;

/// Compare-and-set-if-greater on a plain string counter.
const MAX_ONLINE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local candidate = tonumber(ARGV[1])
if candidate > current then
    redis.call('SET', KEYS[1], ARGV[1])
end
return 0
"#;

/// Redis pub/sub implementation of `ClusterBus`.
pub struct RedisBus {
    /// The internal Redis client, used to open pub/sub connections.
    client: Client,
    /// Multiplexed connection used for PUBLISH.
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Connects to Redis.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

impl ClusterBus for RedisBus {
    fn publish<'a>(
        &'a self,
        channel: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let mut conn = self.publisher.clone();
            let _: () = conn.publish(channel, payload).await?;
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        channels: &'a [String],
    ) -> BoxFuture<'a, Result<BusStream, HubError>> {
        Box::pin(async move {
            let mut pubsub = self.client.get_async_pubsub().await?;
            for channel in channels {
                pubsub.subscribe(channel.as_str()).await?;
            }
            let stream = pubsub.into_on_message().map(|msg| BusMessage {
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            });
            Ok(stream.boxed())
        })
    }
}

/// Redis implementation of `StatsStore`.
///
/// Keys: `{prefix}:max_online:{day}` and `{prefix}:total_opens:{day}`.
pub struct RedisStatsStore {
    conn: ConnectionManager,
    prefix: String,
    max_online: Script,
}

impl RedisStatsStore {
    /// Connects to Redis and namespaces keys under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            max_online: Script::new(MAX_ONLINE_SCRIPT),
        })
    }

    fn key(&self, counter: &str, day: &str) -> String {
        format!("{}:{}:{}", self.prefix, counter, day)
    }
}

impl StatsStore for RedisStatsStore {
    fn record_max_online<'a>(
        &'a self,
        day: &'a str,
        online: usize,
    ) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let key = self.key("max_online", day);
            let _: () = self
                .max_online
                .key(key)
                .arg(online as u64)
                .invoke_async(&mut conn)
                .await?;
            Ok(())
        })
    }

    fn incr_total_opens<'a>(&'a self, day: &'a str) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = conn.incr(self.key("total_opens", day), 1u64).await?;
            Ok(())
        })
    }
}
