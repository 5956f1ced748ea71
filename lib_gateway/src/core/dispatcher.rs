//! # Hub and Dispatch Loop
//!
//! The `Hub` is the gateway's single point of truth for live connections.
//!
//! ## Core Design Principles:
//!
//! 1.  **One ordered queue**: every mutation (register, unregister, join,
//!     leave, session/identity updates) and every broadcast is an event on one
//!     bounded FIFO queue drained by a single dispatch task. Events of all kinds
//!     are therefore applied on this instance in exactly the order they were
//!     enqueued.
//!
//! 2.  **Lock for reads, loop for order**: the `Registry` sits behind one
//!     `RwLock`. The loop takes the write side for each mutation; request
//!     handlers read counts through the read side at any time. Reads are
//!     linearizable against the lock and may trail events still in the queue.
//!
//! 3.  **Zero-copy fan-out**: a broadcast is serialized once and every
//!     recipient receives a clone of the same `Arc<str>`.
//!
//! 4.  **Bounded producers**: enqueueing waits at most `enqueue_timeout`;
//!     after that the event is dropped with a warning rather than stalling the
//!     caller forever.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connections::bus::ClusterBus;
use crate::core::envelope::{ConnectionId, ConnectionSender, Envelope, Outbound, Room};
use crate::core::error::HubError;
use crate::core::log_stream::LogStreams;
use crate::core::registry::{PresenceDelta, Registry};
use crate::core::stats::{spawn_online_stats, StatsStore};
use crate::loggers::log_broadcast::LogBroadcaster;

/// Presence event: a new distinct public session appeared.
pub const VISITOR_ONLINE: &str = "visitor-online";
/// Presence event: the last connection of a public session went away.
pub const VISITOR_OFFLINE: &str = "visitor-offline";
/// Presence event: a connection left a public sub-topic.
pub const LEAVE_PRESENCE: &str = "leave-presence";

/// Capability check for admin credentials.
pub type TokenValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// # Hub Configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identifies this instance on the cluster bus.
    pub instance_id: String,
    /// Bus channels are `{channel_prefix}:public` and `{channel_prefix}:admin`.
    pub channel_prefix: String,
    /// Capacity of the dispatch queue.
    pub queue_capacity: usize,
    /// How long producers wait on a full dispatch queue.
    pub enqueue_timeout: Duration,
    /// Upper bound for one bus publish.
    pub publish_timeout: Duration,
    /// Upper bound for each statistics update.
    pub stats_timeout: Duration,
    /// Pause before re-subscribing to the bus after a failure.
    pub bus_retry_delay: Duration,
    /// Directory of the daily rolling log files replayed to admin tails.
    pub log_dir: Option<PathBuf>,
    /// Frames buffered per admin log tail.
    pub log_buffer_frames: usize,
    /// Read size when replaying on-disk log segments.
    pub log_chunk_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            channel_prefix: "gateway".to_string(),
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(2),
            stats_timeout: Duration::from_secs(2),
            bus_retry_delay: Duration::from_secs(3),
            log_dir: None,
            log_buffer_frames: 512,
            log_chunk_bytes: 32 * 1024,
        }
    }
}

/// External collaborators the hub is wired to.
pub struct HubDeps {
    /// Cluster fan-out bus.
    pub bus: Arc<dyn ClusterBus>,
    /// Daily statistics store; `None` disables statistics.
    pub stats: Option<Arc<dyn StatsStore>>,
    /// Admin credential check.
    pub validator: TokenValidator,
    /// Process log tee used for admin log tails.
    pub logs: LogBroadcaster,
}

/// Online counts as served by the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Distinct public sessions.
    pub public: usize,
    /// Admin connections.
    pub admin: usize,
    /// All live connections.
    pub total: usize,
}

/// Where a broadcast came from, which decides whether it is re-published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Originated on this instance: deliver locally, then publish.
    Local,
    /// Relayed from a sibling via the bus channel of this room: deliver to
    /// that room only, never publish again.
    Relayed(Room),
}

pub(crate) enum HubEvent {
    Register {
        id: ConnectionId,
        room: Room,
        session: Option<String>,
        sender: ConnectionSender,
    },
    Unregister {
        id: ConnectionId,
    },
    Join {
        id: ConnectionId,
        topic: String,
    },
    Leave {
        id: ConnectionId,
        topic: String,
    },
    UpdateSession {
        id: ConnectionId,
        session: String,
    },
    SetIdentity {
        id: ConnectionId,
        identity: String,
    },
    Broadcast {
        envelope: Envelope,
        delivery: Delivery,
    },
    Flush(oneshot::Sender<()>),
}

pub(crate) struct HubInner {
    pub(crate) config: HubConfig,
    registry: RwLock<Registry>,
    events: mpsc::Sender<HubEvent>,
    pub(crate) bus: Arc<dyn ClusterBus>,
    stats: Option<Arc<dyn StatsStore>>,
    pub(crate) validator: TokenValidator,
    pub(crate) logs: Arc<LogStreams>,
    pub(crate) cancel: CancellationToken,
}

/// # Hub
///
/// Cheap to clone; every clone talks to the same dispatch loop.
#[derive(Clone)]
pub struct Hub {
    pub(crate) inner: Arc<HubInner>,
}

impl Hub {
    /// Builds the hub and spawns its dispatch loop and bus subscriber.
    ///
    /// Both tasks run until `cancel` fires; queued events are then dropped.
    /// Must be called from within a tokio runtime.
    pub fn start(config: HubConfig, deps: HubDeps, cancel: CancellationToken) -> Hub {
        let (events, rx) = mpsc::channel(config.queue_capacity.max(1));
        let logs = Arc::new(LogStreams::new(
            deps.logs,
            config.log_dir.clone(),
            SystemTime::now(),
            config.log_buffer_frames,
            config.log_chunk_bytes,
        ));

        let inner = Arc::new(HubInner {
            config,
            registry: RwLock::new(Registry::new()),
            events,
            bus: deps.bus,
            stats: deps.stats,
            validator: deps.validator,
            logs,
            cancel,
        });

        info!(
            instance = %inner.config.instance_id,
            prefix = %inner.config.channel_prefix,
            "gateway hub starting"
        );
        tokio::spawn(run_dispatch_loop(Arc::clone(&inner), rx));
        tokio::spawn(crate::core::bridge::run_bus_subscriber(Arc::clone(&inner)));

        Hub { inner }
    }

    /// Replaces the log replay start time. Segments modified before it are
    /// not replayed.
    pub fn with_log_epoch(self, started_at: SystemTime) -> Hub {
        self.inner.logs.set_started_at(started_at);
        self
    }

    /// This instance's bus identity.
    pub fn instance_id(&self) -> &str {
        &self.inner.config.instance_id
    }

    /// Registers (or re-registers) a connection. See `Registry::register`.
    pub async fn register(
        &self,
        id: ConnectionId,
        room: Room,
        session: Option<String>,
        sender: ConnectionSender,
    ) -> Result<(), HubError> {
        self.inner
            .enqueue(HubEvent::Register {
                id,
                room,
                session,
                sender,
            })
            .await
    }

    /// Unregisters a connection. Unknown connections are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.inner.enqueue(HubEvent::Unregister { id }).await
    }

    /// Queues `event` for every connection in `room` (`None` for all rooms)
    /// on this instance and on every sibling instance.
    ///
    /// Never fails from the caller's point of view: an event that cannot be
    /// queued in time is dropped with a warning.
    pub async fn broadcast(&self, event: impl Into<String>, payload: Value, room: Option<Room>) {
        let envelope = Envelope::new(event, payload).to_room(room);
        let event_name = envelope.event.clone();
        if let Err(e) = self
            .inner
            .enqueue(HubEvent::Broadcast {
                envelope,
                delivery: Delivery::Local,
            })
            .await
        {
            warn!(event = %event_name, error = %e, "broadcast dropped");
        }
    }

    /// `broadcast` to the admin channel.
    pub async fn broadcast_admin(&self, event: impl Into<String>, payload: Value) {
        self.broadcast(event, payload, Some(Room::Admin)).await;
    }

    /// `broadcast` to the public channel.
    pub async fn broadcast_public(&self, event: impl Into<String>, payload: Value) {
        self.broadcast(event, payload, Some(Room::Public)).await;
    }

    /// Queues `event` for the members of public sub-topic `topic` on this
    /// instance and on every sibling instance. Connections that never joined
    /// the topic do not receive it.
    pub async fn broadcast_topic(
        &self,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) {
        let envelope = Envelope::new(event, payload).to_topic(topic);
        let event_name = envelope.event.clone();
        if let Err(e) = self
            .inner
            .enqueue(HubEvent::Broadcast {
                envelope,
                delivery: Delivery::Local,
            })
            .await
        {
            warn!(event = %event_name, error = %e, "topic broadcast dropped");
        }
    }

    /// `None`: all live connections. `Public`: distinct sessions.
    /// `Admin`: admin connections.
    pub fn client_count(&self, room: Option<Room>) -> usize {
        self.inner.read_registry().client_count(room)
    }

    /// `client_count` keyed by wire name: `""` counts every connection, an
    /// unknown room counts nothing.
    pub fn client_count_named(&self, room: &str) -> usize {
        match room.trim() {
            "" => self.client_count(None),
            name => name
                .parse::<Room>()
                .map_or(0, |room| self.client_count(Some(room))),
        }
    }

    /// Counts for the stats endpoint.
    pub fn stats(&self) -> HubStats {
        let registry = self.inner.read_registry();
        HubStats {
            public: registry.client_count(Some(Room::Public)),
            admin: registry.client_count(Some(Room::Admin)),
            total: registry.client_count(None),
        }
    }

    /// Connections joined to a public sub-topic.
    pub fn topic_count(&self, topic: &str) -> usize {
        self.inner.read_registry().topic_count(topic)
    }

    /// Whether `id` is currently in the registry.
    pub fn is_registered(&self, id: &ConnectionId) -> bool {
        self.inner.read_registry().contains(id)
    }

    /// Effective session of a registered connection.
    pub fn session_of(&self, id: &ConnectionId) -> Option<String> {
        self.inner.read_registry().session_of(id).map(str::to_string)
    }

    /// Waits until every event queued before this call has been applied.
    pub async fn flush(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(HubEvent::Flush(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub(crate) async fn enqueue(&self, event: HubEvent) -> Result<(), HubError> {
        self.inner.enqueue(event).await
    }

    pub(crate) fn sender_of(&self, id: &ConnectionId) -> Option<ConnectionSender> {
        self.inner.read_registry().sender_of(id)
    }
}

impl HubInner {
    pub(crate) fn read_registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn enqueue(&self, event: HubEvent) -> Result<(), HubError> {
        if self.cancel.is_cancelled() {
            return Err(HubError::Closed);
        }
        match self
            .events
            .send_timeout(event, self.config.enqueue_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(HubError::QueueTimeout(self.config.enqueue_timeout))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(HubError::Closed),
        }
    }

    /// Applies one event. Lock guards never live across an `.await`.
    async fn apply(&self, event: HubEvent) {
        match event {
            HubEvent::Register {
                id,
                room,
                session,
                sender,
            } => {
                let outcome = self
                    .write_registry()
                    .register(&id, room, session.as_deref(), sender);
                if !outcome.changed {
                    return;
                }
                debug!(connection = %id, room = %room, "connection registered");
                for topic in &outcome.left_topics {
                    self.emit_leave_presence(&outcome.identity, topic).await;
                }
                self.announce_presence(&outcome.presence).await;
                if outcome.entered_public {
                    if let Some(store) = &self.stats {
                        spawn_online_stats(
                            Arc::clone(store),
                            outcome.presence.after,
                            self.config.stats_timeout,
                        );
                    }
                }
            }
            HubEvent::Unregister { id } => {
                let departure = self.write_registry().unregister(&id);
                let Some(departure) = departure else {
                    return;
                };
                debug!(connection = %id, room = %departure.room, "connection unregistered");
                for topic in &departure.topics {
                    self.emit_leave_presence(&departure.identity, topic).await;
                }
                self.announce_presence(&departure.presence).await;
            }
            HubEvent::Join { id, topic } => {
                if self.write_registry().join(&id, &topic) {
                    debug!(connection = %id, topic = %topic, "joined sub-topic");
                }
            }
            HubEvent::Leave { id, topic } => {
                let identity = self.write_registry().leave(&id, &topic);
                if let Some(identity) = identity {
                    self.emit_leave_presence(&identity, &topic).await;
                }
            }
            HubEvent::UpdateSession { id, session } => {
                let outcome = self.write_registry().rebind_session(&id, &session);
                if let Some(outcome) = outcome.filter(|o| o.changed) {
                    debug!(connection = %id, session = %session, "session re-bound");
                    // a re-bind reports the new count as online either way
                    if outcome.presence.before != outcome.presence.after {
                        let envelope =
                            Envelope::new(VISITOR_ONLINE, json!({ "online": outcome.presence.after }))
                                .to_room(Some(Room::Public));
                        self.emit(&envelope).await;
                    }
                }
            }
            HubEvent::SetIdentity { id, identity } => {
                self.write_registry().set_identity(&id, &identity);
            }
            HubEvent::Broadcast { envelope, delivery } => match delivery {
                Delivery::Local => self.emit(&envelope).await,
                Delivery::Relayed(room) => self.deliver_local(&envelope, Some(room)),
            },
            HubEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Local delivery followed by bus publish.
    pub(crate) async fn emit(&self, envelope: &Envelope) {
        self.deliver_local(envelope, envelope.room);
        self.publish(envelope).await;
    }

    /// Hands the serialized envelope to every local connection in `target`.
    pub(crate) fn deliver_local(&self, envelope: &Envelope, target: Option<Room>) {
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = %envelope.event, error = %e, "failed to serialize envelope");
                return;
            }
        };
        let senders = {
            let registry = self.read_registry();
            match envelope.topic.as_deref() {
                Some(topic) if target.map_or(true, |room| room == Room::Public) => {
                    registry.topic_senders(topic)
                }
                Some(_) => Vec::new(),
                None => registry.senders(target),
            }
        };
        for sender in senders {
            if let Err(mpsc::error::TrySendError::Full(_)) =
                sender.try_send(Outbound::Frame(Arc::clone(&frame)))
            {
                debug!(event = %envelope.event, "outbound buffer full, frame dropped");
            }
        }
    }

    async fn announce_presence(&self, presence: &PresenceDelta) {
        let envelope = if presence.went_online() {
            Envelope::new(VISITOR_ONLINE, json!({ "online": presence.after }))
        } else if presence.went_offline() {
            Envelope::new(
                VISITOR_OFFLINE,
                json!({ "online": presence.after, "sessionId": presence.departed }),
            )
        } else {
            return;
        };
        self.emit(&envelope.to_room(Some(Room::Public))).await;
    }

    async fn emit_leave_presence(&self, identity: &str, topic: &str) {
        let envelope = Envelope::new(
            LEAVE_PRESENCE,
            json!({ "identity": identity, "roomName": topic }),
        )
        .to_room(Some(Room::Public));
        self.emit(&envelope).await;
    }
}

async fn run_dispatch_loop(inner: Arc<HubInner>, mut rx: mpsc::Receiver<HubEvent>) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {
                info!("dispatch loop cancelled, dropping {} queued events", rx.len());
                break;
            }
            event = rx.recv() => match event {
                Some(event) => inner.apply(event).await,
                None => break,
            }
        }
    }
    inner.logs.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory_bus::MemoryBus;
    use crate::connections::bus::{BusMessage, BusStream};
    use crate::core::stats::{day_key, MemoryStatsStore};
    use futures_util::future::BoxFuture;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Max-online never answers; total-opens always fails.
    #[derive(Default)]
    struct WedgedStats {
        opens_attempted: AtomicUsize,
    }

    impl StatsStore for WedgedStats {
        fn record_max_online<'a>(
            &'a self,
            _day: &'a str,
            _online: usize,
        ) -> BoxFuture<'a, Result<(), HubError>> {
            Box::pin(futures_util::future::pending::<Result<(), HubError>>())
        }

        fn incr_total_opens<'a>(&'a self, _day: &'a str) -> BoxFuture<'a, Result<(), HubError>> {
            Box::pin(async move {
                self.opens_attempted.fetch_add(1, Ordering::SeqCst);
                Err(HubError::BusUnavailable("stats backend down".into()))
            })
        }
    }

    /// Publishes never complete, which parks the dispatch loop.
    #[derive(Default)]
    struct StalledBus {
        publishing: Notify,
    }

    impl ClusterBus for StalledBus {
        fn publish<'a>(
            &'a self,
            _channel: &'a str,
            _payload: Vec<u8>,
        ) -> BoxFuture<'a, Result<(), HubError>> {
            Box::pin(async move {
                self.publishing.notify_one();
                futures_util::future::pending::<Result<(), HubError>>().await
            })
        }

        fn subscribe<'a>(
            &'a self,
            _channels: &'a [String],
        ) -> BoxFuture<'a, Result<BusStream, HubError>> {
            Box::pin(async move { Ok(futures_util::stream::pending::<BusMessage>().boxed()) })
        }
    }

    fn start(bus: MemoryBus, stats: Option<Arc<dyn StatsStore>>) -> Hub {
        Hub::start(
            HubConfig {
                instance_id: "test".into(),
                bus_retry_delay: Duration::from_millis(20),
                ..HubConfig::default()
            },
            HubDeps {
                bus: Arc::new(bus),
                stats,
                validator: Arc::new(|_: &str| false),
                logs: LogBroadcaster::new(),
            },
            CancellationToken::new(),
        )
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn events(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["event"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn presence_fires_once_per_session() {
        let hub = start(MemoryBus::new(), None);
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);

        hub.register("a".into(), Room::Public, Some("s1".into()), tx_a).await.unwrap();
        hub.register("b".into(), Room::Public, Some("s1".into()), tx_b).await.unwrap();
        hub.flush().await.unwrap();

        let seen = frames(&mut rx_a);
        assert_eq!(events(&seen), vec![VISITOR_ONLINE]);
        assert_eq!(seen[0]["payload"]["online"], 1);
        assert!(frames(&mut rx_b).is_empty());

        assert_eq!(hub.client_count(Some(Room::Public)), 1);
        assert_eq!(hub.client_count(None), 2);

        hub.unregister("a".into()).await.unwrap();
        hub.flush().await.unwrap();
        assert!(frames(&mut rx_b).is_empty());
        assert_eq!(hub.client_count(Some(Room::Public)), 1);

        let (tx_c, mut rx_c) = mpsc::channel(16);
        hub.register("c".into(), Room::Public, None, tx_c).await.unwrap();
        hub.unregister("b".into()).await.unwrap();
        hub.flush().await.unwrap();
        let seen = frames(&mut rx_c);
        assert_eq!(events(&seen), vec![VISITOR_ONLINE, VISITOR_OFFLINE]);
        assert_eq!(seen[1]["payload"]["online"], 1);
        assert_eq!(seen[1]["payload"]["sessionId"], "s1");
    }

    #[tokio::test]
    async fn broadcast_targets_rooms() {
        let bus = MemoryBus::new();
        bus.set_offline(true);
        let hub = start(bus, None);
        let (tx_p, mut rx_p) = mpsc::channel(16);
        let (tx_a, mut rx_a) = mpsc::channel(16);
        hub.register("p".into(), Room::Public, None, tx_p).await.unwrap();
        hub.register("a".into(), Room::Admin, None, tx_a).await.unwrap();
        hub.flush().await.unwrap();
        frames(&mut rx_p);

        hub.broadcast_admin("POST_CREATE", json!({"id": 1})).await;
        hub.broadcast_public("NOTE_CREATE", json!({"id": 2})).await;
        hub.broadcast("SITE_UPDATE", Value::Null, None).await;
        hub.flush().await.unwrap();

        assert_eq!(events(&frames(&mut rx_a)), vec!["POST_CREATE", "SITE_UPDATE"]);
        assert_eq!(events(&frames(&mut rx_p)), vec!["NOTE_CREATE", "SITE_UPDATE"]);
    }

    #[tokio::test]
    async fn topic_broadcast_reaches_members_only() {
        let hub = start(MemoryBus::new(), None);
        let (tx_in, mut rx_in) = mpsc::channel(16);
        let (tx_out, mut rx_out) = mpsc::channel(16);
        let (tx_adm, mut rx_adm) = mpsc::channel(16);
        hub.register("in".into(), Room::Public, Some("s1".into()), tx_in).await.unwrap();
        hub.register("out".into(), Room::Public, Some("s2".into()), tx_out).await.unwrap();
        hub.register("adm".into(), Room::Admin, None, tx_adm).await.unwrap();
        hub.enqueue(HubEvent::Join { id: "in".into(), topic: "article-7".into() })
            .await
            .unwrap();
        hub.flush().await.unwrap();
        frames(&mut rx_in);
        frames(&mut rx_out);

        hub.broadcast_topic("article-7", "COMMENT_CREATE", json!({"id": 3})).await;
        hub.broadcast_topic("article-8", "COMMENT_CREATE", json!({"id": 4})).await;
        hub.flush().await.unwrap();

        let seen = frames(&mut rx_in);
        assert_eq!(events(&seen), vec!["COMMENT_CREATE"]);
        assert_eq!(seen[0]["topic"], "article-7");
        assert_eq!(seen[0]["payload"]["id"], 3);
        assert!(frames(&mut rx_out).is_empty());
        assert!(frames(&mut rx_adm).is_empty());
    }

    #[tokio::test]
    async fn stats_shape() {
        let hub = start(MemoryBus::new(), None);
        let (tx, _rx) = mpsc::channel(16);
        hub.register("p1".into(), Room::Public, Some("s".into()), tx.clone()).await.unwrap();
        hub.register("p2".into(), Room::Public, Some("s".into()), tx.clone()).await.unwrap();
        hub.register("a1".into(), Room::Admin, None, tx).await.unwrap();
        hub.flush().await.unwrap();
        assert_eq!(hub.stats(), HubStats { public: 1, admin: 1, total: 3 });
        assert_eq!(hub.client_count_named(""), 3);
        assert_eq!(hub.client_count_named("public"), 1);
        assert_eq!(hub.client_count_named("admin"), 1);
        assert_eq!(hub.client_count_named("lobby"), 0);
        assert_eq!(
            serde_json::to_value(hub.stats()).unwrap(),
            json!({"public": 1, "admin": 1, "total": 3})
        );
    }

    #[tokio::test]
    async fn public_entry_updates_daily_stats() {
        let store = Arc::new(MemoryStatsStore::new());
        let hub = start(MemoryBus::new(), Some(store.clone() as Arc<dyn StatsStore>));
        let (tx, _rx) = mpsc::channel(16);
        hub.register("p1".into(), Room::Public, Some("s1".into()), tx.clone()).await.unwrap();
        hub.register("p2".into(), Room::Public, Some("s2".into()), tx.clone()).await.unwrap();
        hub.register("p3".into(), Room::Public, Some("s2".into()), tx.clone()).await.unwrap();
        hub.register("adm".into(), Room::Admin, None, tx).await.unwrap();
        hub.flush().await.unwrap();

        let day = day_key(chrono::Local::now());
        for _ in 0..100 {
            if store.total_opens(&day) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.total_opens(&day), 3);
        assert_eq!(store.max_online(&day), 2);
    }

    #[tokio::test]
    async fn cancelled_hub_refuses_events() {
        let cancel = CancellationToken::new();
        let hub = Hub::start(
            HubConfig::default(),
            HubDeps {
                bus: Arc::new(MemoryBus::new()),
                stats: None,
                validator: Arc::new(|_: &str| true),
                logs: LogBroadcaster::new(),
            },
            cancel.clone(),
        );
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            hub.register("x".into(), Room::Public, None, tx).await,
            Err(HubError::Closed)
        ));
        assert_eq!(hub.client_count(None), 0);
    }

    #[tokio::test]
    async fn failing_stats_store_never_blocks_registration() {
        let store = Arc::new(WedgedStats::default());
        let hub = Hub::start(
            HubConfig {
                instance_id: "test".into(),
                stats_timeout: Duration::from_millis(50),
                ..HubConfig::default()
            },
            HubDeps {
                bus: Arc::new(MemoryBus::new()),
                stats: Some(store.clone() as Arc<dyn StatsStore>),
                validator: Arc::new(|_: &str| false),
                logs: LogBroadcaster::new(),
            },
            CancellationToken::new(),
        );
        let (tx, _rx) = mpsc::channel(64);
        for n in 0..20 {
            hub.register(format!("p{n}").as_str().into(), Room::Public, None, tx.clone())
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_millis(500), hub.flush())
            .await
            .expect("registration is not held up by statistics")
            .unwrap();
        assert_eq!(hub.client_count(Some(Room::Public)), 20);

        // each update gives up on max-online, then still tries total-opens
        for _ in 0..100 {
            if store.opens_attempted.load(Ordering::SeqCst) == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.opens_attempted.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn full_queue_drops_event_after_enqueue_timeout() {
        let bus = Arc::new(StalledBus::default());
        let hub = Hub::start(
            HubConfig {
                instance_id: "test".into(),
                queue_capacity: 1,
                enqueue_timeout: Duration::from_millis(20),
                publish_timeout: Duration::from_secs(30),
                ..HubConfig::default()
            },
            HubDeps {
                bus: bus.clone(),
                stats: None,
                validator: Arc::new(|_: &str| false),
                logs: LogBroadcaster::new(),
            },
            CancellationToken::new(),
        );

        hub.broadcast_public("NOTE_CREATE", Value::Null).await;
        tokio::time::timeout(Duration::from_secs(2), bus.publishing.notified())
            .await
            .expect("dispatch loop reached the bus");

        let (tx, _rx) = mpsc::channel(4);
        hub.register("queued".into(), Room::Admin, None, tx.clone()).await.unwrap();
        let dropped = hub.register("dropped".into(), Room::Admin, None, tx).await;
        match dropped {
            Err(HubError::QueueTimeout(waited)) => assert_eq!(waited, Duration::from_millis(20)),
            other => panic!("expected a queue timeout, got {other:?}"),
        }
        assert!(!hub.is_registered(&ConnectionId::new("dropped")));
    }
}
