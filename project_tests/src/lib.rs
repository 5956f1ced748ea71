//! # Gateway Test Harness
//!
//! Helpers shared by the scenario tests under `tests/`: a `Node` is one hub
//! instance wired to a shared in-process bus, and a `Client` is the receiving
//! end of one simulated socket.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lib_gateway::connections::MemoryBus;
use lib_gateway::core::StatsStore;
use lib_gateway::loggers::LogBroadcaster;
use lib_gateway::{ConnectionId, Handshake, Hub, HubConfig, HubDeps, Outbound, Room};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Token accepted by every test node's admin validator.
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// One hub instance.
pub struct Node {
    pub hub: Hub,
    pub logs: LogBroadcaster,
    pub cancel: CancellationToken,
}

/// Builder for a `Node`.
pub struct NodeBuilder {
    config: HubConfig,
    bus: MemoryBus,
    stats: Option<Arc<dyn StatsStore>>,
    log_epoch: Option<SystemTime>,
}

impl NodeBuilder {
    pub fn new(instance: &str, bus: &MemoryBus) -> Self {
        Self {
            config: HubConfig {
                instance_id: instance.to_string(),
                channel_prefix: "it".to_string(),
                bus_retry_delay: Duration::from_millis(20),
                ..HubConfig::default()
            },
            bus: bus.clone(),
            stats: None,
            log_epoch: None,
        }
    }

    pub fn stats(mut self, store: Arc<dyn StatsStore>) -> Self {
        self.stats = Some(store);
        self
    }

    pub fn log_dir(mut self, dir: &std::path::Path, since: SystemTime) -> Self {
        self.config.log_dir = Some(dir.to_path_buf());
        self.log_epoch = Some(since);
        self
    }

    pub fn chunk_bytes(mut self, bytes: usize) -> Self {
        self.config.log_chunk_bytes = bytes;
        self
    }

    pub fn start(self) -> Node {
        let logs = LogBroadcaster::new();
        let cancel = CancellationToken::new();
        let mut hub = Hub::start(
            self.config,
            HubDeps {
                bus: Arc::new(self.bus),
                stats: self.stats,
                validator: Arc::new(|token: &str| token == ADMIN_TOKEN),
                logs: logs.clone(),
            },
            cancel.clone(),
        );
        if let Some(since) = self.log_epoch {
            hub = hub.with_log_epoch(since);
        }
        Node { hub, logs, cancel }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Receiving end of a simulated socket.
pub struct Client {
    pub id: ConnectionId,
    pub room: Room,
    rx: mpsc::Receiver<Outbound>,
}

impl Client {
    /// Every frame received so far, decoded. Stops at a close request.
    pub fn frames(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(text)) = self.rx.try_recv() {
            out.push(serde_json::from_str(&text).expect("frame is JSON"));
        }
        out
    }

    /// Frames received so far with the given event name.
    pub fn events_named(&mut self, event: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["event"] == event)
            .collect()
    }

    /// Waits for the next frame or close request.
    pub async fn next(&mut self) -> Option<Outbound> {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits for the next frame and decodes it.
    pub async fn next_frame(&mut self) -> Value {
        match self.next().await {
            Some(Outbound::Frame(text)) => serde_json::from_str(&text).expect("frame is JSON"),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    /// Waits for the next frame named `event`, skipping any others.
    pub async fn next_named(&mut self, event: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["event"] == event {
                return frame;
            }
        }
    }
}

impl Node {
    /// Opens a socket on `room` and returns whether it was accepted.
    pub async fn connect(&self, room: Room, id: &str, handshake: Handshake) -> (Client, bool) {
        let (tx, rx) = mpsc::channel(256);
        let id = ConnectionId::new(id);
        let accepted = self.hub.on_connect(room, id.clone(), &handshake, tx).await;
        self.hub.flush().await.expect("hub is running");
        (Client { id, room, rx }, accepted)
    }

    pub async fn connect_public(&self, id: &str, session: Option<&str>) -> Client {
        let handshake = match session {
            Some(session) => Handshake::new().with_query("sessionId", session),
            None => Handshake::new(),
        };
        self.connect(Room::Public, id, handshake).await.0
    }

    pub async fn connect_admin(&self, id: &str) -> Client {
        let handshake = Handshake::new().with_query("token", ADMIN_TOKEN);
        let (client, accepted) = self.connect(Room::Admin, id, handshake).await;
        assert!(accepted, "admin with a valid token is accepted");
        client
    }

    pub async fn send(&self, client: &Client, raw: &str) {
        self.hub.on_message(client.room, &client.id, raw).await;
    }

    pub async fn disconnect(&self, client: &Client) {
        self.hub.on_disconnect(client.room, &client.id).await;
    }

    pub async fn flush(&self) {
        self.hub.flush().await.expect("hub is running");
    }
}

/// Waits until `n` subscribers are attached to the bus.
pub async fn wait_for_subscribers(bus: &MemoryBus, n: usize) {
    for _ in 0..200 {
        if bus.subscriber_count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("bus never reached {n} subscribers");
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
