//! # Channel Router
//!
//! Transport-facing entry points. The websocket layer calls `on_connect`,
//! `on_message` and `on_disconnect` with the room of the endpoint the client
//! dialed; the router validates, parses and turns each call into hub events.
//!
//! Public and admin connections accept different message sets. Anything
//! malformed or out of place is ignored without a reply.

use serde_json::json;
use tracing::{info, trace, warn};

use crate::core::dispatcher::{Hub, HubEvent};
use crate::core::envelope::{
    ClientMessage, ConnectionId, ConnectionSender, Envelope, Handshake, Outbound, Room,
};
use crate::core::error::HubError;

/// Acknowledgement sent to every accepted connection.
pub const GATEWAY_CONNECT: &str = "GATEWAY_CONNECT";
/// Sent to admin connections with a missing or rejected credential.
pub const AUTH_FAILED: &str = "AUTH_FAILED";

impl Hub {
    /// Accepts a new transport connection into `room`.
    ///
    /// Returns `false` when the connection was refused; the refusal frame and
    /// a close request have already been queued on `sender`.
    ///
    /// # Arguments
    /// * `room` - room of the endpoint the client connected to.
    /// * `id` - transport-assigned connection id.
    /// * `handshake` - query parameters and headers of the upgrade request.
    /// * `sender` - outbound half owned by the connection's writer task.
    pub async fn on_connect(
        &self,
        room: Room,
        id: ConnectionId,
        handshake: &Handshake,
        sender: ConnectionSender,
    ) -> bool {
        let session = match room {
            Room::Public => handshake.session_id().map(str::to_string),
            Room::Admin => {
                let accepted = handshake
                    .bearer_token()
                    .is_some_and(|token| (self.inner.validator)(token));
                if !accepted {
                    info!(connection = %id, "admin connection refused");
                    let refusal = Envelope::new(AUTH_FAILED, json!({ "message": "unauthorized" }))
                        .with_code(401);
                    send_direct(&sender, &refusal);
                    let _ = sender.try_send(Outbound::Close);
                    return false;
                }
                None
            }
        };

        let ack = Envelope::new(
            GATEWAY_CONNECT,
            json!({
                "connectionId": id.as_str(),
                "sessionId": session.as_deref().unwrap_or(id.as_str()),
            }),
        );
        send_direct(&sender, &ack);

        if let Err(e) = self.register(id.clone(), room, session, sender).await {
            warn!(connection = %id, room = %room, error = %e, "registration dropped");
        }
        true
    }

    /// Handles one inbound text frame from a connection in `room`.
    pub async fn on_message(&self, room: Room, id: &ConnectionId, raw: &str) {
        let Some(message) = ClientMessage::parse(raw) else {
            trace!(connection = %id, "ignoring unrecognised message");
            return;
        };

        let event = match (room, message) {
            (Room::Public, ClientMessage::Join(topic)) => HubEvent::Join {
                id: id.clone(),
                topic,
            },
            (Room::Public, ClientMessage::Leave(topic)) => HubEvent::Leave {
                id: id.clone(),
                topic,
            },
            (Room::Public, ClientMessage::UpdateSession(session)) => HubEvent::UpdateSession {
                id: id.clone(),
                session,
            },
            (_, ClientMessage::Identify(identity)) => HubEvent::SetIdentity {
                id: id.clone(),
                identity,
            },
            (Room::Admin, ClientMessage::Log { replay_previous }) => {
                self.subscribe_logs(id, replay_previous).await;
                return;
            }
            (Room::Admin, ClientMessage::Unlog) => {
                self.unsubscribe_logs(id);
                return;
            }
            (room, message) => {
                trace!(connection = %id, room = %room, ?message, "message not allowed here");
                return;
            }
        };

        if let Err(e) = self.enqueue(event).await {
            warn!(connection = %id, error = %e, "client message dropped");
        }
    }

    /// Tears a connection down. Log tails stop before the registry entry
    /// goes away.
    pub async fn on_disconnect(&self, room: Room, id: &ConnectionId) {
        if room == Room::Admin {
            self.unsubscribe_logs(id);
        }
        if let Err(e) = self.unregister(id.clone()).await {
            warn!(connection = %id, error = %e, "unregister dropped");
        }
    }

    /// Starts streaming the process log to a registered connection. A second
    /// request while a tail is running is ignored.
    ///
    /// Returns whether a new tail was started.
    pub async fn subscribe_logs(&self, id: &ConnectionId, replay_previous: bool) -> bool {
        let sender = match self.sender_of(id) {
            Some(sender) => Some(sender),
            // the Register event may still be queued
            None => match self.flush().await {
                Ok(()) => self.sender_of(id),
                Err(HubError::Closed) => None,
                Err(e) => {
                    warn!(connection = %id, error = %e, "log tail not started");
                    None
                }
            },
        };
        let Some(sender) = sender else {
            return false;
        };
        self.inner
            .logs
            .subscribe(id.clone(), sender, replay_previous)
            .await
    }

    /// Stops the log tail of `id`, if any.
    pub fn unsubscribe_logs(&self, id: &ConnectionId) -> bool {
        self.inner.logs.unsubscribe(id)
    }

    /// Whether `id` currently tails the process log.
    pub fn is_tailing_logs(&self, id: &ConnectionId) -> bool {
        self.inner.logs.is_subscribed(id)
    }
}

fn send_direct(sender: &ConnectionSender, envelope: &Envelope) {
    match envelope.to_frame() {
        Ok(frame) => {
            let _ = sender.try_send(Outbound::Frame(frame));
        }
        Err(e) => warn!(event = %envelope.event, error = %e, "failed to serialize envelope"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::connections::memory_bus::MemoryBus;
    use crate::core::dispatcher::{HubConfig, HubDeps, LEAVE_PRESENCE, VISITOR_ONLINE};
    use crate::loggers::log_broadcast::LogBroadcaster;

    fn start() -> (Hub, LogBroadcaster) {
        let logs = LogBroadcaster::new();
        let hub = Hub::start(
            HubConfig {
                instance_id: "router-test".into(),
                ..HubConfig::default()
            },
            HubDeps {
                bus: Arc::new(MemoryBus::new()),
                stats: None,
                validator: Arc::new(|token: &str| token == "secret"),
                logs: logs.clone(),
            },
            CancellationToken::new(),
        );
        (hub, logs)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn frame_values(items: &[Outbound]) -> Vec<Value> {
        items
            .iter()
            .filter_map(|item| match item {
                Outbound::Frame(text) => Some(serde_json::from_str(text).unwrap()),
                Outbound::Close => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn public_connect_acknowledges_with_session() {
        let (hub, _) = start();
        let (tx, mut rx) = mpsc::channel(16);
        let handshake = Handshake::new().with_query("sessionId", "tab-group");
        assert!(hub.on_connect(Room::Public, "c1".into(), &handshake, tx).await);
        hub.flush().await.unwrap();

        let frames = frame_values(&drain(&mut rx));
        assert_eq!(frames[0]["event"], GATEWAY_CONNECT);
        assert_eq!(frames[0]["payload"]["connectionId"], "c1");
        assert_eq!(frames[0]["payload"]["sessionId"], "tab-group");
        assert_eq!(frames[1]["event"], VISITOR_ONLINE);
        assert_eq!(hub.session_of(&"c1".into()).as_deref(), Some("tab-group"));
    }

    #[tokio::test]
    async fn admin_without_valid_token_is_closed() {
        let (hub, _) = start();
        for handshake in [
            Handshake::new(),
            Handshake::new().with_query("token", "wrong"),
            Handshake::new().with_header("Authorization", "Bearer nope"),
        ] {
            let (tx, mut rx) = mpsc::channel(16);
            assert!(!hub.on_connect(Room::Admin, "adm".into(), &handshake, tx).await);
            let items = drain(&mut rx);
            let frames = frame_values(&items);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["event"], AUTH_FAILED);
            assert_eq!(frames[0]["code"], 401);
            assert!(matches!(items.last(), Some(Outbound::Close)));
        }
        hub.flush().await.unwrap();
        assert_eq!(hub.client_count(Some(Room::Admin)), 0);
    }

    #[tokio::test]
    async fn admin_with_bearer_header_is_registered() {
        let (hub, _) = start();
        let (tx, mut rx) = mpsc::channel(16);
        let handshake = Handshake::new().with_header("authorization", "bearer secret");
        assert!(hub.on_connect(Room::Admin, "adm".into(), &handshake, tx).await);
        hub.flush().await.unwrap();
        assert_eq!(hub.client_count(Some(Room::Admin)), 1);
        let frames = frame_values(&drain(&mut rx));
        assert_eq!(frames[0]["event"], GATEWAY_CONNECT);
    }

    #[tokio::test]
    async fn disconnect_emits_leave_presence_per_topic() {
        let (hub, _) = start();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(32);
        let a: ConnectionId = "a".into();
        hub.on_connect(Room::Public, a.clone(), &Handshake::new(), tx_a).await;
        hub.on_connect(Room::Public, "b".into(), &Handshake::new(), tx_b).await;
        hub.on_message(Room::Public, &a, r#"{"type":"identify","payload":{"identity":"ann"}}"#)
            .await;
        hub.on_message(Room::Public, &a, r#"{"type":"join","payload":{"roomName":"t1"}}"#)
            .await;
        hub.on_message(Room::Public, &a, r#"{"type":"join","payload":{"roomName":"t2"}}"#)
            .await;
        hub.flush().await.unwrap();
        assert_eq!(hub.topic_count("t1"), 1);
        drain(&mut rx_b);

        hub.on_disconnect(Room::Public, &a).await;
        hub.flush().await.unwrap();

        let frames = frame_values(&drain(&mut rx_b));
        let leaves: Vec<&Value> = frames
            .iter()
            .filter(|f| f["event"] == LEAVE_PRESENCE)
            .collect();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0]["payload"], json!({"identity": "ann", "roomName": "t1"}));
        assert_eq!(leaves[1]["payload"]["roomName"], "t2");
        assert_eq!(hub.topic_count("t1"), 0);
        assert!(!hub.is_registered(&a));
    }

    #[tokio::test]
    async fn wrong_room_and_malformed_messages_are_ignored() {
        let (hub, _) = start();
        let (tx, _rx) = mpsc::channel(16);
        let p: ConnectionId = "p".into();
        hub.on_connect(Room::Public, p.clone(), &Handshake::new(), tx).await;
        hub.on_message(Room::Public, &p, r#"{"type":"log","payload":{"prevLog":true}}"#)
            .await;
        hub.on_message(Room::Public, &p, "not json").await;
        hub.on_message(Room::Public, &p, r#"{"type":"join","payload":{}}"#).await;
        hub.flush().await.unwrap();
        assert!(!hub.is_tailing_logs(&p));
        assert_eq!(hub.topic_count(""), 0);
    }

    #[tokio::test]
    async fn admin_log_tail_lifecycle() {
        let (hub, logs) = start();
        let (tx, mut rx) = mpsc::channel(16);
        let adm: ConnectionId = "adm".into();
        let handshake = Handshake::new().with_query("token", "secret");
        hub.on_connect(Room::Admin, adm.clone(), &handshake, tx).await;
        hub.on_message(Room::Admin, &adm, r#"{"type":"log","payload":{"prevLog":false}}"#)
            .await;
        assert!(hub.is_tailing_logs(&adm));
        drain(&mut rx);

        logs.publish(b"hello\n");
        let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Outbound::Frame(text) = item else {
            panic!("expected a frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "STDOUT");
        assert_eq!(value["payload"], "hello\n");

        hub.on_message(Room::Admin, &adm, r#"{"type":"unlog"}"#).await;
        assert!(!hub.is_tailing_logs(&adm));

        hub.on_message(Room::Admin, &adm, r#"{"type":"log","payload":{}}"#).await;
        assert!(hub.is_tailing_logs(&adm));
        hub.on_disconnect(Room::Admin, &adm).await;
        assert!(!hub.is_tailing_logs(&adm));
    }
}
