use std::fs;
use std::time::{Duration, SystemTime};

use lib_gateway::connections::MemoryBus;
use lib_gateway::{Handshake, Outbound, Room};
use project_tests::NodeBuilder;
use tempfile::tempdir;

#[tokio::test]
async fn admin_without_token_is_refused() {
    let bus = MemoryBus::new();
    let node = NodeBuilder::new("solo", &bus).start();

    let (mut client, accepted) = node.connect(Room::Admin, "adm", Handshake::new()).await;
    assert!(!accepted);

    let refused = client.next_frame().await;
    assert_eq!(refused["event"], "AUTH_FAILED");
    assert_eq!(refused["code"], 401);
    assert_eq!(client.next().await, Some(Outbound::Close));
    assert_eq!(node.hub.client_count(Some(Room::Admin)), 0);
    assert!(!node.hub.is_registered(&client.id));
}

#[tokio::test]
async fn replay_streams_segments_since_startup_then_live_lines() {
    let dir = tempdir().expect("Failed to create temporary directory");

    let stale = dir.path().join("server_gateway.2020-01-01");
    fs::write(&stale, b"old run\n").expect("write stale segment");
    fs::File::options()
        .write(true)
        .open(&stale)
        .and_then(|f| f.set_modified(SystemTime::now() - Duration::from_secs(86_400)))
        .expect("age stale segment");

    let started = SystemTime::now() - Duration::from_secs(5);
    fs::write(dir.path().join("server_gateway.today"), b"0123456789").expect("write segment");

    let bus = MemoryBus::new();
    let node = NodeBuilder::new("solo", &bus).log_dir(dir.path(), started).start();
    let mut admin = node.connect_admin("adm").await;
    assert_eq!(admin.next_frame().await["event"], "GATEWAY_CONNECT");

    node.send(&admin, r#"{"type":"log","payload":{"prevLog":true}}"#).await;

    let replayed = admin.next_frame().await;
    assert_eq!(replayed["event"], "STDOUT");
    assert_eq!(replayed["payload"], "0123456789");

    node.logs.publish(b"INFO live line\n");
    let live = admin.next_frame().await;
    assert_eq!(live["event"], "STDOUT");
    assert_eq!(live["payload"], "INFO live line\n");
}

#[tokio::test]
async fn replay_splits_large_segments_into_chunks() {
    let dir = tempdir().expect("Failed to create temporary directory");
    let started = SystemTime::now() - Duration::from_secs(5);
    fs::write(dir.path().join("server_gateway.today"), b"aaaabbbbcc").expect("write segment");

    let bus = MemoryBus::new();
    let node = NodeBuilder::new("solo", &bus)
        .log_dir(dir.path(), started)
        .chunk_bytes(4)
        .start();
    let mut admin = node.connect_admin("adm").await;
    admin.frames();

    node.send(&admin, r#"{"type":"log","payload":{"prevLog":true}}"#).await;
    let chunks: Vec<String> = [
        admin.next_frame().await,
        admin.next_frame().await,
        admin.next_frame().await,
    ]
    .iter()
    .map(|f| f["payload"].as_str().expect("text payload").to_string())
    .collect();
    assert_eq!(chunks, vec!["aaaa", "bbbb", "cc"]);
}

#[tokio::test]
async fn unlog_and_disconnect_stop_the_tail() {
    let bus = MemoryBus::new();
    let node = NodeBuilder::new("solo", &bus).start();
    let mut admin = node.connect_admin("adm").await;
    admin.frames();

    node.send(&admin, r#"{"type":"log","payload":{}}"#).await;
    node.send(&admin, r#"{"type":"log","payload":{}}"#).await;
    assert!(node.hub.is_tailing_logs(&admin.id));

    node.logs.publish(b"once\n");
    assert_eq!(admin.next_frame().await["payload"], "once\n");
    assert!(admin.frames().is_empty(), "a second log request adds no second tail");

    node.send(&admin, r#"{"type":"unlog"}"#).await;
    assert!(!node.hub.is_tailing_logs(&admin.id));
    node.logs.publish(b"unseen\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(admin.frames().is_empty());

    node.send(&admin, r#"{"type":"log","payload":{}}"#).await;
    node.disconnect(&admin).await;
    node.flush().await;
    assert!(!node.hub.is_tailing_logs(&admin.id));
    assert_eq!(node.hub.client_count(Some(Room::Admin)), 0);
}

#[tokio::test]
async fn public_clients_cannot_tail_logs() {
    let bus = MemoryBus::new();
    let node = NodeBuilder::new("solo", &bus).start();
    let visitor = node.connect_public("v", None).await;
    node.send(&visitor, r#"{"type":"log","payload":{"prevLog":true}}"#).await;
    assert!(!node.hub.is_tailing_logs(&visitor.id));
}
