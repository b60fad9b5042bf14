//! Loopback integration tests: whole transfers over real UDP sockets.

use crate::bundle::BundleId;
use crate::config::Config;
use crate::node::{Node, TransferOutcome};
use crate::store::CustodyState;
use std::net::SocketAddr;
use std::path::Path;
use tempfile::TempDir;
use tokio::time::{timeout, Duration};

fn test_config(dir: &Path, name: &str) -> Config {
    let mut config = Config::new();
    config.node.port = 0; // ephemeral
    config.node.node_id = Some(name.to_string());
    config.storage.db_path = Some(dir.join(format!("{}.db", name)).display().to_string());
    config.storage.inbox_dir = dir.join(format!("{}_inbox", name)).display().to_string();
    config.transfer.chunk_size = 512;
    config
}

fn loopback_addr(node: &Node) -> SocketAddr {
    let port = node.local_addr().expect("node started").port();
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn inbox_file(dir: &Path, name: &str, bundle_id: &BundleId) -> std::path::PathBuf {
    dir.join(format!("{}_inbox", name))
        .join(format!("bundle_{}.bin", bundle_id.to_hex()))
}

fn source_file(dir: &Path, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| ((i * 31 + i / 7) % 256) as u8).collect();
    let path = dir.join("source.bin");
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

#[tokio::test]
async fn test_loopback_transfer_byte_identical() {
    let dir = TempDir::new().unwrap();
    let (source, data) = source_file(dir.path(), 100_000);

    let mut receiver = Node::new(test_config(dir.path(), "rx")).unwrap();
    receiver.start().await.unwrap();
    let rx_addr = loopback_addr(&receiver);
    let rx_task = tokio::spawn(async move {
        let _ = receiver.run().await;
    });

    let mut sender = Node::new(test_config(dir.path(), "tx")).unwrap();
    sender.start().await.unwrap();
    let bundle_id = sender.submit(&source, rx_addr).unwrap();

    let outcome = timeout(
        Duration::from_secs(30),
        sender.run_until_settled(bundle_id, true),
    )
    .await
    .expect("transfer timed out")
    .unwrap();
    assert_eq!(outcome, TransferOutcome::Delivered);

    let written = std::fs::read(inbox_file(dir.path(), "rx", &bundle_id)).unwrap();
    assert_eq!(written.len(), data.len());
    assert_eq!(written, data);

    let state = sender.store().load_bundle(&bundle_id).unwrap().unwrap();
    assert_eq!(state.state, crate::bundle::BundleState::Delivered);

    rx_task.abort();
}

#[tokio::test]
async fn test_loopback_transfer_with_fec() {
    let dir = TempDir::new().unwrap();
    let (source, data) = source_file(dir.path(), 20_000);

    let mut receiver = Node::new(test_config(dir.path(), "rx")).unwrap();
    receiver.start().await.unwrap();
    let rx_addr = loopback_addr(&receiver);
    let rx_task = tokio::spawn(async move {
        let _ = receiver.run().await;
    });

    let mut tx_config = test_config(dir.path(), "tx");
    tx_config.fec.enabled = true;
    let mut sender = Node::new(tx_config).unwrap();
    sender.start().await.unwrap();
    let bundle_id = sender.submit_with_fec(&source, rx_addr, true).unwrap();

    let outcome = timeout(
        Duration::from_secs(30),
        sender.run_until_settled(bundle_id, true),
    )
    .await
    .expect("transfer timed out")
    .unwrap();
    assert_eq!(outcome, TransferOutcome::Delivered);

    let written = std::fs::read(inbox_file(dir.path(), "rx", &bundle_id)).unwrap();
    assert_eq!(written, data);

    rx_task.abort();
}

#[tokio::test]
async fn test_relay_path_with_custody() {
    let dir = TempDir::new().unwrap();
    let (source, data) = source_file(dir.path(), 30_000);

    // Final destination C
    let mut node_c = Node::new(test_config(dir.path(), "c")).unwrap();
    node_c.start().await.unwrap();
    let c_addr = loopback_addr(&node_c);
    let c_task = tokio::spawn(async move {
        let _ = node_c.run().await;
    });

    // Relay B forwarding to C
    let mut b_config = test_config(dir.path(), "b");
    b_config.custody.next_hop = Some(c_addr.to_string());
    let mut node_b = Node::new(b_config).unwrap();
    node_b.start().await.unwrap();
    let b_addr = loopback_addr(&node_b);
    let b_store = node_b.store().clone();
    let b_task = tokio::spawn(async move {
        let _ = node_b.run().await;
    });

    // Origin A, offering custody quickly
    let mut a_config = test_config(dir.path(), "a");
    a_config.custody.backoff_base_sec = 1;
    let mut node_a = Node::new(a_config).unwrap();
    node_a.start().await.unwrap();
    let bundle_id = node_a.submit(&source, b_addr).unwrap();

    // Delivery is confirmed end-to-end through the cascade C -> B -> A
    let outcome = timeout(
        Duration::from_secs(60),
        node_a.run_until_settled(bundle_id, true),
    )
    .await
    .expect("relay transfer timed out")
    .unwrap();
    assert_eq!(outcome, TransferOutcome::Delivered);

    // C assembled the original bytes
    let written = std::fs::read(inbox_file(dir.path(), "c", &bundle_id)).unwrap();
    assert_eq!(written, data);

    // B's custody promise was released by the delivery
    let record = b_store
        .load_custody_record(&bundle_id, "b")
        .unwrap()
        .expect("custody record exists");
    assert_eq!(record.state, CustodyState::Released);

    b_task.abort();
    c_task.abort();
}

#[tokio::test]
async fn test_send_without_wait_settles_on_custody() {
    let dir = TempDir::new().unwrap();
    let (source, _) = source_file(dir.path(), 5_000);

    // A "relay" with an unreachable next hop: it accepts custody but
    // can never complete delivery.
    let mut b_config = test_config(dir.path(), "b");
    b_config.custody.next_hop = Some("127.0.0.1:9".to_string());
    let mut node_b = Node::new(b_config).unwrap();
    node_b.start().await.unwrap();
    let b_addr = loopback_addr(&node_b);
    let b_task = tokio::spawn(async move {
        let _ = node_b.run().await;
    });

    let mut a_config = test_config(dir.path(), "a");
    a_config.custody.backoff_base_sec = 1;
    let mut node_a = Node::new(a_config).unwrap();
    node_a.start().await.unwrap();
    let bundle_id = node_a.submit(&source, b_addr).unwrap();

    let outcome = timeout(
        Duration::from_secs(30),
        node_a.run_until_settled(bundle_id, false),
    )
    .await
    .expect("custody handoff timed out")
    .unwrap();
    assert_eq!(outcome, TransferOutcome::CustodyTransferred);

    b_task.abort();
}
