// tests/integration/probe_test.rs

//! Worker pool tests: partitioning, database resolution across workers and
//! both ways of stopping.

use super::test_helpers::{Conn, init_tracing};
use mysqlprobe::Probe;
use mysqlprobe::config::ProbeConfig;
use mysqlprobe::core::message::{Message, UNKNOWN_DB_NAME};
use mysqlprobe::core::resolver::{ConnectionWatcher, DbNameResolver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn config(workers: usize) -> ProbeConfig {
    ProbeConfig {
        workers,
        ..ProbeConfig::default()
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Some(msg) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("output channel never closed")
    {
        messages.push(msg);
    }
    messages.sort_by_key(|m| m.client_port);
    messages
}

#[tokio::test]
async fn test_drain_delivers_every_record() {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let probe = Probe::start(&config(3), tx, None);
    assert_eq!(probe.workers(), 3);

    for port in 50000..50010u16 {
        let conn = Conn::new(port);
        probe
            .dispatch(conn.query(&format!("SELECT * FROM t WHERE id = {port}"), 0))
            .await
            .unwrap();
    }
    for port in 50000..50010u16 {
        probe.dispatch(Conn::new(port).ok(1, 0, 4)).await.unwrap();
    }
    probe.drain().await;

    let messages = collect(rx).await;
    assert_eq!(messages.len(), 10);
    for (msg, port) in messages.iter().zip(50000..50010u16) {
        assert_eq!(msg.client_port, port);
        assert_eq!(msg.raw, format!("SELECT * FROM t WHERE id = {port}"));
        assert_eq!(msg.sql, "SELECT * FROM t WHERE id = ?");
        assert_eq!(msg.affected_rows, 1);
        assert_eq!(msg.latency, 4.0);
    }

    // Same statement against the same server groups under one key.
    assert!(messages
        .windows(2)
        .all(|w| w[0].assembly_key == w[1].assembly_key));
}

#[tokio::test]
async fn test_database_names_reach_records() {
    init_tracing();
    let seeded = Conn::new(51000);
    let greeted = Conn::new(51001);
    let unknown = Conn::new(51002);

    let watcher = Arc::new(ConnectionWatcher::with_entries([(
        seeded.client.to_string(),
        "reports".to_string(),
    )]));
    let (tx, rx) = mpsc::unbounded_channel();
    let probe = Probe::start(&config(2), tx, Some(watcher.clone()));

    probe.dispatch(greeted.greeting(0)).await.unwrap();
    probe
        .dispatch(greeted.handshake_response("app", Some("shop"), 1))
        .await
        .unwrap();
    for (i, conn) in [seeded, greeted, unknown].iter().enumerate() {
        let t = 10 * (i as i64 + 1);
        probe
            .dispatch(conn.query("SELECT * FROM carts", t))
            .await
            .unwrap();
        probe.dispatch(conn.result_set(t + 1)).await.unwrap();
    }
    probe.drain().await;

    let messages = collect(rx).await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].db, "reports");
    assert_eq!(messages[1].db, "shop");
    assert_eq!(messages[2].db, UNKNOWN_DB_NAME);

    assert_ne!(messages[0].assembly_key, messages[1].assembly_key);
    assert_eq!(
        watcher.lookup(&greeted.client.to_string()).as_deref(),
        Some("shop")
    );
}

#[tokio::test]
async fn test_shutdown_stops_workers() {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let probe = Probe::start(&config(2), tx, None);

    for port in 52000..52005u16 {
        probe
            .dispatch(Conn::new(port).query("SELECT 1 FROM dual", 0))
            .await
            .unwrap();
    }
    timeout(Duration::from_secs(5), probe.shutdown())
        .await
        .expect("shutdown hung");

    // No responses were captured, so nothing is reported.
    assert!(collect(rx).await.is_empty());
}

#[tokio::test]
async fn test_single_worker_pool() {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let probe = Probe::start(&ProbeConfig::default(), tx, None);
    assert_eq!(probe.workers(), 1);

    let conn = Conn::new(53000);
    probe
        .dispatch(conn.prepare("SELECT * FROM items WHERE sku = ?", 0))
        .await
        .unwrap();
    probe.dispatch(conn.prepare_ok(9, 1)).await.unwrap();
    probe.dispatch(conn.execute(9, 2)).await.unwrap();
    probe.dispatch(conn.ok(0, 0, 5)).await.unwrap();
    probe.drain().await;

    let messages = collect(rx).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sql, "SELECT * FROM items WHERE sku = ?");
    assert_eq!(messages[0].raw, "SELECT * FROM items WHERE sku = ?");
    assert_eq!(messages[0].latency, 3.0);
}
