// tests/integration/assembly_test.rs

//! Dispatcher tests: connection lookup, record delivery and idle eviction,
//! with real stream tasks behind the table.

use super::test_helpers::{Conn, SERVER_PORT, at, init_tracing};
use mysqlprobe::connection::{Assembly, StreamHandle};
use mysqlprobe::core::flow::dst_port_classifier;
use mysqlprobe::core::message::{Message, UNKNOWN_DB_NAME};
use mysqlprobe::core::resolver::{ConnectionWatcher, DbNameResolver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn assembly() -> (Assembly, mpsc::UnboundedReceiver<Message>) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let assembly = Assembly::new("test", dst_port_classifier(SERVER_PORT), tx);
    (assembly, rx)
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("output channel closed")
}

/// Collects records until every sender is gone.
async fn drain(mut rx: mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Some(msg) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("output channel never closed")
    {
        messages.push(msg);
    }
    messages
}

#[tokio::test]
async fn test_both_directions_share_one_stream() {
    let (mut assembly, mut rx) = assembly();
    let conn = Conn::new(41000);

    let query = conn.query("SELECT * FROM users WHERE id = 7", 0);
    let key = query.key();
    assembly.assemble(query).await;
    assembly.assemble(conn.ok(0, 2, 3)).await;

    assert_eq!(assembly.len(), 1);
    assert!(assembly.find(&key).is_some());
    assert!(assembly.find(&key.reverse()).is_some());
    assert!(assembly.find(&Conn::new(41001).query("SELECT 1", 0).key()).is_none());

    let stream = assembly.find(&key).unwrap();
    assert_eq!(stream.endpoints().server, conn.server);
    assert_eq!(stream.endpoints().client, conn.client);
    assert_eq!(stream.last_seen(), at(3));

    let msg = next_message(&mut rx).await;
    assert_eq!(msg.sql, "SELECT * FROM users WHERE id = ?");
    assert_eq!(msg.raw, "SELECT * FROM users WHERE id = 7");
    assert_eq!(msg.latency, 3.0);
    assert_eq!(msg.server_status, 2);
    assert_eq!(msg.client_port, 41000);
    assert_eq!(msg.server_port, SERVER_PORT);
    assert_eq!(msg.db, UNKNOWN_DB_NAME);
}

#[tokio::test]
async fn test_server_first_packet_registers_connection() {
    let (mut assembly, _rx) = assembly();
    let conn = Conn::new(41002);

    let greeting = conn.greeting(0);
    let key = greeting.key();
    assembly.assemble(greeting).await;
    assembly.assemble(conn.handshake_response("app", Some("shop"), 1)).await;

    assert_eq!(assembly.len(), 1);
    let stream = assembly.find(&key.reverse()).unwrap();
    assert_eq!(stream.endpoints().server, conn.server);
}

#[tokio::test]
async fn test_connections_are_kept_apart() {
    let (mut assembly, rx) = assembly();

    for port in 42000..42004u16 {
        let conn = Conn::new(port);
        assembly
            .assemble(conn.query(&format!("SELECT * FROM t{port} WHERE a = 1"), 0))
            .await;
    }
    for port in 42000..42004u16 {
        assembly.assemble(Conn::new(port).ok(1, 0, 10)).await;
    }
    assert_eq!(assembly.len(), 4);

    drop(assembly);
    let mut messages = drain(rx).await;
    messages.sort_by_key(|m| m.client_port);
    assert_eq!(messages.len(), 4);
    for (msg, port) in messages.iter().zip(42000..42004u16) {
        assert_eq!(msg.client_port, port);
        assert_eq!(msg.sql, format!("SELECT * FROM t{port} WHERE a = ?"));
    }
}

#[tokio::test]
async fn test_close_older_than_is_strict() {
    let (mut assembly, _rx) = assembly();
    let old = Conn::new(43000);
    let edge = Conn::new(43001);
    let fresh = Conn::new(43002);

    assembly.assemble(old.query("SELECT 1 FROM dual", 0)).await;
    assembly.assemble(edge.query("SELECT 2 FROM dual", 1_000)).await;
    assembly.assemble(fresh.query("SELECT 3 FROM dual", 2_000)).await;

    assert_eq!(assembly.close_older_than(at(1_000)), 1);
    assert_eq!(assembly.len(), 2);
    assert!(assembly.find(&old.ping(0).key()).is_none());
    assert!(assembly.find(&edge.ping(0).key()).is_some());

    // Nothing left before the cutoff the second time.
    assert_eq!(assembly.close_older_than(at(1_000)), 0);

    assert_eq!(assembly.close_older_than(at(60_000)), 2);
    assert!(assembly.is_empty());
}

#[tokio::test]
async fn test_activity_refreshes_last_seen() {
    let (mut assembly, _rx) = assembly();
    let conn = Conn::new(43100);

    assembly.assemble(conn.query("SELECT 1 FROM dual", 0)).await;
    assembly.assemble(conn.ok(0, 0, 5_000)).await;

    assert_eq!(assembly.close_older_than(at(4_000)), 0);
    assert_eq!(assembly.len(), 1);
}

#[tokio::test]
async fn test_evicted_connection_starts_over() {
    let (mut assembly, mut rx) = assembly();
    let conn = Conn::new(43200);

    assembly.assemble(conn.query("SELECT * FROM lost", 0)).await;
    assert_eq!(assembly.close_older_than(at(10)), 1);

    // The pending request died with the old stream.
    assembly.assemble(conn.ok(0, 0, 20)).await;
    assert_eq!(assembly.len(), 1);

    assembly.assemble(conn.query("SELECT * FROM found", 30)).await;
    assembly.assemble(conn.ok(0, 0, 31)).await;
    let msg = next_message(&mut rx).await;
    assert_eq!(msg.sql, "SELECT * FROM found");
}

/// An assembly sharing `watcher`, which is seeded with `seeded`'s database.
fn watched_assembly(
    seeded: &Conn,
) -> (
    Assembly,
    Arc<ConnectionWatcher>,
    mpsc::UnboundedReceiver<Message>,
) {
    init_tracing();
    let watcher = Arc::new(ConnectionWatcher::with_entries([(
        seeded.client.to_string(),
        "reports".to_string(),
    )]));
    let (tx, rx) = mpsc::unbounded_channel();
    let assembly = Assembly::new("test", dst_port_classifier(SERVER_PORT), tx)
        .with_resolver(watcher.clone());
    (assembly, watcher, rx)
}

/// Runs a handshake naming `shop` and one query, waiting for its record.
async fn log_in(
    assembly: &mut Assembly,
    rx: &mut mpsc::UnboundedReceiver<Message>,
    conn: &Conn,
) {
    assembly.assemble(conn.greeting(0)).await;
    assembly
        .assemble(conn.handshake_response("app", Some("shop"), 1))
        .await;
    assembly.assemble(conn.query("SELECT * FROM carts", 2)).await;
    assembly.assemble(conn.ok(0, 0, 3)).await;
    assert_eq!(next_message(rx).await.db, "shop");
}

#[tokio::test]
async fn test_eviction_forgets_published_database() {
    let seeded = Conn::new(43300);
    let conn = Conn::new(43301);
    let (mut assembly, watcher, mut rx) = watched_assembly(&seeded);

    assembly.assemble(seeded.query("SELECT 1 FROM dual", 0)).await;
    log_in(&mut assembly, &mut rx, &conn).await;
    assert_eq!(
        watcher.lookup(&conn.client.to_string()).as_deref(),
        Some("shop")
    );

    assert_eq!(assembly.close_older_than(at(60_000)), 2);
    assert_eq!(watcher.lookup(&conn.client.to_string()), None);
    assert_eq!(
        watcher.lookup(&seeded.client.to_string()).as_deref(),
        Some("reports")
    );

    // A new connection reusing the address does not inherit the database.
    assembly.assemble(conn.query("SELECT * FROM carts", 70_000)).await;
    assembly.assemble(conn.ok(0, 0, 70_001)).await;
    assert_eq!(next_message(&mut rx).await.db, UNKNOWN_DB_NAME);
}

#[tokio::test]
async fn test_close_all_forgets_published_database() {
    let seeded = Conn::new(43400);
    let conn = Conn::new(43401);
    let (mut assembly, watcher, mut rx) = watched_assembly(&seeded);

    log_in(&mut assembly, &mut rx, &conn).await;
    assert_eq!(watcher.len(), 2);

    assert_eq!(assembly.close_all(), 1);
    assert_eq!(watcher.lookup(&conn.client.to_string()), None);
    assert_eq!(
        watcher.lookup(&seeded.client.to_string()).as_deref(),
        Some("reports")
    );
}

#[tokio::test]
async fn test_release_all_lets_queues_drain() {
    let (mut assembly, rx) = assembly();
    let conn = Conn::new(44000);

    assembly.assemble(conn.query("SELECT * FROM orders", 0)).await;
    assembly.assemble(conn.result_set(1)).await;
    assert_eq!(assembly.release_all(), 1);
    assert!(assembly.is_empty());

    drop(assembly);
    let messages = drain(rx).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sql, "SELECT * FROM orders");
}

#[tokio::test]
async fn test_close_all_stops_every_stream() {
    let (mut assembly, rx) = assembly();
    for port in 45000..45003u16 {
        assembly
            .assemble(Conn::new(port).query("SELECT 1 FROM dual", 0))
            .await;
    }

    assert_eq!(assembly.close_all(), 3);
    assert!(assembly.is_empty());

    // Every task exits, so the output channel closes.
    drop(assembly);
    let messages = drain(rx).await;
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_stream_handle_close_is_idempotent() {
    init_tracing();
    let conn = Conn::new(46000);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handle = StreamHandle::spawn(conn.state(), 4, tx, at(0));

    assert!(!handle.is_closed());
    handle.close();
    handle.close();
    assert!(handle.is_closed());

    // Once the task is gone its queue rejects packets.
    let rejected = timeout(Duration::from_secs(5), async {
        loop {
            if handle.send(conn.ping(1)).await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(rejected.is_ok());

    drop(handle);
    assert!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_none());
}
