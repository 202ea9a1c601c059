// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end tests: master capture → transport → slave apply.
//!
//! Both sides run on SQLite files in a temporary directory. The master's
//! scheduler runs in the background; `force_change_check` serializes with it,
//! so once it returns everything staged before the call has been published.
//!
//! Run with: cargo test --test pipeline -- --nocapture

mod common;

use common::*;
use db_replication::{
    ChannelPublisher, ReplicationAgent, ReplicationConfig, SessionState, TableToWatch,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn master_config(dir: &Path) -> Arc<ReplicationConfig> {
    Arc::new(ReplicationConfig::for_testing("orders-master", dir.join("master.db")))
}

fn replica_config(dir: &Path) -> Arc<ReplicationConfig> {
    Arc::new(slave_config(dir, false))
}

async fn start_agent(dir: &Path, transport: &Arc<RecordingTransport>) -> ReplicationAgent {
    init_tracing();
    let mut agent = ReplicationAgent::new(Some(master_config(dir)), Some(replica_config(dir)))
        .unwrap()
        .with_publisher(transport.clone())
        .with_slave_transport(transport.clone());
    agent.start().await.unwrap();
    agent
}

async fn master_exec(agent: &ReplicationAgent, sql: &str) {
    sqlx::query(sql)
        .execute(agent.master().unwrap().pool())
        .await
        .unwrap();
}

/// Capture a table from creation on and replay the stream on the slave.
#[tokio::test]
async fn live_changes_reach_the_slave() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let mut agent = start_agent(dir.path(), &transport).await;
    let master = agent.master().unwrap();

    master_exec(&agent, "CREATE TABLE orders (id INTEGER PRIMARY KEY, val TEXT)").await;
    assert!(master
        .add_table_to_watch(TableToWatch::new(None, None, "orders"))
        .await
        .unwrap());
    master.force_change_check().await.unwrap();

    master_exec(&agent, "INSERT INTO orders VALUES (1, 'a'), (2, 'b'), (3, 'c')").await;
    master_exec(&agent, "UPDATE orders SET val = 'B' WHERE id = 2").await;
    master_exec(&agent, "DELETE FROM orders WHERE id = 3").await;
    master.force_change_check().await.unwrap();

    let published = transport.take_published().await;
    assert_eq!(published[0].description.command, "CREATE");
    assert!(published.iter().all(|m| !m.is_already_processed()));

    let engine = agent.apply_engine().unwrap();
    for msg in &published {
        engine.store(msg).await.unwrap();
    }

    assert_eq!(
        fetch_kv(engine.pool(), "orders").await,
        vec![(1, Some("a".to_string())), (2, Some("B".to_string()))]
    );
    let staged: i64 = sqlx::query_scalar("SELECT count(*) FROM repl_items")
        .fetch_one(master.pool())
        .await
        .unwrap();
    assert_eq!(staged, 0);

    agent.shutdown().await;
}

/// Messages go through the encoded (and compressed) wire form.
#[tokio::test]
async fn encoded_stream_through_channel() {
    init_tracing();
    let dir = tempdir().unwrap();
    let (publisher, mut rx) = ChannelPublisher::new(64);
    let mut agent = ReplicationAgent::new(Some(master_config(dir.path())), Some(replica_config(dir.path())))
        .unwrap()
        .with_publisher(Arc::new(publisher));
    agent.start().await.unwrap();
    let master = agent.master().unwrap();

    master_exec(&agent, "CREATE TABLE orders (id INTEGER PRIMARY KEY, val TEXT)").await;
    master
        .add_table_to_watch(TableToWatch::new(None, None, "orders"))
        .await
        .unwrap();
    master.force_change_check().await.unwrap();
    master_exec(&agent, "INSERT INTO orders VALUES (1, 'some longer text to pass the threshold')").await;
    master.force_change_check().await.unwrap();

    let engine = agent.apply_engine().unwrap();
    let mut received = 0;
    while let Ok(bytes) = rx.try_recv() {
        engine.store_encoded(&bytes).await.unwrap();
        received += 1;
    }
    assert!(received >= 2);
    assert_eq!(fetch_kv(engine.pool(), "orders").await.len(), 1);

    agent.shutdown().await;
}

/// A new slave syncs from a snapshot while live changes are held, then
/// continues with the live stream.
#[tokio::test]
async fn initial_sync_then_live_stream() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let mut agent = start_agent(dir.path(), &transport).await;
    let master = agent.master().unwrap();
    let slave = agent.slave().unwrap();

    master_exec(&agent, "CREATE TABLE orders (id INTEGER PRIMARY KEY, val TEXT)").await;
    master_exec(&agent, "INSERT INTO orders VALUES (1, 'before-watch')").await;
    master
        .add_table_to_watch(TableToWatch::new(None, None, "orders"))
        .await
        .unwrap();
    master.force_change_check().await.unwrap();

    let session = slave.sessions().register("replica", "orders-master", "orders").await;
    assert_eq!(session.state().await, SessionState::Preparing);
    session.prepare_for_request().await.unwrap();
    session.request_initial_data().await.unwrap();
    assert_eq!(session.state().await, SessionState::Requesting);

    // Live changes while the request is pending are held
    master_exec(&agent, "INSERT INTO orders VALUES (2, 'while-requesting')").await;
    master.force_change_check().await.unwrap();
    let live = transport.take_published().await;
    assert_eq!(slave.deliver(&session, live).await.unwrap(), 0);
    assert!(session.held_count().await >= 2);

    let data = master.initiate_update("replica").await.unwrap();
    assert!(data.min_repl_key < data.max_repl_key);
    assert_eq!(data.row_count(), 2);

    let applied = slave.complete_initial_update(&session, data).await.unwrap();
    assert!(applied >= 2);
    assert_eq!(session.state().await, SessionState::Active);
    assert_eq!(
        fetch_kv(slave.pool(), "orders").await,
        vec![
            (1, Some("before-watch".to_string())),
            (2, Some("while-requesting".to_string()))
        ]
    );

    // Back to normal operation
    master_exec(&agent, "UPDATE orders SET val = 'after' WHERE id = 1").await;
    master.force_change_check().await.unwrap();
    let live = transport.take_published().await;
    assert_eq!(slave.deliver(&session, live).await.unwrap(), 1);
    assert_eq!(fetch_kv(slave.pool(), "orders").await[0], (1, Some("after".to_string())));
    assert!(!session.is_in_transition().await);

    let calls = transport.calls().await;
    assert!(calls.contains(&"clear_queue:replica".to_string()));
    assert!(calls.contains(&"install_filter:replica:orders".to_string()));
    assert!(calls.contains(&"remove_filter:replica:orders".to_string()));
    assert_eq!(transport.requests().await.len(), 1);

    agent.shutdown().await;
}

/// Changes delivered while a session is paused are applied on resume, ahead
/// of what arrives afterwards.
#[tokio::test]
async fn paused_session_applies_held_changes_on_resume() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let mut agent = start_agent(dir.path(), &transport).await;
    let master = agent.master().unwrap();
    let slave = agent.slave().unwrap();

    master_exec(&agent, "CREATE TABLE orders (id INTEGER PRIMARY KEY, val TEXT)").await;
    master
        .add_table_to_watch(TableToWatch::new(None, None, "orders"))
        .await
        .unwrap();
    master.force_change_check().await.unwrap();

    let session = slave.sessions().register("replica", "orders-master", "orders").await;
    session.prepare_for_request().await.unwrap();
    session.request_initial_data().await.unwrap();
    let data = master.initiate_update("replica").await.unwrap();
    slave.complete_initial_update(&session, data).await.unwrap();
    transport.take_published().await;

    assert!(!slave.toggle_active(&session).await.unwrap());
    assert_eq!(session.state().await, SessionState::Paused);

    master_exec(&agent, "INSERT INTO orders VALUES (1, 'while-paused')").await;
    master.force_change_check().await.unwrap();
    let during = transport.take_published().await;
    assert_eq!(slave.deliver(&session, during).await.unwrap(), 0);
    assert!(fetch_kv(slave.pool(), "orders").await.is_empty());

    assert!(slave.toggle_active(&session).await.unwrap());
    assert_eq!(
        fetch_kv(slave.pool(), "orders").await,
        vec![(1, Some("while-paused".to_string()))]
    );

    master_exec(&agent, "UPDATE orders SET val = 'after-resume' WHERE id = 1").await;
    master.force_change_check().await.unwrap();
    let after = transport.take_published().await;
    assert_eq!(slave.deliver(&session, after).await.unwrap(), 1);
    assert_eq!(
        fetch_kv(slave.pool(), "orders").await,
        vec![(1, Some("after-resume".to_string()))]
    );
    assert_eq!(session.held_count().await, 0);

    agent.shutdown().await;
}

/// Cancelling a pending request reverts the transport side effects.
#[tokio::test]
async fn cancelled_initial_sync() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let mut agent = start_agent(dir.path(), &transport).await;
    let sessions = agent.sessions().unwrap();

    let session = sessions.register("replica", "orders-master", "orders").await;
    session.prepare_for_request().await.unwrap();
    session.request_initial_data().await.unwrap();

    assert!(session.cancel_initial_update().await.unwrap());
    assert_eq!(session.state().await, SessionState::Cancelled);
    assert!(session.is_delivery_active().await);

    let calls = transport.calls().await;
    assert!(calls.contains(&"cancel:orders-master:replica".to_string()));
    assert!(calls.contains(&"delivery:replica:true".to_string()));

    // A cancelled session is replaced on re-registration
    let fresh = sessions.register("replica", "orders-master", "orders").await;
    assert_eq!(fresh.state().await, SessionState::Preparing);
    assert!(sessions.remove("replica").await.unwrap().is_some());
    assert!(sessions.is_empty());

    agent.shutdown().await;
}
