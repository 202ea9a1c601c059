// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! lost changes, leaked connections, or double application.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use db_replication::message::{decode, maybe_decompress};
use db_replication::{
    ChangeChecker, ChangeConverter, ChangeScheduler, Dialect, InitialUpdater, ReplKeyStore,
    ReplicationConfig, SqliteDialect, TableToWatch, WatchRegistry,
};
use std::collections::BTreeSet;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

/// Bootstrapped master database with `orders` under capture. The CREATE for
/// `orders` is staged but not converted yet.
async fn master_db(dir: &std::path::Path) -> (SqlitePool, Arc<SqliteDialect>) {
    let pool = open_pool(&dir.join("master.db"), 2).await;
    let dialect = Arc::new(SqliteDialect::new());
    for stmt in dialect.bootstrap_statements("repl_") {
        sqlx::query(&stmt).execute(&pool).await.unwrap();
    }
    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, val TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    let mut conn = pool.acquire().await.unwrap();
    WatchRegistry::new("repl_")
        .store(&mut *conn, &TableToWatch::new(None, None, "orders"))
        .await
        .unwrap();
    assert_eq!(dialect.force_table_change_check(&mut *conn, "repl_").await.unwrap(), 1);
    drop(conn);
    (pool, dialect)
}

fn converter(
    dialect: &Arc<SqliteDialect>,
    transport: &Arc<RecordingTransport>,
    store: &Arc<ReplKeyStore>,
) -> ChangeConverter {
    ChangeConverter::new(
        "orders-master",
        "repl_",
        dialect.clone(),
        transport.clone(),
        store.clone(),
        1000,
    )
}

async fn staged_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM repl_items")
        .fetch_one(pool)
        .await
        .unwrap()
}

// =============================================================================
// Publish Failures
// =============================================================================

/// Test: A failed publish keeps the staged rows for the next check
#[tokio::test]
async fn publish_failure_keeps_staged_rows() {
    init_tracing();
    let dir = tempdir().unwrap();
    let (pool, dialect) = master_db(dir.path()).await;
    let transport = Arc::new(RecordingTransport::new());
    let store = Arc::new(ReplKeyStore::in_memory().await.unwrap());
    let converter = converter(&dialect, &transport, &store);

    let mut conn = pool.acquire().await.unwrap();
    converter.check_again(&mut *conn).await.unwrap();
    transport.take_published().await;

    sqlx::query("INSERT INTO orders VALUES (1, 'a'), (2, 'b')")
        .execute(&mut *conn)
        .await
        .unwrap();

    transport.fail_next_publishes(1);
    let err = converter.check_again(&mut *conn).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(err.to_string().contains("staged rows kept"));
    assert_eq!(staged_count(&pool).await, 2);
    assert!(transport.published().await.is_empty());

    assert_eq!(converter.check_again(&mut *conn).await.unwrap(), 2);
    assert_eq!(staged_count(&pool).await, 0);
    let published = transport.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].rows.len(), 2);
    assert!(!published[0].is_already_processed());
}

/// Test: The scheduler backs off on failures and catches up afterwards
#[tokio::test]
async fn scheduler_survives_transient_failures() {
    init_tracing();
    let dir = tempdir().unwrap();
    let (pool, dialect) = master_db(dir.path()).await;
    let transport = Arc::new(RecordingTransport::new());
    let store = Arc::new(ReplKeyStore::in_memory().await.unwrap());
    let checker: Arc<dyn ChangeChecker> = Arc::new(converter(&dialect, &transport, &store));

    sqlx::query("INSERT INTO orders VALUES (1, 'a')")
        .execute(&pool)
        .await
        .unwrap();
    transport.fail_next_publishes(2);

    let scheduler = Arc::new(ChangeScheduler::new(
        "orders-master",
        pool.clone(),
        checker,
        dialect.clone(),
        Some(Duration::from_millis(20)),
        Duration::from_millis(10),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    let caught_up = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let published = transport.published().await;
            if published.iter().any(|m| !m.rows.is_empty()) && staged_count(&pool).await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(caught_up.is_ok(), "scheduler never published after failures");
    assert_eq!(scheduler.errors(), 2);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

// =============================================================================
// Crash Between Publish and Cleanup
// =============================================================================

/// Test: Rows replayed after a crash are tagged and skipped by the slave
#[tokio::test]
async fn replay_after_crash_is_marked_processed() {
    init_tracing();
    let dir = tempdir().unwrap();
    let (pool, dialect) = master_db(dir.path()).await;
    let transport = Arc::new(RecordingTransport::new());
    let store = Arc::new(ReplKeyStore::new(dir.path().join("state.db")).await.unwrap());

    let first = converter(&dialect, &transport, &store);
    let mut conn = pool.acquire().await.unwrap();
    first.check_again(&mut *conn).await.unwrap();
    sqlx::query("INSERT INTO orders VALUES (1, 'a')")
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE staged_copy AS SELECT * FROM repl_items")
        .execute(&mut *conn)
        .await
        .unwrap();
    first.check_again(&mut *conn).await.unwrap();
    store.flush_dirty().await.unwrap();

    // Publish went through but the cleanup "did not happen"
    sqlx::query("INSERT INTO repl_items SELECT * FROM staged_copy")
        .execute(&mut *conn)
        .await
        .unwrap();

    let restarted = converter(&dialect, &transport, &store);
    assert_eq!(restarted.check_again(&mut *conn).await.unwrap(), 1);

    let published = transport.take_published().await;
    let replayed = published.last().unwrap();
    assert!(replayed.is_already_processed());

    let slave_cfg = slave_config(dir.path(), false);
    let engine = slave_engine(dir.path(), &slave_cfg, 2).await;
    for msg in &published {
        engine.store(msg).await.unwrap();
    }
    assert_eq!(fetch_kv(engine.pool(), "orders").await, vec![(1, Some("a".to_string()))]);

    // New changes are not tagged
    sqlx::query("INSERT INTO orders VALUES (2, 'b')")
        .execute(&mut *conn)
        .await
        .unwrap();
    restarted.check_again(&mut *conn).await.unwrap();
    let fresh = transport.take_published().await;
    assert_eq!(fresh.len(), 1);
    assert!(!fresh[0].is_already_processed());
}

// =============================================================================
// Snapshot Under Concurrent Writes
// =============================================================================

/// Test: Writes racing an initial update land either inside the snapshot
/// (replKey below min) or after it (replKey above max), never in between
#[tokio::test]
async fn snapshot_boundaries_hold_under_concurrent_writes() {
    init_tracing();
    let dir = tempdir().unwrap();
    let (pool, dialect) = master_db(dir.path()).await;
    let config = ReplicationConfig::for_testing("orders-master", dir.path().join("master.db"));
    let updater = InitialUpdater::new(&config, pool.clone(), dialect.clone());

    let writer_pool = pool.clone();
    let writer = tokio::spawn(async move {
        for id in 1..=200i64 {
            sqlx::query("INSERT INTO orders VALUES (?, 'v')")
                .bind(id)
                .execute(&writer_pool)
                .await
                .unwrap();
            if id % 20 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    let data = updater.initiate_update("replica").await.unwrap();
    writer.await.unwrap();

    let between: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM repl_items WHERE repl_key > ? AND repl_key < ?",
    )
    .bind(data.min_repl_key)
    .bind(data.max_repl_key)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(between, 0);

    let before: Vec<String> = sqlx::query_scalar(
        "SELECT guid FROM repl_items WHERE db_action = 'INSERT' AND repl_key < ?",
    )
    .bind(data.min_repl_key)
    .fetch_all(&pool)
    .await
    .unwrap();
    let in_snapshot: BTreeSet<String> = data
        .messages
        .iter()
        .flat_map(|m| m.rows.iter().filter_map(|r| r.guid().map(str::to_string)))
        .collect();
    assert_eq!(in_snapshot, before.into_iter().collect::<BTreeSet<_>>());
}

// =============================================================================
// Corrupted Data Handling
// =============================================================================

/// Test: Corrupted zstd data doesn't panic
#[tokio::test]
async fn corrupted_zstd_no_panic() {
    let corrupted_payloads: &[&[u8]] = &[
        // Just magic header, no content
        &[0x28, 0xB5, 0x2F, 0xFD],
        // Magic header with garbage
        &[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE],
        // Magic header with truncated frame header
        &[0x28, 0xB5, 0x2F, 0xFD, 0x20],
    ];

    for (i, payload) in corrupted_payloads.iter().enumerate() {
        assert!(maybe_decompress(payload).is_err(), "payload {} decompressed", i);
        assert!(decode(payload).is_err(), "payload {} decoded", i);
    }
}

/// Test: Undecodable entries fail the apply without touching the destination
#[tokio::test]
async fn undecodable_entries_are_rejected() {
    let dir = tempdir().unwrap();
    let config = slave_config(dir.path(), false);
    let engine = slave_engine(dir.path(), &config, 1).await;
    engine.store(&create_kv("t")).await.unwrap();

    let bad: &[&[u8]] = &[
        &[],
        b"not json",
        b"{\"description\": 1}",
        &[0x28, 0xB5, 0x2F, 0xFD, 0x00, 0x00],
    ];
    for payload in bad {
        assert!(engine.store_encoded(payload).await.is_err());
    }
    assert_eq!(engine.messages_failed(), bad.len() as u64);

    // Well-formed compressed entry still applies
    let encoded = db_replication::message::encode(&insert("t", 1, 1, "ok"), 1).unwrap();
    assert_eq!(&encoded[..4], &[0x28, 0xB5, 0x2F, 0xFD]);
    engine.store_encoded(&encoded).await.unwrap();
    assert_eq!(fetch_kv(engine.pool(), "t").await.len(), 1);
}

// =============================================================================
// Connection Pool
// =============================================================================

/// Test: Concurrent messages on a single-connection pool neither deadlock
/// nor leak the connection
#[tokio::test]
async fn concurrent_apply_on_single_connection() {
    let dir = tempdir().unwrap();
    let config = slave_config(dir.path(), false);
    let engine = Arc::new(slave_engine(dir.path(), &config, 1).await);
    engine.store(&create_kv("t")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20i64 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            // Every third one fails on an unknown action
            let msg = if i % 3 == 0 {
                replication(vec![row("t", i + 1, "x", "MERGE", serde_json::json!({"id": i}), None)])
            } else {
                insert("t", i + 1, i, "v")
            };
            engine.store(&msg).await.is_ok()
        }));
    }

    let mut ok = 0;
    for handle in handles {
        if handle.await.unwrap() {
            ok += 1;
        }
    }
    assert_eq!(ok, 13);
    assert_eq!(fetch_kv(engine.pool(), "t").await.len(), 13);
}

// =============================================================================
// ReplKey Store Recovery
// =============================================================================

/// Test: Flushed marks survive a crash; unflushed ones are lost
#[tokio::test]
async fn repl_key_store_crash_recovery() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let store = ReplKeyStore::new(&path).await.unwrap();
        assert!(store.advance("orders-master.oldReplKey", 100).await);
        store.flush_dirty().await.unwrap();
        assert!(store.advance("orders-master.oldReplKey", 150).await);
        // Dropped without close: 150 was never flushed
    }

    let store = ReplKeyStore::new(&path).await.unwrap();
    assert_eq!(store.get("orders-master.oldReplKey").await, Some(100));

    // Marks never go backwards
    assert!(!store.advance("orders-master.oldReplKey", 50).await);
    assert!(store.advance("orders-master.oldReplKey", 200).await);
    store.close().await;

    let store = ReplKeyStore::new(&path).await.unwrap();
    assert_eq!(store.get("orders-master.oldReplKey").await, Some(200));
    store.close().await;
}

/// Test: Rapid advances only persist the highest value
#[tokio::test]
async fn repl_key_store_rapid_updates() {
    let dir = tempdir().unwrap();
    let store = ReplKeyStore::new(dir.path().join("state.db")).await.unwrap();

    for key in 1..=500 {
        store.advance("replica.maxReplKey", key).await;
    }
    assert_eq!(store.dirty_count().await, 1);
    assert_eq!(store.flush_dirty().await.unwrap(), 1);
    assert_eq!(store.get("replica.maxReplKey").await, Some(500));
    store.close().await;
}
