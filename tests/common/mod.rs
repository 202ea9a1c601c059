//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - SQLite pool and apply engine setup on temporary files
//! - Change message builders
//! - A recording transport/publisher mock

#![allow(dead_code)]

pub mod mock_transport;

pub use mock_transport::*;

use db_replication::message::{attr, ChangeRow, MessageDescription};
use db_replication::{
    ApplyEngine, ChangeMessage, ColumnDescriptor, Command, IdentityMapper, NameMapper,
    ReplicationConfig, SchemaChangeRecord, SqliteDialect,
};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Install a test subscriber once (`RUST_LOG=db_replication=debug` to see logs).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

/// Pool on a SQLite file with a short acquire timeout, so a leaked
/// connection shows up as an error instead of a hang.
pub async fn open_pool(path: &Path, max_connections: u32) -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(2))
        .connect(&sqlite_url(path))
        .await
        .unwrap()
}

pub fn slave_config(dir: &Path, overwrite: bool) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing("slave", dir.join("slave.db"));
    config.slave.overwrite_tables = overwrite;
    config.slave.import_location = Some(dir.join("dumps"));
    config
}

/// Apply engine on `<dir>/slave.db`.
pub async fn slave_engine(dir: &Path, config: &ReplicationConfig, max_connections: u32) -> ApplyEngine {
    slave_engine_with_mapper(dir, config, max_connections, Arc::new(IdentityMapper)).await
}

pub async fn slave_engine_with_mapper(
    dir: &Path,
    config: &ReplicationConfig,
    max_connections: u32,
    mapper: Arc<dyn NameMapper>,
) -> ApplyEngine {
    let pool = open_pool(&dir.join("slave.db"), max_connections).await;
    ApplyEngine::new(config, pool, Arc::new(SqliteDialect::new()), mapper)
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// CREATE for `table` with `(name, type, pk_position)` columns.
pub fn create_message(schema: Option<&str>, table: &str, columns: &[(&str, &str, u32)]) -> ChangeMessage {
    let mut record = SchemaChangeRecord::new(Command::Create, None, schema, table);
    record.columns = columns
        .iter()
        .map(|(name, ty, pk)| ColumnDescriptor::new(name, ty, *pk))
        .collect();
    record.into_message()
}

/// `(id INTEGER PRIMARY KEY, val TEXT)`
pub fn create_kv(table: &str) -> ChangeMessage {
    create_message(None, table, &[("id", "INTEGER", 1), ("val", "TEXT", 0)])
}

/// One DML row. `old` becomes the UPDATE before-image.
pub fn row(table: &str, key: i64, guid: &str, action: &str, columns: Value, old: Option<Value>) -> ChangeRow {
    let mut attributes = BTreeMap::new();
    attributes.insert(attr::TABLE_NAME.to_string(), table.to_string());
    attributes.insert(attr::REPL_KEY.to_string(), key.to_string());
    attributes.insert(attr::GUID.to_string(), guid.to_string());
    attributes.insert(attr::ACTION.to_string(), action.to_string());
    attributes.insert(attr::TRANSACTION.to_string(), format!("tx-{}", key));
    if let Some(old) = old {
        attributes.insert(attr::OLD_CONTENT.to_string(), old.to_string());
    }
    ChangeRow {
        columns: object(columns),
        attributes,
    }
}

/// A REPLICATION message carrying `rows`.
pub fn replication(rows: Vec<ChangeRow>) -> ChangeMessage {
    ChangeMessage {
        description: MessageDescription {
            command: Command::Replication.as_str().to_string(),
            attributes: BTreeMap::new(),
            columns: Vec::new(),
        },
        rows,
        payload: None,
    }
}

pub fn insert(table: &str, key: i64, id: i64, val: &str) -> ChangeMessage {
    replication(vec![row(
        table,
        key,
        &id.to_string(),
        "INSERT",
        serde_json::json!({"id": id, "val": val}),
        None,
    )])
}

pub fn update(table: &str, key: i64, id: i64, val: &str) -> ChangeMessage {
    replication(vec![row(
        table,
        key,
        &id.to_string(),
        "UPDATE",
        serde_json::json!({"id": id, "val": val}),
        Some(serde_json::json!({"id": id})),
    )])
}

pub fn delete(table: &str, key: i64, id: i64) -> ChangeMessage {
    replication(vec![row(
        table,
        key,
        &id.to_string(),
        "DELETE",
        serde_json::json!({"id": id}),
        None,
    )])
}

/// `(id, val)` rows of a key/value table, ordered by id.
pub async fn fetch_kv(pool: &SqlitePool, table: &str) -> Vec<(i64, Option<String>)> {
    sqlx::query_as(&format!("SELECT id, val FROM \"{}\" ORDER BY id", table))
        .fetch_all(pool)
        .await
        .unwrap()
}

pub async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
    let count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await
            .unwrap();
    count > 0
}
