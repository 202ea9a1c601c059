// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Slave-side writer: applies change messages to the destination database.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   store(msg)   ┌──────────────────────────────────────────┐
//! │  transport   │ ─────────────▶ │              ApplyEngine                 │
//! │ (in order,   │                │                                          │
//! │  per slave)  │                │  command ──▶ toggles ──▶ BEGIN           │
//! └──────────────┘                │     │                     │              │
//!                                 │     ▼                     ▼              │
//!                                 │  REPLICATION ──▶ SchemaCache ──▶ DML     │
//!                                 │  CREATE / DROP / STATEMENT ──▶ DDL       │
//!                                 │  ALTER ──▶ logged only                   │
//!                                 │  DUMP ──▶ DumpSink (no transaction)      │
//!                                 │                     │                    │
//!                                 │              COMMIT / ROLLBACK           │
//!                                 └──────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - One transaction per message: every row applies or none does.
//! - The pooled connection is released on every exit path.
//! - A REPLICATION row whose replKey does not exceed the last applied one is
//!   logged as an ordering anomaly and applied anyway.
//! - Messages tagged `alreadyProcessed` by the master are skipped.

mod cache;
mod dump;
mod table;

pub use cache::SchemaCache;
pub use dump::{DumpSink, FileDumpSink};
pub use table::TableDescription;

use crate::config::{ReplicationConfig, SlaveConfig};
use crate::dialect::Dialect;
use crate::error::{ReplicationError, Result};
use crate::mapper::{MappedName, NameMapper};
use crate::message::{self, attr, Action, ChangeMessage, ColumnDescriptor, Command};
use crate::metrics;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Connection;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Sentinel for "nothing applied yet".
const NO_KEY: i64 = i64::MIN;

/// Outcome of [`ApplyEngine::store`] for a message that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Tagged `alreadyProcessed` by the master.
    SkippedAlreadyProcessed,
    /// The command is switched off by a writer toggle.
    SkippedDisabled,
}

/// Applies inbound change messages to one destination database.
pub struct ApplyEngine {
    config: SlaveConfig,
    pool: SqlitePool,
    dialect: Arc<dyn Dialect>,
    mapper: Arc<dyn NameMapper>,
    cache: SchemaCache,
    dump_sink: Arc<dyn DumpSink>,
    last_applied: AtomicI64,
    last_response: RwLock<Option<String>>,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl ApplyEngine {
    pub fn new(
        config: &ReplicationConfig,
        pool: SqlitePool,
        dialect: Arc<dyn Dialect>,
        mapper: Arc<dyn NameMapper>,
    ) -> Self {
        let sink = FileDumpSink::new(config.slave.import_location(), config.slave.keep_dump_files);
        Self {
            config: config.slave.clone(),
            pool,
            dialect,
            mapper,
            cache: SchemaCache::new(),
            dump_sink: Arc::new(sink),
            last_applied: AtomicI64::new(NO_KEY),
            last_response: RwLock::new(None),
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Replace the file sink used for DUMP payloads.
    pub fn with_dump_sink(mut self, sink: Arc<dyn DumpSink>) -> Self {
        self.dump_sink = sink;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.cache
    }

    /// Highest replKey applied by this instance.
    pub fn last_applied_repl_key(&self) -> Option<i64> {
        match self.last_applied.load(Ordering::Acquire) {
            NO_KEY => None,
            k => Some(k),
        }
    }

    /// Summary of the last STATEMENT executed.
    pub fn last_sql_response(&self) -> Option<String> {
        self.last_response.read().ok().and_then(|r| r.clone())
    }

    pub fn messages_applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn messages_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Decode and apply an encoded message.
    pub async fn store_encoded(&self, data: &[u8]) -> Result<ApplyOutcome> {
        let msg = match message::decode(data) {
            Ok(m) => m,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_message_failed("UNDECODABLE");
                return Err(e);
            }
        };
        self.store(&msg).await
    }

    /// Apply one message. Errors roll the whole message back.
    pub async fn store(&self, msg: &ChangeMessage) -> Result<ApplyOutcome> {
        let label = msg.description.command.clone();
        match self.store_inner(msg).await {
            Ok(outcome) => {
                if outcome == ApplyOutcome::Applied {
                    self.applied.fetch_add(1, Ordering::Relaxed);
                    metrics::record_message_applied(&label);
                }
                Ok(outcome)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_message_failed(&label);
                error!(command = %label, error = %e, "Failed to apply message");
                Err(e)
            }
        }
    }

    async fn store_inner(&self, msg: &ChangeMessage) -> Result<ApplyOutcome> {
        if msg.is_already_processed() {
            metrics::record_already_processed();
            info!(
                command = %msg.description.command,
                range = ?msg.repl_key_range(),
                "Skipping message already processed by the master"
            );
            return Ok(ApplyOutcome::SkippedAlreadyProcessed);
        }

        let command = msg.command()?;
        if !self.is_enabled(command) {
            warn!(
                command = %command,
                table = msg.attr(attr::TABLE_NAME).unwrap_or(""),
                "Command disabled on this writer, skipping"
            );
            return Ok(ApplyOutcome::SkippedDisabled);
        }

        if command == Command::Dump {
            self.store_dump(msg).await?;
            return Ok(ApplyOutcome::Applied);
        }

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        let mut last = self.last_applied.load(Ordering::Acquire);

        match self.apply_in_tx(&mut tx, command, msg, &mut last).await {
            Ok(()) => {
                tx.commit().await?;
                if command == Command::Replication {
                    self.last_applied.store(last, Ordering::Release);
                }
                debug!(command = %command, rows = msg.rows.len(), "Message applied");
                Ok(ApplyOutcome::Applied)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn is_enabled(&self, command: Command) -> bool {
        match command {
            Command::Drop => self.config.allow_drops,
            Command::Create => self.config.allow_creates,
            Command::Alter => self.config.allow_alters,
            Command::Statement => self.config.allow_statements,
            Command::Replication | Command::Dump => true,
        }
    }

    async fn apply_in_tx(
        &self,
        conn: &mut SqliteConnection,
        command: Command,
        msg: &ChangeMessage,
        last: &mut i64,
    ) -> Result<()> {
        match command {
            Command::Replication => self.apply_rows(conn, msg, last).await,
            Command::Create => self.create_table(conn, msg).await,
            Command::Drop => self.drop_table(conn, msg).await,
            Command::Alter => {
                let name = self.resolve_description(msg)?;
                warn!(table = %name, "ALTER is not implemented, destination unchanged");
                Ok(())
            }
            Command::Statement => self.execute_statement(conn, msg).await,
            Command::Dump => Err(ReplicationError::Internal(
                "DUMP cannot run inside a transaction".to_string(),
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DML
    // ═══════════════════════════════════════════════════════════════════════

    async fn apply_rows(&self, conn: &mut SqliteConnection, msg: &ChangeMessage, last: &mut i64) -> Result<()> {
        let transaction = msg.attr(attr::TRANSACTION);

        for row in &msg.rows {
            let table = msg
                .row_attr(row, attr::TABLE_NAME)
                .ok_or_else(|| ReplicationError::Codec("row without tableName".to_string()))?;
            let catalog = msg.row_attr(row, attr::CATALOG);
            let schema = msg.row_attr(row, attr::SCHEMA);

            let action_text = msg.row_attr(row, attr::ACTION).unwrap_or("");
            let action = Action::parse(action_text).ok_or_else(|| ReplicationError::UnknownAction {
                table: table.to_string(),
                action: action_text.to_string(),
            })?;

            if let Some(key) = row.repl_key() {
                if *last != NO_KEY && key <= *last {
                    metrics::record_ordering_anomaly();
                    error!(
                        table = %table,
                        repl_key = key,
                        last_applied = *last,
                        "Ordering anomaly: replKey not increasing, applying anyway"
                    );
                }
                *last = key;
            }

            if let (Some(expected), Some(actual)) = (transaction, row.attr(attr::TRANSACTION)) {
                if expected != actual {
                    warn!(
                        table = %table,
                        expected = %expected,
                        actual = %actual,
                        "Row transaction differs from message transaction"
                    );
                }
            }

            let name = MappedName::resolve(self.mapper.as_ref(), catalog, schema, table);
            let desc = self
                .cache
                .get_or_populate(self.dialect.as_ref(), &mut *conn, &name)
                .await?
                .ok_or_else(|| ReplicationError::apply(name.to_string(), "destination table does not exist"))?;

            let columns = self.map_columns(catalog, schema, table, &row.columns);
            match action {
                Action::Insert => {
                    desc.insert(&mut *conn, &columns).await?;
                }
                Action::Update => {
                    let old = row
                        .old_columns()?
                        .map(|old| self.map_columns(catalog, schema, table, &old));
                    desc.update(&mut *conn, &columns, old.as_ref()).await?;
                }
                Action::Delete => {
                    desc.delete(&mut *conn, &columns).await?;
                }
            }
            metrics::record_row_applied(action.as_str());
        }
        Ok(())
    }

    /// Rename columns through the mapper, dropping the unmapped ones.
    fn map_columns(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        columns: &Map<String, Value>,
    ) -> Map<String, Value> {
        columns
            .iter()
            .filter_map(|(name, value)| {
                self.mapper
                    .map_column(catalog, schema, table, name)
                    .map(|mapped| (mapped, value.clone()))
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DDL and statements
    // ═══════════════════════════════════════════════════════════════════════

    fn resolve_description(&self, msg: &ChangeMessage) -> Result<MappedName> {
        let table = msg
            .attr(attr::TABLE_NAME)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ReplicationError::Codec(format!("{} without tableName", msg.description.command)))?;
        Ok(MappedName::resolve(
            self.mapper.as_ref(),
            msg.attr(attr::CATALOG),
            msg.attr(attr::SCHEMA),
            table,
        ))
    }

    async fn create_table(&self, conn: &mut SqliteConnection, msg: &ChangeMessage) -> Result<()> {
        let name = self.resolve_description(msg)?;
        let (catalog, schema) = (msg.attr(attr::CATALOG), msg.attr(attr::SCHEMA));
        let source_table = msg.attr(attr::TABLE_NAME).unwrap_or_default();

        let columns: Vec<ColumnDescriptor> = msg
            .description
            .columns
            .iter()
            .filter_map(|c| {
                self.mapper
                    .map_column(catalog, schema, source_table, &c.name)
                    .map(|mapped| ColumnDescriptor { name: mapped, ..c.clone() })
            })
            .collect();
        if columns.is_empty() {
            return Err(ReplicationError::apply(name.to_string(), "CREATE without columns"));
        }

        if self.dialect.table_exists(&mut *conn, &name).await? {
            if !self.config.overwrite_tables {
                return Err(ReplicationError::TableExists(name.to_string()));
            }
            info!(table = %name, "Table exists, dropping it before re-creation");
            sqlx::query(&self.dialect.drop_table_statement(&name))
                .execute(&mut *conn)
                .await?;
        }

        let sql = self.dialect.create_table_statement(&name, &columns);
        debug!(table = %name, sql = %sql, "Creating table");
        sqlx::query(&sql).execute(&mut *conn).await?;
        self.cache.invalidate_table(self.dialect.as_ref(), &name).await;
        info!(table = %name, columns = columns.len(), "Created table");
        Ok(())
    }

    async fn drop_table(&self, conn: &mut SqliteConnection, msg: &ChangeMessage) -> Result<()> {
        let name = self.resolve_description(msg)?;
        sqlx::query(&self.dialect.drop_table_statement(&name))
            .execute(&mut *conn)
            .await?;
        self.cache.invalidate_table(self.dialect.as_ref(), &name).await;
        info!(table = %name, "Dropped table");
        Ok(())
    }

    async fn execute_statement(&self, conn: &mut SqliteConnection, msg: &ChangeMessage) -> Result<()> {
        let sql = msg
            .attr(attr::STATEMENT)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ReplicationError::Codec("STATEMENT without statement text".to_string()))?;

        let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
        let response = if rows.is_empty() {
            "OK".to_string()
        } else {
            warn!(rows = rows.len(), "STATEMENT returned a result set, not processed");
            format!("{} row(s) returned", rows.len())
        };
        if let Ok(mut last) = self.last_response.write() {
            *last = Some(response);
        }
        info!(statement = %sql, "Executed statement");
        Ok(())
    }

    async fn store_dump(&self, msg: &ChangeMessage) -> Result<()> {
        let name = msg
            .attr(attr::DUMP_NAME)
            .ok_or_else(|| ReplicationError::Codec("DUMP without dumpName".to_string()))?;
        let payload = msg.payload.as_deref().ok_or_else(|| ReplicationError::Dump {
            name: name.to_string(),
            message: "no payload".to_string(),
        })?;
        self.dump_sink.store(name, payload).await?;
        Ok(())
    }
}
