// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master-side initial update (bulk snapshot for one slave).
//!
//! ```text
//! minKey = incrementReplKey()
//! for each replicated table (registry order):
//!     CREATE  (columns as described by the source)
//!     REPLICATION INSERT × ceil(rows / rowsPerMessage)
//! maxKey = incrementReplKey()
//! REPLICATION (no rows, endOfTransition=true, replKey=maxKey)
//! ```
//!
//! The whole snapshot runs in one write transaction, so every live change
//! has a replKey either below `minKey` (contained in the snapshot) or above
//! `maxKey` (not contained). The slave session still merges its held queue
//! by guid for changes it received twice.
//!
//! Snapshot rows carry no replKey so the writer's ordering check ignores them.

use crate::config::ReplicationConfig;
use crate::dialect::Dialect;
use crate::error::Result;
use crate::mapper::MappedName;
use crate::message::{
    attr, parse_row_image, ChangeMessage, ChangeRow, Command, MessageDescription, SchemaChangeRecord,
    REPL_VERSION,
};
use crate::watch::{sort_by_repl_key, WatchRegistry, WatchStatus};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use tracing::{info, info_span, warn, Instrument};

/// Snapshot handed to a slave session.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialData {
    pub min_repl_key: i64,
    pub max_repl_key: i64,
    pub messages: Vec<ChangeMessage>,
}

impl InitialData {
    /// Number of snapshot rows across all messages.
    pub fn row_count(&self) -> usize {
        self.messages.iter().map(|m| m.rows.len()).sum()
    }
}

/// Builds initial updates from the watched tables of one master.
pub struct InitialUpdater {
    prefix: String,
    pool: SqlitePool,
    dialect: std::sync::Arc<dyn Dialect>,
    registry: WatchRegistry,
    rows_per_message: usize,
}

impl InitialUpdater {
    pub fn new(config: &ReplicationConfig, pool: SqlitePool, dialect: std::sync::Arc<dyn Dialect>) -> Self {
        Self {
            prefix: config.prefix.clone(),
            pool,
            dialect,
            registry: WatchRegistry::new(&config.prefix),
            rows_per_message: config.master.rows_per_message.max(1),
        }
    }

    /// Snapshot every replicated table for `slave`.
    pub async fn initiate_update(&self, slave: &str) -> Result<InitialData> {
        let span = info_span!("initial_update", slave = %slave);
        async move {
            // The first statement writes, so the transaction holds the write
            // lock until commit and no capture trigger fires in between.
            let mut tx = self.pool.begin().await?;
            let min_repl_key = self.dialect.increment_repl_key(&mut *tx, &self.prefix).await?;
            let transaction = format!("initial-{}", min_repl_key);

            let mut tables = self.registry.get_all(&mut *tx).await?;
            sort_by_repl_key(&mut tables);

            let mut messages = Vec::new();
            for entry in tables.iter().filter(|t| t.replicate && t.status == WatchStatus::Ok) {
                let name = MappedName::unmapped(entry.schema(), &entry.table);
                let produced = self
                    .snapshot_table(&mut *tx, &name, &transaction, slave, &mut messages)
                    .await?;
                info!(table = %name, rows = produced, "Table snapshot taken");
            }

            let max_repl_key = self.dialect.increment_repl_key(&mut *tx, &self.prefix).await?;
            tx.commit().await?;
            messages.push(end_of_transition(max_repl_key, slave));

            let data = InitialData {
                min_repl_key,
                max_repl_key,
                messages,
            };
            info!(
                min_repl_key,
                max_repl_key,
                messages = data.messages.len(),
                rows = data.row_count(),
                "Initial update ready"
            );
            Ok(data)
        }
        .instrument(span)
        .await
    }

    async fn snapshot_table(
        &self,
        conn: &mut SqliteConnection,
        name: &MappedName,
        transaction: &str,
        slave: &str,
        out: &mut Vec<ChangeMessage>,
    ) -> Result<usize> {
        let columns = self.dialect.describe_table(&mut *conn, name).await?;
        if columns.is_empty() {
            warn!(table = %name, "Watched table does not exist, skipped in initial update");
            return Ok(0);
        }

        let mut create = SchemaChangeRecord::new(Command::Create, None, name.schema.as_deref(), &name.table);
        create.columns = columns.clone();
        let mut msg = create.into_message();
        msg.set_attr(attr::DESTINATION, slave);
        out.push(msg);

        let sql = self.dialect.snapshot_statement(name, &columns);
        let images: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
        let total = images.len();

        let mut rows = Vec::with_capacity(self.rows_per_message.min(total));
        for (guid, content) in images {
            rows.push(snapshot_row(name, transaction, &guid, &content)?);
            if rows.len() == self.rows_per_message {
                out.push(insert_message(name, transaction, slave, std::mem::take(&mut rows)));
            }
        }
        if !rows.is_empty() {
            out.push(insert_message(name, transaction, slave, rows));
        }
        Ok(total)
    }
}

fn snapshot_row(name: &MappedName, transaction: &str, guid: &str, content: &str) -> Result<ChangeRow> {
    let mut attributes = BTreeMap::new();
    attributes.insert(attr::TABLE_NAME.to_string(), name.table.clone());
    attributes.insert(attr::ACTION.to_string(), "INSERT".to_string());
    attributes.insert(attr::GUID.to_string(), guid.to_string());
    attributes.insert(attr::TRANSACTION.to_string(), transaction.to_string());
    attributes.insert(attr::VERSION.to_string(), REPL_VERSION.to_string());
    if let Some(schema) = &name.schema {
        attributes.insert(attr::SCHEMA.to_string(), schema.clone());
    }
    Ok(ChangeRow {
        columns: parse_row_image(content)?,
        attributes,
    })
}

fn insert_message(name: &MappedName, transaction: &str, slave: &str, rows: Vec<ChangeRow>) -> ChangeMessage {
    let mut attributes = BTreeMap::new();
    attributes.insert(attr::TABLE_NAME.to_string(), name.table.clone());
    attributes.insert(attr::TRANSACTION.to_string(), transaction.to_string());
    attributes.insert(attr::DESTINATION.to_string(), slave.to_string());
    if let Some(schema) = &name.schema {
        attributes.insert(attr::SCHEMA.to_string(), schema.clone());
    }
    ChangeMessage {
        description: MessageDescription {
            command: Command::Replication.as_str().to_string(),
            attributes,
            columns: Vec::new(),
        },
        rows,
        payload: None,
    }
}

/// Marker closing a snapshot.
pub fn end_of_transition(max_repl_key: i64, slave: &str) -> ChangeMessage {
    let mut attributes = BTreeMap::new();
    attributes.insert(attr::END_OF_TRANSITION.to_string(), "true".to_string());
    attributes.insert(attr::REPL_KEY.to_string(), max_repl_key.to_string());
    attributes.insert(attr::DESTINATION.to_string(), slave.to_string());
    ChangeMessage {
        description: MessageDescription {
            command: Command::Replication.as_str().to_string(),
            attributes,
            columns: Vec::new(),
        },
        rows: Vec::new(),
        payload: None,
    }
}
