// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master-side change converter.
//!
//! Drains the staging table (`<prefix>items`) in replKey order, turns every
//! staged row into a canonical record and publishes the result:
//!
//! ```text
//! <prefix>items (repl_key order)
//!   │
//!   ├─ INSERT/UPDATE/DELETE ──► ChangeRecord ─┐ grouped by trans_key
//!   │                                          ├──► ChangeMessage ──► publisher
//!   └─ CREATE/DROP/ALTER ─────► SchemaChangeRecord ─┘
//!   │
//!   └─ DELETE FROM <prefix>items WHERE repl_key <= last published
//! ```
//!
//! # replKey Guard
//!
//! The converter remembers the last replKey it published (in the
//! [`ReplKeyStore`]). A message whose keys are all at or below that mark was
//! published before (typically a crash between publish and cleanup) and is
//! sent again tagged `alreadyProcessed=true`. More than
//! [`MAX_CONSECUTIVE_PROCESSED`] such messages in a row is logged as severe.

use crate::dialect::Dialect;
use crate::error::{ReplicationError, Result};
use crate::mapper::MappedName;
use crate::message::{
    attr, Action, ChangeMessage, ChangeRecord, Command, SchemaChangeRecord,
};
use crate::state_store::ReplKeyStore;
use crate::transport::{BoxFuture, ChangePublisher};
use crate::watch::{TableToWatch, WatchRegistry};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Consecutive already-processed messages tolerated before logging as severe.
pub const MAX_CONSECUTIVE_PROCESSED: u32 = 10;

/// Something the scheduler can ask to look for new changes.
pub trait ChangeChecker: Send + Sync + 'static {
    /// Convert and publish everything staged. Returns the number of staged
    /// rows consumed.
    fn check_again<'a>(&'a self, conn: &'a mut SqliteConnection) -> BoxFuture<'a, usize>;
}

/// One row of `<prefix>items`.
#[derive(Debug, Clone)]
struct StagedRow {
    repl_key: i64,
    trans_key: String,
    db_id: String,
    table_name: String,
    guid: Option<String>,
    action: String,
    schema: Option<String>,
    content: Option<String>,
    old_content: Option<String>,
    version: String,
}

impl StagedRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self> {
        Ok(Self {
            repl_key: row.try_get("repl_key")?,
            trans_key: row.try_get("trans_key")?,
            db_id: row.try_get("db_id")?,
            table_name: row.try_get("table_name")?,
            guid: row.try_get("guid")?,
            action: row.try_get("db_action")?,
            schema: row.try_get("db_schema")?,
            content: row.try_get("content")?,
            old_content: row.try_get("old_content")?,
            version: row.try_get("version")?,
        })
    }

    fn name(&self) -> MappedName {
        MappedName::unmapped(self.schema.as_deref(), &self.table_name)
    }
}

#[derive(Debug, Default)]
struct GuardState {
    /// Last published replKey; `None` until loaded from the store.
    old_repl_key: Option<i64>,
    consecutive_processed: u32,
}

/// Converts staged rows into change messages and publishes them.
pub struct ChangeConverter {
    /// Key under which the published high-water mark is stored.
    name: String,
    prefix: String,
    dialect: Arc<dyn Dialect>,
    publisher: Arc<dyn ChangePublisher>,
    store: Arc<ReplKeyStore>,
    max_rows: u32,
    guard: Mutex<GuardState>,
}

impl ChangeConverter {
    pub fn new(
        name: &str,
        prefix: &str,
        dialect: Arc<dyn Dialect>,
        publisher: Arc<dyn ChangePublisher>,
        store: Arc<ReplKeyStore>,
        max_rows: u32,
    ) -> Self {
        Self {
            name: format!("{}.oldReplKey", name),
            prefix: prefix.to_string(),
            dialect,
            publisher,
            store,
            max_rows: max_rows.max(1),
            guard: Mutex::new(GuardState::default()),
        }
    }

    /// Store key of the published high-water mark.
    pub fn store_key(&self) -> &str {
        &self.name
    }

    /// Last replKey handed to the publisher, if any.
    pub async fn last_published(&self) -> Option<i64> {
        self.guard.lock().await.old_repl_key
    }

    /// Load the mark from the store, capped at the live sequence value so a
    /// reset sequence does not flag every new change as already processed.
    async fn load_old_repl_key(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let stored = match self.store.get(&self.name).await {
            Some(k) => k,
            None => {
                info!(key = %self.name, "No published replKey found, starting from 0");
                return Ok(0);
            }
        };
        let real = self.dialect.increment_repl_key(&mut *conn, &self.prefix).await?;
        if stored > real {
            warn!(
                stored,
                sequence = real,
                "Stored replKey is above the sequence, the sequence was probably reset; using the sequence value"
            );
            Ok(real)
        } else {
            info!(repl_key = stored, "Resuming after published replKey");
            Ok(stored)
        }
    }

    async fn read_staged(&self, conn: &mut SqliteConnection) -> Result<Vec<StagedRow>> {
        let sql = format!(
            "SELECT repl_key, trans_key, db_id, table_name, guid, db_action, db_schema, content, old_content, version \
             FROM {}items ORDER BY repl_key LIMIT ?",
            self.prefix
        );
        let rows = sqlx::query(&sql)
            .bind(self.max_rows as i64)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(StagedRow::from_row).collect()
    }

    /// Turn one staged DML row into a record, refilling a missing
    /// after-image from the live table.
    async fn to_change_record(
        &self,
        conn: &mut SqliteConnection,
        staged: &StagedRow,
        action: Action,
    ) -> Result<ChangeRecord> {
        let mut new_content = staged.content.clone();
        if action != Action::Delete && new_content.as_deref().map_or(true, str::is_empty) {
            if let Some(guid) = &staged.guid {
                new_content = self
                    .dialect
                    .content_from_guid(&mut *conn, &staged.name(), guid)
                    .await?;
                debug!(table = %staged.table_name, guid = %guid, "Refilled content by guid");
            }
        }
        Ok(ChangeRecord {
            repl_key: staged.repl_key,
            transaction: staged.trans_key.clone(),
            db_id: staged.db_id.clone(),
            table_name: staged.table_name.clone(),
            catalog: None,
            schema: staged.schema.clone(),
            guid: staged.guid.clone(),
            action,
            old_content: staged.old_content.clone(),
            new_content,
            version: staged.version.clone(),
        })
    }

    async fn to_schema_message(
        &self,
        conn: &mut SqliteConnection,
        staged: &StagedRow,
        command: Command,
    ) -> Result<Option<ChangeMessage>> {
        let mut record = SchemaChangeRecord::new(
            command,
            None,
            staged.schema.as_deref(),
            &staged.table_name,
        );
        record.repl_key = Some(staged.repl_key);
        if command != Command::Drop {
            record.columns = self.dialect.describe_table(&mut *conn, &staged.name()).await?;
            if record.columns.is_empty() {
                warn!(
                    table = %staged.table_name,
                    command = %command,
                    "Table vanished before its description could be read, skipping"
                );
                return Ok(None);
            }
        }
        let mut msg = record.into_message();
        msg.set_attr(attr::TRANSACTION, staged.trans_key.clone());
        msg.set_attr(attr::DB_ID, staged.db_id.clone());
        Ok(Some(msg))
    }

    /// Build the ordered message list for `staged`.
    async fn build_messages(
        &self,
        conn: &mut SqliteConnection,
        staged: &[StagedRow],
    ) -> Result<Vec<ChangeMessage>> {
        let mut messages = Vec::new();
        let mut pending: Vec<ChangeRecord> = Vec::new();

        for row in staged {
            if let Some(action) = Action::parse(&row.action) {
                if pending
                    .last()
                    .map_or(false, |last| last.transaction != row.trans_key)
                {
                    messages.push(ChangeMessage::replication(&pending)?);
                    pending.clear();
                }
                pending.push(self.to_change_record(&mut *conn, row, action).await?);
                continue;
            }

            let command = match row.action.to_ascii_uppercase().as_str() {
                "CREATE" => Command::Create,
                "DROP" => Command::Drop,
                "ALTER" => Command::Alter,
                other => {
                    error!(
                        repl_key = row.repl_key,
                        action = other,
                        "Staged row with unknown action, dropping it"
                    );
                    continue;
                }
            };

            if !pending.is_empty() {
                messages.push(ChangeMessage::replication(&pending)?);
                pending.clear();
            }
            if let Some(msg) = self.to_schema_message(&mut *conn, row, command).await? {
                messages.push(msg);
            }
        }

        if !pending.is_empty() {
            messages.push(ChangeMessage::replication(&pending)?);
        }
        Ok(messages)
    }

    /// Tag `msg` when it was published before and track the mark.
    fn apply_guard(&self, guard: &mut GuardState, msg: &mut ChangeMessage) {
        let Some((_, max)) = msg.repl_key_range() else {
            return;
        };
        let old = guard.old_repl_key.unwrap_or(0);
        if max <= old {
            guard.consecutive_processed += 1;
            warn!(
                repl_key = max,
                old_repl_key = old,
                "replKey already processed, marking message"
            );
            msg.set_attr(attr::ALREADY_PROCESSED, "true");
            crate::metrics::record_already_processed();
            if guard.consecutive_processed > MAX_CONSECUTIVE_PROCESSED {
                error!(
                    consecutive = guard.consecutive_processed,
                    "Too many consecutive already processed entries; the sequence may have been reset"
                );
            }
        } else {
            guard.consecutive_processed = 0;
        }
    }

    /// Raise the per-table replKey in the registry.
    async fn update_table_marks(
        &self,
        conn: &mut SqliteConnection,
        staged: &[StagedRow],
    ) -> Result<()> {
        let mut marks: HashMap<(Option<String>, String), i64> = HashMap::new();
        for row in staged {
            let key = (row.schema.clone(), row.table_name.clone());
            let entry = marks.entry(key).or_insert(row.repl_key);
            *entry = (*entry).max(row.repl_key);
        }
        let registry = WatchRegistry::new(&self.prefix);
        for ((schema, table), repl_key) in marks {
            let entry = TableToWatch::new(None, schema.as_deref(), &table);
            registry.update_repl_key(&mut *conn, &entry, repl_key).await?;
        }
        Ok(())
    }

    async fn run_check(&self, conn: &mut SqliteConnection) -> Result<usize> {
        let mut guard = self.guard.lock().await;
        if guard.old_repl_key.is_none() {
            guard.old_repl_key = Some(self.load_old_repl_key(&mut *conn).await?);
        }

        let structural = self
            .dialect
            .force_table_change_check(&mut *conn, &self.prefix)
            .await?;
        if structural > 0 {
            debug!(staged = structural, "Structure changes staged");
        }

        let staged = self.read_staged(&mut *conn).await?;
        let Some(last_key) = staged.last().map(|r| r.repl_key) else {
            return Ok(0);
        };

        let messages = self.build_messages(&mut *conn, &staged).await?;
        let mut published = 0usize;
        for mut msg in messages {
            self.apply_guard(&mut guard, &mut msg);
            let max = msg.repl_key_range().map(|(_, hi)| hi);
            let command = msg.description.command.clone();
            self.publisher.publish(msg).await?;
            published += 1;
            crate::metrics::record_message_published(&command);
            if let Some(max) = max {
                if guard.old_repl_key.map_or(true, |old| max > old) {
                    guard.old_repl_key = Some(max);
                    self.store.advance(&self.name, max).await;
                }
            }
        }

        self.update_table_marks(&mut *conn, &staged).await?;

        let sql = format!("DELETE FROM {}items WHERE repl_key <= ?", self.prefix);
        let removed = sqlx::query(&sql)
            .bind(last_key)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        crate::metrics::record_changes_captured(staged.len());
        debug!(
            rows = staged.len(),
            messages = published,
            removed,
            last_repl_key = last_key,
            "Staged changes converted"
        );
        Ok(staged.len())
    }
}

impl ChangeChecker for ChangeConverter {
    fn check_again<'a>(&'a self, conn: &'a mut SqliteConnection) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            self.run_check(conn).await.map_err(|e| match e {
                ReplicationError::Transport(msg) => {
                    ReplicationError::Transport(format!("publish failed, staged rows kept: {}", msg))
                }
                other => other,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use sqlx::Connection;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Recorder {
        messages: AsyncMutex<Vec<ChangeMessage>>,
    }

    impl ChangePublisher for Recorder {
        fn publish(&self, msg: ChangeMessage) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.messages.lock().await.push(msg);
                Ok(())
            })
        }
    }

    async fn setup() -> (SqliteConnection, Arc<Recorder>, ChangeConverter) {
        let dialect = Arc::new(SqliteDialect::new());
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        for s in dialect.bootstrap_statements("repl_") {
            sqlx::query(&s).execute(&mut conn).await.unwrap();
        }
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT)")
            .execute(&mut conn)
            .await
            .unwrap();
        let entry = TableToWatch::new(None, None, "t");
        let cols = dialect
            .describe_table(&mut conn, &MappedName::unmapped(None, "t"))
            .await
            .unwrap();
        for s in dialect.create_trigger_statements("repl_", &entry, &cols).unwrap() {
            sqlx::query(&s).execute(&mut conn).await.unwrap();
        }
        let mut entry = entry;
        entry.status = crate::watch::WatchStatus::Ok;
        WatchRegistry::new("repl_").store(&mut conn, &entry).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let store = Arc::new(ReplKeyStore::in_memory().await.unwrap());
        let converter = ChangeConverter::new(
            "master",
            "repl_",
            dialect,
            recorder.clone(),
            store,
            100,
        );
        (conn, recorder, converter)
    }

    #[tokio::test]
    async fn test_converts_and_cleans_up() {
        let (mut conn, recorder, converter) = setup().await;
        sqlx::query("INSERT INTO t VALUES (1, 'a'), (2, 'b')")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("UPDATE t SET val = 'c' WHERE id = 1")
            .execute(&mut conn)
            .await
            .unwrap();

        let consumed = converter.check_again(&mut conn).await.unwrap();
        assert_eq!(consumed, 3);

        let msgs = recorder.messages.lock().await;
        // Two statements, two transaction keys.
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].rows.len(), 2);
        assert_eq!(msgs[1].rows[0].attr(attr::ACTION), Some("UPDATE"));
        assert!(msgs[1].rows[0].attr(attr::OLD_CONTENT).is_some());
        let (lo, hi) = msgs[0].repl_key_range().unwrap();
        assert!(lo < hi);

        let left: i64 = sqlx::query_scalar("SELECT count(*) FROM repl_items")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(left, 0);
        assert!(converter.last_published().await.unwrap() > 0);

        let mark: i64 =
            sqlx::query_scalar("SELECT repl_key FROM repl_tables WHERE tablename = 't'")
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!(mark, converter.last_published().await.unwrap());
    }

    #[tokio::test]
    async fn test_rapid_statements_stay_separate_messages() {
        let (mut conn, recorder, converter) = setup().await;
        for id in 0..20i64 {
            sqlx::query("INSERT INTO t VALUES (?, 'v')")
                .bind(id)
                .execute(&mut conn)
                .await
                .unwrap();
        }
        assert_eq!(converter.check_again(&mut conn).await.unwrap(), 20);

        let msgs = recorder.messages.lock().await;
        assert_eq!(msgs.len(), 20);
        assert!(msgs.iter().all(|m| m.rows.len() == 1));
    }

    #[tokio::test]
    async fn test_nothing_staged() {
        let (mut conn, recorder, converter) = setup().await;
        assert_eq!(converter.check_again(&mut conn).await.unwrap(), 0);
        assert!(recorder.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_rows_are_marked_processed() {
        let (mut conn, recorder, converter) = setup().await;
        sqlx::query("INSERT INTO t VALUES (1, 'a')")
            .execute(&mut conn)
            .await
            .unwrap();
        converter.check_again(&mut conn).await.unwrap();
        let published = converter.last_published().await.unwrap();

        // Simulate a crash between publish and cleanup: the same row is staged again.
        sqlx::query(
            "INSERT INTO repl_items (repl_key, trans_key, db_id, table_name, guid, db_action, content, version) \
             VALUES (?, 'x', 'main', 't', '1', 'INSERT', '{\"id\":1,\"val\":\"a\"}', '1.0')",
        )
        .bind(published)
        .execute(&mut conn)
        .await
        .unwrap();
        converter.check_again(&mut conn).await.unwrap();

        let msgs = recorder.messages.lock().await;
        assert_eq!(msgs.len(), 2);
        assert!(!msgs[0].is_already_processed());
        assert!(msgs[1].is_already_processed());
    }

    #[tokio::test]
    async fn test_missing_content_refilled_by_guid() {
        let (mut conn, recorder, converter) = setup().await;
        sqlx::query("INSERT INTO t VALUES (7, 'seven')")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("UPDATE repl_items SET content = NULL")
            .execute(&mut conn)
            .await
            .unwrap();
        converter.check_again(&mut conn).await.unwrap();

        let msgs = recorder.messages.lock().await;
        assert_eq!(
            msgs[0].rows[0].columns.get("val"),
            Some(&serde_json::json!("seven"))
        );
    }

    #[tokio::test]
    async fn test_structure_change_published_as_create() {
        let (mut conn, recorder, converter) = setup().await;
        let registry = WatchRegistry::new("repl_");
        registry
            .store(&mut conn, &TableToWatch::new(None, None, "late"))
            .await
            .unwrap();
        sqlx::query("CREATE TABLE late (k INTEGER PRIMARY KEY, v TEXT)")
            .execute(&mut conn)
            .await
            .unwrap();

        converter.check_again(&mut conn).await.unwrap();
        sqlx::query("INSERT INTO late VALUES (1, 'one')")
            .execute(&mut conn)
            .await
            .unwrap();
        converter.check_again(&mut conn).await.unwrap();

        let msgs = recorder.messages.lock().await;
        assert_eq!(msgs[0].command().unwrap(), Command::Create);
        assert_eq!(msgs[0].description.columns.len(), 2);
        assert_eq!(msgs[1].command().unwrap(), Command::Replication);
        assert_eq!(msgs[1].attr(attr::TABLE_NAME), Some("late"));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_staged_rows() {
        struct Failing;
        impl ChangePublisher for Failing {
            fn publish(&self, _msg: ChangeMessage) -> BoxFuture<'_, ()> {
                Box::pin(async { Err(ReplicationError::Transport("down".into())) })
            }
        }

        let (mut conn, _recorder, converter) = setup().await;
        let converter = ChangeConverter {
            publisher: Arc::new(Failing),
            ..converter
        };
        sqlx::query("INSERT INTO t VALUES (1, 'a')")
            .execute(&mut conn)
            .await
            .unwrap();
        let err = converter.check_again(&mut conn).await.unwrap_err();
        assert!(err.is_retryable());

        let left: i64 = sqlx::query_scalar("SELECT count(*) FROM repl_items")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(left, 1);
    }
}
