// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite dialect.
//!
//! Capture is trigger based. Every watched table gets three `AFTER` row
//! triggers that stage one row per change into `<prefix>items`:
//!
//! ```text
//! repl_key     INTEGER PK AUTOINCREMENT   global order key
//! trans_key    <prefix>trans counter      groups the rows of one statement
//! db_id        'main'
//! table_name   source table
//! guid         rowid of the changed row
//! db_action    INSERT | UPDATE | DELETE | CREATE | DROP | ALTER
//! db_schema    source schema or NULL
//! content      json_object(...) after-image
//! old_content  json_object(...) before-image
//! version      replication format version
//! ```
//!
//! SQLite has no notification primitive and no DDL triggers, so the
//! scheduler polls and structure changes are found by
//! [`force_table_change_check`](Dialect::force_table_change_check).
//!
//! # Transaction Keys
//!
//! Triggers cannot see a transaction id, so the key is taken per capturing
//! statement from the single row of `<prefix>trans`. Before staging, every
//! trigger bumps the counter unless the row still carries the stamp of the
//! running statement: its `'now'` and the connection's `total_changes()`.
//! Both stay fixed while one statement runs. `total_changes()` moves on with
//! every completed statement of the connection, so the next statement always
//! gets a new key even within the same millisecond. DDL markers always take
//! a fresh key.
//!
//! Triggers in an attached schema cannot write into the main schema, so only
//! tables of the main schema can be watched. BLOB columns cannot be captured
//! because `json_object` rejects BLOB values.

use super::Dialect;
use crate::error::{ReplicationError, Result};
use crate::mapper::MappedName;
use crate::message::{ColumnDescriptor, REPL_VERSION};
use crate::transport::BoxFuture;
use crate::watch::{TableToWatch, WatchRegistry, WatchStatus};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::{debug, info};

const DB_ID: &str = "main";

/// Statement stamp. SQLite keeps `'now'` fixed for the duration of one
/// statement, `total_changes()` only moves when a statement completes.
const STATEMENT_STAMP_EXPR: &str = "strftime('%Y%m%d%H%M%f', 'now')";
const STATEMENT_CHANGES_EXPR: &str = "total_changes()";

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqliteDialect {
    pub fn new() -> Self {
        Self
    }

    fn items_table(prefix: &str) -> String {
        format!("{}items", prefix)
    }

    fn trans_table(prefix: &str) -> String {
        format!("{}trans", prefix)
    }

    /// Key of the current transaction, as text.
    fn trans_key_expr(prefix: &str) -> String {
        format!("(SELECT CAST(trans_key AS TEXT) FROM {} WHERE id = 1)", Self::trans_table(prefix))
    }

    /// Bump the transaction key unless this statement already did.
    fn open_trans_statement(prefix: &str) -> String {
        format!(
            "UPDATE {0} SET trans_key = trans_key + 1, stamp = {1}, changes = {2} \
             WHERE id = 1 AND (stamp IS NOT {1} OR changes IS NOT {2})",
            Self::trans_table(prefix),
            STATEMENT_STAMP_EXPR,
            STATEMENT_CHANGES_EXPR
        )
    }

    fn schema_literal(&self, schema: Option<&str>) -> String {
        match schema {
            Some(s) => self.quote_literal(s),
            None => "NULL".to_string(),
        }
    }

    /// `json_object('a', NEW."a", 'b', NEW."b")`
    fn row_image(&self, alias: &str, columns: &[ColumnDescriptor]) -> String {
        let pairs: Vec<String> = columns
            .iter()
            .map(|c| {
                format!(
                    "{}, {}.{}",
                    self.quote_literal(&c.name),
                    alias,
                    self.quote_identifier(&c.name)
                )
            })
            .collect();
        format!("json_object({})", pairs.join(", "))
    }

    fn trigger_names(&self, prefix: &str, entry: &TableToWatch) -> [String; 3] {
        let base = entry.trigger_name(prefix);
        [
            format!("{}_i", base),
            format!("{}_u", base),
            format!("{}_d", base),
        ]
    }

    fn ensure_watchable(entry: &TableToWatch) -> Result<()> {
        if entry.catalog().is_some() {
            return Err(ReplicationError::Config(format!(
                "SQLite has no catalogs, cannot watch '{}'",
                entry.config_key()
            )));
        }
        match entry.schema() {
            None => Ok(()),
            Some(s) if s.eq_ignore_ascii_case("main") => Ok(()),
            Some(_) => Err(ReplicationError::Config(format!(
                "SQLite triggers can only capture tables of the main schema, cannot watch '{}'",
                entry.config_key()
            ))),
        }
    }

    /// Insert a DDL marker row into the staging table.
    async fn stage_ddl(
        &self,
        conn: &mut SqliteConnection,
        prefix: &str,
        entry: &TableToWatch,
        action: &str,
    ) -> Result<()> {
        // A structure change is a transaction of its own.
        sqlx::query(&format!(
            "UPDATE {} SET trans_key = trans_key + 1, stamp = NULL, changes = NULL WHERE id = 1",
            Self::trans_table(prefix)
        ))
        .execute(&mut *conn)
        .await?;
        let sql = format!(
            "INSERT INTO {} (trans_key, db_id, table_name, guid, db_action, db_schema, content, old_content, version) \
             VALUES ({}, ?, ?, NULL, ?, ?, NULL, NULL, ?)",
            Self::items_table(prefix),
            Self::trans_key_expr(prefix)
        );
        sqlx::query(&sql)
            .bind(DB_ID)
            .bind(&entry.table)
            .bind(action)
            .bind(entry.schema())
            .bind(REPL_VERSION)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn check_watchable(&self, entry: &TableToWatch) -> Result<()> {
        Self::ensure_watchable(entry)
    }

    fn bootstrap_statements(&self, prefix: &str) -> Vec<String> {
        let items = Self::items_table(prefix);
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                    repl_key INTEGER PRIMARY KEY AUTOINCREMENT, \
                    trans_key TEXT NOT NULL, \
                    db_id TEXT NOT NULL, \
                    table_name TEXT NOT NULL, \
                    guid TEXT, \
                    db_action TEXT NOT NULL, \
                    db_schema TEXT, \
                    content TEXT, \
                    old_content TEXT, \
                    version TEXT NOT NULL)",
                items
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {}tables (\
                    catalogname TEXT NOT NULL, \
                    schemaname TEXT NOT NULL, \
                    tablename TEXT NOT NULL, \
                    replicate INTEGER NOT NULL DEFAULT 1, \
                    trigger_name TEXT, \
                    repl_key INTEGER NOT NULL DEFAULT -1, \
                    status TEXT, \
                    PRIMARY KEY (catalogname, schemaname, tablename))",
                prefix
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                    id INTEGER PRIMARY KEY CHECK (id = 1), \
                    trans_key INTEGER NOT NULL, \
                    stamp TEXT, \
                    changes INTEGER)",
                Self::trans_table(prefix)
            ),
            format!(
                "INSERT OR IGNORE INTO {} (id, trans_key) VALUES (1, 0)",
                Self::trans_table(prefix)
            ),
            // Seed the sequence so increment_repl_key always has a row to bump.
            format!(
                "INSERT INTO sqlite_sequence (name, seq) SELECT '{0}', 0 \
                 WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = '{0}')",
                items
            ),
        ]
    }

    fn cleanup_statements(&self, prefix: &str) -> Vec<String> {
        let items = Self::items_table(prefix);
        vec![
            format!("DROP TABLE IF EXISTS {}", items),
            format!("DROP TABLE IF EXISTS {}tables", prefix),
            format!("DROP TABLE IF EXISTS {}", Self::trans_table(prefix)),
        ]
    }

    fn create_trigger_statements(
        &self,
        prefix: &str,
        entry: &TableToWatch,
        columns: &[ColumnDescriptor],
    ) -> Result<Vec<String>> {
        Self::ensure_watchable(entry)?;
        if columns.is_empty() {
            return Err(ReplicationError::Config(format!(
                "cannot add triggers to '{}': table has no columns or does not exist",
                entry.table
            )));
        }

        let items = Self::items_table(prefix);
        let table = self.quote_identifier(&entry.table);
        let table_lit = self.quote_literal(&entry.table);
        let schema_lit = self.schema_literal(entry.schema());
        let version_lit = self.quote_literal(REPL_VERSION);
        let [ins, upd, del] = self.trigger_names(prefix, entry);
        let open_trans = Self::open_trans_statement(prefix);
        let trans_key = Self::trans_key_expr(prefix);

        let body = |action: &str, guid: &str, content: &str, old: &str| {
            format!(
                "{}; INSERT INTO {} (trans_key, db_id, table_name, guid, db_action, db_schema, content, old_content, version) \
                 VALUES ({}, '{}', {}, CAST({} AS TEXT), '{}', {}, {}, {}, {});",
                open_trans, items, trans_key, DB_ID, table_lit, guid, action, schema_lit, content, old, version_lit
            )
        };

        let new_image = self.row_image("NEW", columns);
        let old_image = self.row_image("OLD", columns);

        Ok(vec![
            format!(
                "CREATE TRIGGER IF NOT EXISTS {} AFTER INSERT ON {} FOR EACH ROW BEGIN {} END",
                self.quote_identifier(&ins),
                table,
                body("INSERT", "NEW.rowid", &new_image, "NULL")
            ),
            format!(
                "CREATE TRIGGER IF NOT EXISTS {} AFTER UPDATE ON {} FOR EACH ROW BEGIN {} END",
                self.quote_identifier(&upd),
                table,
                body("UPDATE", "NEW.rowid", &new_image, &old_image)
            ),
            format!(
                "CREATE TRIGGER IF NOT EXISTS {} AFTER DELETE ON {} FOR EACH ROW BEGIN {} END",
                self.quote_identifier(&del),
                table,
                body("DELETE", "OLD.rowid", "NULL", &old_image)
            ),
        ])
    }

    fn drop_trigger_statements(&self, prefix: &str, entry: &TableToWatch) -> Vec<String> {
        self.trigger_names(prefix, entry)
            .iter()
            .map(|name| format!("DROP TRIGGER IF EXISTS {}", self.quote_identifier(name)))
            .collect()
    }

    fn snapshot_statement(&self, name: &MappedName, columns: &[ColumnDescriptor]) -> String {
        format!(
            "SELECT CAST(src.rowid AS TEXT), {} FROM {} AS src ORDER BY src.rowid",
            self.row_image("src", columns),
            self.qualified_name(name)
        )
    }

    fn is_bootstrapped<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        prefix: &'a str,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN (?, ?, ?)",
            )
            .bind(Self::items_table(prefix))
            .bind(format!("{}tables", prefix))
            .bind(Self::trans_table(prefix))
            .fetch_one(&mut *conn)
            .await?;
            Ok(count == 3)
        })
    }

    fn table_exists<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        name: &'a MappedName,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let master = match &name.schema {
                Some(s) => format!("{}.sqlite_master", self.quote_identifier(s)),
                None => "sqlite_master".to_string(),
            };
            let sql = format!(
                "SELECT count(*) FROM {} WHERE type = 'table' AND name = ? COLLATE NOCASE",
                master
            );
            let count: i64 = sqlx::query_scalar(&sql)
                .bind(&name.table)
                .fetch_one(&mut *conn)
                .await?;
            Ok(count > 0)
        })
    }

    fn describe_table<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        name: &'a MappedName,
    ) -> BoxFuture<'a, Vec<ColumnDescriptor>> {
        Box::pin(async move {
            let rows = match &name.schema {
                Some(schema) => {
                    sqlx::query("SELECT name, type, pk FROM pragma_table_info(?, ?) ORDER BY cid")
                        .bind(&name.table)
                        .bind(schema)
                        .fetch_all(&mut *conn)
                        .await?
                }
                None => {
                    sqlx::query("SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid")
                        .bind(&name.table)
                        .fetch_all(&mut *conn)
                        .await?
                }
            };

            let mut columns = Vec::with_capacity(rows.len());
            for row in rows {
                let col_name: String = row.try_get("name")?;
                let sql_type: String = row.try_get("type")?;
                let pk: i64 = row.try_get("pk")?;
                columns.push(ColumnDescriptor::new(&col_name, &sql_type, pk.max(0) as u32));
            }
            Ok(columns)
        })
    }

    fn increment_repl_key<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        prefix: &'a str,
    ) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let key: Option<i64> = sqlx::query_scalar(
                "UPDATE sqlite_sequence SET seq = seq + 1 WHERE name = ? RETURNING seq",
            )
            .bind(Self::items_table(prefix))
            .fetch_optional(&mut *conn)
            .await?;
            key.ok_or_else(|| {
                ReplicationError::InvalidState {
                    expected: "bootstrapped master".to_string(),
                    actual: format!("no sequence for '{}'", Self::items_table(prefix)),
                }
            })
        })
    }

    fn content_from_guid<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        name: &'a MappedName,
        guid: &'a str,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let columns = self.describe_table(&mut *conn, name).await?;
            if columns.is_empty() {
                return Ok(None);
            }
            let rowid: i64 = match guid.parse() {
                Ok(id) => id,
                Err(_) => return Ok(None),
            };
            let pairs: Vec<String> = columns
                .iter()
                .map(|c| format!("{}, {}", self.quote_literal(&c.name), self.quote_identifier(&c.name)))
                .collect();
            let sql = format!(
                "SELECT json_object({}) FROM {} WHERE rowid = ?",
                pairs.join(", "),
                self.qualified_name(name)
            );
            let content: Option<String> = sqlx::query_scalar(&sql)
                .bind(rowid)
                .fetch_optional(&mut *conn)
                .await?;
            Ok(content)
        })
    }

    fn force_table_change_check<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        prefix: &'a str,
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let registry = WatchRegistry::new(prefix);
            let entries = registry.get_all(&mut *conn).await?;
            let mut staged = 0;

            for entry in entries.iter().filter(|e| e.replicate) {
                let name = MappedName::unmapped(None, &entry.table);
                let exists = self.table_exists(&mut *conn, &name).await?;

                match (entry.status, exists) {
                    (WatchStatus::Ok, false) => {
                        info!(table = %entry.table, "Watched table disappeared, staging DROP");
                        self.stage_ddl(&mut *conn, prefix, entry, "DROP").await?;
                        registry
                            .set_status(&mut *conn, entry, WatchStatus::Creating)
                            .await?;
                        staged += 1;
                    }
                    (WatchStatus::Creating, true) => {
                        let columns = self.describe_table(&mut *conn, &name).await?;
                        for stmt in self.create_trigger_statements(prefix, entry, &columns)? {
                            sqlx::query(&stmt).execute(&mut *conn).await?;
                        }
                        info!(table = %entry.table, "Watched table appeared, staging CREATE");
                        self.stage_ddl(&mut *conn, prefix, entry, "CREATE").await?;
                        registry.set_status(&mut *conn, entry, WatchStatus::Ok).await?;
                        staged += 1;
                    }
                    _ => {}
                }
            }

            debug!(staged, "Table change check complete");
            Ok(staged)
        })
    }
}
