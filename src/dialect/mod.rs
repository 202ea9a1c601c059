// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-RDBMS behaviour.
//!
//! A [`Dialect`] knows how to install and remove the capture
//! infrastructure on a master, how to generate CREATE TABLE and trigger
//! statements, how to read table metadata, and how to force a structure
//! check. Dialects are picked by name through [`create_dialect`], a fixed
//! registry.
//!
//! SQL generation is synchronous and side-effect free. Everything that
//! talks to the database takes the connection it should run on, so callers
//! decide the transaction boundaries.

mod sqlite;

pub use sqlite::SqliteDialect;

use crate::error::{ReplicationError, Result};
use crate::mapper::MappedName;
use crate::message::ColumnDescriptor;
use crate::transport::BoxFuture;
use crate::watch::TableToWatch;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;

/// Database-specific SQL generation and metadata access.
pub trait Dialect: Send + Sync + 'static {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name).
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Quote a string literal.
    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Normalize an identifier for use as a metadata cache key.
    fn normalize_identifier(&self, ident: &str) -> String {
        ident.trim().to_lowercase()
    }

    /// Fully qualified, quoted table name. The schema is omitted when absent.
    fn qualified_name(&self, name: &MappedName) -> String {
        match &name.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(&name.table)
            ),
            None => self.quote_identifier(&name.table),
        }
    }

    /// Column clause of a CREATE TABLE statement.
    fn column_statement(&self, column: &ColumnDescriptor) -> String {
        let mut stmt = self.quote_identifier(&column.name);
        if !column.sql_type.trim().is_empty() {
            stmt.push(' ');
            stmt.push_str(column.sql_type.trim());
        }
        if column.primary_key {
            stmt.push_str(" NOT NULL");
        }
        stmt
    }

    /// `CREATE TABLE <name> (col type, ..., PRIMARY KEY (pk1, pk2))`.
    fn create_table_statement(&self, name: &MappedName, columns: &[ColumnDescriptor]) -> String {
        let mut parts: Vec<String> = columns.iter().map(|c| self.column_statement(c)).collect();

        let mut pk: Vec<&ColumnDescriptor> = columns.iter().filter(|c| c.primary_key).collect();
        pk.sort_by_key(|c| c.pk_position);
        if !pk.is_empty() {
            let names: Vec<String> = pk.iter().map(|c| self.quote_identifier(&c.name)).collect();
            parts.push(format!("PRIMARY KEY ({})", names.join(", ")));
        }

        format!(
            "CREATE TABLE {} ({})",
            self.qualified_name(name),
            parts.join(", ")
        )
    }

    fn drop_table_statement(&self, name: &MappedName) -> String {
        format!("DROP TABLE {}", self.qualified_name(name))
    }

    /// Reject tables this dialect cannot capture.
    fn check_watchable(&self, _entry: &TableToWatch) -> Result<()> {
        Ok(())
    }

    /// Statements creating the staging and registry tables.
    fn bootstrap_statements(&self, prefix: &str) -> Vec<String>;

    /// Statements removing what [`bootstrap_statements`](Self::bootstrap_statements) created.
    /// Triggers are removed separately, per watched table.
    fn cleanup_statements(&self, prefix: &str) -> Vec<String>;

    /// Statements installing capture triggers on one watched table.
    fn create_trigger_statements(
        &self,
        prefix: &str,
        entry: &TableToWatch,
        columns: &[ColumnDescriptor],
    ) -> Result<Vec<String>>;

    /// Statements removing the capture triggers of one watched table.
    fn drop_trigger_statements(&self, prefix: &str, entry: &TableToWatch) -> Vec<String>;

    /// Query returning `(guid, row image)` for every row of a table, in a
    /// stable order. Used for initial updates.
    fn snapshot_statement(&self, name: &MappedName, columns: &[ColumnDescriptor]) -> String;

    /// Whether the capture infrastructure exists.
    fn is_bootstrapped<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        prefix: &'a str,
    ) -> BoxFuture<'a, bool>;

    /// Whether a table exists (case-insensitive).
    fn table_exists<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        name: &'a MappedName,
    ) -> BoxFuture<'a, bool>;

    /// Ordered column descriptors; empty when the table does not exist.
    fn describe_table<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        name: &'a MappedName,
    ) -> BoxFuture<'a, Vec<ColumnDescriptor>>;

    /// Reserve a new replKey without staging a change.
    fn increment_repl_key<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        prefix: &'a str,
    ) -> BoxFuture<'a, i64>;

    /// Current content of the row identified by `guid`, serialized as a row image.
    fn content_from_guid<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        name: &'a MappedName,
        guid: &'a str,
    ) -> BoxFuture<'a, Option<String>>;

    /// Compare the registry with the live catalog and stage CREATE/DROP
    /// records for tables that appeared or disappeared. Returns the number
    /// of staged records.
    fn force_table_change_check<'a>(
        &'a self,
        conn: &'a mut SqliteConnection,
        prefix: &'a str,
    ) -> BoxFuture<'a, usize>;

    /// Whether [`wait_for_change`](Self::wait_for_change) blocks on a real
    /// database notification.
    fn supports_change_notification(&self) -> bool {
        false
    }

    /// Block until the database signals new changes or `timeout` passes.
    /// Returns true when woken by a notification.
    fn wait_for_change<'a>(
        &'a self,
        _conn: &'a mut SqliteConnection,
        _timeout: Duration,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }
}

/// Instantiate a dialect by registry name.
pub fn create_dialect(name: &str) -> Result<Arc<dyn Dialect>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "sqlite" | "sqlite3" => Ok(Arc::new(SqliteDialect::new())),
        other => Err(ReplicationError::Config(format!(
            "unknown 'db.dialect' '{}' (known: sqlite)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert_eq!(create_dialect("sqlite").unwrap().name(), "sqlite");
        assert_eq!(create_dialect("SQLite3").unwrap().name(), "sqlite");
        assert!(create_dialect("oracle").is_err());
    }

    #[test]
    fn test_quote_identifier_escapes() {
        let d = SqliteDialect::new();
        assert_eq!(d.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(d.quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_create_table_statement() {
        let d = SqliteDialect::new();
        let name = MappedName::unmapped(Some("shop"), "orders");
        let cols = vec![
            ColumnDescriptor::new("b", "TEXT", 2),
            ColumnDescriptor::new("a", "INTEGER", 1),
            ColumnDescriptor::new("val", "REAL", 0),
        ];
        assert_eq!(
            d.create_table_statement(&name, &cols),
            "CREATE TABLE \"shop\".\"orders\" (\"b\" TEXT NOT NULL, \"a\" INTEGER NOT NULL, \"val\" REAL, PRIMARY KEY (\"a\", \"b\"))"
        );
    }

    #[test]
    fn test_create_table_without_schema_or_pk() {
        let d = SqliteDialect::new();
        let name = MappedName::unmapped(None, "log");
        let cols = vec![ColumnDescriptor::new("msg", "", 0)];
        assert_eq!(
            d.create_table_statement(&name, &cols),
            "CREATE TABLE \"log\" (\"msg\")"
        );
    }

    #[test]
    fn test_normalize_identifier() {
        let d = SqliteDialect::new();
        assert_eq!(d.normalize_identifier(" Foo "), "foo");
    }
}
