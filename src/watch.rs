// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table watch registry.
//!
//! Holds the set of master tables under capture. Each entry is uniquely keyed
//! by its `(catalog, schema, table)` triple; catalog and schema may be empty,
//! in which case they carry the explicit [`EMPTY`] marker rather than an
//! "unspecified" value.
//!
//! Entries come from two places:
//! - configuration pairs `table.[catalog.][schema.]table = replicate,trigger,replKey`
//! - the persisted `<prefix>tables` registry table on the master
//!
//! # Value Format
//!
//! ```text
//! table.myschema.mytable = true,trg1,42
//!                          │    │    └── replKey (high-water mark, default -1)
//!                          │    └─────── trigger base name (default generated)
//!                          └──────────── replicate flag (default true)
//! ```
//!
//! The older `actions=IDU,trigger=trg1,sequence=42` form is accepted too;
//! an empty `actions` list means "do not replicate".

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use std::fmt;
use tracing::{debug, info};

/// Marker stored for an empty catalog or schema.
pub const EMPTY: &str = " ";

/// Configuration key prefix for watched tables.
pub const TABLE_PREFIX: &str = "table.";

/// Default high-water mark for a table that never replicated.
pub const DEFAULT_REPL_KEY: i64 = -1;

/// Lifecycle status of a watched table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchStatus {
    /// Registered, triggers not yet installed.
    Creating,
    /// Triggers installed, changes are captured.
    Ok,
    /// Marked for removal.
    Remove,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Creating => "CREATING",
            WatchStatus::Ok => "OK",
            WatchStatus::Remove => "REMOVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATING" => Some(WatchStatus::Creating),
            "OK" => Some(WatchStatus::Ok),
            "REMOVE" => Some(WatchStatus::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table under capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableToWatch {
    /// Catalog, or [`EMPTY`].
    pub catalog: String,
    /// Schema, or [`EMPTY`].
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Whether changes are captured. May be toggled at any time.
    pub replicate: bool,
    /// Trigger base name. `None` means generate one from the prefix.
    #[serde(default)]
    pub trigger: Option<String>,
    /// High-water replication key. Only ever increases.
    #[serde(default = "default_repl_key")]
    pub repl_key: i64,
    #[serde(default = "default_status")]
    pub status: WatchStatus,
}

fn default_repl_key() -> i64 {
    DEFAULT_REPL_KEY
}

fn default_status() -> WatchStatus {
    WatchStatus::Creating
}

/// Normalize an optional catalog/schema to the stored representation.
pub fn or_empty(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => EMPTY.to_string(),
    }
}

/// Turn the stored representation back into an optional qualifier.
pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

impl TableToWatch {
    /// Create an entry with defaults (replicate, generated trigger, replKey -1).
    pub fn new(catalog: Option<&str>, schema: Option<&str>, table: &str) -> Self {
        Self {
            catalog: or_empty(catalog),
            schema: or_empty(schema),
            table: table.trim().to_string(),
            replicate: true,
            trigger: None,
            repl_key: DEFAULT_REPL_KEY,
            status: WatchStatus::Creating,
        }
    }

    /// Parse a configuration pair such as `table.myschema.mytable = true,trg1,42`.
    pub fn from_property(key: &str, value: &str) -> Result<Self> {
        let name = key.trim().strip_prefix(TABLE_PREFIX).ok_or_else(|| {
            ReplicationError::Config(format!(
                "watched table key '{}' must start with '{}'",
                key, TABLE_PREFIX
            ))
        })?;

        let parts: Vec<&str> = name.split('.').collect();
        let (catalog, schema, table) = match parts.as_slice() {
            [t] => (None, None, *t),
            [s, t] => (None, Some(*s), *t),
            [c, s, t] => (Some(*c), Some(*s), *t),
            _ => {
                return Err(ReplicationError::Config(format!(
                    "watched table key '{}' has too many segments",
                    key
                )))
            }
        };
        if table.trim().is_empty() {
            return Err(ReplicationError::Config(format!(
                "watched table key '{}' has no table name",
                key
            )));
        }

        let mut entry = TableToWatch::new(catalog, schema, table);
        entry.assign_value(value)?;
        Ok(entry)
    }

    fn assign_value(&mut self, value: &str) -> Result<()> {
        if value.contains('=') {
            return self.assign_named_value(value);
        }

        let mut fields = value.split(',').map(str::trim);
        if let Some(replicate) = fields.next() {
            if !replicate.is_empty() {
                self.replicate = parse_flag(replicate)?;
            }
        }
        if let Some(trigger) = fields.next() {
            if !trigger.is_empty() {
                self.trigger = Some(trigger.to_string());
            }
        }
        if let Some(repl_key) = fields.next() {
            if !repl_key.is_empty() {
                self.repl_key = parse_repl_key(repl_key)?;
            }
        }
        Ok(())
    }

    fn assign_named_value(&mut self, value: &str) -> Result<()> {
        for pair in value.split(',') {
            let (k, v) = match pair.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            };
            match k {
                "actions" => self.replicate = !v.is_empty(),
                "replicate" => self.replicate = parse_flag(v)?,
                "trigger" if !v.is_empty() => self.trigger = Some(v.to_string()),
                "sequence" | "replKey" if !v.is_empty() => self.repl_key = parse_repl_key(v)?,
                _ => debug!(key = k, "Ignoring unknown watched table attribute"),
            }
        }
        Ok(())
    }

    /// Configuration key for this entry, the inverse of [`from_property`](Self::from_property).
    pub fn config_key(&self) -> String {
        let mut key = TABLE_PREFIX.to_string();
        if let Some(c) = non_empty(&self.catalog) {
            key.push_str(c);
            key.push('.');
        }
        if let Some(s) = non_empty(&self.schema) {
            key.push_str(s);
            key.push('.');
        }
        key.push_str(&self.table);
        key
    }

    /// Configuration value in positional form.
    pub fn config_value(&self) -> String {
        format!(
            "{},{},{}",
            self.replicate,
            self.trigger.as_deref().unwrap_or(""),
            self.repl_key
        )
    }

    pub fn catalog(&self) -> Option<&str> {
        non_empty(&self.catalog)
    }

    pub fn schema(&self) -> Option<&str> {
        non_empty(&self.schema)
    }

    /// Whether both entries refer to the same table (case-insensitive).
    pub fn same_table(&self, other: &TableToWatch) -> bool {
        self.catalog.eq_ignore_ascii_case(&other.catalog)
            && self.schema.eq_ignore_ascii_case(&other.schema)
            && self.table.eq_ignore_ascii_case(&other.table)
    }

    /// Trigger base name, generated from the prefix when not configured.
    pub fn trigger_name(&self, prefix: &str) -> String {
        match &self.trigger {
            Some(t) => t.clone(),
            None => format!("{}trg_{}", prefix, self.table.to_lowercase()),
        }
    }
}

impl fmt::Display for TableToWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.config_key(), self.config_value())
    }
}

fn parse_flag(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(ReplicationError::Config(format!(
            "invalid replicate flag '{}'",
            other
        ))),
    }
}

fn parse_repl_key(s: &str) -> Result<i64> {
    s.parse::<i64>()
        .map_err(|e| ReplicationError::Config(format!("invalid replKey '{}': {}", s, e)))
}

/// Parse every `table.*` pair, sorted by replKey (the order triggers get added in).
pub fn parse_all<'a, I>(pairs: I) -> Result<Vec<TableToWatch>>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut tables = Vec::new();
    for (key, value) in pairs {
        if key.starts_with(TABLE_PREFIX) {
            tables.push(TableToWatch::from_property(key, value)?);
        }
    }
    sort_by_repl_key(&mut tables);
    Ok(tables)
}

/// Stable sort by replKey.
pub fn sort_by_repl_key(tables: &mut [TableToWatch]) {
    tables.sort_by_key(|t| t.repl_key);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persisted registry (<prefix>tables on the master)
// ═══════════════════════════════════════════════════════════════════════════════

/// Access to the persisted registry table on the master database.
#[derive(Debug, Clone)]
pub struct WatchRegistry {
    table_name: String,
}

impl WatchRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            table_name: format!("{}tables", prefix),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Look up one entry by identity.
    pub async fn get(
        &self,
        conn: &mut SqliteConnection,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<TableToWatch>> {
        let sql = format!(
            "SELECT catalogname, schemaname, tablename, replicate, trigger_name, repl_key, status \
             FROM {} WHERE catalogname = ? AND schemaname = ? AND tablename = ? COLLATE NOCASE",
            self.table_name
        );
        let row = sqlx::query(&sql)
            .bind(or_empty(catalog))
            .bind(or_empty(schema))
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    /// All entries, ordered by replKey.
    pub async fn get_all(&self, conn: &mut SqliteConnection) -> Result<Vec<TableToWatch>> {
        let sql = format!(
            "SELECT catalogname, schemaname, tablename, replicate, trigger_name, repl_key, status \
             FROM {} ORDER BY repl_key, tablename",
            self.table_name
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Insert the entry, or replace the stored one with the same identity.
    pub async fn store(&self, conn: &mut SqliteConnection, entry: &TableToWatch) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (catalogname, schemaname, tablename, replicate, trigger_name, repl_key, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(catalogname, schemaname, tablename) DO UPDATE SET \
                replicate = excluded.replicate, \
                trigger_name = excluded.trigger_name, \
                repl_key = MAX(repl_key, excluded.repl_key), \
                status = excluded.status",
            self.table_name
        );
        sqlx::query(&sql)
            .bind(&entry.catalog)
            .bind(&entry.schema)
            .bind(&entry.table)
            .bind(entry.replicate)
            .bind(entry.trigger.as_deref())
            .bind(entry.repl_key)
            .bind(entry.status.as_str())
            .execute(&mut *conn)
            .await?;
        debug!(table = %entry.table, status = %entry.status, "Stored watched table");
        Ok(())
    }

    pub async fn set_status(
        &self,
        conn: &mut SqliteConnection,
        entry: &TableToWatch,
        status: WatchStatus,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ? WHERE catalogname = ? AND schemaname = ? AND tablename = ? COLLATE NOCASE",
            self.table_name
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(&entry.catalog)
            .bind(&entry.schema)
            .bind(&entry.table)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Toggle the replicate flag. Returns false if the entry does not exist.
    pub async fn set_replicate(
        &self,
        conn: &mut SqliteConnection,
        entry: &TableToWatch,
        replicate: bool,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET replicate = ? WHERE catalogname = ? AND schemaname = ? AND tablename = ? COLLATE NOCASE",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(replicate)
            .bind(&entry.catalog)
            .bind(&entry.schema)
            .bind(&entry.table)
            .execute(&mut *conn)
            .await?;
        info!(table = %entry.table, replicate, "Replicate flag changed");
        Ok(result.rows_affected() > 0)
    }

    /// Raise the high-water mark. Lower values are ignored.
    pub async fn update_repl_key(
        &self,
        conn: &mut SqliteConnection,
        entry: &TableToWatch,
        repl_key: i64,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET repl_key = ? WHERE catalogname = ? AND schemaname = ? AND tablename = ? COLLATE NOCASE AND repl_key < ?",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(repl_key)
            .bind(&entry.catalog)
            .bind(&entry.schema)
            .bind(&entry.table)
            .bind(repl_key)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove(&self, conn: &mut SqliteConnection, entry: &TableToWatch) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE catalogname = ? AND schemaname = ? AND tablename = ? COLLATE NOCASE",
            self.table_name
        );
        let result = sqlx::query(&sql)
            .bind(&entry.catalog)
            .bind(&entry.schema)
            .bind(&entry.table)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<TableToWatch> {
    let status: Option<String> = row.try_get("status")?;
    Ok(TableToWatch {
        catalog: row.try_get("catalogname")?,
        schema: row.try_get("schemaname")?,
        table: row.try_get("tablename")?,
        replicate: row.try_get("replicate")?,
        trigger: row.try_get("trigger_name")?,
        repl_key: row.try_get("repl_key")?,
        status: status
            .as_deref()
            .and_then(WatchStatus::parse)
            .unwrap_or(WatchStatus::Creating),
    })
}
