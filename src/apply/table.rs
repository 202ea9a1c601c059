// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row-level DML against one destination table.
//!
//! A [`TableDescription`] is the cached shape of a destination table. It
//! turns row images (column → JSON value) into parameterized INSERT, UPDATE
//! and DELETE statements.
//!
//! # Row Identification
//!
//! UPDATE and DELETE target rows by primary key (`"pk" = ?`). Tables without
//! a primary key fall back to every known column of the before-image
//! (`"c" IS ?`, so NULLs match). A fallback statement that matches no row or
//! more than one row is logged as a warning.
//!
//! An INSERT of a row whose key exists already is logged as an error and
//! skipped. Rows replayed after a master crash arrive that way.

use crate::dialect::Dialect;
use crate::error::{ReplicationError, Result};
use crate::mapper::MappedName;
use crate::message::{Action, ColumnDescriptor};
use crate::metrics;
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection};
use tracing::{debug, error, warn};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind a JSON value with the closest SQLite storage class.
fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Cached shape of a destination table.
#[derive(Debug, Clone)]
pub struct TableDescription {
    name: MappedName,
    qualified: String,
    columns: Vec<ColumnDescriptor>,
    quoted: Vec<String>,
}

impl TableDescription {
    pub fn new(dialect: &dyn Dialect, name: MappedName, columns: Vec<ColumnDescriptor>) -> Self {
        let quoted = columns
            .iter()
            .map(|c| dialect.quote_identifier(&c.name))
            .collect();
        Self {
            qualified: dialect.qualified_name(&name),
            name,
            columns,
            quoted,
        }
    }

    pub fn name(&self) -> &MappedName {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }

    /// Index of `column` (case-insensitive).
    fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(column))
    }

    /// Known columns present in `image`, in table order.
    fn present<'a>(&self, image: &'a Map<String, Value>) -> Vec<(usize, &'a Value)> {
        let mut found: Vec<(usize, &Value)> = Vec::with_capacity(image.len());
        for (name, value) in image {
            match self.position(name) {
                Some(idx) => found.push((idx, value)),
                None => debug!(table = %self.name, column = %name, "Ignoring unknown column"),
            }
        }
        found.sort_by_key(|(idx, _)| *idx);
        found
    }

    /// WHERE clause and its values for the row described by `image`.
    fn where_clause<'a>(&self, image: &'a Map<String, Value>) -> Result<(String, Vec<&'a Value>)> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if self.has_primary_key() {
            let mut pk: Vec<usize> = (0..self.columns.len())
                .filter(|i| self.columns[*i].primary_key)
                .collect();
            pk.sort_by_key(|i| self.columns[*i].pk_position);
            for idx in pk {
                let col = &self.columns[idx];
                let value = image
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&col.name))
                    .map(|(_, v)| v)
                    .ok_or_else(|| {
                        ReplicationError::apply(
                            self.name.to_string(),
                            format!("row image lacks primary key column '{}'", col.name),
                        )
                    })?;
                conditions.push(format!("{} = ?", self.quoted[idx]));
                values.push(value);
            }
        } else {
            for (idx, value) in self.present(image) {
                conditions.push(format!("{} IS ?", self.quoted[idx]));
                values.push(value);
            }
            if conditions.is_empty() {
                return Err(ReplicationError::apply(
                    self.name.to_string(),
                    "cannot identify row: no primary key and no known columns",
                ));
            }
        }

        Ok((conditions.join(" AND "), values))
    }

    fn check_matches(&self, action: Action, affected: u64) {
        if affected == 0 {
            warn!(table = %self.name, action = %action, "Statement matched no row");
        } else if affected > 1 && !self.has_primary_key() {
            warn!(
                table = %self.name,
                action = %action,
                affected,
                "Statement without primary key matched several rows"
            );
        }
    }

    pub async fn insert(&self, conn: &mut SqliteConnection, row: &Map<String, Value>) -> Result<u64> {
        let present = self.present(row);
        if present.is_empty() {
            return Err(ReplicationError::apply(
                self.name.to_string(),
                "INSERT without any known column",
            ));
        }

        let cols: Vec<&str> = present.iter().map(|(i, _)| self.quoted[*i].as_str()).collect();
        let marks = vec!["?"; present.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified,
            cols.join(", "),
            marks
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in &present {
            query = bind_value(query, value);
        }
        match query.execute(&mut *conn).await {
            Ok(done) => Ok(done.rows_affected()),
            // SQLite rolls back only the failed statement, the transaction goes on.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                error!(
                    table = %self.name,
                    error = %e,
                    "Row to insert exists already, ignoring it and continuing"
                );
                metrics::record_duplicate_insert();
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Update the row identified by `old` (or by `new` when no before-image
    /// was shipped) to the values of `new`.
    pub async fn update(
        &self,
        conn: &mut SqliteConnection,
        new: &Map<String, Value>,
        old: Option<&Map<String, Value>>,
    ) -> Result<u64> {
        let present = self.present(new);
        if present.is_empty() {
            return Err(ReplicationError::apply(
                self.name.to_string(),
                "UPDATE without any known column",
            ));
        }
        let identity = match old {
            Some(old) => old,
            None if self.has_primary_key() => new,
            None => {
                return Err(ReplicationError::apply(
                    self.name.to_string(),
                    "UPDATE on a table without primary key needs the old content",
                ))
            }
        };
        let (where_sql, where_values) = self.where_clause(identity)?;

        let sets: Vec<String> = present
            .iter()
            .map(|(i, _)| format!("{} = ?", self.quoted[*i]))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.qualified,
            sets.join(", "),
            where_sql
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in &present {
            query = bind_value(query, value);
        }
        for value in where_values {
            query = bind_value(query, value);
        }
        let affected = query.execute(&mut *conn).await?.rows_affected();
        self.check_matches(Action::Update, affected);
        Ok(affected)
    }

    /// Delete the row described by the before-image `old`.
    pub async fn delete(&self, conn: &mut SqliteConnection, old: &Map<String, Value>) -> Result<u64> {
        let (where_sql, where_values) = self.where_clause(old)?;
        let sql = format!("DELETE FROM {} WHERE {}", self.qualified, where_sql);

        let mut query = sqlx::query(&sql);
        for value in where_values {
            query = bind_value(query, value);
        }
        let affected = query.execute(&mut *conn).await?.rows_affected();
        self.check_matches(Action::Delete, affected);
        Ok(affected)
    }
}
