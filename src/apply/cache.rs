// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination schema cache.
//!
//! Table descriptions are read from destination metadata the first time a
//! table is referenced and kept until invalidated. Keys are normalized
//! through the dialect, so `Foo` and `foo` share one entry.
//!
//! Lookups hold one lock around get-or-populate: when several messages hit
//! an unseen table at once, exactly one metadata query runs.

use super::table::TableDescription;
use crate::dialect::Dialect;
use crate::error::Result;
use crate::mapper::MappedName;
use sqlx::sqlite::SqliteConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct SchemaCache {
    entries: Mutex<HashMap<String, Arc<TableDescription>>>,
    populations: AtomicU64,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(dialect: &dyn Dialect, name: &MappedName) -> String {
        dialect.normalize_identifier(&name.to_string())
    }

    /// Cached description of `name`, reading metadata on first use.
    /// `None` when the table does not exist (nothing is cached then).
    pub async fn get_or_populate(
        &self,
        dialect: &dyn Dialect,
        conn: &mut SqliteConnection,
        name: &MappedName,
    ) -> Result<Option<Arc<TableDescription>>> {
        let key = Self::key(dialect, name);
        let mut entries = self.entries.lock().await;
        if let Some(desc) = entries.get(&key) {
            return Ok(Some(Arc::clone(desc)));
        }

        let columns = dialect.describe_table(&mut *conn, name).await?;
        self.populations.fetch_add(1, Ordering::Relaxed);
        if columns.is_empty() {
            return Ok(None);
        }

        debug!(table = %key, columns = columns.len(), "Cached table description");
        let desc = Arc::new(TableDescription::new(dialect, name.clone(), columns));
        entries.insert(key, Arc::clone(&desc));
        Ok(Some(desc))
    }

    /// Drop the entry for `name`; the next reference reads metadata again.
    pub async fn invalidate_table(&self, dialect: &dyn Dialect, name: &MappedName) -> bool {
        let key = Self::key(dialect, name);
        let removed = self.entries.lock().await.remove(&key).is_some();
        if removed {
            debug!(table = %key, "Invalidated table description");
        }
        removed
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Number of metadata reads performed so far.
    pub fn populations(&self) -> u64 {
        self.populations.load(Ordering::Relaxed)
    }
}
