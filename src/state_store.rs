// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistent replKey high-water marks.
//!
//! Two parties need a replKey that survives restarts:
//! - the master converter remembers the last replKey it published, so a
//!   restart can flag re-published rows as `alreadyProcessed`
//! - slave sessions remember the `maxReplKey` of their last completed
//!   initial sync
//!
//! Marks are stored in a small SQLite database next to the engine, separate
//! from the replicated databases.
//!
//! # Debounced Writes
//!
//! - `advance()` updates the in-memory cache immediately and marks the key dirty
//! - `flush_dirty()` persists all dirty keys in a batch
//! - The agent calls `flush_dirty()` periodically and on shutdown
//!
//! A crash between `advance()` and `flush_dirty()` loses at most one flush
//! interval of progress. After restart the converter re-publishes those rows
//! without the `alreadyProcessed` flag. The slave skips INSERTs of rows it
//! already has; UPDATEs and DELETEs are applied again by key.
//!
//! # Monotonic
//!
//! Marks only move up. `advance()` with a lower value is ignored, both in
//! the cache and in the upsert on disk.

use crate::error::{is_sqlite_busy_error, ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Busy retry: doubling delay from the base, capped, for a bounded number of attempts.
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that selects a private in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Run `f`, retrying while SQLite reports the database busy or locked.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::state_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Persistent high-water replKey storage backed by SQLite.
pub struct ReplKeyStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, i64>>>,
    /// Keys with values not yet persisted
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
}

impl ReplKeyStore {
    /// Open (or create) the store at `path`. `":memory:"` gives a private,
    /// non-persistent store.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing replKey store");

        let pool = if path_str == IN_MEMORY {
            // One connection that never idles out, or the data goes with it.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                    .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(2)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repl_keys (
                name TEXT PRIMARY KEY,
                repl_key INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT name, repl_key FROM repl_keys")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (name, repl_key) in rows {
            debug!(name = %name, repl_key, "Loaded replKey from disk");
            cache.insert(name, repl_key);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored replKeys from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    /// Open a private in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::new(IN_MEMORY).await
    }

    pub async fn get(&self, name: &str) -> Option<i64> {
        self.cache.read().await.get(name).copied()
    }

    /// Raise the mark for `name` (debounced). Returns false when `repl_key`
    /// is not above the current mark.
    pub async fn advance(&self, name: &str, repl_key: i64) -> bool {
        {
            let mut cache = self.cache.write().await;
            match cache.get(name) {
                Some(current) if *current >= repl_key => return false,
                _ => {
                    cache.insert(name.to_string(), repl_key);
                }
            }
        }

        self.dirty.write().await.insert(name.to_string());

        debug!(name = %name, repl_key, "replKey advanced (pending flush)");
        true
    }

    /// Persist all dirty marks. Returns the number written.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_names: Vec<String> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_names.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cache = self.cache.read().await;
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for name in &dirty_names {
            if let Some(repl_key) = cache.get(name).copied() {
                let result = execute_with_retry("repl_key_flush", || async {
                    sqlx::query(
                        r#"
                        INSERT INTO repl_keys (name, repl_key, updated_at)
                        VALUES (?, ?, ?)
                        ON CONFLICT(name) DO UPDATE SET
                            repl_key = MAX(repl_key, excluded.repl_key),
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(name)
                    .bind(repl_key)
                    .bind(now)
                    .execute(pool)
                    .await
                })
                .await;

                match result {
                    Ok(_) => flushed += 1,
                    Err(e) => {
                        errors += 1;
                        warn!(name = %name, error = %e, "Failed to flush replKey");
                        self.dirty.write().await.insert(name.clone());
                    }
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty replKeys");
            crate::metrics::record_state_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ReplicationError::Internal(format!(
                "Failed to flush {} replKeys",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget the mark for `name`, in memory and on disk.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.cache.write().await.remove(name);
        self.dirty.write().await.remove(name);

        let pool = &self.pool;
        execute_with_retry("repl_key_delete", || async {
            sqlx::query("DELETE FROM repl_keys WHERE name = ?")
                .bind(name)
                .execute(pool)
                .await
        })
        .await?;

        info!(name = %name, "Deleted replKey");
        Ok(())
    }

    pub async fn get_all(&self) -> HashMap<String, i64> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fold the WAL back into the main file so a copied store is complete.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.path == IN_MEMORY {
            return Ok(());
        }
        let pool = &self.pool;

        execute_with_retry("repl_key_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty replKeys on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty replKeys on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("replKey store closed");
    }
}
