// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master side: capture infrastructure, watched-table administration and the
//! components feeding the scheduler.

use super::open_pool;
use crate::config::ReplicationConfig;
use crate::converter::{ChangeChecker, ChangeConverter};
use crate::dialect::{create_dialect, Dialect};
use crate::error::Result;
use crate::initial::{InitialData, InitialUpdater};
use crate::mapper::MappedName;
use crate::scheduler::ChangeScheduler;
use crate::state_store::ReplKeyStore;
use crate::transport::ChangePublisher;
use crate::watch::{TableToWatch, WatchRegistry, WatchStatus};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Connection;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything one master configuration owns.
pub struct MasterSide {
    config: Arc<ReplicationConfig>,
    pool: SqlitePool,
    dialect: Arc<dyn Dialect>,
    registry: WatchRegistry,
    converter: Arc<ChangeConverter>,
    scheduler: Arc<ChangeScheduler>,
    updater: InitialUpdater,
}

impl MasterSide {
    /// Open the master database, bootstrap it if configured and register the
    /// configured tables. The scheduler is built but not spawned.
    pub(crate) async fn open(
        config: Arc<ReplicationConfig>,
        publisher: Arc<dyn ChangePublisher>,
        store: Arc<ReplKeyStore>,
    ) -> Result<Self> {
        let pool = open_pool(&config).await?;
        let dialect = create_dialect(&config.db.dialect)?;

        let converter = Arc::new(ChangeConverter::new(
            &config.name,
            &config.prefix,
            Arc::clone(&dialect),
            publisher,
            store,
            config.master.max_rows_per_check,
        ));
        let checker: Arc<dyn ChangeChecker> = Arc::clone(&converter) as Arc<dyn ChangeChecker>;
        let scheduler = Arc::new(ChangeScheduler::new(
            &config.name,
            pool.clone(),
            checker,
            Arc::clone(&dialect),
            config.master.poll_interval(),
            config.master.backoff_duration(),
        ));
        let updater = InitialUpdater::new(&config, pool.clone(), Arc::clone(&dialect));

        let side = Self {
            registry: WatchRegistry::new(&config.prefix),
            config,
            pool,
            dialect,
            converter,
            scheduler,
            updater,
        };

        if side.config.master.bootstrap {
            side.bootstrap(side.config.master.force_bootstrap).await?;
        }
        side.register_configured_tables().await?;
        Ok(side)
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    pub fn converter(&self) -> &Arc<ChangeConverter> {
        &self.converter
    }

    pub fn scheduler(&self) -> &Arc<ChangeScheduler> {
        &self.scheduler
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Bootstrap
    // ═══════════════════════════════════════════════════════════════════════

    /// Create the capture infrastructure.
    ///
    /// Present and `force == false`: nothing happens and false is returned.
    /// With `force` everything (triggers included) is dropped and recreated.
    pub async fn bootstrap(&self, force: bool) -> Result<bool> {
        let prefix = &self.config.prefix;
        let mut conn = self.pool.acquire().await?;
        let present = self.dialect.is_bootstrapped(&mut *conn, prefix).await?;
        if present && !force {
            debug!(prefix = %prefix, "Capture infrastructure already present");
            return Ok(false);
        }

        let mut tx = conn.begin().await?;
        if present {
            let dropped = self.teardown(&mut tx).await?;
            warn!(prefix = %prefix, tables = dropped, "Forced bootstrap, capture infrastructure dropped");
        }
        for stmt in self.dialect.bootstrap_statements(prefix) {
            sqlx::query(&stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(prefix = %prefix, force, "Capture infrastructure created");
        Ok(true)
    }

    /// Drop every system object and trigger. Meant for test environments.
    pub async fn cleanup(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        let dropped = self.teardown(&mut tx).await?;
        tx.commit().await?;
        info!(prefix = %self.config.prefix, tables = dropped, "Capture infrastructure removed");
        Ok(())
    }

    async fn teardown(&self, conn: &mut SqliteConnection) -> Result<usize> {
        let registry_table = MappedName::unmapped(None, self.registry.table_name());
        let entries = if self.dialect.table_exists(&mut *conn, &registry_table).await? {
            self.registry.get_all(&mut *conn).await?
        } else {
            Vec::new()
        };

        for entry in &entries {
            self.drop_triggers(&mut *conn, entry).await?;
        }
        for stmt in self.dialect.cleanup_statements(&self.config.prefix) {
            sqlx::query(&stmt).execute(&mut *conn).await?;
        }
        Ok(entries.len())
    }

    async fn register_configured_tables(&self) -> Result<()> {
        if self.config.tables.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        for entry in &self.config.tables {
            self.dialect.check_watchable(entry)?;
            let known = self
                .registry
                .get(&mut *conn, entry.catalog(), entry.schema(), &entry.table)
                .await?;
            if known.is_none() {
                self.registry.store(&mut *conn, entry).await?;
                debug!(table = %entry, "Registered configured table");
            }
        }
        Ok(())
    }

    async fn drop_triggers(&self, conn: &mut SqliteConnection, entry: &TableToWatch) -> Result<()> {
        for stmt in self.dialect.drop_trigger_statements(&self.config.prefix, entry) {
            sqlx::query(&stmt).execute(&mut *conn).await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Registry administration
    // ═══════════════════════════════════════════════════════════════════════

    /// All watched tables, ordered by replKey.
    pub async fn watched_tables(&self) -> Result<Vec<TableToWatch>> {
        let mut conn = self.pool.acquire().await?;
        self.registry.get_all(&mut *conn).await
    }

    /// Start watching a table. Returns false if it is already registered.
    ///
    /// The entry is stored as CREATING; the next check installs the triggers
    /// and publishes a CREATE once the table exists.
    pub async fn add_table_to_watch(&self, entry: TableToWatch) -> Result<bool> {
        self.dialect.check_watchable(&entry)?;
        let mut conn = self.pool.acquire().await?;
        let known = self
            .registry
            .get(&mut *conn, entry.catalog(), entry.schema(), &entry.table)
            .await?;
        if known.is_some() {
            debug!(table = %entry, "Table already watched");
            return Ok(false);
        }

        let mut entry = entry;
        entry.status = WatchStatus::Creating;
        self.registry.store(&mut *conn, &entry).await?;
        info!(table = %entry, replicate = entry.replicate, "Table added to watch list");
        self.scheduler.trigger();
        Ok(true)
    }

    /// Stop watching a table and remove its triggers. Returns false if it was
    /// not registered.
    pub async fn remove_table_to_watch(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(entry) = self.registry.get(&mut *conn, catalog, schema, table).await? else {
            return Ok(false);
        };

        let mut tx = conn.begin().await?;
        self.registry.set_status(&mut *tx, &entry, WatchStatus::Remove).await?;
        self.drop_triggers(&mut *tx, &entry).await?;
        self.registry.remove(&mut *tx, &entry).await?;
        tx.commit().await?;

        info!(table = %entry, "Table removed from watch list");
        Ok(true)
    }

    /// Switch replication of a watched table on or off.
    ///
    /// Off drops the triggers. On reinstalls them for a table in status OK;
    /// a table that vanished meanwhile goes back to CREATING.
    pub async fn set_replicate(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        replicate: bool,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(entry) = self.registry.get(&mut *conn, catalog, schema, table).await? else {
            return Ok(false);
        };

        let mut tx = conn.begin().await?;
        self.registry.set_replicate(&mut *tx, &entry, replicate).await?;
        if !replicate {
            self.drop_triggers(&mut *tx, &entry).await?;
        } else if entry.status == WatchStatus::Ok {
            let name = MappedName::unmapped(entry.schema(), &entry.table);
            let columns = self.dialect.describe_table(&mut *tx, &name).await?;
            if columns.is_empty() {
                self.registry
                    .set_status(&mut *tx, &entry, WatchStatus::Creating)
                    .await?;
            } else {
                for stmt in self
                    .dialect
                    .create_trigger_statements(&self.config.prefix, &entry, &columns)?
                {
                    sqlx::query(&stmt).execute(&mut *tx).await?;
                }
            }
        }
        tx.commit().await?;

        self.scheduler.trigger();
        Ok(true)
    }

    /// Raise the stored replKey of a watched table. Lower values are ignored.
    pub async fn update_repl_key(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        repl_key: i64,
    ) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let Some(entry) = self.registry.get(&mut *conn, catalog, schema, table).await? else {
            return Ok(false);
        };
        self.registry.update_repl_key(&mut *conn, &entry, repl_key).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversion
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one conversion right now, outside the scheduler. Returns the
    /// number of staged rows consumed.
    pub async fn force_change_check(&self) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        self.converter.check_again(&mut *conn).await
    }

    /// Snapshot every replicated table for `slave`.
    pub async fn initiate_update(&self, slave: &str) -> Result<InitialData> {
        self.updater.initiate_update(slave).await
    }
}
