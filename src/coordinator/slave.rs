// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Slave side: the apply engine plus the sessions feeding it.

use super::open_pool;
use crate::apply::{ApplyEngine, ApplyOutcome};
use crate::config::ReplicationConfig;
use crate::dialect::create_dialect;
use crate::error::Result;
use crate::initial::InitialData;
use crate::mapper::{create_mapper, NameMapper};
use crate::message::{self, ChangeMessage, Command};
use crate::session::{SessionManager, SlaveSession};
use crate::state_store::ReplKeyStore;
use crate::transport::SlaveTransport;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything one slave configuration owns.
pub struct SlaveSide {
    config: Arc<ReplicationConfig>,
    pool: SqlitePool,
    engine: Arc<ApplyEngine>,
    sessions: Arc<SessionManager>,
}

impl SlaveSide {
    pub(crate) async fn open(
        config: Arc<ReplicationConfig>,
        mapper: Option<Arc<dyn NameMapper>>,
        transport: Arc<dyn SlaveTransport>,
        store: Arc<ReplKeyStore>,
    ) -> Result<Self> {
        let pool = open_pool(&config).await?;
        let dialect = create_dialect(&config.db.dialect)?;
        let mapper = match mapper {
            Some(m) => m,
            None => create_mapper(&config.mapper)?,
        };
        let engine = Arc::new(ApplyEngine::new(&config, pool.clone(), dialect, mapper));
        let sessions = Arc::new(SessionManager::new(transport, store));

        info!(
            name = %config.name,
            overwrite_tables = config.slave.overwrite_tables,
            "Apply engine ready"
        );
        Ok(Self {
            config,
            pool,
            engine,
            sessions,
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn engine(&self) -> &Arc<ApplyEngine> {
        &self.engine
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Filter delivered entries through `session` and apply what passes, in
    /// order. Returns the number of messages applied.
    ///
    /// The first failing message stops the batch; earlier messages stay
    /// committed.
    pub async fn deliver(&self, session: &SlaveSession, entries: Vec<ChangeMessage>) -> Result<usize> {
        let ready = session.check(entries).await;
        let mut applied = 0;
        for msg in &ready {
            if self.apply_one(session, msg).await? {
                applied += 1;
            }
        }
        if applied > 0 {
            debug!(slave = %session.name(), applied, "Delivered entries applied");
        }
        Ok(applied)
    }

    /// Pause or resume live delivery for `session`. On resume the entries
    /// held while paused are applied right away, in order.
    pub async fn toggle_active(&self, session: &SlaveSession) -> Result<bool> {
        let active = session.toggle_active().await?;
        if active {
            let applied = self.deliver(session, Vec::new()).await?;
            info!(slave = %session.name(), applied, "Delivery resumed");
        }
        Ok(active)
    }

    /// Decode encoded entries and [`deliver`](Self::deliver) them.
    pub async fn deliver_encoded(&self, session: &SlaveSession, payloads: &[Vec<u8>]) -> Result<usize> {
        let entries = payloads
            .iter()
            .map(|p| message::decode(p))
            .collect::<Result<Vec<_>>>()?;
        self.deliver(session, entries).await
    }

    /// Finish an initial update: reactivate the session and apply the
    /// snapshot merged with the changes held meanwhile.
    pub async fn complete_initial_update(&self, session: &SlaveSession, data: InitialData) -> Result<usize> {
        let merged = session
            .reactivate_destination(data.min_repl_key, data.max_repl_key, data.messages)
            .await?;
        let mut applied = 0;
        for msg in &merged {
            if self.apply_one(session, msg).await? {
                applied += 1;
            }
        }
        info!(slave = %session.name(), applied, "Initial update applied");
        Ok(applied)
    }

    async fn apply_one(&self, session: &SlaveSession, msg: &ChangeMessage) -> Result<bool> {
        let outcome = self.engine.store(msg).await?;
        if matches!(msg.command(), Ok(Command::Statement)) && outcome == ApplyOutcome::Applied {
            session.set_last_sql_response(self.engine.last_sql_response()).await;
        }
        if let Some((_, hi)) = msg.repl_key_range() {
            session.record_applied(hi).await;
        }
        Ok(outcome == ApplyOutcome::Applied)
    }
}
