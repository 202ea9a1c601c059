// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication agent.
//!
//! The orchestrator that ties together:
//! - the master side: capture bootstrap, watched tables, the converter and the
//!   [`ChangeScheduler`] loop
//! - the slave side: the [`ApplyEngine`] and the [`SessionManager`]
//! - the [`ReplKeyStore`] holding both sides' high-water marks
//!
//! # Architecture
//!
//! An agent runs a master configuration, a slave configuration, or both:
//! 1. Opens the high-water store
//! 2. Master: opens the pool, bootstraps, registers tables, spawns the scheduler
//! 3. Slave: opens the pool, builds the apply engine and session manager
//! 4. Flushes dirty high-water marks periodically
//! 5. Handles graceful shutdown, letting the in-flight iteration finish
//!
//! Transport is external: changes leave through a [`ChangePublisher`] and
//! arrive through [`SlaveSide::deliver`].

mod master;
mod slave;
mod types;

pub use master::MasterSide;
pub use slave::SlaveSide;
pub use types::AgentState;

use crate::apply::ApplyEngine;
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::mapper::NameMapper;
use crate::metrics;
use crate::scheduler::ChangeScheduler;
use crate::session::SessionManager;
use crate::state_store::ReplKeyStore;
use crate::transport::{ChangePublisher, NoOpTransport, SlaveTransport};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The replication agent.
///
/// Owns the lifecycle of one master and/or one slave configuration.
pub struct ReplicationAgent {
    master_config: Option<Arc<ReplicationConfig>>,
    slave_config: Option<Arc<ReplicationConfig>>,

    publisher: Arc<dyn ChangePublisher>,
    transport: Arc<dyn SlaveTransport>,
    mapper: Option<Arc<dyn NameMapper>>,

    /// Agent state (broadcast to watchers)
    state_tx: watch::Sender<AgentState>,
    state_rx: watch::Receiver<AgentState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    master: Option<MasterSide>,
    slave: Option<SlaveSide>,
    store: Option<Arc<ReplKeyStore>>,

    /// Scheduler and flush task handles
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReplicationAgent {
    /// Create an agent for a master configuration, a slave configuration, or
    /// both.
    ///
    /// Master and slave must be distinct configuration instances; passing the
    /// same one twice is rejected.
    pub fn new(
        master: Option<Arc<ReplicationConfig>>,
        slave: Option<Arc<ReplicationConfig>>,
    ) -> Result<Self> {
        match (&master, &slave) {
            (None, None) => {
                return Err(ReplicationError::Config(
                    "neither a master nor a slave configuration was given".to_string(),
                ))
            }
            (Some(m), Some(s)) if Arc::ptr_eq(m, s) => {
                return Err(ReplicationError::Config(
                    "master and slave configuration are the same instance".to_string(),
                ))
            }
            _ => {}
        }
        if let Some(config) = &master {
            config.validate()?;
        }
        if let Some(config) = &slave {
            config.validate()?;
        }

        let (state_tx, state_rx) = watch::channel(AgentState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            master_config: master,
            slave_config: slave,
            publisher: Arc::new(NoOpTransport),
            transport: Arc::new(NoOpTransport),
            mapper: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            master: None,
            slave: None,
            store: None,
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Where converted changes are published (master side).
    pub fn with_publisher(mut self, publisher: Arc<dyn ChangePublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Delivery control used by slave sessions.
    pub fn with_slave_transport(mut self, transport: Arc<dyn SlaveTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Use `mapper` instead of the one named by `replication.mapper.class`.
    pub fn with_mapper(mut self, mapper: Arc<dyn NameMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Get current agent state.
    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), AgentState::Running)
    }

    /// The master side, once started.
    pub fn master(&self) -> Result<&MasterSide> {
        self.master.as_ref().ok_or_else(|| self.not_available("master"))
    }

    /// The slave side, once started.
    pub fn slave(&self) -> Result<&SlaveSide> {
        self.slave.as_ref().ok_or_else(|| self.not_available("slave"))
    }

    pub fn apply_engine(&self) -> Result<&Arc<ApplyEngine>> {
        Ok(self.slave()?.engine())
    }

    pub fn sessions(&self) -> Result<&Arc<SessionManager>> {
        Ok(self.slave()?.sessions())
    }

    pub fn scheduler(&self) -> Result<&Arc<ChangeScheduler>> {
        Ok(self.master()?.scheduler())
    }

    pub fn store(&self) -> Option<&Arc<ReplKeyStore>> {
        self.store.as_ref()
    }

    fn not_available(&self, side: &str) -> ReplicationError {
        ReplicationError::InvalidState {
            expected: format!("running agent with a {} configuration", side),
            actual: format!("{:?}", self.state()),
        }
    }

    /// Start the agent.
    ///
    /// 1. Opens the high-water store (SQLite)
    /// 2. Master: bootstrap, watched tables, scheduler task
    /// 3. Slave: apply engine and session manager
    /// 4. Spawns the high-water flush task
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != AgentState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            master = self.master_config.as_ref().map(|c| c.name.as_str()),
            slave = self.slave_config.as_ref().map(|c| c.name.as_str()),
            "Starting replication agent"
        );
        let _ = self.state_tx.send(AgentState::Starting);
        metrics::set_agent_state("Starting");

        if let Err(e) = self.open_components().await {
            error!(error = %e, "Replication agent failed to start");
            let _ = self.state_tx.send(AgentState::Failed);
            metrics::set_agent_state("Failed");
            return Err(e);
        }

        if let Some(master) = &self.master {
            let scheduler = Arc::clone(master.scheduler());
            let shutdown_rx = self.shutdown_rx.clone();
            let handle = tokio::spawn(async move {
                scheduler.run(shutdown_rx).await;
            });
            info!(name = %master.config().name, "Spawned change scheduler");
            self.handles.write().await.push(handle);
        }

        self.spawn_flush_task().await;

        let _ = self.state_tx.send(AgentState::Running);
        metrics::set_agent_state("Running");
        info!("Replication agent running");
        Ok(())
    }

    async fn open_components(&mut self) -> Result<()> {
        let state_path = self
            .master_config
            .as_ref()
            .or(self.slave_config.as_ref())
            .map(|c| c.state.sqlite_path.clone())
            .ok_or_else(|| ReplicationError::Internal("no configuration".to_string()))?;
        let store = Arc::new(ReplKeyStore::new(&state_path).await?);
        info!(path = %state_path, "High-water store initialized");
        self.store = Some(Arc::clone(&store));

        if let Some(config) = &self.master_config {
            let side = MasterSide::open(
                Arc::clone(config),
                Arc::clone(&self.publisher),
                Arc::clone(&store),
            )
            .await?;
            self.master = Some(side);
        }

        if let Some(config) = &self.slave_config {
            let side = SlaveSide::open(
                Arc::clone(config),
                self.mapper.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&store),
            )
            .await?;
            self.slave = Some(side);
        }
        Ok(())
    }

    /// Spawn the high-water flush task for debounced writes.
    async fn spawn_flush_task(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let flush_interval = self
            .master_config
            .as_ref()
            .or(self.slave_config.as_ref())
            .map(|c| c.state.flush_interval_duration())
            .unwrap_or(Duration::from_secs(5));
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = store.flush_dirty().await {
                            warn!(error = %e, "Failed to flush replKeys");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("ReplKey flush task stopping");
                            break;
                        }
                    }
                }
            }
        });

        debug!("Spawned replKey flush task");
        self.handles.write().await.push(handle);
    }

    /// Shutdown the agent gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal the scheduler and flush task to stop
    /// 2. Wait for them to finish their current iteration (with timeout)
    /// 3. Close the database pools
    /// 4. Flush, checkpoint and close the high-water store
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication agent");
        let _ = self.state_tx.send(AgentState::ShuttingDown);
        metrics::set_agent_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        if let Some(master) = self.master.take() {
            master.pool().close().await;
        }
        if let Some(slave) = self.slave.take() {
            slave.pool().close().await;
        }

        // Close the store (flushes dirty marks, WAL checkpoint)
        if let Some(store) = self.store.take() {
            store.close().await;
        }

        let _ = self.state_tx.send(AgentState::Stopped);
        metrics::set_agent_state("Stopped");
        info!("Replication agent stopped");
    }
}

/// Open the pool for `config.db`.
pub(crate) async fn open_pool(config: &ReplicationConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.db.url)
        .map_err(|e| ReplicationError::Config(format!("invalid 'db.url' '{}': {}", config.db.url, e)))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(config.db.max_connections)
        .acquire_timeout(config.db.acquire_timeout_duration())
        .connect_with(options)
        .await?;
    debug!(name = %config.name, max_connections = config.db.max_connections, "Database pool opened");
    Ok(pool)
}
