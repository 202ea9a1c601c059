//! # DB Replication
//!
//! Trigger-based change-data-capture and transactional replication between
//! SQL databases.
//!
//! ## Architecture
//!
//! A master captures row changes with triggers into a staging table; a
//! scheduler drains it into canonical change messages; an external transport
//! carries them; a slave applies each message in one transaction:
//!
//! ```text
//! ┌──────────────────────── master ────────────────────────┐
//! │                                                        │
//! │  watched table ──trigger──► <prefix>items              │
//! │                                   │                    │
//! │  ChangeScheduler ──check_again──► ChangeConverter ─────┼──► ChangePublisher
//! │  (poll / hint / notification)     (replKey guard)      │         │
//! └────────────────────────────────────────────────────────┘         │ transport
//!                                                                    ▼
//! ┌──────────────────────── slave ─────────────────────────┐
//! │                                                        │
//! │  SlaveSession ──check──► ApplyEngine ──one tx──► tables│
//! │  (initial sync,          (SchemaCache, mapper,         │
//! │   hold / merge)           writer toggles)              │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Initial Synchronization
//!
//! A new slave session holds live changes while the master's
//! [`InitialUpdater`] snapshots every replicated table. The snapshot is then
//! merged with the held changes so no row is applied twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use db_replication::{ReplicationAgent, ReplicationConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let master = Arc::new(ReplicationConfig::for_testing("orders", "/var/lib/app/master.db"));
//!     let slave = Arc::new(ReplicationConfig::for_testing("orders", "/var/lib/app/replica.db"));
//!
//!     let mut agent = ReplicationAgent::new(Some(master), Some(slave)).expect("Invalid config");
//!     agent.start().await.expect("Failed to start");
//!
//!     // Agent runs until shutdown signal
//!     agent.shutdown().await;
//! }
//! ```

pub mod apply;
pub mod config;
pub mod converter;
pub mod coordinator;
pub mod dialect;
pub mod error;
pub mod initial;
pub mod mapper;
pub mod message;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod state_store;
pub mod transport;
pub mod watch;

// Re-exports for convenience
pub use apply::{ApplyEngine, ApplyOutcome, DumpSink, FileDumpSink, SchemaCache, TableDescription};
pub use config::{DbConfig, MapperConfig, MasterConfig, ReplicationConfig, SlaveConfig, StateStoreConfig};
pub use converter::{ChangeChecker, ChangeConverter};
pub use coordinator::{AgentState, MasterSide, ReplicationAgent, SlaveSide};
pub use dialect::{create_dialect, Dialect, SqliteDialect};
pub use error::{ReplicationError, Result};
pub use initial::{InitialData, InitialUpdater};
pub use mapper::{create_mapper, DefaultMapper, IdentityMapper, MappedName, NameMapper};
pub use message::{Action, ChangeMessage, ChangeRecord, ChangeRow, ColumnDescriptor, Command, SchemaChangeRecord};
pub use scheduler::ChangeScheduler;
pub use session::{SessionManager, SessionState, SlaveSession};
pub use state_store::ReplKeyStore;
pub use transport::{ChangePublisher, ChannelPublisher, InitialDataRequest, NoOpTransport, SlaveTransport};
pub use watch::{TableToWatch, WatchRegistry, WatchStatus};
