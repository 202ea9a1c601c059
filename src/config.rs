// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication agent.
//!
//! Configuration is an explicit value handed to every component's
//! constructor. It can be built programmatically, deserialized from
//! YAML/JSON, or read from the flat string key/value pairs the surrounding
//! platform keeps in its property store ([`ReplicationConfig::from_properties`]).
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── name: String                 # replication name, keys persisted state
//! ├── prefix: String               # system object prefix (default "repl_")
//! ├── db: DbConfig                 # database url, dialect, pool size
//! ├── tables: Vec<TableToWatch>    # table.* entries
//! ├── mapper: MapperConfig         # replication.mapper.*
//! ├── master: MasterConfig         # bootstrap, scheduler, converter
//! ├── slave: SlaveConfig           # writer policies, dump sink
//! └── state: StateStoreConfig      # local high-water store (SQLite)
//! ```
//!
//! # Property Keys
//!
//! ```text
//! db.url = sqlite:///var/lib/app/master.db
//! table.myschema.mytable = true,trg1,42
//! replication.mapper.class = default
//! replication.mapper.tables = src1=dst1,src2=dst2
//! replication.overwriteTables = false
//! replication.importLocation = /var/lib/app/dumps
//! replication.bootstrap = true
//! alertScheduler.pollInterval = 2000
//! ```

use crate::error::{ReplicationError, Result};
use crate::watch::{self, TableToWatch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to the agent and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of this replication. Keys the persisted high-water marks.
    #[serde(default = "default_name")]
    pub name: String,

    /// Prefix for every system object (`<prefix>items`, `<prefix>tables`, `<prefix>trans`).
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Database this side reads from (master) or writes to (slave).
    pub db: DbConfig,

    /// Watched tables (master side only).
    #[serde(default)]
    pub tables: Vec<TableToWatch>,

    #[serde(default)]
    pub mapper: MapperConfig,

    #[serde(default)]
    pub master: MasterConfig,

    #[serde(default)]
    pub slave: SlaveConfig,

    #[serde(default)]
    pub state: StateStoreConfig,
}

fn default_name() -> String {
    "replication".to_string()
}

fn default_prefix() -> String {
    "repl_".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            prefix: default_prefix(),
            db: DbConfig::default(),
            tables: Vec::new(),
            mapper: MapperConfig::default(),
            master: MasterConfig::default(),
            slave: SlaveConfig::default(),
            state: StateStoreConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a config for tests against a SQLite file.
    pub fn for_testing(name: &str, db_path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = db_path.into();
        Self {
            name: name.to_string(),
            db: DbConfig::sqlite_file(&path),
            master: MasterConfig::for_testing(),
            state: StateStoreConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Build a config from flat string properties.
    ///
    /// Unknown keys are ignored so the same property set can carry settings
    /// for other components of the platform.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = ReplicationConfig::default();
        let get = |key: &str| props.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = get("replication.name") {
            config.name = v.to_string();
        }
        if let Some(v) = get("replication.prefix") {
            config.prefix = v.to_string();
        }

        if let Some(v) = get("db.url") {
            config.db.url = v.to_string();
        }
        if let Some(v) = get("db.dialect") {
            config.db.dialect = v.to_string();
        }
        if let Some(v) = get("db.maxConnections") {
            config.db.max_connections = parse_number("db.maxConnections", v)?;
        }

        config.tables = watch::parse_all(props)?;

        if let Some(v) = get("replication.mapper.class") {
            config.mapper.class = v.to_string();
        }
        if let Some(v) = get("replication.mapper.tables") {
            config.mapper.tables = parse_mapping("replication.mapper.tables", v)?;
        }
        if let Some(v) = get("replication.mapper.schemas") {
            config.mapper.schemas = parse_mapping("replication.mapper.schemas", v)?;
        }
        if let Some(v) = get("replication.mapper.columns") {
            config.mapper.columns = parse_mapping("replication.mapper.columns", v)?;
        }

        if let Some(v) = get("replication.bootstrap") {
            config.master.bootstrap = parse_bool("replication.bootstrap", v)?;
        }
        if let Some(v) = get("replication.bootstrap.force") {
            config.master.force_bootstrap = parse_bool("replication.bootstrap.force", v)?;
        }
        if let Some(v) = get("alertScheduler.pollInterval") {
            config.master.poll_interval_ms = parse_number("alertScheduler.pollInterval", v)?;
        }
        if let Some(v) = get("replication.scheduler.backoff") {
            humantime::parse_duration(v).map_err(|e| {
                ReplicationError::Config(format!(
                    "invalid 'replication.scheduler.backoff' value '{}': {}",
                    v, e
                ))
            })?;
            config.master.backoff = v.to_string();
        }
        if let Some(v) = get("replication.converter.maxRows") {
            config.master.max_rows_per_check = parse_number("replication.converter.maxRows", v)?;
        }
        if let Some(v) = get("replication.initialUpdate.rowsPerMessage") {
            config.master.rows_per_message =
                parse_number("replication.initialUpdate.rowsPerMessage", v)?;
        }
        if let Some(v) = get("replication.compressSize") {
            config.master.compress_threshold = parse_number("replication.compressSize", v)?;
        }

        if let Some(v) = get("replication.overwriteTables") {
            config.slave.overwrite_tables = parse_bool("replication.overwriteTables", v)?;
        }
        if let Some(v) = get("replication.importLocation") {
            config.slave.import_location = Some(PathBuf::from(v));
        }
        if let Some(v) = get("replication.keepDumpFiles") {
            config.slave.keep_dump_files = parse_bool("replication.keepDumpFiles", v)?;
        }
        if let Some(v) = get("replication.drops") {
            config.slave.allow_drops = parse_bool("replication.drops", v)?;
        }
        if let Some(v) = get("replication.creates") {
            config.slave.allow_creates = parse_bool("replication.creates", v)?;
        }
        if let Some(v) = get("replication.alters") {
            config.slave.allow_alters = parse_bool("replication.alters", v)?;
        }
        if let Some(v) = get("replication.statements") {
            config.slave.allow_statements = parse_bool("replication.statements", v)?;
        }

        if let Some(v) = get("replication.state.path") {
            config.state.sqlite_path = v.to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every component relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ReplicationError::Config("replication name is empty".into()));
        }
        if self.prefix.trim().is_empty() {
            return Err(ReplicationError::Config("'replication.prefix' is empty".into()));
        }
        if !self
            .prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ReplicationError::Config(format!(
                "'replication.prefix' must be alphanumeric, got '{}'",
                self.prefix
            )));
        }
        if self.db.url.trim().is_empty() {
            return Err(ReplicationError::Config("'db.url' is required".into()));
        }
        if self.db.max_connections == 0 {
            return Err(ReplicationError::Config(
                "'db.maxConnections' must be at least 1".into(),
            ));
        }
        if self.master.rows_per_message == 0 {
            return Err(ReplicationError::Config(
                "'replication.initialUpdate.rowsPerMessage' must be at least 1".into(),
            ));
        }
        humantime::parse_duration(&self.master.backoff).map_err(|e| {
            ReplicationError::Config(format!(
                "invalid scheduler backoff '{}': {}",
                self.master.backoff, e
            ))
        })?;
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ReplicationError::Config(format!(
            "'{}' must be a boolean, got '{}'",
            key, value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        ReplicationError::Config(format!("'{}' must be a number, got '{}'", key, value))
    })
}

/// Parse `src1=dst1,src2=dst2`.
pub fn parse_mapping(key: &str, value: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (src, dst) = pair.split_once('=').ok_or_else(|| {
            ReplicationError::Config(format!(
                "'{}' entry '{}' must have the form src=dst",
                key, pair
            ))
        })?;
        let src = src.trim();
        if src.is_empty() {
            return Err(ReplicationError::Config(format!(
                "'{}' entry '{}' has an empty source name",
                key, pair
            )));
        }
        map.insert(src.to_string(), dst.trim().to_string());
    }
    Ok(map)
}

// ═══════════════════════════════════════════════════════════════════════════════
// DbConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// sqlx connection URL, e.g. `sqlite:///var/lib/app/master.db?mode=rwc`.
    pub url: String,

    /// Dialect name, resolved through the dialect registry.
    #[serde(default = "default_dialect")]
    pub dialect: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a pooled connection (e.g. "5s").
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: String,
}

fn default_dialect() -> String {
    "sqlite".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_acquire_timeout() -> String {
    "5s".to_string()
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            dialect: default_dialect(),
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl DbConfig {
    /// SQLite file database, created if missing.
    pub fn sqlite_file(path: &std::path::Path) -> Self {
        Self {
            url: format!("sqlite://{}?mode=rwc", path.display()),
            ..Default::default()
        }
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.acquire_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MapperConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Name mapping selection (`replication.mapper.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfig {
    /// Registry name of the mapper implementation.
    #[serde(default = "default_mapper_class")]
    pub class: String,

    /// Table renames, `src=dst`. An empty destination drops the qualifier.
    #[serde(default)]
    pub tables: BTreeMap<String, String>,

    /// Schema renames, `src=dst`. An empty destination omits the schema.
    #[serde(default)]
    pub schemas: BTreeMap<String, String>,

    /// Column renames, `src=dst` or `table.src=dst`. An empty destination drops the column.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

fn default_mapper_class() -> String {
    "default".to_string()
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            class: default_mapper_class(),
            tables: BTreeMap::new(),
            schemas: BTreeMap::new(),
            columns: BTreeMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MasterConfig: bootstrap, scheduler and converter
// ═══════════════════════════════════════════════════════════════════════════════

/// Master-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Create the capture infrastructure on startup if missing.
    #[serde(default = "default_true")]
    pub bootstrap: bool,

    /// Drop and recreate the capture infrastructure on startup.
    #[serde(default)]
    pub force_bootstrap: bool,

    /// Timed poll interval in milliseconds. 0 disables timed polling; the
    /// scheduler then only wakes on explicit change hints.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Fixed backoff after a failed scheduler iteration (e.g. "500ms").
    #[serde(default = "default_backoff")]
    pub backoff: String,

    /// Maximum staged rows converted per check.
    #[serde(default = "default_max_rows_per_check")]
    pub max_rows_per_check: u32,

    /// Rows per message when sending an initial snapshot.
    #[serde(default = "default_rows_per_message")]
    pub rows_per_message: usize,

    /// Encoded messages larger than this many bytes are zstd compressed.
    /// 0 disables compression.
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: usize,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_backoff() -> String {
    "500ms".to_string()
}

fn default_max_rows_per_check() -> u32 {
    1000
}

fn default_rows_per_message() -> usize {
    250
}

fn default_compress_threshold() -> usize {
    64 * 1024
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bootstrap: true,
            force_bootstrap: false,
            poll_interval_ms: default_poll_interval_ms(),
            backoff: default_backoff(),
            max_rows_per_check: default_max_rows_per_check(),
            rows_per_message: default_rows_per_message(),
            compress_threshold: default_compress_threshold(),
        }
    }
}

impl MasterConfig {
    /// Fast polling for tests.
    pub fn for_testing() -> Self {
        Self {
            poll_interval_ms: 20,
            backoff: "20ms".to_string(),
            ..Default::default()
        }
    }

    /// `None` when timed polling is switched off.
    pub fn poll_interval(&self) -> Option<Duration> {
        if self.poll_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.poll_interval_ms))
        }
    }

    pub fn backoff_duration(&self) -> Duration {
        humantime::parse_duration(&self.backoff).unwrap_or(Duration::from_millis(500))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SlaveConfig: writer policies
// ═══════════════════════════════════════════════════════════════════════════════

/// Slave-side (writer) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// CREATE on an existing table drops and recreates it instead of failing.
    #[serde(default)]
    pub overwrite_tables: bool,

    /// Directory DUMP payloads are written to. Defaults to the system temp dir.
    #[serde(default)]
    pub import_location: Option<PathBuf>,

    /// Keep dump files after they were handed over.
    #[serde(default)]
    pub keep_dump_files: bool,

    #[serde(default = "default_true")]
    pub allow_drops: bool,

    #[serde(default = "default_true")]
    pub allow_creates: bool,

    #[serde(default = "default_true")]
    pub allow_alters: bool,

    #[serde(default = "default_true")]
    pub allow_statements: bool,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            overwrite_tables: false,
            import_location: None,
            keep_dump_files: false,
            allow_drops: true,
            allow_creates: true,
            allow_alters: true,
            allow_statements: true,
        }
    }
}

impl SlaveConfig {
    pub fn import_location(&self) -> PathBuf {
        self.import_location
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StateStoreConfig: local high-water store
// ═══════════════════════════════════════════════════════════════════════════════

/// Local persistence of replKey high-water marks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreConfig {
    /// Path to the SQLite file, or ":memory:".
    #[serde(default = "default_state_path")]
    pub sqlite_path: String,

    /// How often dirty marks are flushed (e.g. "5s").
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_state_path() -> String {
    "replication_state.db".to_string()
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_state_path(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl StateStoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            flush_interval: default_flush_interval(),
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(5))
    }
}
