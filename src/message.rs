// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical change records and the transport-agnostic change message.
//!
//! The converter produces [`ChangeRecord`]s (row-level DML) and
//! [`SchemaChangeRecord`]s (DDL, raw statements, dumps) and packs them into a
//! [`ChangeMessage`]. The writer consumes the message on the slave.
//!
//! # Message Shape
//!
//! ```text
//! description: {
//!   command: REPLICATION | CREATE | DROP | ALTER | STATEMENT | DUMP
//!   attributes: { tableName, catalog, schema, action, statement?, dumpName? }
//!   columns: [ { name, sqlType, primaryKey } ]        (CREATE only)
//! }
//! rows: [
//!   { columns: {...}, attributes: { tableName, replKey, transaction, dbId,
//!                                   guid, schema, version, action } }
//! ]
//! payload: bytes                                       (DUMP only)
//! ```
//!
//! Every row carries its own attribute set so the writer can dedup and audit
//! even when the transport drops message-level metadata.
//!
//! # Encoding
//!
//! Messages are JSON. Encoded messages above a size threshold are zstd
//! compressed; [`decode`] recognises the zstd magic and accepts both forms.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Attribute names used on message descriptions and rows.
pub mod attr {
    pub const TABLE_NAME: &str = "tableName";
    pub const CATALOG: &str = "catalog";
    pub const SCHEMA: &str = "schema";
    pub const ACTION: &str = "action";
    pub const STATEMENT: &str = "statement";
    pub const DUMP_NAME: &str = "dumpName";
    pub const REPL_KEY: &str = "replKey";
    pub const TRANSACTION: &str = "transaction";
    pub const DB_ID: &str = "dbId";
    pub const GUID: &str = "guid";
    pub const VERSION: &str = "version";
    pub const OLD_CONTENT: &str = "oldContent";
    pub const ALREADY_PROCESSED: &str = "alreadyProcessed";
    pub const END_OF_TRANSITION: &str = "endOfTransition";
    pub const DESTINATION: &str = "destination";
}

/// Replication format version written on every row.
pub const REPL_VERSION: &str = "1.0";

// ═══════════════════════════════════════════════════════════════════════════════
// Commands and actions
// ═══════════════════════════════════════════════════════════════════════════════

/// Message-level command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Replication,
    Create,
    Drop,
    Alter,
    Statement,
    Dump,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Replication => "REPLICATION",
            Command::Create => "CREATE",
            Command::Drop => "DROP",
            Command::Alter => "ALTER",
            Command::Statement => "STATEMENT",
            Command::Dump => "DUMP",
        }
    }

    /// Parse a wire command. Anything outside the known set is an error.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REPLICATION" => Ok(Command::Replication),
            "CREATE" => Ok(Command::Create),
            "DROP" => Ok(Command::Drop),
            "ALTER" => Ok(Command::Alter),
            "STATEMENT" => Ok(Command::Statement),
            "DUMP" => Ok(Command::Dump),
            _ => Err(ReplicationError::UnknownCommand(s.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level DML action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Action::Insert),
            "UPDATE" => Some(Action::Update),
            "DELETE" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of a table description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declared SQL type as reported by the source database.
    pub sql_type: String,
    #[serde(default)]
    pub primary_key: bool,
    /// Position inside the primary key (1-based), 0 when not a key column.
    #[serde(default)]
    pub pk_position: u32,
}

impl ColumnDescriptor {
    pub fn new(name: &str, sql_type: &str, pk_position: u32) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            primary_key: pk_position > 0,
            pk_position,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// Canonical row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Global monotonic order key, shared by all watched tables.
    pub repl_key: i64,
    /// Transaction timestamp/key grouping the rows of one source transaction.
    pub transaction: String,
    pub db_id: String,
    pub table_name: String,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    /// Row identity across before/after images.
    pub guid: Option<String>,
    pub action: Action,
    /// Serialized before-image, present for UPDATE and DELETE.
    pub old_content: Option<String>,
    /// Serialized after-image, present for INSERT and UPDATE.
    pub new_content: Option<String>,
    pub version: String,
}

impl ChangeRecord {
    /// Row attribute set: table name, replKey, transaction, db id, guid,
    /// schema, version and action, plus the before-image for UPDATE.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert(attr::TABLE_NAME.to_string(), self.table_name.clone());
        attrs.insert(attr::REPL_KEY.to_string(), self.repl_key.to_string());
        attrs.insert(attr::TRANSACTION.to_string(), self.transaction.clone());
        attrs.insert(attr::DB_ID.to_string(), self.db_id.clone());
        attrs.insert(attr::ACTION.to_string(), self.action.as_str().to_string());
        attrs.insert(attr::VERSION.to_string(), self.version.clone());
        if let Some(guid) = &self.guid {
            attrs.insert(attr::GUID.to_string(), guid.clone());
        }
        if let Some(schema) = &self.schema {
            attrs.insert(attr::SCHEMA.to_string(), schema.clone());
        }
        if let Some(catalog) = &self.catalog {
            attrs.insert(attr::CATALOG.to_string(), catalog.clone());
        }
        if self.action == Action::Update {
            if let Some(old) = &self.old_content {
                attrs.insert(attr::OLD_CONTENT.to_string(), old.clone());
            }
        }
        attrs
    }

    /// Build the message row. Columns come from the after-image, or the
    /// before-image for DELETE.
    pub fn to_row(&self) -> Result<ChangeRow> {
        let content = match self.action {
            Action::Insert | Action::Update => self.new_content.as_deref(),
            Action::Delete => self.old_content.as_deref(),
        };
        let columns = match content {
            Some(c) => parse_row_image(c)?,
            None => Map::new(),
        };
        Ok(ChangeRow {
            columns,
            attributes: self.attributes(),
        })
    }
}

/// Parse a serialized row image into a column map.
pub fn parse_row_image(content: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(content)? {
        Value::Object(map) => Ok(map),
        other => Err(ReplicationError::Codec(format!(
            "row image must be a JSON object, got {}",
            other
        ))),
    }
}

/// Canonical schema-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChangeRecord {
    /// One of CREATE, DROP, ALTER, STATEMENT, DUMP.
    pub command: Command,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table_name: String,
    /// Ordered column descriptors (CREATE).
    pub columns: Vec<ColumnDescriptor>,
    /// Raw SQL (STATEMENT).
    pub statement: Option<String>,
    /// Declared file name (DUMP).
    pub dump_name: Option<String>,
    pub repl_key: Option<i64>,
}

impl SchemaChangeRecord {
    pub fn new(command: Command, catalog: Option<&str>, schema: Option<&str>, table: &str) -> Self {
        Self {
            command,
            catalog: catalog.map(str::to_string),
            schema: schema.map(str::to_string),
            table_name: table.to_string(),
            columns: Vec::new(),
            statement: None,
            dump_name: None,
            repl_key: None,
        }
    }

    pub fn into_message(self) -> ChangeMessage {
        let mut attributes = BTreeMap::new();
        attributes.insert(attr::TABLE_NAME.to_string(), self.table_name);
        attributes.insert(attr::ACTION.to_string(), self.command.as_str().to_string());
        if let Some(c) = self.catalog {
            attributes.insert(attr::CATALOG.to_string(), c);
        }
        if let Some(s) = self.schema {
            attributes.insert(attr::SCHEMA.to_string(), s);
        }
        if let Some(stmt) = self.statement {
            attributes.insert(attr::STATEMENT.to_string(), stmt);
        }
        if let Some(name) = self.dump_name {
            attributes.insert(attr::DUMP_NAME.to_string(), name);
        }
        if let Some(key) = self.repl_key {
            attributes.insert(attr::REPL_KEY.to_string(), key.to_string());
        }
        ChangeMessage {
            description: MessageDescription {
                command: self.command.as_str().to_string(),
                attributes,
                columns: self.columns,
            },
            rows: Vec::new(),
            payload: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Wire message
// ═══════════════════════════════════════════════════════════════════════════════

/// Message-level description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDescription {
    /// Kept as a string so unknown commands reach the writer and fail there.
    pub command: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnDescriptor>,
}

/// One row of a REPLICATION message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub columns: Map<String, Value>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ChangeRow {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn repl_key(&self) -> Option<i64> {
        self.attr(attr::REPL_KEY).and_then(|v| v.parse().ok())
    }

    pub fn guid(&self) -> Option<&str> {
        self.attr(attr::GUID)
    }

    /// Before-image of an UPDATE, if the row carries one.
    pub fn old_columns(&self) -> Result<Option<Map<String, Value>>> {
        self.attr(attr::OLD_CONTENT).map(parse_row_image).transpose()
    }
}

/// The unit the transport moves and the writer applies atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub description: MessageDescription,
    #[serde(default)]
    pub rows: Vec<ChangeRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl ChangeMessage {
    /// A REPLICATION message for `records`. Description attributes are taken
    /// from the first record; every row keeps its own.
    pub fn replication(records: &[ChangeRecord]) -> Result<Self> {
        let mut attributes = BTreeMap::new();
        if let Some(first) = records.first() {
            attributes.insert(attr::TABLE_NAME.to_string(), first.table_name.clone());
            attributes.insert(attr::TRANSACTION.to_string(), first.transaction.clone());
            attributes.insert(attr::DB_ID.to_string(), first.db_id.clone());
            if let Some(s) = &first.schema {
                attributes.insert(attr::SCHEMA.to_string(), s.clone());
            }
            if let Some(c) = &first.catalog {
                attributes.insert(attr::CATALOG.to_string(), c.clone());
            }
        }
        let rows = records
            .iter()
            .map(ChangeRecord::to_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            description: MessageDescription {
                command: Command::Replication.as_str().to_string(),
                attributes,
                columns: Vec::new(),
            },
            rows,
            payload: None,
        })
    }

    /// A DUMP message carrying a raw payload for the file sink.
    pub fn dump(dump_name: &str, payload: Vec<u8>) -> Self {
        let mut record = SchemaChangeRecord::new(Command::Dump, None, None, "");
        record.dump_name = Some(dump_name.to_string());
        let mut msg = record.into_message();
        msg.payload = Some(payload);
        msg
    }

    /// A STATEMENT message executing `sql` verbatim on the slave.
    pub fn statement(sql: &str) -> Self {
        let mut record = SchemaChangeRecord::new(Command::Statement, None, None, "");
        record.statement = Some(sql.to_string());
        record.into_message()
    }

    pub fn command(&self) -> Result<Command> {
        Command::parse(&self.description.command)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.description.attributes.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.description
            .attributes
            .insert(name.to_string(), value.into());
    }

    /// Row attribute with fallback to the description.
    pub fn row_attr<'a>(&'a self, row: &'a ChangeRow, name: &str) -> Option<&'a str> {
        row.attr(name).or_else(|| self.attr(name))
    }

    pub fn is_already_processed(&self) -> bool {
        self.attr(attr::ALREADY_PROCESSED)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn is_end_of_transition(&self) -> bool {
        self.attr(attr::END_OF_TRANSITION)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Lowest and highest row replKey, or the description replKey.
    pub fn repl_key_range(&self) -> Option<(i64, i64)> {
        let keys = self.rows.iter().filter_map(ChangeRow::repl_key);
        let (min, max) = keys.fold((None, None), |(lo, hi): (Option<i64>, Option<i64>), k| {
            (
                Some(lo.map_or(k, |l| l.min(k))),
                Some(hi.map_or(k, |h| h.max(k))),
            )
        });
        match (min, max) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => self
                .attr(attr::REPL_KEY)
                .and_then(|v| v.parse().ok())
                .map(|k| (k, k)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Codec
// ═══════════════════════════════════════════════════════════════════════════════

/// Encode a message; compress when the JSON exceeds `compress_threshold`
/// bytes (0 disables compression).
pub fn encode(msg: &ChangeMessage, compress_threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    if compress_threshold > 0 && json.len() > compress_threshold {
        return zstd::encode_all(&json[..], 3)
            .map_err(|e| ReplicationError::Codec(format!("zstd encode: {}", e)));
    }
    Ok(json)
}

/// Decode a message produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<ChangeMessage> {
    let bytes = maybe_decompress(data)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}
