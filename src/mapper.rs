// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Name mapping between master and slave namespaces.
//!
//! A [`NameMapper`] is four pure functions. Returning `None` from
//! `map_catalog` or `map_schema` means "omit this qualifier" in generated
//! statements. Returning `None` from `map_column` drops the column from
//! replication. `map_table` returning `None` keeps the source table name.
//!
//! Implementations are selected by name through [`create_mapper`], a fixed
//! registry; callers may also inject their own `Arc<dyn NameMapper>`.

use crate::config::MapperConfig;
use crate::error::{ReplicationError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Translates identifiers from the master namespace into the slave namespace.
///
/// All methods must be deterministic and free of side effects.
pub trait NameMapper: Send + Sync {
    fn map_catalog(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        column: Option<&str>,
    ) -> Option<String>;

    fn map_schema(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        column: Option<&str>,
    ) -> Option<String>;

    fn map_table(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        column: Option<&str>,
    ) -> Option<String>;

    fn map_column(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Option<String>;
}

/// Passes every identifier through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMapper;

impl NameMapper for IdentityMapper {
    fn map_catalog(&self, catalog: Option<&str>, _: Option<&str>, _: &str, _: Option<&str>) -> Option<String> {
        catalog.map(str::to_string)
    }

    fn map_schema(&self, _: Option<&str>, schema: Option<&str>, _: &str, _: Option<&str>) -> Option<String> {
        schema.map(str::to_string)
    }

    fn map_table(&self, _: Option<&str>, _: Option<&str>, table: &str, _: Option<&str>) -> Option<String> {
        Some(table.to_string())
    }

    fn map_column(&self, _: Option<&str>, _: Option<&str>, _: &str, column: &str) -> Option<String> {
        Some(column.to_string())
    }
}

/// Table-driven mapper configured by `replication.mapper.*`.
///
/// Lookups are case-insensitive on the source name. An entry with an empty
/// destination maps to `None`. Column entries may be qualified with the
/// source table (`orders.qty=quantity`); qualified entries win over bare ones.
#[derive(Debug, Default, Clone)]
pub struct DefaultMapper {
    schemas: BTreeMap<String, String>,
    tables: BTreeMap<String, String>,
    columns: BTreeMap<String, String>,
}

impl DefaultMapper {
    pub fn new(config: &MapperConfig) -> Self {
        Self {
            schemas: lowercase_keys(&config.schemas),
            tables: lowercase_keys(&config.tables),
            columns: lowercase_keys(&config.columns),
        }
    }

    fn lookup(map: &BTreeMap<String, String>, key: &str) -> Option<Option<String>> {
        map.get(&key.to_lowercase()).map(|dst| {
            if dst.is_empty() {
                None
            } else {
                Some(dst.clone())
            }
        })
    }
}

fn lowercase_keys(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect()
}

impl NameMapper for DefaultMapper {
    fn map_catalog(&self, catalog: Option<&str>, _: Option<&str>, _: &str, _: Option<&str>) -> Option<String> {
        catalog.map(str::to_string)
    }

    fn map_schema(&self, _: Option<&str>, schema: Option<&str>, _: &str, _: Option<&str>) -> Option<String> {
        let schema = schema?;
        match Self::lookup(&self.schemas, schema) {
            Some(mapped) => mapped,
            None => Some(schema.to_string()),
        }
    }

    fn map_table(&self, _: Option<&str>, _: Option<&str>, table: &str, _: Option<&str>) -> Option<String> {
        match Self::lookup(&self.tables, table) {
            Some(mapped) => mapped,
            None => Some(table.to_string()),
        }
    }

    fn map_column(&self, _: Option<&str>, _: Option<&str>, table: &str, column: &str) -> Option<String> {
        let qualified = format!("{}.{}", table, column);
        if let Some(mapped) = Self::lookup(&self.columns, &qualified) {
            return mapped;
        }
        match Self::lookup(&self.columns, column) {
            Some(mapped) => mapped,
            None => Some(column.to_string()),
        }
    }
}

/// Instantiate a mapper by registry name.
pub fn create_mapper(config: &MapperConfig) -> Result<Arc<dyn NameMapper>> {
    match config.class.trim().to_ascii_lowercase().as_str() {
        "" | "default" => Ok(Arc::new(DefaultMapper::new(config))),
        "identity" => Ok(Arc::new(IdentityMapper)),
        other => Err(ReplicationError::Config(format!(
            "unknown 'replication.mapper.class' '{}' (known: default, identity)",
            other
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolved destination names
// ═══════════════════════════════════════════════════════════════════════════════

/// A destination table name after mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedName {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl MappedName {
    /// Map a master table identity through `mapper`.
    pub fn resolve(
        mapper: &dyn NameMapper,
        catalog: Option<&str>,
        schema: Option<&str>,
        table: &str,
    ) -> Self {
        Self {
            catalog: mapper.map_catalog(catalog, schema, table, None),
            schema: mapper.map_schema(catalog, schema, table, None),
            table: mapper
                .map_table(catalog, schema, table, None)
                .unwrap_or_else(|| table.to_string()),
        }
    }

    /// Unmapped name, for places that speak the master's namespace.
    pub fn unmapped(schema: Option<&str>, table: &str) -> Self {
        Self {
            catalog: None,
            schema: schema.map(str::to_string),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for MappedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(s) => write!(f, "{}.{}", s, self.table),
            None => f.write_str(&self.table),
        }
    }
}
