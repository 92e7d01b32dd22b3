// SPDX-License-Identifier: Apache-2.0

//! Universal data types for the datasource adapter layer
//!
//! These types provide a normalized representation of database concepts
//! across the supported SQL backends. The pipeline never touches a
//! driver-native row or column type.

use serde::{Deserialize, Serialize};

/// A declared ability of a datasource adapter, used as a dispatch key by the
/// executor registry. Adapters declare a fixed set at construction; dispatch
/// is a lookup, never duck-typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SqlExecution,
    DryRun,
    SchemaIntrospection,
    RestAccess,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::SqlExecution => "sql_execution",
            Capability::DryRun => "dry_run",
            Capability::SchemaIntrospection => "schema_introspection",
            Capability::RestAccess => "rest_access",
        }
    }
}

/// Database connection configuration.
///
/// Backend-opaque: SQLite stores the file path in `host`, the client-server
/// backends use host/port/credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub backend: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: Option<String>,
    pub ssl: bool,
    pub pool_max_connections: Option<u32>,
    pub pool_acquire_timeout_secs: Option<u32>,
}

/// Registration-time profile for one datasource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterProfile {
    /// Unique datasource id, the key sub-queries are routed by.
    pub id: String,
    pub config: ConnectionConfig,
    /// Declared capability set, used by the executor registry for dispatch.
    pub capabilities: Vec<Capability>,
    /// Maximum rows a single execution is expected to return. Hitting the
    /// limit exactly produces a truncation warning, never an error. `None`
    /// defers to the pipeline-wide default.
    pub row_limit: Option<u64>,
    /// Optional database role the adapter should assume for read-only work.
    pub read_only_role: Option<String>,
}

pub const DEFAULT_ROW_LIMIT: u64 = 10_000;

impl AdapterProfile {
    pub fn new(id: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            id: id.into(),
            config,
            capabilities: vec![
                Capability::SqlExecution,
                Capability::DryRun,
                Capability::SchemaIntrospection,
            ],
            row_limit: None,
            read_only_role: None,
        }
    }
}

/// Universal value representation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// Query execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub row_count: u64,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms: 0.0,
        }
    }

    pub fn with_rows(columns: Vec<ColumnInfo>, rows: Vec<Row>, time_ms: f64) -> Self {
        let row_count = rows.len() as u64;
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms: time_ms,
        }
    }
}

/// Planner-reported cost of a statement, gathered without executing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostEstimate {
    pub estimated_rows: u64,
    pub estimated_bytes: u64,
    pub estimated_latency_ms: f64,
}

/// Result of validating a statement without running it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunResult {
    /// The statement after a parse round-trip through the backend dialect.
    pub normalized_sql: String,
    pub estimate: CostEstimate,
}

/// Foreign key definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Column metadata for table schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    /// Data type (backend-specific spelling)
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
}

/// One table as reported by schema introspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<TableColumn>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// Full introspected schema for one datasource
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub tables: Vec<TableInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_round_trips_through_serde() {
        let json = serde_json::to_string(&Capability::SqlExecution).unwrap();
        assert_eq!(json, "\"sql_execution\"");
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Capability::SqlExecution);
    }

    #[test]
    fn profile_defaults_carry_sql_capabilities() {
        let config = ConnectionConfig {
            backend: "sqlite".to_string(),
            host: ":memory:".to_string(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: None,
            ssl: false,
            pool_max_connections: None,
            pool_acquire_timeout_secs: None,
        };
        let profile = AdapterProfile::new("local", config);
        assert!(profile.capabilities.contains(&Capability::SqlExecution));
        // No per-source override by default; the pipeline default applies.
        assert_eq!(profile.row_limit, None);
    }

    #[test]
    fn password_is_never_serialized() {
        let config = ConnectionConfig {
            backend: "postgres".to_string(),
            host: "db".to_string(),
            port: 5432,
            username: "u".to_string(),
            password: "hunter2".to_string(),
            database: Some("app".to_string()),
            ssl: true,
            pool_max_connections: None,
            pool_acquire_timeout_secs: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
