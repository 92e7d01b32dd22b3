// SPDX-License-Identifier: Apache-2.0

//! MySQL Adapter
//!
//! Implements the DatasourceAdapter trait for MySQL/MariaDB using SQLx.
//! Dry-run uses `EXPLAIN FORMAT=JSON`, which plans without executing.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, Row as SqlxRow, TypeInfo};
use tokio::sync::RwLock;

use crate::engine::adapters::normalize_sql;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DatasourceAdapter;
use crate::engine::types::{
    Capability, ColumnInfo, ConnectionConfig, CostEstimate, DryRunResult, ForeignKey, QueryResult,
    Row, SchemaInfo, TableColumn, TableInfo, Value,
};

const CAPABILITIES: &[Capability] = &[
    Capability::SqlExecution,
    Capability::DryRun,
    Capability::SchemaIntrospection,
];

/// MySQL adapter implementation
pub struct MySqlAdapter {
    id: String,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> EngineResult<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::not_connected(&self.id))
    }

    fn build_connect_options(config: &ConnectionConfig) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(if config.ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Preferred
            });
        if let Some(ref db) = config.database {
            opts = opts.database(db);
        }
        opts
    }

    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn convert_row(row: &MySqlRow) -> Row {
        let values = row
            .columns()
            .iter()
            .map(|col| Self::extract_value(row, col.ordinal()))
            .collect();
        Row { values }
    }

    fn column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    fn map_sqlx_err(e: sqlx::Error) -> EngineError {
        match &e {
            sqlx::Error::Database(db) => {
                let msg = db.message().to_string();
                if msg.contains("Access denied") {
                    EngineError::auth_failed(msg)
                } else if msg.contains("error in your SQL syntax") {
                    EngineError::syntax_error(msg)
                } else {
                    EngineError::execution_error(msg)
                }
            }
            sqlx::Error::PoolTimedOut => EngineError::Timeout { timeout_ms: 30_000 },
            _ => EngineError::execution_error(e.to_string()),
        }
    }

    /// MySQL returns the JSON plan as one text cell. Cost lives under
    /// query_block.cost_info.query_cost (as a string), row estimates under
    /// rows_examined_per_scan, both at varying depths.
    fn parse_explain_json(plan_text: &str) -> CostEstimate {
        let parsed: serde_json::Value = match serde_json::from_str(plan_text) {
            Ok(v) => v,
            Err(_) => return CostEstimate::default(),
        };

        fn find_number(value: &serde_json::Value, key: &str) -> Option<f64> {
            match value {
                serde_json::Value::Object(map) => {
                    if let Some(v) = map.get(key) {
                        if let Some(n) = v.as_f64() {
                            return Some(n);
                        }
                        if let Some(s) = v.as_str() {
                            if let Ok(n) = s.parse::<f64>() {
                                return Some(n);
                            }
                        }
                    }
                    map.values().find_map(|v| find_number(v, key))
                }
                serde_json::Value::Array(items) => {
                    items.iter().find_map(|v| find_number(v, key))
                }
                _ => None,
            }
        }

        let rows = find_number(&parsed, "rows_examined_per_scan").unwrap_or(0.0) as u64;
        let cost = find_number(&parsed, "query_cost").unwrap_or(0.0);

        CostEstimate {
            estimated_rows: rows,
            estimated_bytes: 0,
            estimated_latency_ms: cost / 100.0,
        }
    }
}

#[async_trait]
impl DatasourceAdapter for MySqlAdapter {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    fn adapter_name(&self) -> &'static str {
        "MySQL"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let opts = Self::build_connect_options(config);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_max_connections.unwrap_or(5))
            .acquire_timeout(std::time::Duration::from_secs(
                config.pool_acquire_timeout_secs.unwrap_or(30) as u64,
            ))
            .connect_with(opts)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("Access denied") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryResult> {
        let pool = self.pool().await?;
        let start = Instant::now();

        let mut conn = pool.acquire().await.map_err(Self::map_sqlx_err)?;
        let rows = sqlx::query(sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(Self::map_sqlx_err)?;

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        let columns = rows.first().map(Self::column_info).unwrap_or_default();
        let rows: Vec<Row> = rows.iter().map(Self::convert_row).collect();
        Ok(QueryResult::with_rows(columns, rows, elapsed))
    }

    async fn dry_run(&self, sql: &str) -> EngineResult<DryRunResult> {
        let normalized_sql = normalize_sql(&sqlparser::dialect::MySqlDialect {}, sql)?;

        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(Self::map_sqlx_err)?;
        let row = sqlx::query(&format!("EXPLAIN FORMAT=JSON {sql}"))
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::map_sqlx_err)?;

        let plan_text: String = row
            .try_get(0)
            .map_err(|e| EngineError::internal(format!("unreadable plan output: {e}")))?;

        Ok(DryRunResult {
            normalized_sql,
            estimate: Self::parse_explain_json(&plan_text),
        })
    }

    async fn introspect_schema(&self) -> EngineResult<SchemaInfo> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(Self::map_sqlx_err)?;

        let column_rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT table_name, column_name, data_type, is_nullable, column_key \
             FROM information_schema.columns \
             WHERE table_schema = DATABASE() \
             ORDER BY table_name, ordinal_position",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(Self::map_sqlx_err)?;

        let fk_rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT table_name, column_name, referenced_table_name, referenced_column_name \
             FROM information_schema.key_column_usage \
             WHERE table_schema = DATABASE() AND referenced_table_name IS NOT NULL",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(Self::map_sqlx_err)?;

        let mut tables: Vec<TableInfo> = Vec::new();
        for (table_name, column_name, data_type, is_nullable, column_key) in column_rows {
            let column = TableColumn {
                name: column_name,
                data_type,
                nullable: is_nullable == "YES",
                is_primary_key: column_key == "PRI",
            };
            match tables.iter_mut().find(|t| t.name == table_name) {
                Some(table) => table.columns.push(column),
                None => tables.push(TableInfo {
                    name: table_name,
                    columns: vec![column],
                    foreign_keys: Vec::new(),
                }),
            }
        }
        for (table_name, column, referenced_table, referenced_column) in fk_rows {
            if let Some(table) = tables.iter_mut().find(|t| t.name == table_name) {
                table.foreign_keys.push(ForeignKey {
                    column,
                    referenced_table,
                    referenced_column,
                });
            }
        }

        Ok(SchemaInfo { tables })
    }
}
