// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL Adapter
//!
//! Implements the DatasourceAdapter trait for PostgreSQL using SQLx.
//! Dry-run uses `EXPLAIN (FORMAT JSON)`, which plans without executing and
//! reports row/width/cost estimates straight from the planner.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
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

/// PostgreSQL adapter implementation
pub struct PostgresAdapter {
    id: String,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> EngineResult<PgPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::not_connected(&self.id))
    }

    fn build_connect_options(config: &ConnectionConfig) -> PgConnectOptions {
        let mut opts = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(if config.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if let Some(ref db) = config.database {
            opts = opts.database(db);
        }
        opts
    }

    /// Extracts a value from a PgRow at the given index, trying common types
    /// in order of likelihood. NULLs are handled via `Option<T>`.
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
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
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.to_rfc3339()))
                .unwrap_or(Value::Null);
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

    fn convert_row(row: &PgRow) -> Row {
        let values = row
            .columns()
            .iter()
            .map(|col| Self::extract_value(row, col.ordinal()))
            .collect();
        Row { values }
    }

    fn column_info(row: &PgRow) -> Vec<ColumnInfo> {
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
                if msg.contains("password authentication failed") {
                    EngineError::auth_failed(msg)
                } else if db.code().as_deref() == Some("42601") {
                    EngineError::syntax_error(msg)
                } else {
                    EngineError::execution_error(msg)
                }
            }
            sqlx::Error::PoolTimedOut => EngineError::Timeout { timeout_ms: 30_000 },
            _ => EngineError::execution_error(e.to_string()),
        }
    }

    fn parse_explain_json(plan: &serde_json::Value) -> CostEstimate {
        let plan = plan
            .get(0)
            .and_then(|v| v.get("Plan"))
            .cloned()
            .unwrap_or_default();

        let rows = plan["Plan Rows"].as_u64().unwrap_or(0);
        let width = plan["Plan Width"].as_u64().unwrap_or(0);
        // Postgres cost units are abstract page fetches; treat them as a
        // rough latency proxy rather than pretending to milliseconds of
        // precision.
        let cost = plan["Total Cost"].as_f64().unwrap_or(0.0);

        CostEstimate {
            estimated_rows: rows,
            estimated_bytes: rows * width,
            estimated_latency_ms: cost / 100.0,
        }
    }
}

#[async_trait]
impl DatasourceAdapter for PostgresAdapter {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    fn adapter_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let opts = Self::build_connect_options(config);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max_connections.unwrap_or(5))
            .acquire_timeout(std::time::Duration::from_secs(
                config.pool_acquire_timeout_secs.unwrap_or(30) as u64,
            ))
            .connect_with(opts)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("password authentication failed") {
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
        let normalized_sql = normalize_sql(&sqlparser::dialect::PostgreSqlDialect {}, sql)?;

        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(Self::map_sqlx_err)?;
        let row = sqlx::query(&format!("EXPLAIN (FORMAT JSON) {sql}"))
            .fetch_one(&mut *conn)
            .await
            .map_err(Self::map_sqlx_err)?;

        let plan: serde_json::Value = row
            .try_get(0)
            .map_err(|e| EngineError::internal(format!("unreadable plan output: {e}")))?;

        Ok(DryRunResult {
            normalized_sql,
            estimate: Self::parse_explain_json(&plan),
        })
    }

    async fn introspect_schema(&self) -> EngineResult<SchemaInfo> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(Self::map_sqlx_err)?;

        let column_rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT table_name, column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = 'public' \
             ORDER BY table_name, ordinal_position",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(Self::map_sqlx_err)?;

        let pk_rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT tc.table_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = 'public'",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(Self::map_sqlx_err)?;

        let fk_rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT tc.table_name, kcu.column_name, ccu.table_name, ccu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name \
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public'",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(Self::map_sqlx_err)?;

        let mut tables: Vec<TableInfo> = Vec::new();
        for (table_name, column_name, data_type, is_nullable) in column_rows {
            let is_primary_key = pk_rows
                .iter()
                .any(|(t, c)| *t == table_name && *c == column_name);
            let column = TableColumn {
                name: column_name,
                data_type,
                nullable: is_nullable == "YES",
                is_primary_key,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explain_json_extracts_planner_estimates() {
        let plan: serde_json::Value = serde_json::json!([{
            "Plan": {
                "Node Type": "Seq Scan",
                "Plan Rows": 420,
                "Plan Width": 32,
                "Total Cost": 15.2
            }
        }]);
        let estimate = PostgresAdapter::parse_explain_json(&plan);
        assert_eq!(estimate.estimated_rows, 420);
        assert_eq!(estimate.estimated_bytes, 420 * 32);
        assert!(estimate.estimated_latency_ms > 0.0);
    }

    #[test]
    fn explain_json_tolerates_missing_fields() {
        let estimate = PostgresAdapter::parse_explain_json(&serde_json::json!([]));
        assert_eq!(estimate.estimated_rows, 0);
    }

    #[tokio::test]
    async fn execute_before_connect_is_rejected() {
        let adapter = PostgresAdapter::new("warehouse");
        let err = adapter.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, EngineError::NotConnected { .. }));
    }
}
