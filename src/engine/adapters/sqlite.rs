// SPDX-License-Identifier: Apache-2.0

//! SQLite Adapter
//!
//! Implements the DatasourceAdapter trait for SQLite using SQLx.
//!
//! ## SQLite Specifics
//!
//! - File-based: `host` in ConnectionConfig carries the file path
//! - Supports `:memory:` for in-memory databases
//! - Uses WAL mode for better concurrency
//! - The planner exposes no row estimates, so dry-run cost is scan-step based

use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
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

/// SQLite adapter implementation
pub struct SqliteAdapter {
    id: String,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> EngineResult<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::not_connected(&self.id))
    }

    fn build_connect_options(config: &ConnectionConfig) -> EngineResult<SqliteConnectOptions> {
        let path = config.host.trim();
        if path.is_empty() {
            return Err(EngineError::connection_failed("SQLite path cannot be empty"));
        }

        let conn_str = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}")
        };

        let opts = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| EngineError::connection_failed(e.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        // Never create a database file by accident: a missing path is an
        // unreachable backend, not a new datasource.
        Ok(opts.create_if_missing(path == ":memory:"))
    }

    /// Extracts a value from a SqliteRow at the given index.
    ///
    /// SQLite has dynamic typing, so we try multiple types in order of
    /// likelihood.
    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn convert_row(row: &SqliteRow) -> Row {
        let values = row
            .columns()
            .iter()
            .map(|col| Self::extract_value(row, col.ordinal()))
            .collect();
        Row { values }
    }

    fn column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn map_sqlx_err(e: sqlx::Error) -> EngineError {
        match &e {
            sqlx::Error::Database(db) if db.message().contains("syntax error") => {
                EngineError::syntax_error(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut => EngineError::Timeout { timeout_ms: 30_000 },
            _ => EngineError::execution_error(e.to_string()),
        }
    }
}

#[async_trait]
impl DatasourceAdapter for SqliteAdapter {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    fn adapter_name(&self) -> &'static str {
        "SQLite"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let opts = Self::build_connect_options(config)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_max_connections.unwrap_or(5))
            .acquire_timeout(std::time::Duration::from_secs(
                config.pool_acquire_timeout_secs.unwrap_or(30) as u64,
            ))
            .connect_with(opts)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

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

        // Scoped acquisition: the pool guard releases on every exit path.
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
        let normalized_sql = normalize_sql(&sqlparser::dialect::SQLiteDialect {}, sql)?;

        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(Self::map_sqlx_err)?;
        let plan_rows = sqlx::query(&format!("EXPLAIN QUERY PLAN {sql}"))
            .fetch_all(&mut *conn)
            .await
            .map_err(Self::map_sqlx_err)?;

        // SQLite's planner reports scan steps, not row estimates. Charge a
        // nominal latency per step so wider plans rank as more expensive.
        let steps = plan_rows.len() as u64;
        Ok(DryRunResult {
            normalized_sql,
            estimate: CostEstimate {
                estimated_rows: 0,
                estimated_bytes: 0,
                estimated_latency_ms: steps as f64 * 0.1,
            },
        })
    }

    async fn introspect_schema(&self) -> EngineResult<SchemaInfo> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(Self::map_sqlx_err)?;

        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(Self::map_sqlx_err)?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            let quoted = Self::quote_ident(&name);

            let column_rows: Vec<(i64, String, String, i64, Option<String>, i64)> =
                sqlx::query_as(&format!("PRAGMA table_info({quoted})"))
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(Self::map_sqlx_err)?;

            let columns = column_rows
                .into_iter()
                .map(|(_cid, col_name, data_type, notnull, _default, pk)| TableColumn {
                    name: col_name,
                    data_type,
                    nullable: notnull == 0,
                    is_primary_key: pk > 0,
                })
                .collect();

            let fk_rows: Vec<(i64, i64, String, String, String)> = sqlx::query_as(&format!(
                "SELECT id, seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list({quoted})"
            ))
            .fetch_all(&mut *conn)
            .await
            .unwrap_or_default();

            let foreign_keys = fk_rows
                .into_iter()
                .map(|(_id, _seq, table, from, to)| ForeignKey {
                    column: from,
                    referenced_table: table,
                    referenced_column: to,
                })
                .collect();

            tables.push(TableInfo {
                name,
                columns,
                foreign_keys,
            });
        }

        Ok(SchemaInfo { tables })
    }
}
