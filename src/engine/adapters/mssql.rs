// SPDX-License-Identifier: Apache-2.0

//! SQL Server Adapter
//!
//! Implements the DatasourceAdapter trait for Microsoft SQL Server using
//! Tiberius over the TDS protocol, with bb8 for async connection pooling.
//!
//! Dry-run uses `SET SHOWPLAN_ALL`, which makes the server return the
//! estimated plan for subsequent statements instead of executing them.

use std::time::Instant;

use async_trait::async_trait;
use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use tiberius::{AuthMethod, ColumnData, Config, EncryptionLevel};
use tokio::sync::RwLock;

use crate::engine::adapters::normalize_sql;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DatasourceAdapter;
use crate::engine::types::{
    Capability, ColumnInfo, ConnectionConfig, CostEstimate, DryRunResult, ForeignKey, QueryResult,
    Row, SchemaInfo, TableColumn, TableInfo, Value,
};

type MssqlPool = Pool<ConnectionManager>;

const CAPABILITIES: &[Capability] = &[
    Capability::SqlExecution,
    Capability::DryRun,
    Capability::SchemaIntrospection,
];

/// SQL Server adapter implementation
pub struct SqlServerAdapter {
    id: String,
    pool: RwLock<Option<MssqlPool>>,
}

impl SqlServerAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> EngineResult<MssqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::not_connected(&self.id))
    }

    fn build_config(config: &ConnectionConfig) -> Config {
        let mut tib_config = Config::new();
        tib_config.host(&config.host);
        tib_config.port(config.port);
        tib_config.authentication(AuthMethod::sql_server(&config.username, &config.password));
        if let Some(ref db) = config.database {
            if !db.is_empty() {
                tib_config.database(db);
            }
        }
        tib_config.encryption(if config.ssl {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        tib_config.trust_cert();
        tib_config
    }

    fn map_tiberius_err(e: tiberius::error::Error) -> EngineError {
        let msg = e.to_string();
        if msg.contains("Login failed") {
            EngineError::auth_failed(msg)
        } else if msg.contains("Incorrect syntax") {
            EngineError::syntax_error(msg)
        } else {
            EngineError::execution_error(msg)
        }
    }

    fn map_pool_err(e: bb8::RunError<bb8_tiberius::Error>) -> EngineError {
        match e {
            bb8::RunError::User(bb8_tiberius::Error::Tiberius(inner)) => {
                Self::map_tiberius_err(inner)
            }
            bb8::RunError::User(bb8_tiberius::Error::Io(inner)) => {
                Self::map_tiberius_err(inner.into())
            }
            bb8::RunError::TimedOut => EngineError::Timeout { timeout_ms: 30_000 },
        }
    }

    fn column_info(columns: &[tiberius::Column]) -> Vec<ColumnInfo> {
        columns
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: format!("{:?}", col.column_type()),
                nullable: true,
            })
            .collect()
    }

    fn convert_column_data(data: &ColumnData<'_>) -> Value {
        match data {
            ColumnData::Bit(Some(b)) => Value::Bool(*b),
            ColumnData::U8(Some(v)) => Value::Int(*v as i64),
            ColumnData::I16(Some(v)) => Value::Int(*v as i64),
            ColumnData::I32(Some(v)) => Value::Int(*v as i64),
            ColumnData::I64(Some(v)) => Value::Int(*v),
            ColumnData::F32(Some(v)) => Value::Float(*v as f64),
            ColumnData::F64(Some(v)) => Value::Float(*v),
            ColumnData::Numeric(Some(n)) => {
                let val = n.value() as f64 / 10f64.powi(n.scale() as i32);
                Value::Float(val)
            }
            ColumnData::String(Some(s)) => Value::Text(s.to_string()),
            ColumnData::Guid(Some(g)) => Value::Text(format!("{g}")),
            ColumnData::Binary(Some(b)) => Value::Bytes(b.to_vec()),
            ColumnData::Xml(Some(xml)) => Value::Text(xml.to_string()),
            _ => Value::Null,
        }
    }

    fn convert_row(row: &tiberius::Row) -> Row {
        let values: Vec<Value> = row
            .cells()
            .enumerate()
            .map(|(i, (_col, data))| match data {
                // Date/time types go through chrono via typed getters.
                ColumnData::DateTime(Some(_))
                | ColumnData::SmallDateTime(Some(_))
                | ColumnData::DateTime2(Some(_)) => row
                    .try_get::<chrono::NaiveDateTime, _>(i)
                    .ok()
                    .flatten()
                    .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                    .unwrap_or(Value::Null),
                ColumnData::DateTimeOffset(Some(_)) => row
                    .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                    .ok()
                    .flatten()
                    .map(|dt| Value::Text(dt.to_rfc3339()))
                    .unwrap_or(Value::Null),
                ColumnData::Date(Some(_)) => row
                    .try_get::<chrono::NaiveDate, _>(i)
                    .ok()
                    .flatten()
                    .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                    .unwrap_or(Value::Null),
                ColumnData::Time(Some(_)) => row
                    .try_get::<chrono::NaiveTime, _>(i)
                    .ok()
                    .flatten()
                    .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
                    .unwrap_or(Value::Null),
                _ => Self::convert_column_data(data),
            })
            .collect();
        Row { values }
    }
}

#[async_trait]
impl DatasourceAdapter for SqlServerAdapter {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    fn adapter_name(&self) -> &'static str {
        "SQL Server"
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let tib_config = Self::build_config(config);
        let mgr = ConnectionManager::new(tib_config);

        let pool = Pool::builder()
            .max_size(config.pool_max_connections.unwrap_or(5))
            .connection_timeout(std::time::Duration::from_secs(
                config.pool_acquire_timeout_secs.unwrap_or(30) as u64,
            ))
            .build(mgr)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        // Pool construction is lazy; force one handshake so an unreachable
        // or unauthorized backend fails here, not on first execute.
        {
            let mut conn = pool.get().await.map_err(|e| match e {
                bb8::RunError::User(inner) => {
                    let msg = inner.to_string();
                    if msg.contains("Login failed") {
                        EngineError::auth_failed(msg)
                    } else {
                        EngineError::connection_failed(msg)
                    }
                }
                bb8::RunError::TimedOut => EngineError::connection_failed("pool timeout"),
            })?;
            conn.simple_query("SELECT 1")
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()))?
                .into_results()
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        }

        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        // bb8 pools close their connections on drop.
        self.pool.write().await.take();
        Ok(())
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryResult> {
        let pool = self.pool().await?;
        let start = Instant::now();

        let mut conn = pool.get().await.map_err(Self::map_pool_err)?;
        let stream = conn
            .simple_query(sql)
            .await
            .map_err(Self::map_tiberius_err)?;
        let result_sets = stream
            .into_results()
            .await
            .map_err(Self::map_tiberius_err)?;

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        let rows: Vec<tiberius::Row> = result_sets.into_iter().flatten().collect();
        let columns = rows
            .first()
            .map(|r| Self::column_info(r.columns()))
            .unwrap_or_default();
        let rows: Vec<Row> = rows.iter().map(Self::convert_row).collect();
        Ok(QueryResult::with_rows(columns, rows, elapsed))
    }

    async fn dry_run(&self, sql: &str) -> EngineResult<DryRunResult> {
        let normalized_sql = normalize_sql(&sqlparser::dialect::MsSqlDialect {}, sql)?;

        let pool = self.pool().await?;
        let mut conn = pool.get().await.map_err(Self::map_pool_err)?;

        conn.simple_query("SET SHOWPLAN_ALL ON")
            .await
            .map_err(Self::map_tiberius_err)?
            .into_results()
            .await
            .map_err(Self::map_tiberius_err)?;

        let plan = async {
            let stream = conn.simple_query(sql).await?;
            stream.into_results().await
        }
        .await;

        // Restore the session mode before the connection returns to the pool,
        // whatever the plan request did.
        let _ = conn.simple_query("SET SHOWPLAN_ALL OFF").await;

        let result_sets = plan.map_err(Self::map_tiberius_err)?;
        let plan_rows: Vec<tiberius::Row> = result_sets.into_iter().flatten().collect();

        let estimated_rows = plan_rows
            .first()
            .and_then(|row| row.try_get::<f64, _>("EstimateRows").ok().flatten())
            .unwrap_or(0.0);
        let total_subtree_cost = plan_rows
            .first()
            .and_then(|row| row.try_get::<f64, _>("TotalSubtreeCost").ok().flatten())
            .unwrap_or(0.0);

        Ok(DryRunResult {
            normalized_sql,
            estimate: CostEstimate {
                estimated_rows: estimated_rows as u64,
                estimated_bytes: 0,
                estimated_latency_ms: total_subtree_cost * 1000.0,
            },
        })
    }

    async fn introspect_schema(&self) -> EngineResult<SchemaInfo> {
        let pool = self.pool().await?;
        let mut conn = pool.get().await.map_err(Self::map_pool_err)?;

        let column_sets = conn
            .simple_query(
                "SELECT c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE, c.IS_NULLABLE, \
                        CASE WHEN pk.COLUMN_NAME IS NULL THEN 0 ELSE 1 END AS IS_PK \
                 FROM INFORMATION_SCHEMA.COLUMNS c \
                 LEFT JOIN ( \
                     SELECT kcu.TABLE_NAME, kcu.COLUMN_NAME \
                     FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                     JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
                       ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
                     WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
                 ) pk ON pk.TABLE_NAME = c.TABLE_NAME AND pk.COLUMN_NAME = c.COLUMN_NAME \
                 ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION",
            )
            .await
            .map_err(Self::map_tiberius_err)?
            .into_results()
            .await
            .map_err(Self::map_tiberius_err)?;

        let fk_sets = conn
            .simple_query(
                "SELECT kcu.TABLE_NAME, kcu.COLUMN_NAME, kcu2.TABLE_NAME, kcu2.COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
                   ON kcu.CONSTRAINT_NAME = rc.CONSTRAINT_NAME \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu2 \
                   ON kcu2.CONSTRAINT_NAME = rc.UNIQUE_CONSTRAINT_NAME \
                  AND kcu2.ORDINAL_POSITION = kcu.ORDINAL_POSITION",
            )
            .await
            .map_err(Self::map_tiberius_err)?
            .into_results()
            .await
            .map_err(Self::map_tiberius_err)?;

        let text = |row: &tiberius::Row, idx: usize| -> String {
            row.try_get::<&str, _>(idx)
                .ok()
                .flatten()
                .unwrap_or_default()
                .to_string()
        };

        let mut tables: Vec<TableInfo> = Vec::new();
        for row in column_sets.into_iter().flatten() {
            let table_name = text(&row, 0);
            let column = TableColumn {
                name: text(&row, 1),
                data_type: text(&row, 2),
                nullable: text(&row, 3) == "YES",
                is_primary_key: row.try_get::<i32, _>(4).ok().flatten().unwrap_or(0) == 1,
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
        for row in fk_sets.into_iter().flatten() {
            let table_name = text(&row, 0);
            if let Some(table) = tables.iter_mut().find(|t| t.name == table_name) {
                table.foreign_keys.push(ForeignKey {
                    column: text(&row, 1),
                    referenced_table: text(&row, 2),
                    referenced_column: text(&row, 3),
                });
            }
        }

        Ok(SchemaInfo { tables })
    }
}
