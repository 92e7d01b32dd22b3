// SPDX-License-Identifier: Apache-2.0

//! Adapter conformance suite
//!
//! Every backend implementation must pass these checks before the pipeline
//! will trust it. The suite pins down the contract the trait alone cannot:
//! connection failures surface as connection-class errors, execution failures
//! as execution-class errors, dry-run never executes, and introspection
//! returns the agreed shape.
//!
//! Integration tests run the suite against real backends (see
//! `tests/adapter_conformance.rs`); [`MockAdapter`] lets unit tests run it
//! in-process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DatasourceAdapter;
use crate::engine::types::{
    Capability, ColumnInfo, ConnectionConfig, CostEstimate, DryRunResult, QueryResult, Row,
    SchemaInfo, TableColumn, TableInfo, Value,
};

/// Inputs for one conformance run against a candidate adapter.
pub struct ConformanceFixture {
    pub good_config: ConnectionConfig,
    pub bad_config: ConnectionConfig,
    /// A statement expected to succeed after `setup_sql` ran.
    pub probe_sql: String,
    /// Statements run once after connect to create test data. May be empty.
    pub setup_sql: Vec<String>,
    /// A statement the backend must reject.
    pub invalid_sql: String,
}

/// Runs the full conformance suite. Panics with a descriptive message on the
/// first violated contract, so it composes with `#[tokio::test]`.
pub async fn assert_adapter_conformance<A: DatasourceAdapter>(
    adapter: &A,
    fixture: &ConformanceFixture,
) {
    // Capability declaration must be static and non-empty.
    let caps = adapter.capabilities().to_vec();
    assert!(
        !caps.is_empty(),
        "adapter '{}' declares no capabilities",
        adapter.adapter_id()
    );
    assert_eq!(
        caps,
        adapter.capabilities().to_vec(),
        "capability declaration is not stable across calls"
    );

    // Connecting to an unreachable/unauthorized backend must fail with a
    // connection-class error, not a panic or a generic internal error.
    match adapter.connect(&fixture.bad_config).await {
        Err(EngineError::ConnectionFailed { .. })
        | Err(EngineError::AuthenticationFailed { .. })
        | Err(EngineError::Timeout { .. }) => {}
        Err(other) => panic!("bad config produced non-connection error: {other}"),
        Ok(()) => panic!("bad config unexpectedly connected"),
    }

    adapter
        .connect(&fixture.good_config)
        .await
        .expect("good config must connect");

    for stmt in &fixture.setup_sql {
        adapter.execute(stmt).await.expect("setup statement failed");
    }

    // Execute success: result shape must be internally consistent.
    let result = adapter
        .execute(&fixture.probe_sql)
        .await
        .expect("probe statement must execute");
    assert_eq!(
        result.row_count,
        result.rows.len() as u64,
        "row_count disagrees with rows"
    );
    for row in &result.rows {
        assert_eq!(
            row.values.len(),
            result.columns.len(),
            "row width disagrees with column metadata"
        );
    }

    // Execute failure: backend rejection maps to a syntax/execution error.
    match adapter.execute(&fixture.invalid_sql).await {
        Err(EngineError::SyntaxError { .. }) | Err(EngineError::ExecutionError { .. }) => {}
        Err(other) => panic!("invalid SQL produced unexpected error: {other}"),
        Ok(_) => panic!("invalid SQL unexpectedly executed"),
    }

    // Dry run validates without executing and reports a normalized statement.
    if adapter.capabilities().contains(&Capability::DryRun) {
        let dry = adapter
            .dry_run(&fixture.probe_sql)
            .await
            .expect("dry run of the probe statement must validate");
        assert!(
            !dry.normalized_sql.trim().is_empty(),
            "dry run returned empty normalized SQL"
        );
        assert!(
            adapter.dry_run(&fixture.invalid_sql).await.is_err(),
            "dry run accepted an invalid statement"
        );
    }

    // Introspection shape: every table has a name and typed columns.
    if adapter
        .capabilities()
        .contains(&Capability::SchemaIntrospection)
    {
        let schema = adapter
            .introspect_schema()
            .await
            .expect("introspection must succeed on a connected adapter");
        for table in &schema.tables {
            assert!(!table.name.is_empty(), "introspected table without a name");
            for column in &table.columns {
                assert!(
                    !column.name.is_empty(),
                    "table '{}' has a column without a name",
                    table.name
                );
            }
        }
    }

    adapter.disconnect().await.expect("disconnect must succeed");
}

// ==================== Mock adapter ====================

/// Behavior script for [`MockAdapter`], shared across clones.
#[derive(Default)]
struct MockScript {
    /// Errors to return from `execute`, consumed front to back before
    /// falling through to the canned result.
    execute_errors: Vec<EngineError>,
    /// Canned result returned once the error script is exhausted.
    result: Option<QueryResult>,
    schema: Option<SchemaInfo>,
    /// Artificial latency applied to `execute`.
    execute_delay: Option<Duration>,
    refuse_connect: bool,
}

/// Scriptable in-memory adapter used by the conformance suite and the
/// pipeline tests.
pub struct MockAdapter {
    id: String,
    capabilities: Vec<Capability>,
    script: Mutex<MockScript>,
    execute_calls: AtomicU64,
    connected: Mutex<bool>,
}

impl MockAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: vec![
                Capability::SqlExecution,
                Capability::DryRun,
                Capability::SchemaIntrospection,
            ],
            script: Mutex::new(MockScript::default()),
            execute_calls: AtomicU64::new(0),
            connected: Mutex::new(false),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Queue an error for the next `execute` call.
    pub fn push_execute_error(&self, err: EngineError) {
        self.script.lock().execute_errors.push(err);
    }

    pub fn set_result(&self, result: QueryResult) {
        self.script.lock().result = Some(result);
    }

    pub fn set_schema(&self, schema: SchemaInfo) {
        self.script.lock().schema = Some(schema);
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.script.lock().execute_delay = Some(delay);
    }

    pub fn refuse_connect(&self) {
        self.script.lock().refuse_connect = true;
    }

    pub fn execute_calls(&self) -> u64 {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// One-row, one-column result most tests want.
    pub fn single_row_result(column: &str, value: Value) -> QueryResult {
        QueryResult::with_rows(
            vec![ColumnInfo {
                name: column.to_string(),
                data_type: "text".to_string(),
                nullable: true,
            }],
            vec![Row {
                values: vec![value],
            }],
            1.0,
        )
    }

    /// A small users/orders schema for retrieval tests.
    pub fn sample_schema() -> SchemaInfo {
        let col = |name: &str, data_type: &str| TableColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: false,
            is_primary_key: name == "id",
        };
        SchemaInfo {
            tables: vec![
                TableInfo {
                    name: "users".to_string(),
                    columns: vec![col("id", "integer"), col("email", "text")],
                    foreign_keys: vec![],
                },
                TableInfo {
                    name: "orders".to_string(),
                    columns: vec![
                        col("id", "integer"),
                        col("user_id", "integer"),
                        col("total", "real"),
                    ],
                    foreign_keys: vec![],
                },
            ],
        }
    }
}

#[async_trait]
impl DatasourceAdapter for MockAdapter {
    fn adapter_id(&self) -> &str {
        &self.id
    }

    fn adapter_name(&self) -> &'static str {
        "Mock"
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn connect(&self, config: &ConnectionConfig) -> EngineResult<()> {
        if self.script.lock().refuse_connect || config.host == "unreachable" {
            return Err(EngineError::connection_failed(format!(
                "no backend at {}:{}",
                config.host, config.port
            )));
        }
        *self.connected.lock() = true;
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        *self.connected.lock() = false;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> EngineResult<QueryResult> {
        if !*self.connected.lock() {
            return Err(EngineError::not_connected(&self.id));
        }
        self.execute_calls.fetch_add(1, Ordering::SeqCst);

        let (delay, scripted) = {
            let mut script = self.script.lock();
            let scripted = if script.execute_errors.is_empty() {
                None
            } else {
                Some(script.execute_errors.remove(0))
            };
            (script.execute_delay, scripted)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = scripted {
            return Err(err);
        }
        if sql.to_uppercase().contains("SYNTAX GARBAGE") {
            return Err(EngineError::syntax_error("near \"GARBAGE\""));
        }

        let canned = self.script.lock().result.clone();
        Ok(canned.unwrap_or_else(QueryResult::empty))
    }

    async fn dry_run(&self, sql: &str) -> EngineResult<DryRunResult> {
        if sql.to_uppercase().contains("SYNTAX GARBAGE") {
            return Err(EngineError::syntax_error("near \"GARBAGE\""));
        }
        Ok(DryRunResult {
            normalized_sql: sql.trim().to_string(),
            estimate: CostEstimate::default(),
        })
    }

    async fn introspect_schema(&self) -> EngineResult<SchemaInfo> {
        if !*self.connected.lock() {
            return Err(EngineError::not_connected(&self.id));
        }
        let canned = self.script.lock().schema.clone();
        Ok(canned.unwrap_or_default())
    }
}

/// Convenience for tests that want a registered, connected mock.
pub async fn connected_mock(id: &str) -> Arc<MockAdapter> {
    let adapter = Arc::new(MockAdapter::new(id));
    let config = ConnectionConfig {
        backend: "mock".to_string(),
        host: "localhost".to_string(),
        port: 0,
        username: String::new(),
        password: String::new(),
        database: None,
        ssl: false,
        pool_max_connections: None,
        pool_acquire_timeout_secs: None,
    };
    adapter
        .connect(&config)
        .await
        .expect("mock connect is infallible for localhost");
    adapter
}
