// SPDX-License-Identifier: Apache-2.0

//! Executor registry and the SQL execution service.
//!
//! Adapters are *what* talks to a backend; executors are *how* a sub-query
//! is dispatched against a capability. The registry maps capability keys to
//! executor services, populated explicitly at startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::config::PipelineConfig;
use super::error::{ErrorCode, PipelineError};
use super::state::SubQuery;
use crate::context::RequestContext;
use crate::engine::error::EngineError;
use crate::engine::registry::AdapterRegistry;
use crate::engine::types::{Capability, QueryResult};

const NODE: &str = "execute";

/// Outcome of dispatching one sub-query.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub result: QueryResult,
    pub warnings: Vec<String>,
}

/// Dispatches a sub-query whose plan requires this service's capability.
#[async_trait]
pub trait ExecutorService: Send + Sync {
    fn capability(&self) -> Capability;

    async fn execute(
        &self,
        ctx: &RequestContext,
        sub_query: &SubQuery,
        sql: &str,
    ) -> Result<ExecutionOutcome, PipelineError>;
}

/// Capability-keyed executor table.
///
/// Resolution walks entries in registration order and returns the first
/// whose capability matches the requested set. Registering a capability
/// that already has an executor replaces it in place, so the original
/// position in the resolution order is kept.
#[derive(Default)]
pub struct ExecutorRegistry {
    entries: Vec<(Capability, Arc<dyn ExecutorService>)>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn ExecutorService>) {
        let key = executor.capability();
        match self.entries.iter_mut().find(|(cap, _)| *cap == key) {
            Some(entry) => entry.1 = executor,
            None => self.entries.push((key, executor)),
        }
    }

    /// First registered executor matching any requested capability, or
    /// `None`. Absence is not an error here; the calling stage decides
    /// what a missing executor means.
    pub fn resolve(&self, requested: &[Capability]) -> Option<Arc<dyn ExecutorService>> {
        self.entries
            .iter()
            .find(|(cap, _)| requested.contains(cap))
            .map(|(_, executor)| executor.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Executes SQL sub-queries through registered adapters, with a per-call
/// timeout and cooperative cancellation.
pub struct SqlExecutor {
    adapters: Arc<AdapterRegistry>,
    timeout: Duration,
    default_row_limit: u64,
}

impl SqlExecutor {
    pub fn new(adapters: Arc<AdapterRegistry>, config: &PipelineConfig) -> Self {
        Self {
            adapters,
            timeout: Duration::from_millis(config.execute_timeout_ms),
            default_row_limit: config.default_row_limit,
        }
    }

    fn classify(e: &EngineError) -> ErrorCode {
        match e {
            EngineError::AdapterNotFound { .. } => ErrorCode::MissingDatasourceId,
            EngineError::Cancelled => ErrorCode::Cancelled,
            EngineError::Internal { .. } => ErrorCode::UnknownError,
            // Connection loss, auth expiry, rejection, and timeouts are all
            // transient from the pipeline's point of view.
            _ => ErrorCode::DbExecutionError,
        }
    }
}

#[async_trait]
impl ExecutorService for SqlExecutor {
    fn capability(&self) -> Capability {
        Capability::SqlExecution
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        sub_query: &SubQuery,
        sql: &str,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let adapter = self.adapters.get(&sub_query.datasource_id).ok_or_else(|| {
            PipelineError::new(
                NODE,
                ErrorCode::MissingDatasourceId,
                format!("datasource '{}' is not registered", sub_query.datasource_id),
            )
        })?;
        let profile = self.adapters.get_profile(&sub_query.datasource_id);
        // Per-source override when the profile declares one, otherwise the
        // configured pipeline default.
        let row_limit = profile
            .and_then(|p| p.row_limit)
            .unwrap_or(self.default_row_limit);

        // Backends that can plan without executing get a validation pass
        // first, so a statement the planner rejects feeds the refine loop
        // instead of burning a real execution.
        let dry_run_capable = profile
            .map(|p| p.capabilities.contains(&Capability::DryRun))
            .unwrap_or(false);
        if dry_run_capable {
            if let Err(e) = adapter.dry_run(sql).await {
                return Err(PipelineError::new(
                    NODE,
                    ErrorCode::SqlGenFailed,
                    format!("generated SQL failed validation: {e}"),
                ));
            }
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => {
                return Err(PipelineError::new(
                    NODE,
                    ErrorCode::Cancelled,
                    "request cancelled during execution",
                ));
            }
            outcome = tokio::time::timeout(self.timeout, adapter.execute(sql)) => match outcome {
                Err(_) => {
                    return Err(PipelineError::new(
                        NODE,
                        ErrorCode::DbExecutionError,
                        format!("execution exceeded {}ms", self.timeout.as_millis()),
                    ));
                }
                Ok(Err(e)) => {
                    return Err(PipelineError::new(NODE, Self::classify(&e), e.to_string()));
                }
                Ok(Ok(result)) => result,
            }
        };

        let mut warnings = Vec::new();
        if result.row_count >= row_limit {
            warn!(
                sub_query_id = %sub_query.id,
                row_count = result.row_count,
                row_limit,
                "row limit reached, results may be truncated"
            );
            warnings.push(format!(
                "datasource '{}' returned {} rows, reaching its limit of {}",
                sub_query.datasource_id, result.row_count, row_limit
            ));
        }
        info!(
            sub_query_id = %sub_query.id,
            rows = result.row_count,
            elapsed_ms = result.execution_time_ms,
            "execution complete"
        );
        Ok(ExecutionOutcome { result, warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::conformance::{connected_mock, MockAdapter};
    use crate::engine::types::{AdapterProfile, ConnectionConfig, Value};
    use crate::pipeline::state::SubQueryStatus;

    fn mock_config() -> ConnectionConfig {
        ConnectionConfig {
            backend: "mock".to_string(),
            host: "localhost".to_string(),
            port: 0,
            username: String::new(),
            password: String::new(),
            database: None,
            ssl: false,
            pool_max_connections: None,
            pool_acquire_timeout_secs: None,
        }
    }

    fn sub_query(datasource_id: &str) -> SubQuery {
        SubQuery {
            id: "abc123".to_string(),
            parent: "trace-1".to_string(),
            datasource_id: datasource_id.to_string(),
            intent: "count users".to_string(),
            filters: Vec::new(),
            sql: None,
            status: SubQueryStatus::Pending,
        }
    }

    struct NoopExecutor(Capability, &'static str);

    #[async_trait]
    impl ExecutorService for NoopExecutor {
        fn capability(&self) -> Capability {
            self.0
        }

        async fn execute(
            &self,
            _ctx: &RequestContext,
            _sub_query: &SubQuery,
            _sql: &str,
        ) -> Result<ExecutionOutcome, PipelineError> {
            Err(PipelineError::new(self.1, ErrorCode::UnknownError, "noop"))
        }
    }

    #[test]
    fn resolution_honors_registration_order() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor(Capability::SqlExecution, "first")));
        registry.register(Arc::new(NoopExecutor(Capability::RestAccess, "rest")));

        let resolved = registry
            .resolve(&[Capability::RestAccess, Capability::SqlExecution])
            .unwrap();
        assert_eq!(resolved.capability(), Capability::SqlExecution);

        assert!(registry.resolve(&[Capability::DryRun]).is_none());
    }

    #[tokio::test]
    async fn re_registration_replaces_per_key() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor(Capability::SqlExecution, "old")));
        registry.register(Arc::new(NoopExecutor(Capability::SqlExecution, "new")));

        let resolved = registry.resolve(&[Capability::SqlExecution]).unwrap();
        let ctx = RequestContext::new("acme");
        let err = resolved
            .execute(&ctx, &sub_query("db"), "SELECT 1")
            .await
            .unwrap_err();
        assert_eq!(err.node, "new");
    }

    #[tokio::test]
    async fn executes_through_the_adapter() {
        let adapter = connected_mock("warehouse").await;
        adapter.set_result(MockAdapter::single_row_result("n", Value::Int(42)));

        let mut adapters = AdapterRegistry::new();
        adapters.register(AdapterProfile::new("warehouse", mock_config()), adapter);
        let executor = SqlExecutor::new(Arc::new(adapters), &PipelineConfig::default());

        let ctx = RequestContext::new("acme");
        let outcome = executor
            .execute(&ctx, &sub_query("warehouse"), "SELECT count(*) FROM users")
            .await
            .unwrap();
        assert_eq!(outcome.result.row_count, 1);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn backend_rejection_is_retryable_db_error() {
        let adapter = connected_mock("warehouse").await;
        adapter.push_execute_error(EngineError::execution_error("deadlock"));

        let mut adapters = AdapterRegistry::new();
        adapters.register(AdapterProfile::new("warehouse", mock_config()), adapter);
        let executor = SqlExecutor::new(Arc::new(adapters), &PipelineConfig::default());

        let ctx = RequestContext::new("acme");
        let err = executor
            .execute(&ctx, &sub_query("warehouse"), "SELECT 1")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DbExecutionError);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn planner_rejection_feeds_the_refine_loop() {
        let adapter = connected_mock("warehouse").await;

        let mut adapters = AdapterRegistry::new();
        adapters.register(AdapterProfile::new("warehouse", mock_config()), adapter.clone());
        let executor = SqlExecutor::new(Arc::new(adapters), &PipelineConfig::default());

        let ctx = RequestContext::new("acme");
        let err = executor
            .execute(&ctx, &sub_query("warehouse"), "SYNTAX GARBAGE")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SqlGenFailed);
        assert!(err.is_retryable());
        // Validation happened instead of execution.
        assert_eq!(adapter.execute_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_surfaces_its_own_code() {
        let adapter = connected_mock("warehouse").await;
        adapter.set_execute_delay(Duration::from_secs(5));

        let mut adapters = AdapterRegistry::new();
        adapters.register(AdapterProfile::new("warehouse", mock_config()), adapter);
        let executor = SqlExecutor::new(Arc::new(adapters), &PipelineConfig::default());

        let ctx = RequestContext::new("acme");
        ctx.cancel();
        let err = executor
            .execute(&ctx, &sub_query("warehouse"), "SELECT 1")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn hitting_the_row_limit_warns() {
        let adapter = connected_mock("warehouse").await;
        adapter.set_result(MockAdapter::single_row_result("n", Value::Int(1)));

        let mut profile = AdapterProfile::new("warehouse", mock_config());
        profile.row_limit = Some(1);
        let mut adapters = AdapterRegistry::new();
        adapters.register(profile, adapter);
        let executor = SqlExecutor::new(Arc::new(adapters), &PipelineConfig::default());

        let ctx = RequestContext::new("acme");
        let outcome = executor
            .execute(&ctx, &sub_query("warehouse"), "SELECT 1")
            .await
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn config_row_limit_applies_when_profile_has_none() {
        let adapter = connected_mock("warehouse").await;
        adapter.set_result(MockAdapter::single_row_result("n", Value::Int(1)));

        let mut adapters = AdapterRegistry::new();
        adapters.register(AdapterProfile::new("warehouse", mock_config()), adapter);
        let mut config = PipelineConfig::default();
        config.default_row_limit = 1;
        let executor = SqlExecutor::new(Arc::new(adapters), &config);

        let ctx = RequestContext::new("acme");
        let outcome = executor
            .execute(&ctx, &sub_query("warehouse"), "SELECT 1")
            .await
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
    }
}
