// SPDX-License-Identifier: Apache-2.0

//! QueryLoom turns a natural-language question into read-only SQL executed
//! across one or more heterogeneous databases, then folds the results into
//! one answer.
//!
//! The crate is organized around a staged pipeline: a request is decomposed
//! into sub-queries with content-stable ids, each sub-query is generated
//! against retrieved schema context, gated for read-only safety, and
//! executed through a capability-dispatched adapter, with a bounded refine
//! loop around retryable failures. [`Orchestrator`] wires the pieces
//! together for embedding callers.

pub mod context;
pub mod engine;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod retrieval;

use std::sync::Arc;

use tracing::info;

use crate::context::RequestContext;
use crate::engine::adapters::{MySqlAdapter, PostgresAdapter, SqlServerAdapter, SqliteAdapter};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::AdapterRegistry;
use crate::engine::traits::DatasourceAdapter;
use crate::engine::types::AdapterProfile;
use crate::llm::LanguageModel;
use crate::pipeline::{
    ExecutorRegistry, ExecutorService, PipelineConfig, PipelineController, PipelineResponse,
    SqlExecutor,
};
use crate::retrieval::AdapterSchemaRetriever;

/// Assembles adapters, executors, retrieval, and the language model into a
/// ready-to-run pipeline.
#[derive(Default)]
pub struct OrchestratorBuilder {
    adapters: AdapterRegistry,
    extra_executors: Vec<Arc<dyn ExecutorService>>,
    llm: Option<Arc<dyn LanguageModel>>,
    config: PipelineConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Constructs the adapter named by the profile's backend, connects it,
    /// and registers it under the profile id.
    pub async fn register(&mut self, profile: AdapterProfile) -> EngineResult<()> {
        let adapter: Arc<dyn DatasourceAdapter> = match profile.config.backend.as_str() {
            "sqlite" => Arc::new(SqliteAdapter::new(&profile.id)),
            "postgres" => Arc::new(PostgresAdapter::new(&profile.id)),
            "mysql" => Arc::new(MySqlAdapter::new(&profile.id)),
            "mssql" => Arc::new(SqlServerAdapter::new(&profile.id)),
            other => {
                return Err(EngineError::not_supported(format!(
                    "unknown backend '{other}'"
                )))
            }
        };
        adapter.connect(&profile.config).await?;
        info!(datasource_id = %profile.id, backend = %profile.config.backend, "datasource registered");
        self.adapters.register(profile, adapter);
        Ok(())
    }

    /// Registers an already-constructed adapter. The caller is responsible
    /// for having connected it.
    pub fn register_adapter(
        &mut self,
        profile: AdapterProfile,
        adapter: Arc<dyn DatasourceAdapter>,
    ) {
        self.adapters.register(profile, adapter);
    }

    /// Adds an executor besides the default SQL one.
    pub fn register_executor(&mut self, executor: Arc<dyn ExecutorService>) {
        self.extra_executors.push(executor);
    }

    pub fn build(self) -> Orchestrator {
        let adapters = Arc::new(self.adapters);

        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(SqlExecutor::new(adapters.clone(), &self.config)));
        for executor in self.extra_executors {
            executors.register(executor);
        }

        let retriever = Arc::new(AdapterSchemaRetriever::new(adapters.clone()));
        let controller = PipelineController::new(
            adapters.clone(),
            Arc::new(executors),
            retriever,
            self.llm,
            self.config,
        );

        Orchestrator {
            adapters,
            controller,
        }
    }
}

/// The embedding surface: ask questions, get structured responses.
pub struct Orchestrator {
    adapters: Arc<AdapterRegistry>,
    controller: PipelineController,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Runs one question through the pipeline under a fresh request context.
    pub async fn ask(
        &self,
        tenant_id: &str,
        question: &str,
        target_datasource_id: Option<String>,
    ) -> PipelineResponse {
        let ctx = RequestContext::new(tenant_id);
        self.ask_with_context(&ctx, question, target_datasource_id)
            .await
    }

    /// Same as [`ask`](Self::ask) but under a caller-owned context, so the
    /// caller can cancel or correlate by trace id.
    pub async fn ask_with_context(
        &self,
        ctx: &RequestContext,
        question: &str,
        target_datasource_id: Option<String>,
    ) -> PipelineResponse {
        self.controller.run(ctx, question, target_datasource_id).await
    }

    pub fn datasource_ids(&self) -> Vec<&str> {
        self.adapters.list()
    }

    /// Disconnects every registered adapter.
    pub async fn shutdown(&self) {
        for id in self.adapters.list() {
            if let Some(adapter) = self.adapters.get(id) {
                if let Err(e) = adapter.disconnect().await {
                    tracing::warn!(datasource_id = %id, error = %e, "disconnect failed");
                }
            }
        }
    }
}
