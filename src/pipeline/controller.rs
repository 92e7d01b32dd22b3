// SPDX-License-Identifier: Apache-2.0

//! Pipeline controller.
//!
//! Sequences Decompose → (per sub-query: Retrieve → Generate → SecurityGate
//! → Execute, with a bounded Refine loop) → Aggregate. Sub-queries run
//! concurrently up to a bounded worker pool; each stage contributes a
//! [`StageUpdate`] that the controller merges, so partial failures never
//! clobber sibling progress.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, info_span, instrument, warn, Instrument};

use super::config::PipelineConfig;
use super::decompose;
use super::error::{ErrorCode, PipelineError};
use super::executor::ExecutorRegistry;
use super::gate;
use super::state::{
    PipelineResponse, PipelineState, StageUpdate, SubQuery, SubQueryResult, SubQueryStatus,
};
use crate::context::RequestContext;
use crate::engine::registry::AdapterRegistry;
use crate::llm::{
    parse_structured, DeadlineModel, GenerationResponse, LanguageModel, Stage, SynthesisResponse,
};
use crate::retrieval::{SchemaCandidate, SchemaRetriever};
use crate::engine::types::Capability;

pub struct PipelineController {
    adapters: Arc<AdapterRegistry>,
    executors: Arc<ExecutorRegistry>,
    retriever: Arc<dyn SchemaRetriever>,
    llm: Option<Arc<dyn LanguageModel>>,
    config: PipelineConfig,
}

impl PipelineController {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        executors: Arc<ExecutorRegistry>,
        retriever: Arc<dyn SchemaRetriever>,
        llm: Option<Arc<dyn LanguageModel>>,
        config: PipelineConfig,
    ) -> Self {
        // Every model call in the pipeline runs under the configured
        // deadline, whatever client the caller handed in.
        let llm = llm.map(|inner| {
            Arc::new(DeadlineModel::new(inner, config.llm_timeout_ms)) as Arc<dyn LanguageModel>
        });
        Self {
            adapters,
            executors,
            retriever,
            llm,
            config,
        }
    }

    /// Runs one request through the full pipeline. Expected failures come
    /// back inside the response's error list, never as an `Err`.
    #[instrument(
        name = "pipeline",
        skip_all,
        fields(trace_id = %ctx.trace_id, tenant_id = %ctx.tenant_id)
    )]
    pub async fn run(
        &self,
        ctx: &RequestContext,
        question: &str,
        target_datasource_id: Option<String>,
    ) -> PipelineResponse {
        let mut state = PipelineState::new(
            ctx.trace_id.clone(),
            ctx.tenant_id.clone(),
            question,
            target_datasource_id,
        );

        // Generation cannot proceed without a model, and nothing before
        // generation is worth an adapter round-trip.
        let Some(ref llm) = self.llm else {
            state.errors.push(PipelineError::new(
                "pipeline",
                ErrorCode::MissingLlm,
                "no language model service registered",
            ));
            state.terminal = true;
            return PipelineResponse::from_state(state, None);
        };

        let update = decompose::decompose(&state, &self.adapters, Some(llm)).await;
        state.merge(update);

        if state.sub_queries.is_empty() {
            state.terminal = true;
            return PipelineResponse::from_state(state, None);
        }

        self.fan_out(ctx, &mut state, llm.clone()).await;
        state.terminal = state.all_settled();

        let final_answer = self.aggregate(&mut state, llm).await;
        PipelineResponse::from_state(state, final_answer)
    }

    /// Dispatches all pending sub-queries concurrently, bounded by the
    /// number of distinct datasources involved (capped by config).
    async fn fan_out(
        &self,
        ctx: &RequestContext,
        state: &mut PipelineState,
        llm: Arc<dyn LanguageModel>,
    ) {
        let distinct: HashSet<&str> = state
            .sub_queries
            .iter()
            .map(|sq| sq.datasource_id.as_str())
            .collect();
        let permits = distinct.len().min(self.config.max_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        let worker = SubQueryWorker {
            executors: self.executors.clone(),
            retriever: self.retriever.clone(),
            llm,
            max_refine_attempts: self.config.max_refine_attempts,
        };

        let mut handles = Vec::with_capacity(state.sub_queries.len());
        for sub_query in state.sub_queries.clone() {
            let worker = worker.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let span = info_span!(
                "sub_query",
                trace_id = %ctx.trace_id,
                sub_query_id = %sub_query.id
            );
            let id = sub_query.id.clone();
            let handle = tokio::spawn(
                async move {
                    // The semaphore is never closed, so acquisition only
                    // fails if the pool itself is torn down mid-request.
                    let _permit = semaphore.acquire_owned().await.ok();
                    worker.process(&ctx, sub_query).await
                }
                .instrument(span),
            );
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            match handle.await {
                Ok(update) => state.merge(update),
                Err(e) => {
                    // Task panic or abort. Never retried.
                    let mut update = StageUpdate::default();
                    update.errors.push(
                        PipelineError::new(
                            "execute",
                            ErrorCode::ExecutorCrash,
                            format!("sub-query task crashed: {e}"),
                        )
                        .with_stack(),
                    );
                    update.status_changes.push((id, SubQueryStatus::Failed));
                    state.merge(update);
                }
            }
        }
    }

    /// Folds settled sub-queries into a final answer. Errors already
    /// recorded are surfaced untouched; synthesis failure only costs the
    /// prose answer, never the data.
    async fn aggregate(
        &self,
        state: &mut PipelineState,
        llm: &Arc<dyn LanguageModel>,
    ) -> Option<String> {
        if state.results.is_empty() {
            return None;
        }

        let summary: Vec<serde_json::Value> = state
            .results
            .iter()
            .map(|r| {
                json!({
                    "datasource_id": r.datasource_id,
                    "sql": r.sql,
                    "columns": r.result.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                    "rows": r.result.rows.iter().take(50).collect::<Vec<_>>(),
                    "row_count": r.result.row_count,
                })
            })
            .collect();

        let system_prompt = "You summarize query results into a direct answer. \
            Reply with JSON: {\"final_answer\": \"...\"}.";
        let user_prompt = format!(
            "Question: {}\nResults: {}",
            state.question,
            serde_json::Value::Array(summary)
        );

        let raw = match llm
            .complete(Stage::Synthesize, system_prompt, &user_prompt)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "synthesis failed, returning results without prose");
                state
                    .warnings
                    .push(format!("answer synthesis failed: {e}"));
                return None;
            }
        };

        match parse_structured::<SynthesisResponse>(&raw) {
            Ok(synthesis) => Some(synthesis.final_answer),
            Err(e) => {
                state
                    .warnings
                    .push(format!("unusable synthesis response: {e}"));
                None
            }
        }
    }
}

/// Everything one sub-query task needs, cheap to clone into the task.
#[derive(Clone)]
struct SubQueryWorker {
    executors: Arc<ExecutorRegistry>,
    retriever: Arc<dyn SchemaRetriever>,
    llm: Arc<dyn LanguageModel>,
    max_refine_attempts: u32,
}

impl SubQueryWorker {
    /// Retrieve → Generate → SecurityGate → Execute for one sub-query,
    /// looping through Refine on retryable failures up to the budget.
    async fn process(&self, ctx: &RequestContext, sub_query: SubQuery) -> StageUpdate {
        let mut update = StageUpdate::default();

        let Some(executor) = self.executors.resolve(&[Capability::SqlExecution]) else {
            update.errors.push(PipelineError::new(
                "execute",
                ErrorCode::MissingExecutor,
                "no executor registered for sql_execution",
            ));
            update
                .status_changes
                .push((sub_query.id.clone(), SubQueryStatus::Failed));
            return update;
        };

        let mut last_failure: Option<PipelineError> = None;
        for attempt in 0..=self.max_refine_attempts {
            if ctx.is_cancelled() {
                self.fail(
                    ctx,
                    &mut update,
                    &sub_query,
                    PipelineError::new(
                        "pipeline",
                        ErrorCode::Cancelled,
                        "request cancelled before execution",
                    ),
                );
                return update;
            }

            match self
                .attempt(ctx, &sub_query, &executor, attempt, last_failure.take())
                .await
            {
                Ok(AttemptOutcome { sql, result, warnings }) => {
                    update
                        .sql_assignments
                        .push((sub_query.id.clone(), sql.clone()));
                    update.results.push(result);
                    update.warnings.extend(warnings);
                    update
                        .status_changes
                        .push((sub_query.id.clone(), SubQueryStatus::Succeeded));
                    if attempt > 0 {
                        update.annotate(
                            "refine",
                            Some(&sub_query.id),
                            format!("succeeded on attempt {}", attempt + 1),
                        );
                    }
                    return update;
                }
                Err(error) => {
                    if error.is_retryable() && attempt < self.max_refine_attempts {
                        info!(
                            sub_query_id = %sub_query.id,
                            code = error.code.as_str(),
                            attempt,
                            "retryable failure, entering refine loop"
                        );
                        update.warnings.push(format!(
                            "sub-query {} attempt {} failed ({}), refining",
                            sub_query.id,
                            attempt + 1,
                            error.code.as_str()
                        ));
                        last_failure = Some(error);
                        continue;
                    }
                    // Budget exhausted or the code was never retryable.
                    self.fail(ctx, &mut update, &sub_query, error);
                    return update;
                }
            }
        }

        // Loop always returns; the budget bound makes this unreachable.
        self.fail(
            ctx,
            &mut update,
            &sub_query,
            PipelineError::new("pipeline", ErrorCode::UnknownError, "refine loop fell through"),
        );
        update
    }

    async fn attempt(
        &self,
        ctx: &RequestContext,
        sub_query: &SubQuery,
        executor: &Arc<dyn super::executor::ExecutorService>,
        attempt: u32,
        previous_failure: Option<PipelineError>,
    ) -> Result<AttemptOutcome, PipelineError> {
        let candidates = self
            .retriever
            .retrieve(&sub_query.datasource_id, &sub_query.intent)
            .instrument(info_span!("retrieve", sub_query_id = %sub_query.id))
            .await
            .map_err(|e| {
                PipelineError::new(
                    "retrieve",
                    ErrorCode::SchemaRetrievalFailed,
                    format!("schema retrieval failed: {e}"),
                )
            })?;

        let sql = self
            .generate(sub_query, &candidates, attempt, previous_failure)
            .instrument(info_span!("generate", sub_query_id = %sub_query.id, attempt))
            .await?;

        // Gate violations are fatal for the sub-query and never refined.
        {
            let _gate = info_span!("security_gate", sub_query_id = %sub_query.id).entered();
            gate::enforce_read_only(&sql)?;
        }

        let outcome = executor
            .execute(ctx, sub_query, &sql)
            .instrument(info_span!("execute", sub_query_id = %sub_query.id))
            .await?;
        Ok(AttemptOutcome {
            result: SubQueryResult {
                sub_query_id: sub_query.id.clone(),
                datasource_id: sub_query.datasource_id.clone(),
                sql: sql.clone(),
                result: outcome.result,
            },
            sql,
            warnings: outcome.warnings,
        })
    }

    async fn generate(
        &self,
        sub_query: &SubQuery,
        candidates: &[SchemaCandidate],
        attempt: u32,
        previous_failure: Option<PipelineError>,
    ) -> Result<String, PipelineError> {
        let schema_context = if candidates.is_empty() {
            "No schema context available.".to_string()
        } else {
            candidates
                .iter()
                .map(SchemaCandidate::describe)
                .collect::<Vec<_>>()
                .join("\n")
        };

        let system_prompt = "You write a single read-only SQL SELECT statement. \
            Reply with JSON: {\"reasoning\": \"...\", \"sql\": \"...\"}. \
            Never write data, never emit more than one statement.";
        let mut user_prompt = format!(
            "Datasource: {}\nSchema:\n{}\nRequest: {}",
            sub_query.datasource_id, schema_context, sub_query.intent
        );
        let stage = if attempt == 0 {
            Stage::Generate
        } else {
            if let Some(failure) = previous_failure {
                user_prompt.push_str(&format!(
                    "\nThe previous attempt failed with {}: {}. Correct the statement.",
                    failure.code.as_str(),
                    failure.message
                ));
            }
            Stage::Refine
        };

        let raw = self
            .llm
            .complete(stage, system_prompt, &user_prompt)
            .await
            .map_err(|e| {
                PipelineError::new(
                    "generate",
                    ErrorCode::SqlGenFailed,
                    format!("generation failed: {e}"),
                )
            })?;

        let generation: GenerationResponse = parse_structured(&raw).map_err(|e| {
            PipelineError::new(
                "generate",
                ErrorCode::SqlGenFailed,
                format!("unusable generation response: {e}"),
            )
        })?;

        if generation.sql.trim().is_empty() {
            return Err(PipelineError::new(
                "generate",
                ErrorCode::SqlGenFailed,
                "model produced empty SQL",
            ));
        }
        Ok(generation.sql)
    }

    /// Settles a sub-query as failed. A request-wide code also cancels the
    /// request context, so pending siblings stop before touching a backend.
    fn fail(
        &self,
        ctx: &RequestContext,
        update: &mut StageUpdate,
        sub_query: &SubQuery,
        error: PipelineError,
    ) {
        warn!(
            sub_query_id = %sub_query.id,
            code = error.code.as_str(),
            "sub-query failed: {}",
            error.message
        );
        if error.code.is_request_wide() && !ctx.is_cancelled() {
            info!(
                sub_query_id = %sub_query.id,
                code = error.code.as_str(),
                "request-wide failure, cancelling sibling sub-queries"
            );
            ctx.cancel();
        }
        update.errors.push(error);
        update
            .status_changes
            .push((sub_query.id.clone(), SubQueryStatus::Failed));
    }
}

struct AttemptOutcome {
    sql: String,
    result: SubQueryResult,
    warnings: Vec<String>,
}
