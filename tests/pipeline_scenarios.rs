// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline behavior against scripted adapters and a scripted
//! language model.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use queryloom::context::RequestContext;
use queryloom::engine::conformance::{connected_mock, MockAdapter};
use queryloom::engine::error::EngineError;
use queryloom::engine::registry::AdapterRegistry;
use queryloom::engine::traits::DatasourceAdapter;
use queryloom::engine::types::{AdapterProfile, ConnectionConfig, Value};
use queryloom::llm::{LanguageModel, ScriptedModel, Stage};
use queryloom::pipeline::{ErrorCode, ExecutorRegistry, PipelineConfig, PipelineController};
use queryloom::retrieval::AdapterSchemaRetriever;
use queryloom::{Orchestrator, OrchestratorBuilder};

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

fn generation(sql: &str) -> serde_json::Value {
    json!({ "reasoning": "straightforward lookup", "sql": sql })
}

async fn orchestrator_with(
    adapters: Vec<Arc<MockAdapter>>,
    model: Option<Arc<ScriptedModel>>,
) -> Orchestrator {
    let mut builder = OrchestratorBuilder::new();
    for adapter in adapters {
        let profile = AdapterProfile::new(adapter.adapter_id(), mock_config());
        builder.register_adapter(profile, adapter);
    }
    if let Some(model) = model {
        builder = builder.with_language_model(model);
    }
    builder.build()
}

// Scenario: one datasource, clean run end to end.
#[tokio::test]
async fn single_datasource_happy_path() {
    let adapter = connected_mock("warehouse").await;
    adapter.set_result(MockAdapter::single_row_result("n", Value::Int(42)));
    adapter.set_schema(MockAdapter::sample_schema());

    let model = Arc::new(ScriptedModel::new());
    model.push_json(Stage::Generate, generation("SELECT count(*) AS n FROM users"));
    model.push_json(Stage::Synthesize, json!({ "final_answer": "There are 42 users." }));

    let orchestrator = orchestrator_with(vec![adapter.clone()], Some(model)).await;
    let response = orchestrator.ask("acme", "how many users do we have?", None).await;

    assert_eq!(response.sql.as_deref(), Some("SELECT count(*) AS n FROM users"));
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].result.row_count, 1);
    assert!(response.errors.is_empty(), "errors: {:?}", response.errors);
    assert_eq!(response.final_answer.as_deref(), Some("There are 42 users."));
    assert_eq!(adapter.execute_calls(), 1);
}

// Scenario: two datasources, one transient backend failure retried through
// the refine loop.
#[tokio::test]
async fn federated_query_retries_transient_failure() {
    let warehouse = connected_mock("warehouse").await;
    warehouse.set_result(MockAdapter::single_row_result("revenue", Value::Float(9000.5)));
    let crm = connected_mock("crm").await;
    crm.set_result(MockAdapter::single_row_result("customers", Value::Int(310)));
    crm.push_execute_error(EngineError::execution_error("connection reset"));

    let model = Arc::new(ScriptedModel::new());
    model.push_json(
        Stage::Route,
        json!({
            "routes": [
                { "datasource_id": "warehouse", "intent": "total revenue" },
                { "datasource_id": "crm", "intent": "active customer count" }
            ],
            "reasoning": "revenue is in the warehouse, customers in the crm"
        }),
    );
    model.push_json(Stage::Generate, generation("SELECT 1"));
    model.push_json(Stage::Refine, generation("SELECT 1"));
    model.push_json(Stage::Synthesize, json!({ "final_answer": "Revenue 9000.5 across 310 customers." }));

    let orchestrator =
        orchestrator_with(vec![warehouse.clone(), crm.clone()], Some(model)).await;
    let response = orchestrator
        .ask("acme", "revenue per active customer", None)
        .await;

    assert_eq!(response.results.len(), 2);
    assert!(response.errors.is_empty(), "errors: {:?}", response.errors);
    assert_ne!(
        response.results[0].sub_query_id,
        response.results[1].sub_query_id
    );
    // The flaky adapter was retried exactly once.
    assert_eq!(crm.execute_calls(), 2);
    assert_eq!(warehouse.execute_calls(), 1);
    // Multi-sub-query responses never claim a single SQL statement.
    assert!(response.sql.is_none());
}

// Scenario: generated SQL is a mutation. The gate rejects it before the
// adapter sees anything, and no refine attempt is made.
#[tokio::test]
async fn security_gate_blocks_mutations_without_execution() {
    let adapter = connected_mock("warehouse").await;

    let model = Arc::new(ScriptedModel::new());
    model.push_json(Stage::Generate, generation("DROP TABLE users"));

    let orchestrator = orchestrator_with(vec![adapter.clone()], Some(model.clone())).await;
    let response = orchestrator.ask("acme", "clean up the users table", None).await;

    assert!(response.sql.is_none());
    assert!(response.results.is_empty());
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].code, ErrorCode::SecurityViolation);
    assert_eq!(adapter.execute_calls(), 0);
    // A violation is fatal for the sub-query: no refine call happened.
    assert_eq!(model.call_count(Stage::Refine), 0);
}

// A security violation invalidates the whole generated plan: sibling
// sub-queries still waiting for a worker slot settle as cancelled instead
// of executing.
#[tokio::test]
async fn security_violation_cancels_pending_siblings() {
    let crm = connected_mock("crm").await;
    let warehouse = connected_mock("warehouse").await;
    warehouse.set_result(MockAdapter::single_row_result("n", Value::Int(1)));

    let model = Arc::new(ScriptedModel::new());
    model.push_json(
        Stage::Route,
        json!({
            "routes": [
                { "datasource_id": "crm", "intent": "purge inactive accounts" },
                { "datasource_id": "warehouse", "intent": "count users" }
            ],
            "reasoning": "split"
        }),
    );
    model.push_json(Stage::Generate, generation("DROP TABLE accounts"));

    // One worker slot, so the violating sub-query settles before its
    // sibling gets to run.
    let mut config = PipelineConfig::default();
    config.max_concurrency = 1;
    let mut builder = OrchestratorBuilder::new();
    for adapter in [crm.clone(), warehouse.clone()] {
        let profile = AdapterProfile::new(adapter.adapter_id(), mock_config());
        builder.register_adapter(profile, adapter);
    }
    let orchestrator = builder
        .with_language_model(model.clone())
        .with_config(config)
        .build();

    let response = orchestrator.ask("acme", "purge and count", None).await;

    assert!(response
        .errors
        .iter()
        .any(|e| e.code == ErrorCode::SecurityViolation));
    assert!(response
        .errors
        .iter()
        .any(|e| e.code == ErrorCode::Cancelled));
    assert!(response.results.is_empty());
    // Neither backend ever saw a statement.
    assert_eq!(crm.execute_calls(), 0);
    assert_eq!(warehouse.execute_calls(), 0);
    // The cancelled sibling never reached generation.
    assert_eq!(model.call_count(Stage::Generate), 1);
}

// A model timeout during generation is retryable: the refine loop recovers
// and the failure only survives as a warning.
#[tokio::test]
async fn model_timeout_is_refined_and_recovered() {
    let adapter = connected_mock("warehouse").await;
    adapter.set_result(MockAdapter::single_row_result("n", Value::Int(3)));

    let model = Arc::new(ScriptedModel::new());
    model.push_timeout(Stage::Generate, 30_000);
    model.push_json(Stage::Refine, generation("SELECT count(*) AS n FROM users"));
    model.push_json(Stage::Synthesize, json!({ "final_answer": "3 users." }));

    let orchestrator = orchestrator_with(vec![adapter.clone()], Some(model.clone())).await;
    let response = orchestrator.ask("acme", "how many users?", None).await;

    assert!(response.errors.is_empty(), "errors: {:?}", response.errors);
    assert_eq!(response.results.len(), 1);
    assert!(!response.warnings.is_empty());
    assert_eq!(model.call_count(Stage::Generate), 1);
    assert_eq!(model.call_count(Stage::Refine), 1);
    assert_eq!(adapter.execute_calls(), 1);
    // The refine prompt names the failure it is correcting.
    let calls = model.calls();
    let (_, refine_prompt) = calls
        .iter()
        .find(|(stage, _)| *stage == Stage::Refine)
        .unwrap();
    assert!(refine_prompt.contains("SQL_GEN_FAILED"));
}

// A provider failure during synthesis costs the prose answer, never the
// data already fetched.
#[tokio::test]
async fn synthesis_provider_error_degrades_to_warning() {
    let adapter = connected_mock("warehouse").await;
    adapter.set_result(MockAdapter::single_row_result("n", Value::Int(7)));

    let model = Arc::new(ScriptedModel::new());
    model.push_json(Stage::Generate, generation("SELECT count(*) AS n FROM users"));
    model.push_provider_error(Stage::Synthesize, "rate limited");

    let orchestrator = orchestrator_with(vec![adapter], Some(model)).await;
    let response = orchestrator.ask("acme", "how many users?", None).await;

    assert!(response.errors.is_empty(), "errors: {:?}", response.errors);
    assert_eq!(response.results.len(), 1);
    assert!(response.final_answer.is_none());
    assert!(response
        .warnings
        .iter()
        .any(|w| w.contains("rate limited")));
}

// Scenario: no language model registered. The request fails before any
// adapter is touched.
#[tokio::test]
async fn missing_model_fails_before_any_adapter_call() {
    let adapter = connected_mock("warehouse").await;

    let orchestrator = orchestrator_with(vec![adapter.clone()], None).await;
    let response = orchestrator.ask("acme", "how many users?", None).await;

    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].code, ErrorCode::MissingLlm);
    assert!(response.results.is_empty());
    assert_eq!(adapter.execute_calls(), 0);
}

// Identical requests produce identical sub-query ids across runs.
#[tokio::test]
async fn sub_query_ids_are_reproducible() {
    let adapter = connected_mock("warehouse").await;
    adapter.set_result(MockAdapter::single_row_result("n", Value::Int(1)));

    let model = Arc::new(ScriptedModel::new());
    model.push_json(Stage::Generate, generation("SELECT 1"));
    model.push_json(Stage::Synthesize, json!({ "final_answer": "1" }));

    let orchestrator = orchestrator_with(vec![adapter], Some(model)).await;
    let first = orchestrator.ask("acme", "how many users?", None).await;
    let second = orchestrator.ask("acme", "how many users?", None).await;

    assert_eq!(
        first.results[0].sub_query_id,
        second.results[0].sub_query_id
    );
    // Trace ids stay per-request even when the work is identical.
    assert_ne!(first.trace_id, second.trace_id);
}

// Retry budget: a persistently failing backend escalates after the
// configured number of refine attempts.
#[tokio::test]
async fn refine_budget_escalates_to_fatal() {
    let adapter = connected_mock("warehouse").await;
    for _ in 0..3 {
        adapter.push_execute_error(EngineError::execution_error("still down"));
    }

    let model = Arc::new(ScriptedModel::new());
    model.push_json(Stage::Generate, generation("SELECT 1"));
    model.push_json(Stage::Refine, generation("SELECT 1"));

    let orchestrator = orchestrator_with(vec![adapter.clone()], Some(model.clone())).await;
    let response = orchestrator.ask("acme", "how many users?", None).await;

    // Default budget is 2 refine attempts: 3 executions total.
    assert_eq!(adapter.execute_calls(), 3);
    assert_eq!(model.call_count(Stage::Generate), 1);
    assert_eq!(model.call_count(Stage::Refine), 2);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].code, ErrorCode::DbExecutionError);
    assert!(response.results.is_empty());
}

// Independent sub-queries run concurrently: total latency approaches the
// slowest adapter, not the sum.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_is_concurrent_across_datasources() {
    let slow_a = connected_mock("a").await;
    slow_a.set_result(MockAdapter::single_row_result("x", Value::Int(1)));
    slow_a.set_execute_delay(Duration::from_millis(300));
    let slow_b = connected_mock("b").await;
    slow_b.set_result(MockAdapter::single_row_result("y", Value::Int(2)));
    slow_b.set_execute_delay(Duration::from_millis(300));

    let model = Arc::new(ScriptedModel::new());
    model.push_json(
        Stage::Route,
        json!({
            "routes": [
                { "datasource_id": "a", "intent": "x" },
                { "datasource_id": "b", "intent": "y" }
            ],
            "reasoning": "one per source"
        }),
    );
    model.push_json(Stage::Generate, generation("SELECT 1"));
    model.push_json(Stage::Synthesize, json!({ "final_answer": "done" }));

    let orchestrator = orchestrator_with(vec![slow_a, slow_b], Some(model)).await;

    let started = std::time::Instant::now();
    let response = orchestrator.ask("acme", "x and y", None).await;
    let elapsed = started.elapsed();

    assert_eq!(response.results.len(), 2);
    assert!(
        elapsed < Duration::from_millis(550),
        "fan-out took {elapsed:?}, expected parallel execution"
    );
}

// Cancellation before dispatch settles every sub-query as failed with the
// cancellation code.
#[tokio::test]
async fn cancellation_surfaces_cancelled_errors() {
    let adapter = connected_mock("warehouse").await;

    let model = Arc::new(ScriptedModel::new());
    model.push_json(Stage::Generate, generation("SELECT 1"));

    let orchestrator = orchestrator_with(vec![adapter.clone()], Some(model)).await;

    let ctx = RequestContext::new("acme");
    ctx.cancel();
    let response = orchestrator
        .ask_with_context(&ctx, "how many users?", None)
        .await;

    assert_eq!(response.trace_id, ctx.trace_id);
    assert!(response
        .errors
        .iter()
        .any(|e| e.code == ErrorCode::Cancelled));
    assert_eq!(adapter.execute_calls(), 0);
}

// An empty executor registry is not an error until a sub-query needs one.
#[tokio::test]
async fn missing_executor_is_reported_per_sub_query() {
    let adapter = connected_mock("warehouse").await;
    let mut adapters = AdapterRegistry::new();
    adapters.register(AdapterProfile::new("warehouse", mock_config()), adapter);
    let adapters = Arc::new(adapters);

    let model = Arc::new(ScriptedModel::new());
    model.push_json(Stage::Generate, generation("SELECT 1"));
    let llm: Arc<dyn LanguageModel> = model;

    let controller = PipelineController::new(
        adapters.clone(),
        Arc::new(ExecutorRegistry::new()),
        Arc::new(AdapterSchemaRetriever::new(adapters)),
        Some(llm),
        PipelineConfig::default(),
    );

    let ctx = RequestContext::new("acme");
    let response = controller.run(&ctx, "how many users?", None).await;

    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].code, ErrorCode::MissingExecutor);
}

// Aggregation keeps partial results when a sibling fails fatally.
#[tokio::test]
async fn partial_failure_keeps_sibling_results() {
    let healthy = connected_mock("warehouse").await;
    healthy.set_result(MockAdapter::single_row_result("n", Value::Int(7)));
    let broken = connected_mock("crm").await;
    for _ in 0..3 {
        broken.push_execute_error(EngineError::execution_error("down"));
    }

    let model = Arc::new(ScriptedModel::new());
    model.push_json(
        Stage::Route,
        json!({
            "routes": [
                { "datasource_id": "warehouse", "intent": "n" },
                { "datasource_id": "crm", "intent": "m" }
            ],
            "reasoning": "split"
        }),
    );
    model.push_json(Stage::Generate, generation("SELECT 1"));
    model.push_json(Stage::Refine, generation("SELECT 1"));
    model.push_json(Stage::Synthesize, json!({ "final_answer": "partial" }));

    let orchestrator = orchestrator_with(vec![healthy, broken], Some(model)).await;
    let response = orchestrator.ask("acme", "n and m", None).await;

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].datasource_id, "warehouse");
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].code, ErrorCode::DbExecutionError);
    // The surviving result still gets a synthesized answer.
    assert_eq!(response.final_answer.as_deref(), Some("partial"));
}
