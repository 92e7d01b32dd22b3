// SPDX-License-Identifier: Apache-2.0

//! Tracing output for a full request: every stage gets its own span, tagged
//! with the sub-query id, and all records land in the rolling JSON log.

use std::fs;
use std::sync::Arc;

use serde_json::json;

use queryloom::engine::conformance::{connected_mock, MockAdapter};
use queryloom::engine::traits::DatasourceAdapter;
use queryloom::engine::types::{AdapterProfile, ConnectionConfig, Value};
use queryloom::llm::{ScriptedModel, Stage};
use queryloom::observability::init_tracing_in;
use queryloom::OrchestratorBuilder;

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

#[tokio::test]
async fn request_logs_carry_a_span_per_stage() {
    let dir = tempfile::tempdir().unwrap();
    init_tracing_in(dir.path());

    let adapter = connected_mock("warehouse").await;
    adapter.set_result(MockAdapter::single_row_result("n", Value::Int(42)));
    adapter.set_schema(MockAdapter::sample_schema());

    let model = Arc::new(ScriptedModel::new());
    model.push_json(
        Stage::Generate,
        json!({ "reasoning": "count", "sql": "SELECT count(*) AS n FROM users" }),
    );
    model.push_json(Stage::Synthesize, json!({ "final_answer": "42 users." }));

    let mut builder = OrchestratorBuilder::new();
    builder.register_adapter(
        AdapterProfile::new(adapter.adapter_id(), mock_config()),
        adapter,
    );
    let orchestrator = builder.with_language_model(model).build();

    let response = orchestrator.ask("acme", "how many users?", None).await;
    assert!(response.errors.is_empty(), "errors: {:?}", response.errors);

    let mut content = String::new();
    for entry in fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        content.push_str(&fs::read_to_string(&path).unwrap());
    }
    assert!(!content.is_empty(), "no log records written");

    // Request correlation shows up in the records.
    assert!(content.contains(&response.trace_id));
    assert!(content.contains("tenant_id"));

    // One span per stage invocation, named for the stage.
    for span in [
        "pipeline",
        "decompose",
        "sub_query",
        "retrieve",
        "generate",
        "security_gate",
        "execute",
    ] {
        assert!(
            content.contains(&format!("\"name\":\"{span}\"")),
            "missing span '{span}' in log output"
        );
    }
    // Stage spans are tagged with the sub-query they serve.
    assert!(content.contains("sub_query_id"));
}
