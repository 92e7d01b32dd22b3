// SPDX-License-Identifier: Apache-2.0

//! Decomposition: fans a request into independently schedulable sub-queries.
//!
//! Sub-query ids are content hashes over a canonical encoding of the
//! decomposition payload, so the same request against the same datasource
//! always produces the same id — across processes, time, and call order.

use std::sync::Arc;

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::error::{ErrorCode, PipelineError};
use super::state::{PipelineState, StageUpdate, SubQuery, SubQueryStatus};
use crate::engine::registry::AdapterRegistry;
use crate::llm::{parse_structured, LanguageModel, RoutingResponse, Stage};

const ID_PREFIX: &str = "subq";
const ID_HEX_LEN: usize = 16;

/// Hashes `(prefix, payload)` into a short stable identifier.
///
/// The payload is re-encoded with map keys sorted at every level before
/// hashing; callers must not include volatile fields (timestamps, random
/// ids) in it.
pub fn stable_id(prefix: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b"\x00");
    hasher.update(canonical_encoding(payload).as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(ID_HEX_LEN);
    for byte in digest.iter().take(ID_HEX_LEN / 2) {
        let _ = std::fmt::Write::write_fmt(&mut hex, format_args!("{byte:02x}"));
    }
    hex
}

fn canonical_encoding(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_encoding(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let encoded: Vec<String> = items.iter().map(canonical_encoding).collect();
            format!("[{}]", encoded.join(","))
        }
        other => other.to_string(),
    }
}

fn sub_query_for(parent: &str, datasource_id: &str, intent: &str, filters: &[String]) -> SubQuery {
    // Filters are a set: sorted before hashing so their order never changes
    // the id. The parent trace id is volatile and stays out of the payload.
    let mut sorted_filters = filters.to_vec();
    sorted_filters.sort();
    let payload = json!({
        "datasource_id": datasource_id,
        "intent": intent,
        "filters": sorted_filters,
    });
    SubQuery {
        id: stable_id(ID_PREFIX, &payload),
        parent: parent.to_string(),
        datasource_id: datasource_id.to_string(),
        intent: intent.to_string(),
        filters: filters.to_vec(),
        sql: None,
        status: SubQueryStatus::Pending,
    }
}

/// Produces the sub-query plan for a request.
///
/// An explicit target datasource always wins. With exactly one registered
/// adapter the choice is forced. Otherwise routing needs the language
/// model; without one the request fails before any adapter is touched.
#[instrument(name = "decompose", skip_all, fields(trace_id = %state.trace_id))]
pub async fn decompose(
    state: &PipelineState,
    adapters: &Arc<AdapterRegistry>,
    llm: Option<&Arc<dyn LanguageModel>>,
) -> StageUpdate {
    let mut update = StageUpdate::default();

    if let Some(ref target) = state.target_datasource_id {
        if adapters.get(target).is_none() {
            update.errors.push(PipelineError::new(
                "decompose",
                ErrorCode::MissingDatasourceId,
                format!("target datasource '{target}' is not registered"),
            ));
            return update;
        }
        let sq = sub_query_for(&state.trace_id, target, &state.question, &[]);
        update.annotate("decompose", Some(&sq.id), format!("explicit target {target}"));
        update.new_sub_queries.push(sq);
        return update;
    }

    let registered = adapters.list();
    match registered.as_slice() {
        [] => {
            update.errors.push(PipelineError::new(
                "decompose",
                ErrorCode::MissingDatasourceId,
                "no datasources registered and none targeted",
            ));
            update
        }
        [only] => {
            let sq = sub_query_for(&state.trace_id, only, &state.question, &[]);
            update.annotate("decompose", Some(&sq.id), format!("sole datasource {only}"));
            update.new_sub_queries.push(sq);
            update
        }
        many => route_across(state, many, llm, update).await,
    }
}

/// Multi-datasource requests go through the routing stage.
async fn route_across(
    state: &PipelineState,
    datasource_ids: &[&str],
    llm: Option<&Arc<dyn LanguageModel>>,
    mut update: StageUpdate,
) -> StageUpdate {
    let Some(llm) = llm else {
        update.errors.push(PipelineError::new(
            "decompose",
            ErrorCode::MissingLlm,
            "routing across multiple datasources requires a language model",
        ));
        return update;
    };

    let system_prompt = "You route analytical questions to datasources. \
        Reply with JSON: {\"routes\": [{\"datasource_id\": \"...\", \"intent\": \"...\"}], \
        \"reasoning\": \"...\"}. Only use the listed datasource ids.";
    let user_prompt = format!(
        "Datasources: {}\nQuestion: {}",
        datasource_ids.join(", "),
        state.question
    );

    let raw = match llm.complete(Stage::Route, system_prompt, &user_prompt).await {
        Ok(raw) => raw,
        Err(e) => {
            update.errors.push(PipelineError::new(
                "decompose",
                ErrorCode::PlanningFailure,
                format!("routing failed: {e}"),
            ));
            return update;
        }
    };

    let routing: RoutingResponse = match parse_structured(&raw) {
        Ok(r) => r,
        Err(e) => {
            update.errors.push(PipelineError::new(
                "decompose",
                ErrorCode::PlanningFailure,
                format!("unusable routing decision: {e}"),
            ));
            return update;
        }
    };

    if routing.routes.is_empty() {
        update.errors.push(PipelineError::new(
            "decompose",
            ErrorCode::MissingPlan,
            "routing produced no sub-queries",
        ));
        return update;
    }

    for route in routing.routes {
        if !datasource_ids.iter().any(|id| *id == route.datasource_id) {
            update.errors.push(PipelineError::new(
                "decompose",
                ErrorCode::MissingDatasourceId,
                format!("routed to unknown datasource '{}'", route.datasource_id),
            ));
            continue;
        }
        let sq = sub_query_for(
            &state.trace_id,
            &route.datasource_id,
            &route.intent,
            &route.filters,
        );
        debug!(sub_query_id = %sq.id, datasource_id = %sq.datasource_id, "routed sub-query");
        update.new_sub_queries.push(sq);
    }
    if !routing.reasoning.is_empty() {
        update.annotate("decompose", None, routing.reasoning);
    }
    update
}
