// SPDX-License-Identifier: Apache-2.0

//! Pipeline state and the append-only update protocol.
//!
//! Stages never mutate shared state directly: each returns a [`StageUpdate`]
//! that the controller merges. Merging only appends, so no stage can rewrite
//! or drop what an earlier stage recorded.

use serde::{Deserialize, Serialize};

use super::error::PipelineError;
use crate::engine::types::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueryStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One independently schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuery {
    /// Content hash of the decomposition payload; stable across runs.
    pub id: String,
    /// Trace id of the request this sub-query was decomposed from.
    pub parent: String,
    pub datasource_id: String,
    /// What this sub-query should answer, in natural language.
    pub intent: String,
    /// Constraints the routing stage extracted for this sub-query, e.g.
    /// `region = 'EU'`. Part of the id payload, so different filters mean a
    /// different sub-query.
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub status: SubQueryStatus,
}

/// One entry in the reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAnnotation {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_query_id: Option<String>,
    pub note: String,
}

/// The executed outcome of one sub-query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQueryResult {
    pub sub_query_id: String,
    pub datasource_id: String,
    pub sql: String,
    pub result: QueryResult,
}

/// Accumulated request state. Owned by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub trace_id: String,
    pub tenant_id: String,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_datasource_id: Option<String>,
    pub sub_queries: Vec<SubQuery>,
    pub results: Vec<SubQueryResult>,
    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub reasoning: Vec<StageAnnotation>,
    pub terminal: bool,
}

impl PipelineState {
    pub fn new(
        trace_id: impl Into<String>,
        tenant_id: impl Into<String>,
        question: impl Into<String>,
        target_datasource_id: Option<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            tenant_id: tenant_id.into(),
            question: question.into(),
            target_datasource_id,
            sub_queries: Vec::new(),
            results: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            reasoning: Vec::new(),
            terminal: false,
        }
    }

    /// Folds a stage's partial update into the state.
    ///
    /// Everything appends. Status transitions are the one sanctioned
    /// in-place change, and only for sub-queries the update names.
    pub fn merge(&mut self, update: StageUpdate) {
        self.sub_queries.extend(update.new_sub_queries);
        for (id, status) in update.status_changes {
            if let Some(sq) = self.sub_queries.iter_mut().find(|sq| sq.id == id) {
                sq.status = status;
            }
        }
        for (id, sql) in update.sql_assignments {
            if let Some(sq) = self.sub_queries.iter_mut().find(|sq| sq.id == id) {
                sq.sql = Some(sql);
            }
        }
        self.results.extend(update.results);
        self.errors.extend(update.errors);
        self.warnings.extend(update.warnings);
        self.reasoning.extend(update.annotations);
    }

    /// Terminal once every sub-query has settled.
    pub fn all_settled(&self) -> bool {
        self.sub_queries
            .iter()
            .all(|sq| sq.status != SubQueryStatus::Pending)
    }
}

/// A stage's partial contribution, merged by the controller.
#[derive(Debug, Default)]
pub struct StageUpdate {
    pub new_sub_queries: Vec<SubQuery>,
    pub status_changes: Vec<(String, SubQueryStatus)>,
    pub sql_assignments: Vec<(String, String)>,
    pub results: Vec<SubQueryResult>,
    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub annotations: Vec<StageAnnotation>,
}

impl StageUpdate {
    pub fn annotate(
        &mut self,
        stage: &str,
        sub_query_id: Option<&str>,
        note: impl Into<String>,
    ) {
        self.annotations.push(StageAnnotation {
            stage: stage.to_string(),
            sub_query_id: sub_query_id.map(str::to_string),
            note: note.into(),
        });
    }
}

/// What the caller gets back, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    /// Generated SQL when exactly one sub-query ran; null otherwise.
    pub sql: Option<String>,
    pub results: Vec<SubQueryResult>,
    pub final_answer: Option<String>,
    pub errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub trace_id: String,
    pub reasoning: Vec<StageAnnotation>,
}

impl PipelineResponse {
    pub fn from_state(state: PipelineState, final_answer: Option<String>) -> Self {
        let sql = match state.sub_queries.as_slice() {
            [only] => only.sql.clone(),
            _ => None,
        };
        Self {
            sql,
            results: state.results,
            final_answer,
            errors: state.errors,
            warnings: state.warnings,
            trace_id: state.trace_id,
            reasoning: state.reasoning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ErrorCode;

    fn pending(id: &str) -> SubQuery {
        SubQuery {
            id: id.to_string(),
            parent: "t1".to_string(),
            datasource_id: "db1".to_string(),
            intent: "count users".to_string(),
            filters: Vec::new(),
            sql: None,
            status: SubQueryStatus::Pending,
        }
    }

    #[test]
    fn merge_appends_and_never_drops() {
        let mut state = PipelineState::new("t1", "acme", "how many users?", None);

        let mut first = StageUpdate::default();
        first.new_sub_queries.push(pending("a"));
        first
            .errors
            .push(PipelineError::new("gen", ErrorCode::SqlGenFailed, "retry 1"));
        state.merge(first);

        let mut second = StageUpdate::default();
        second
            .status_changes
            .push(("a".to_string(), SubQueryStatus::Succeeded));
        second.warnings.push("row limit reached".to_string());
        state.merge(second);

        assert_eq!(state.sub_queries.len(), 1);
        assert_eq!(state.sub_queries[0].status, SubQueryStatus::Succeeded);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.warnings.len(), 1);
        assert!(state.all_settled());
    }

    #[test]
    fn response_sql_only_for_single_sub_query() {
        let mut state = PipelineState::new("t1", "acme", "q", None);
        let mut sq = pending("a");
        sq.sql = Some("SELECT 1".to_string());
        state.sub_queries.push(sq);
        let response = PipelineResponse::from_state(state.clone(), None);
        assert_eq!(response.sql.as_deref(), Some("SELECT 1"));

        state.sub_queries.push(pending("b"));
        let response = PipelineResponse::from_state(state, None);
        assert!(response.sql.is_none());
    }
}
