// SPDX-License-Identifier: Apache-2.0

//! Schema retrieval: narrows a datasource's schema to the tables most
//! relevant to a question before prompt assembly.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::engine::error::EngineResult;
use crate::engine::registry::AdapterRegistry;
use crate::engine::types::SchemaInfo;

const MAX_TABLES: usize = 30;

/// One table surfaced for prompt assembly, with its column names and a
/// relevance score (term overlap with the question; higher is better).
#[derive(Debug, Clone)]
pub struct SchemaCandidate {
    pub table: String,
    pub columns: Vec<String>,
    pub score: f64,
}

impl SchemaCandidate {
    /// Renders the candidate the way prompts embed it.
    pub fn describe(&self) -> String {
        format!("{}({})", self.table, self.columns.join(", "))
    }
}

/// Produces schema candidates for a question against one datasource.
///
/// An empty result is valid: generation proceeds without schema grounding
/// rather than failing the request.
#[async_trait]
pub trait SchemaRetriever: Send + Sync {
    async fn retrieve(
        &self,
        datasource_id: &str,
        question: &str,
    ) -> EngineResult<Vec<SchemaCandidate>>;
}

/// Retriever backed by live adapter introspection.
pub struct AdapterSchemaRetriever {
    adapters: Arc<AdapterRegistry>,
}

impl AdapterSchemaRetriever {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self { adapters }
    }

    fn rank(schema: &SchemaInfo, question: &str) -> Vec<SchemaCandidate> {
        let terms: Vec<String> = question
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect();

        let mut candidates: Vec<SchemaCandidate> = schema
            .tables
            .iter()
            .map(|table| {
                let table_lower = table.name.to_lowercase();
                let mut score = 0.0;
                for term in &terms {
                    if table_lower.contains(term.as_str()) || term.contains(&table_lower) {
                        score += 2.0;
                    }
                    for col in &table.columns {
                        if col.name.to_lowercase().contains(term.as_str()) {
                            score += 1.0;
                        }
                    }
                }
                SchemaCandidate {
                    table: table.name.clone(),
                    columns: table.columns.iter().map(|c| c.name.clone()).collect(),
                    score,
                }
            })
            .collect();

        // Stable order: best score first, name breaks ties so identical
        // questions always see identical prompts.
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.table.cmp(&b.table))
        });
        candidates.truncate(MAX_TABLES);
        candidates
    }
}

#[async_trait]
impl SchemaRetriever for AdapterSchemaRetriever {
    async fn retrieve(
        &self,
        datasource_id: &str,
        question: &str,
    ) -> EngineResult<Vec<SchemaCandidate>> {
        let adapter = self
            .adapters
            .get(datasource_id)
            .ok_or_else(|| crate::engine::error::EngineError::adapter_not_found(datasource_id))?;
        let schema = adapter.introspect_schema().await?;
        let candidates = Self::rank(&schema, question);
        debug!(
            datasource_id,
            tables = candidates.len(),
            "schema retrieval complete"
        );
        Ok(candidates)
    }
}
