// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported language model providers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Ollama => "ollama",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o",
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::Ollama => "llama3",
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Ollama => Some("http://localhost:11434"),
            _ => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, LlmProvider::Ollama)
    }
}

/// Sampling seed sent with every completion request.
pub const PINNED_SEED: u64 = 42;

/// Configuration for a language model client.
///
/// Temperature and seed are not configurable: identical prompts must yield
/// identical completions across runs, so both are pinned regardless of what
/// callers put in `temperature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_ms: Option<u64>,
}

impl LlmConfig {
    pub fn new(provider: LlmProvider) -> Self {
        Self {
            provider,
            model: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            timeout_ms: None,
        }
    }

    pub fn effective_model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    pub fn effective_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| self.provider.default_base_url().map(String::from))
    }

    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(2048)
    }

    /// Always 0.0. Caller-supplied overrides are ignored.
    pub fn effective_temperature(&self) -> f32 {
        0.0
    }

    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(30_000)
    }
}

/// Which stage of the pipeline is asking for a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Route,
    Generate,
    Refine,
    Synthesize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Route => "route",
            Stage::Generate => "generate",
            Stage::Refine => "refine",
            Stage::Synthesize => "synthesize",
        }
    }
}

/// One datasource the routing stage selected for a question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub datasource_id: String,
    pub intent: String,
    /// Constraints the model extracted for this route, as SQL-ish predicates.
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Structured output of the routing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResponse {
    pub routes: Vec<Route>,
    #[serde(default)]
    pub reasoning: String,
}

/// Structured output of the generate/refine stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub reasoning: String,
    pub sql: String,
}

/// Structured output of the synthesis stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResponse {
    pub final_answer: String,
}

/// Errors surfaced by a language model client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("response did not match the expected schema: {message}")]
    SchemaMismatch { message: String },
}

impl LlmError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }
}
