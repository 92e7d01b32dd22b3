// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::types::{LlmConfig, LlmError, Stage, PINNED_SEED};

// ─── Trait ───────────────────────────────────────────────────

/// A non-streaming completion backend.
///
/// Implementations must be deterministic for a fixed prompt pair: request
/// bodies carry temperature 0 and a pinned seed where the provider supports
/// one.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn complete(
        &self,
        stage: Stage,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError>;
}

/// Deserializes a stage's structured output, unwrapping a fenced code block
/// first if the model added one.
pub fn parse_structured<T: serde::de::DeserializeOwned>(response: &str) -> Result<T, LlmError> {
    let payload = extract_fenced_block(response).unwrap_or_else(|| response.trim().to_string());
    serde_json::from_str(&payload).map_err(|e| LlmError::schema_mismatch(e.to_string()))
}

/// Bounds every completion with a pipeline-level wall-clock deadline,
/// independent of whatever transport timeout the wrapped client carries.
pub struct DeadlineModel {
    inner: Arc<dyn LanguageModel>,
    timeout_ms: u64,
}

impl DeadlineModel {
    pub fn new(inner: Arc<dyn LanguageModel>, timeout_ms: u64) -> Self {
        Self { inner, timeout_ms }
    }
}

#[async_trait]
impl LanguageModel for DeadlineModel {
    fn provider_id(&self) -> &'static str {
        self.inner.provider_id()
    }

    async fn complete(
        &self,
        stage: Stage,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let deadline = Duration::from_millis(self.timeout_ms);
        tokio::time::timeout(deadline, self.inner.complete(stage, system_prompt, user_prompt))
            .await
            .map_err(|_| LlmError::Timeout {
                timeout_ms: self.timeout_ms,
            })?
    }
}

// ─── OpenAI ──────────────────────────────────────────────────

pub struct OpenAiModel {
    client: Client,
    api_key: String,
    config: LlmConfig,
}

impl OpenAiModel {
    pub fn new(api_key: impl Into<String>, config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    fn request_body(config: &LlmConfig, system_prompt: &str, user_prompt: &str) -> Value {
        json!({
            "model": config.effective_model(),
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt }
            ],
            "max_tokens": config.effective_max_tokens(),
            "temperature": config.effective_temperature(),
            "seed": PINNED_SEED,
            "stream": false
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn provider_id(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        stage: Stage,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let body = Self::request_body(&self.config, system_prompt, user_prompt);
        debug!(
            stage = stage.as_str(),
            model = %self.config.effective_model(),
            "OpenAI request"
        );

        let timeout_ms = self.config.effective_timeout_ms();
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout { timeout_ms }
                } else {
                    LlmError::provider(format!("OpenAI request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let msg =
                extract_api_error(&body).unwrap_or_else(|| format!("HTTP {status}: {body}"));
            return Err(LlmError::provider(msg));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| LlmError::provider(format!("unreadable OpenAI response: {e}")))?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::schema_mismatch("missing choices[0].message.content"))
    }
}

// ─── Anthropic ───────────────────────────────────────────────

pub struct AnthropicModel {
    client: Client,
    api_key: String,
    config: LlmConfig,
}

impl AnthropicModel {
    pub fn new(api_key: impl Into<String>, config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    fn request_body(config: &LlmConfig, system_prompt: &str, user_prompt: &str) -> Value {
        json!({
            "model": config.effective_model(),
            "system": system_prompt,
            "messages": [
                { "role": "user", "content": user_prompt }
            ],
            "max_tokens": config.effective_max_tokens(),
            "temperature": config.effective_temperature(),
            "stream": false
        })
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn provider_id(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(
        &self,
        stage: Stage,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let body = Self::request_body(&self.config, system_prompt, user_prompt);
        debug!(
            stage = stage.as_str(),
            model = %self.config.effective_model(),
            "Anthropic request"
        );

        let timeout_ms = self.config.effective_timeout_ms();
        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout { timeout_ms }
                } else {
                    LlmError::provider(format!("Anthropic request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let msg =
                extract_api_error(&body).unwrap_or_else(|| format!("HTTP {status}: {body}"));
            return Err(LlmError::provider(msg));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| LlmError::provider(format!("unreadable Anthropic response: {e}")))?;
        parsed["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::schema_mismatch("missing content[0].text"))
    }
}

// ─── Ollama ──────────────────────────────────────────────────

pub struct OllamaModel {
    client: Client,
    config: LlmConfig,
}

impl OllamaModel {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn request_body(config: &LlmConfig, system_prompt: &str, user_prompt: &str) -> Value {
        json!({
            "model": config.effective_model(),
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt }
            ],
            "options": {
                "temperature": config.effective_temperature(),
                "seed": PINNED_SEED
            },
            "stream": false
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    fn provider_id(&self) -> &'static str {
        "ollama"
    }

    async fn complete(
        &self,
        stage: Stage,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let base_url = self
            .config
            .effective_base_url()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let body = Self::request_body(&self.config, system_prompt, user_prompt);
        debug!(
            stage = stage.as_str(),
            model = %self.config.effective_model(),
            base_url = %base_url,
            "Ollama request"
        );

        let timeout_ms = self.config.effective_timeout_ms();
        let response = self
            .client
            .post(format!("{base_url}/api/chat"))
            .header("Content-Type", "application/json")
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout { timeout_ms }
                } else {
                    LlmError::provider(format!("Ollama request failed: {e}. Is Ollama running?"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::provider(format!("Ollama HTTP {status}: {body}")));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| LlmError::provider(format!("unreadable Ollama response: {e}")))?;
        parsed["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::schema_mismatch("missing message.content"))
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Extract a user-friendly error message from an API error response body
fn extract_api_error(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    // OpenAI format: { "error": { "message": "..." } }
    // Anthropic format: { "error": { "message": "..." } }
    parsed["error"]["message"].as_str().map(|s| s.to_string())
}

/// Extract the contents of a fenced code block from model response text
pub fn extract_fenced_block(response: &str) -> Option<String> {
    let fence_patterns = ["```json", "```sql", "```"];

    for pattern in &fence_patterns {
        if let Some(start_idx) = response.find(pattern) {
            let content_start = start_idx + pattern.len();
            // Skip to the next line after the opening fence
            let content_start = response[content_start..]
                .find('\n')
                .map(|i| content_start + i + 1)
                .unwrap_or(content_start);

            if let Some(end_idx) = response[content_start..].find("```") {
                let block = response[content_start..content_start + end_idx].trim();
                if !block.is_empty() {
                    return Some(block.to_string());
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{GenerationResponse, LlmProvider};

    #[test]
    fn openai_body_pins_temperature_and_seed() {
        let mut config = LlmConfig::new(LlmProvider::OpenAi);
        config.temperature = Some(0.9);
        let body = OpenAiModel::request_body(&config, "sys", "user");
        assert_eq!(body["temperature"].as_f64(), Some(0.0));
        assert_eq!(body["seed"].as_u64(), Some(PINNED_SEED));
        assert_eq!(body["stream"].as_bool(), Some(false));
    }

    #[test]
    fn ollama_body_pins_options() {
        let config = LlmConfig::new(LlmProvider::Ollama);
        let body = OllamaModel::request_body(&config, "sys", "user");
        assert_eq!(body["options"]["temperature"].as_f64(), Some(0.0));
        assert_eq!(body["options"]["seed"].as_u64(), Some(PINNED_SEED));
    }

    #[test]
    fn anthropic_body_pins_temperature() {
        let mut config = LlmConfig::new(LlmProvider::Anthropic);
        config.temperature = Some(1.0);
        let body = AnthropicModel::request_body(&config, "sys", "user");
        assert_eq!(body["temperature"].as_f64(), Some(0.0));
    }

    #[test]
    fn fenced_block_extraction() {
        let response = "Here you go:\n\n```sql\nSELECT * FROM users;\n```\n\nDone.";
        assert_eq!(
            extract_fenced_block(response),
            Some("SELECT * FROM users;".to_string())
        );
        assert_eq!(extract_fenced_block("plain text"), None);
    }

    #[test]
    fn structured_parse_unwraps_fences() {
        let raw = "```json\n{\"reasoning\":\"r\",\"sql\":\"SELECT 1\"}\n```";
        let parsed: GenerationResponse = parse_structured(raw).unwrap();
        assert_eq!(parsed.sql, "SELECT 1");

        let bare = "{\"sql\":\"SELECT 2\"}";
        let parsed: GenerationResponse = parse_structured(bare).unwrap();
        assert_eq!(parsed.sql, "SELECT 2");
    }

    #[test]
    fn structured_parse_reports_schema_mismatch() {
        let err = parse_structured::<GenerationResponse>("not json").unwrap_err();
        assert!(matches!(err, LlmError::SchemaMismatch { .. }));
    }

    #[test]
    fn api_error_extraction() {
        let body = r#"{"error":{"message":"Invalid API key","type":"invalid_request_error"}}"#;
        assert_eq!(extract_api_error(body), Some("Invalid API key".to_string()));
    }

    struct StallingModel;

    #[async_trait]
    impl LanguageModel for StallingModel {
        fn provider_id(&self) -> &'static str {
            "stalling"
        }

        async fn complete(
            &self,
            _stage: Stage,
            _system_prompt: &str,
            _user_prompt: &str,
        ) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn deadline_bounds_a_stalled_completion() {
        let model = DeadlineModel::new(Arc::new(StallingModel), 20);
        let err = model.complete(Stage::Generate, "s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout { timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn deadline_passes_fast_completions_through() {
        let inner = Arc::new(crate::llm::ScriptedModel::new());
        inner.push_text(Stage::Generate, "quick");
        let model = DeadlineModel::new(inner, 5_000);
        let out = model.complete(Stage::Generate, "s", "u").await.unwrap();
        assert_eq!(out, "quick");
    }
}
