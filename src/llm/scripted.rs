// SPDX-License-Identifier: Apache-2.0

//! Scriptable in-memory language model.
//!
//! Serves canned replies per stage so pipeline behavior can be exercised
//! without network access. Used by the test suites alongside the adapter
//! conformance mock.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::provider::LanguageModel;
use super::types::{LlmError, Stage};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Timeout { timeout_ms: u64 },
    Provider(String),
}

#[derive(Default)]
struct Script {
    replies: HashMap<Stage, VecDeque<Reply>>,
    calls: Vec<(Stage, String)>,
}

/// A deterministic stand-in for a real provider.
///
/// Replies are queued per stage and consumed in order; when a stage's queue
/// runs dry the last queued reply is repeated.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<Script>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, stage: Stage, text: impl Into<String>) -> &Self {
        self.script
            .lock()
            .replies
            .entry(stage)
            .or_default()
            .push_back(Reply::Text(text.into()));
        self
    }

    pub fn push_json(&self, stage: Stage, value: serde_json::Value) -> &Self {
        self.push_text(stage, value.to_string())
    }

    pub fn push_timeout(&self, stage: Stage, timeout_ms: u64) -> &Self {
        self.script
            .lock()
            .replies
            .entry(stage)
            .or_default()
            .push_back(Reply::Timeout { timeout_ms });
        self
    }

    pub fn push_provider_error(&self, stage: Stage, message: impl Into<String>) -> &Self {
        self.script
            .lock()
            .replies
            .entry(stage)
            .or_default()
            .push_back(Reply::Provider(message.into()));
        self
    }

    /// Stages called so far, with the user prompt each one saw.
    pub fn calls(&self) -> Vec<(Stage, String)> {
        self.script.lock().calls.clone()
    }

    pub fn call_count(&self, stage: Stage) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|(s, _)| *s == stage)
            .count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider_id(&self) -> &'static str {
        "scripted"
    }

    async fn complete(
        &self,
        stage: Stage,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, LlmError> {
        let reply = {
            let mut script = self.script.lock();
            script.calls.push((stage, user_prompt.to_string()));
            let queue = script.replies.entry(stage).or_default();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };

        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Timeout { timeout_ms }) => Err(LlmError::Timeout { timeout_ms }),
            Some(Reply::Provider(message)) => Err(LlmError::Provider { message }),
            None => Err(LlmError::provider(format!(
                "no scripted reply for stage {}",
                stage.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_are_consumed_in_order_and_last_repeats() {
        let model = ScriptedModel::new();
        model.push_text(Stage::Generate, "first");
        model.push_text(Stage::Generate, "second");

        assert_eq!(
            model.complete(Stage::Generate, "", "q").await.unwrap(),
            "first"
        );
        assert_eq!(
            model.complete(Stage::Generate, "", "q").await.unwrap(),
            "second"
        );
        assert_eq!(
            model.complete(Stage::Generate, "", "q").await.unwrap(),
            "second"
        );
        assert_eq!(model.call_count(Stage::Generate), 3);
    }

    #[tokio::test]
    async fn unscripted_stage_errors() {
        let model = ScriptedModel::new();
        let err = model.complete(Stage::Route, "", "q").await.unwrap_err();
        assert!(matches!(err, LlmError::Provider { .. }));
    }
}
