// SPDX-License-Identifier: Apache-2.0

//! Pipeline tuning knobs, persisted as JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::DEFAULT_ROW_LIMIT;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many times a retryable failure may re-enter generation before
    /// the last error escalates to fatal.
    pub max_refine_attempts: u32,
    /// Upper bound on sub-queries executing at once.
    pub max_concurrency: usize,
    pub default_row_limit: u64,
    pub execute_timeout_ms: u64,
    pub llm_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_refine_attempts: 2,
            max_concurrency: 8,
            default_row_limit: DEFAULT_ROW_LIMIT,
            execute_timeout_ms: 30_000,
            llm_timeout_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            debug!("no pipeline config file found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::validation(format!("failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EngineError::validation(format!("failed to parse config: {e}")))?;

        info!("loaded pipeline configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::internal(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| EngineError::internal(format!("failed to write config: {e}")))?;

        debug!("saved pipeline configuration to {:?}", path);
        Ok(())
    }
}
