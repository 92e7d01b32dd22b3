// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the datasource adapter layer
//!
//! All backend-specific errors are mapped to these unified error kinds so the
//! pipeline can classify failures without knowing which driver produced them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all adapter operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Query syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Adapter not found: {adapter_id}")]
    AdapterNotFound { adapter_id: String },

    #[error("Adapter not connected: {adapter_id}")]
    NotConnected { adapter_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: msg.into() }
    }

    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn adapter_not_found(id: impl Into<String>) -> Self {
        Self::AdapterNotFound { adapter_id: id.into() }
    }

    pub fn not_connected(id: impl Into<String>) -> Self {
        Self::NotConnected { adapter_id: id.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError { message: msg.into() }
    }
}

/// Result type alias for adapter operations
pub type EngineResult<T> = Result<T, EngineError>;
