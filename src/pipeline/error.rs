// SPDX-License-Identifier: Apache-2.0

//! Pipeline failure taxonomy.
//!
//! Error codes are a closed set. Severity and retryability are looked up
//! from the code, never stored on an instance, so two errors with the same
//! code can never disagree about how they are handled.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingDatasourceId,
    MissingLlm,
    MissingExecutor,
    MissingPlan,
    SchemaRetrievalFailed,
    PlanningFailure,
    SqlGenFailed,
    SecurityViolation,
    SafeguardViolation,
    DbExecutionError,
    ExecutorCrash,
    Cancelled,
    UnknownError,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingDatasourceId => "MISSING_DATASOURCE_ID",
            ErrorCode::MissingLlm => "MISSING_LLM",
            ErrorCode::MissingExecutor => "MISSING_EXECUTOR",
            ErrorCode::MissingPlan => "MISSING_PLAN",
            ErrorCode::SchemaRetrievalFailed => "SCHEMA_RETRIEVAL_FAILED",
            ErrorCode::PlanningFailure => "PLANNING_FAILURE",
            ErrorCode::SqlGenFailed => "SQL_GEN_FAILED",
            ErrorCode::SecurityViolation => "SECURITY_VIOLATION",
            ErrorCode::SafeguardViolation => "SAFEGUARD_VIOLATION",
            ErrorCode::DbExecutionError => "DB_EXECUTION_ERROR",
            ErrorCode::ExecutorCrash => "EXECUTOR_CRASH",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub const fn severity(&self) -> Severity {
        match self {
            ErrorCode::SecurityViolation
            | ErrorCode::SafeguardViolation
            | ErrorCode::ExecutorCrash => Severity::Critical,
            ErrorCode::Cancelled => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Whether this code is a candidate for the bounded refine loop.
    pub const fn is_retryable(&self) -> bool {
        match self {
            ErrorCode::MissingPlan
            | ErrorCode::SchemaRetrievalFailed
            | ErrorCode::PlanningFailure
            | ErrorCode::SqlGenFailed
            | ErrorCode::DbExecutionError => true,
            ErrorCode::MissingDatasourceId
            | ErrorCode::MissingLlm
            | ErrorCode::MissingExecutor
            | ErrorCode::SecurityViolation
            | ErrorCode::SafeguardViolation
            | ErrorCode::ExecutorCrash
            | ErrorCode::Cancelled
            | ErrorCode::UnknownError => false,
        }
    }

    /// Whether this code invalidates the whole request, not just the
    /// sub-query it was recorded against. A security violation means the
    /// generated plan itself cannot be trusted, so siblings are cancelled.
    pub const fn is_request_wide(&self) -> bool {
        matches!(
            self,
            ErrorCode::MissingLlm | ErrorCode::SecurityViolation | ErrorCode::Cancelled
        )
    }
}

/// One recorded failure, attributed to the pipeline node that caught it.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{}] {node}: {message}", code.as_str())]
pub struct PipelineError {
    pub node: String,
    pub message: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Captured backtrace, only attached to faults that indicate a bug
    /// (task crashes, unknown errors), never to expected failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl PipelineError {
    pub fn new(node: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
            code,
            details: None,
            stack: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attaches the current backtrace to the error.
    pub fn with_stack(mut self) -> Self {
        self.stack = Some(std::backtrace::Backtrace::force_capture().to_string());
        self
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_is_fixed_per_code() {
        assert!(!ErrorCode::MissingDatasourceId.is_retryable());
        assert!(ErrorCode::PlanningFailure.is_retryable());
        assert!(ErrorCode::DbExecutionError.is_retryable());
        assert!(!ErrorCode::SecurityViolation.is_retryable());
        assert!(!ErrorCode::ExecutorCrash.is_retryable());

        // Instance payload never changes the answer.
        let a = PipelineError::new("execute", ErrorCode::DbExecutionError, "timeout");
        let b = PipelineError::new("execute", ErrorCode::DbExecutionError, "deadlock")
            .with_details(serde_json::json!({"attempt": 3}));
        assert_eq!(a.is_retryable(), b.is_retryable());
    }

    #[test]
    fn severities_follow_the_table() {
        assert_eq!(ErrorCode::SecurityViolation.severity(), Severity::Critical);
        assert_eq!(ErrorCode::SafeguardViolation.severity(), Severity::Critical);
        assert_eq!(ErrorCode::ExecutorCrash.severity(), Severity::Critical);
        assert_eq!(ErrorCode::SqlGenFailed.severity(), Severity::Error);
        assert_eq!(ErrorCode::Cancelled.severity(), Severity::Warning);
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        let err = PipelineError::new("gate", ErrorCode::SecurityViolation, "DROP rejected");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "SECURITY_VIOLATION");
        assert_eq!(ErrorCode::SqlGenFailed.as_str(), "SQL_GEN_FAILED");
    }

    #[test]
    fn request_wide_codes_follow_the_table() {
        assert!(ErrorCode::MissingLlm.is_request_wide());
        assert!(ErrorCode::SecurityViolation.is_request_wide());
        assert!(ErrorCode::Cancelled.is_request_wide());
        assert!(!ErrorCode::DbExecutionError.is_request_wide());
        assert!(!ErrorCode::SqlGenFailed.is_request_wide());
        assert!(!ErrorCode::MissingExecutor.is_request_wide());
    }

    #[test]
    fn stack_is_opt_in_and_serialized_when_present() {
        let plain = PipelineError::new("execute", ErrorCode::DbExecutionError, "timeout");
        assert!(plain.stack.is_none());
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("stack").is_none());

        let crashed =
            PipelineError::new("execute", ErrorCode::ExecutorCrash, "panic").with_stack();
        let stack = crashed.stack.as_deref().unwrap();
        assert!(!stack.is_empty());
    }
}
