// SPDX-License-Identifier: Apache-2.0

//! The orchestration pipeline: decomposition, generation, gating, execution,
//! and aggregation.

pub mod config;
pub mod controller;
pub mod decompose;
pub mod error;
pub mod executor;
pub mod gate;
pub mod state;

pub use config::PipelineConfig;
pub use controller::PipelineController;
pub use decompose::stable_id;
pub use error::{ErrorCode, PipelineError, Severity};
pub use executor::{ExecutionOutcome, ExecutorRegistry, ExecutorService, SqlExecutor};
pub use state::{
    PipelineResponse, PipelineState, StageAnnotation, StageUpdate, SubQuery, SubQueryResult,
    SubQueryStatus,
};
