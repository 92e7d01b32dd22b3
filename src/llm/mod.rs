// SPDX-License-Identifier: Apache-2.0

//! Language model clients used by the routing, generation, refinement, and
//! synthesis stages.

pub mod provider;
pub mod scripted;
pub mod types;

pub use provider::{
    parse_structured, AnthropicModel, DeadlineModel, LanguageModel, OllamaModel, OpenAiModel,
};
pub use scripted::ScriptedModel;
pub use types::{
    GenerationResponse, LlmConfig, LlmError, LlmProvider, Route, RoutingResponse, Stage,
    SynthesisResponse,
};
