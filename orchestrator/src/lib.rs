// Parley LLM orchestrator
// Turns final transcripts into assistant turns: streamed tokens,
// sentence-segmented TTS requests and tool invocations, with exactly one
// in-flight generation per conversation.

pub mod llm;
pub mod segment;
pub mod tools;
pub mod worker;

pub use llm::{LanguageModel, LlmConfig, LlmEvent, OpenAiCompatModel, ScriptedModel, ToolSpec};
pub use segment::{SegmenterConfig, SentenceSplitter};
pub use tools::{GetTimeTool, Tool, ToolError, ToolOutcome, ToolRouter, ToolRouterConfig};
pub use worker::{OrchestratorConfig, OrchestratorWorker};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error(transparent)]
    Core(#[from] parley_core::CoreError),
}
pub type Result<T> = std::result::Result<T, OrchestratorError>;
