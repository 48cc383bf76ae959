//! Reflexion agent: the refinement controller and the model-backed
//! capabilities it runs on.
//!
//! # Modules
//!
//! - [`refine`] -- the draft, evaluate, reflect loop with interrupt points
//!   and checkpointed resume.
//! - [`llm`] -- completion client for Anthropic and OpenAI-compatible APIs.
//! - [`embedding`] -- embedding client used by the lesson store.
//! - [`summarizer`] -- consolidates lessons into principles.
//! - [`parse`] -- lenient parsing of structured model output.
//! - [`config`] -- TOML and environment configuration.
//! - [`error`] -- the crate error type.

pub mod config;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod parse;
pub mod refine;
pub mod summarizer;

pub use config::{
    DEFAULT_CONFIG_PATH, EmbeddingSettings, LlmSettings, MemorySettings, ReflexionConfig,
    RefinementSettings,
};
pub use embedding::{EmbeddingClient, EmbeddingClientConfig};
pub use error::{AgentError, Result};
pub use llm::{CompletionModel, LlmClient, LlmClientConfig, LlmProvider};
pub use refine::{
    HistoryEntry, LoopSettings, Phase, RefinementController, ResumeOverrides, RetrievedLesson,
    RunStatus, WorkflowState,
};
pub use summarizer::LessonSummarizer;
