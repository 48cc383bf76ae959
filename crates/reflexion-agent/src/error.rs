//! Agent error types.
//!
//! Model and embedding failures inside a run are absorbed by the controller's
//! fallbacks; what reaches the caller through [`AgentError`] is a bad request,
//! a missing run, or a persistence failure.

use reflexion_store::StoreError;

/// Unified error type for the agent crate.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- LLM errors ----------------------------------------------------------
    /// An HTTP request to the model provider failed.
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The provider response could not be parsed.
    #[error("llm response parse error: {reason}")]
    LlmParseFailed { reason: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    // -- Run control errors --------------------------------------------------
    /// No checkpoint exists for the requested run.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run already reached `finalize`.
    #[error("run {run_id} has already finished")]
    RunFinished { run_id: String },

    /// A resume override was supplied where it is not allowed.
    #[error("invalid override for run {run_id}: {reason}")]
    InvalidOverride { run_id: String, reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Validation failed for input data.
    #[error("validation error: {reason}")]
    ValidationError { reason: String },

    // -- Serialization -------------------------------------------------------
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmRequestFailed {
            reason: err.to_string(),
        }
    }
}
