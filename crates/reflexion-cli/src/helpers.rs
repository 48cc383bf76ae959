//! Shared helpers: tracing setup and wiring of the stores and clients.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reflexion_agent::{
    AgentError, CompletionModel, EmbeddingClient, LessonSummarizer, LlmClient,
    RefinementController, ReflexionConfig,
};
use reflexion_store::{
    CheckpointStore, Database, Embedder, MemoryStore, StoreError, StoreResult, Summarizer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Load `.env`, then the config file with environment overrides.
pub fn load_config(path: &Path) -> Result<ReflexionConfig> {
    let _ = dotenvy::dotenv();
    ReflexionConfig::load_with_env(Some(path)).context("failed to load configuration")
}

// ---------------------------------------------------------------------------
// Offline capabilities
// ---------------------------------------------------------------------------

/// Stand-in for commands that only read stored state.
struct Offline;

#[async_trait]
impl CompletionModel for Offline {
    async fn complete(&self, _role: &str, _task: &str) -> reflexion_agent::Result<String> {
        Err(AgentError::MissingApiKey {
            provider: "llm".into(),
        })
    }
}

#[async_trait]
impl Embedder for Offline {
    async fn embed(&self, _text: &str) -> StoreResult<Vec<f32>> {
        Err(StoreError::Embedding("no embedding API key configured".into()))
    }
}

#[async_trait]
impl Summarizer for Offline {
    async fn summarize(&self, _lessons: &[String], _max: usize) -> StoreResult<Vec<String>> {
        Err(StoreError::Summarization("no LLM API key configured".into()))
    }
}

// ---------------------------------------------------------------------------
// App wiring
// ---------------------------------------------------------------------------

/// Everything a command needs.
pub struct App {
    pub config: ReflexionConfig,
    pub controller: RefinementController,
    pub memory: MemoryStore,
}

/// Whether a command calls the model and embedding APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Online,
    ReadOnly,
}

/// Open the database and build the controller.
///
/// `Online` requires API keys for both the completion and embedding
/// providers; `ReadOnly` never contacts them.
pub async fn open_app(config: ReflexionConfig, access: Access) -> Result<App> {
    let db_path = config.memory.database.clone();
    let db = Database::open_and_migrate(db_path.clone())
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    info!(path = %db_path.display(), "store initialized");

    let model: Arc<dyn CompletionModel>;
    let embedder: Arc<dyn Embedder>;
    let summarizer: Arc<dyn Summarizer>;
    match access {
        Access::Online => {
            let llm = LlmClient::new(config.llm_client_config()?)
                .context("failed to create LLM client")?;
            info!(provider = llm.provider().as_str(), model = llm.default_model(), "LLM client ready");
            model = Arc::new(llm);
            embedder = Arc::new(
                EmbeddingClient::new(config.embedding_client_config()?)
                    .context("failed to create embedding client")?,
            );
            summarizer = Arc::new(LessonSummarizer::new(model.clone()));
        }
        Access::ReadOnly => {
            model = Arc::new(Offline);
            embedder = Arc::new(Offline);
            summarizer = Arc::new(Offline);
        }
    }

    let memory = MemoryStore::new(db.clone(), embedder, summarizer)
        .with_query_cache(config.query_cache());
    let controller = RefinementController::new(
        model,
        memory.clone(),
        CheckpointStore::new(db),
        config.loop_settings(),
    );

    Ok(App {
        config,
        controller,
        memory,
    })
}

/// Format unix seconds for display.
pub fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Shorten text to at most `max` characters for one-line display.
pub fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let cut: String = single_line.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
