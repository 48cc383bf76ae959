//! Configuration loading.
//!
//! Settings come from the TOML file (`config/default.toml` unless a path is
//! given) and are then overridden from the environment:
//! - `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` -- completion provider keys
//! - `REFLEXION_LLM_PROVIDER`, `REFLEXION_LLM_MODEL` -- provider and model
//! - `REFLEXION_EMBEDDING_API_KEY` -- embedding key (falls back to `OPENAI_API_KEY`)
//! - `REFLEXION_DB` -- path of the SQLite database
//!
//! A missing file or section means defaults.

use std::path::{Path, PathBuf};

use reflexion_store::{EmbeddingCache, MAX_PRINCIPLES, MaintenancePolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::EmbeddingClientConfig;
use crate::error::{AgentError, Result};
use crate::llm::{LlmClientConfig, LlmProvider};
use crate::refine::LoopSettings;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[llm]`: the completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    /// Empty means the provider's default model.
    pub model: String,
    /// Overrides the provider's public endpoint.
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Never read from the file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            model: String::new(),
            base_url: None,
            max_tokens: 4096,
            temperature: None,
            api_key: None,
        }
    }
}

impl LlmSettings {
    /// Configured model, or the provider default.
    pub fn model(&self) -> &str {
        if !self.model.is_empty() {
            return &self.model;
        }
        match self.provider {
            LlmProvider::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            LlmProvider::OpenAI => DEFAULT_OPENAI_MODEL,
        }
    }
}

/// `[embedding]`: the OpenAI-compatible embedding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model: String,
    pub base_url: String,
    pub dimensions: Option<usize>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        let openai = EmbeddingClientConfig::openai("");
        Self {
            model: openai.model,
            base_url: openai.base_url,
            dimensions: None,
            api_key: None,
        }
    }
}

/// `[memory]`: lesson store location and policy constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub database: PathBuf,
    pub similarity_threshold: f64,
    pub top_k: usize,
    pub dedup_threshold: f64,
    pub decay_rate: f64,
    pub prune_floor: f64,
    pub consolidation_threshold: usize,
    pub max_principles: usize,
    /// Utility added to a stored lesson each time it is judged relevant.
    pub relevance_boost: f64,
    pub cache_capacity: u64,
    pub cache_ttl_seconds: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        let policy = MaintenancePolicy::default();
        Self {
            database: PathBuf::from("data/reflexion.db"),
            similarity_threshold: 0.75,
            top_k: 5,
            dedup_threshold: 0.92,
            decay_rate: policy.decay_rate,
            prune_floor: policy.prune_floor,
            consolidation_threshold: policy.consolidation_threshold,
            max_principles: policy.max_principles,
            relevance_boost: 0.1,
            cache_capacity: 1000,
            cache_ttl_seconds: 3600,
        }
    }
}

/// `[refinement]`: per-run defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementSettings {
    pub task_type: String,
    pub max_iterations: u32,
    pub score_threshold: f64,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            task_type: "writing".into(),
            max_iterations: 3,
            score_threshold: 0.7,
        }
    }
}

// ---------------------------------------------------------------------------
// ReflexionConfig
// ---------------------------------------------------------------------------

/// All settings of a Reflexion deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflexionConfig {
    pub llm: LlmSettings,
    pub embedding: EmbeddingSettings,
    pub memory: MemorySettings,
    pub refinement: RefinementSettings,
}

impl ReflexionConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse TOML config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Load from `path` (or [`DEFAULT_CONFIG_PATH`]) and apply the process
    /// environment.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load(path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH)))?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let explicit_provider = var("REFLEXION_LLM_PROVIDER");
        if let Some(name) = &explicit_provider {
            match name.trim().to_ascii_lowercase().as_str() {
                "anthropic" => self.llm.provider = LlmProvider::Anthropic,
                "openai" | "openai-compatible" => self.llm.provider = LlmProvider::OpenAI,
                other => warn!(provider = other, "unknown REFLEXION_LLM_PROVIDER, ignoring"),
            }
        }
        if let Some(model) = var("REFLEXION_LLM_MODEL") {
            self.llm.model = model;
        }

        let anthropic_key = var("ANTHROPIC_API_KEY");
        let openai_key = var("OPENAI_API_KEY");
        self.llm.api_key = match self.llm.provider {
            LlmProvider::Anthropic => anthropic_key.clone(),
            LlmProvider::OpenAI => openai_key.clone(),
        };

        // Fall back to whichever provider has a key, unless one was pinned.
        if self.llm.api_key.is_none() && explicit_provider.is_none() {
            let fallback = match self.llm.provider {
                LlmProvider::Anthropic => openai_key.clone().map(|k| (LlmProvider::OpenAI, k)),
                LlmProvider::OpenAI => anthropic_key.map(|k| (LlmProvider::Anthropic, k)),
            };
            if let Some((provider, key)) = fallback {
                debug!(provider = provider.as_str(), "using provider with an available key");
                self.llm.provider = provider;
                self.llm.api_key = Some(key);
                self.llm.base_url = None;
            }
        }

        self.embedding.api_key = var("REFLEXION_EMBEDDING_API_KEY").or(openai_key);

        if let Some(db) = var("REFLEXION_DB") {
            self.memory.database = PathBuf::from(db);
        }
    }

    /// Reject values outside their meaningful ranges.
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(AgentError::ConfigError {
                    reason: format!("{name} must be within [0, 1], got {v}"),
                })
            }
        };
        unit("memory.similarity_threshold", self.memory.similarity_threshold)?;
        unit("memory.dedup_threshold", self.memory.dedup_threshold)?;
        unit("memory.prune_floor", self.memory.prune_floor)?;
        unit("refinement.score_threshold", self.refinement.score_threshold)?;

        let m = &self.memory;
        if !(m.decay_rate.is_finite() && m.decay_rate >= 0.0) {
            return Err(AgentError::ConfigError {
                reason: "memory.decay_rate must be non-negative".into(),
            });
        }
        if !(m.relevance_boost.is_finite() && m.relevance_boost >= 0.0) {
            return Err(AgentError::ConfigError {
                reason: "memory.relevance_boost must be non-negative".into(),
            });
        }
        if m.top_k == 0 {
            return Err(AgentError::ConfigError {
                reason: "memory.top_k must be at least 1".into(),
            });
        }
        if !(1..=MAX_PRINCIPLES).contains(&m.max_principles) {
            return Err(AgentError::ConfigError {
                reason: format!("memory.max_principles must be within 1..={MAX_PRINCIPLES}"),
            });
        }
        if self.refinement.max_iterations == 0 {
            return Err(AgentError::ConfigError {
                reason: "refinement.max_iterations must be at least 1".into(),
            });
        }
        if self.refinement.task_type.trim().is_empty() {
            return Err(AgentError::ConfigError {
                reason: "refinement.task_type must not be empty".into(),
            });
        }
        Ok(())
    }

    // -- Derived settings ----------------------------------------------------

    pub fn maintenance_policy(&self) -> MaintenancePolicy {
        MaintenancePolicy {
            decay_rate: self.memory.decay_rate,
            prune_floor: self.memory.prune_floor,
            consolidation_threshold: self.memory.consolidation_threshold,
            max_principles: self.memory.max_principles,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            task_type: self.refinement.task_type.clone(),
            top_k: self.memory.top_k,
            similarity_threshold: self.memory.similarity_threshold,
            dedup_threshold: self.memory.dedup_threshold,
            relevance_boost: self.memory.relevance_boost,
            maintenance: self.maintenance_policy(),
        }
    }

    pub fn query_cache(&self) -> EmbeddingCache {
        EmbeddingCache::builder()
            .max_capacity(self.memory.cache_capacity)
            .ttl_seconds(self.memory.cache_ttl_seconds)
            .build()
    }

    /// Client settings for the completion provider. Fails without a key.
    pub fn llm_client_config(&self) -> Result<LlmClientConfig> {
        let key = self.llm.api_key.clone().ok_or_else(|| AgentError::MissingApiKey {
            provider: self.llm.provider.as_str().into(),
        })?;
        let mut config = match (self.llm.provider, &self.llm.base_url) {
            (LlmProvider::OpenAI, Some(url)) => {
                LlmClientConfig::openai_compatible(key, self.llm.model(), url.clone())
            }
            (LlmProvider::OpenAI, None) => LlmClientConfig::openai(key, self.llm.model()),
            (LlmProvider::Anthropic, url) => {
                let mut config = LlmClientConfig::anthropic(key, self.llm.model());
                if let Some(url) = url {
                    config.base_url = url.clone();
                }
                config
            }
        };
        config.max_tokens = self.llm.max_tokens;
        config.temperature = self.llm.temperature;
        Ok(config)
    }

    /// Client settings for the embedding endpoint. Fails without a key.
    pub fn embedding_client_config(&self) -> Result<EmbeddingClientConfig> {
        let key = self.embedding.api_key.clone().ok_or_else(|| AgentError::MissingApiKey {
            provider: "embedding".into(),
        })?;
        Ok(EmbeddingClientConfig {
            api_key: key,
            base_url: self.embedding.base_url.clone(),
            model: self.embedding.model.clone(),
            dimensions: self.embedding.dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = ReflexionConfig::from_toml_str("").unwrap();
        assert_eq!(config.memory.top_k, 5);
        assert_eq!(config.memory.similarity_threshold, 0.75);
        assert_eq!(config.memory.dedup_threshold, 0.92);
        assert_eq!(config.refinement.task_type, "writing");
        assert_eq!(config.refinement.max_iterations, 3);
        assert_eq!(config.maintenance_policy(), MaintenancePolicy::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ReflexionConfig::from_toml_str(
            r#"
            [memory]
            top_k = 8
            relevance_boost = 0.0

            [llm]
            provider = "openai"
            "#,
        )
        .unwrap();
        assert_eq!(config.memory.top_k, 8);
        assert_eq!(config.memory.relevance_boost, 0.0);
        assert_eq!(config.memory.decay_rate, 0.05);
        assert_eq!(config.llm.provider, LlmProvider::OpenAI);
        assert_eq!(config.llm.model(), DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for doc in [
            "[memory]\nsimilarity_threshold = 1.5",
            "[memory]\nmax_principles = 4",
            "[memory]\ntop_k = 0",
            "[refinement]\nmax_iterations = 0",
            "[memory]\ndecay_rate = -0.1",
        ] {
            assert!(
                matches!(ReflexionConfig::from_toml_str(doc), Err(AgentError::ConfigError { .. })),
                "accepted: {doc}"
            );
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReflexionConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.refinement.score_threshold, 0.7);
    }

    #[test]
    fn api_keys_are_never_read_from_the_file() {
        let config = ReflexionConfig::from_toml_str("[llm]\napi_key = \"leaked\"").unwrap();
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn env_selects_key_for_configured_provider() {
        let mut config = ReflexionConfig::default();
        config.apply_env(env(&[("ANTHROPIC_API_KEY", "sk-ant"), ("OPENAI_API_KEY", "sk-oai")]));
        assert_eq!(config.llm.provider, LlmProvider::Anthropic);
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(config.embedding.api_key.as_deref(), Some("sk-oai"));
    }

    #[test]
    fn env_falls_back_to_provider_with_key() {
        let mut config = ReflexionConfig::default();
        config.apply_env(env(&[("OPENAI_API_KEY", "sk-oai")]));
        assert_eq!(config.llm.provider, LlmProvider::OpenAI);
        let client = config.llm_client_config().unwrap();
        assert_eq!(client.default_model, DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn pinned_provider_without_key_is_an_error() {
        let mut config = ReflexionConfig::default();
        config.apply_env(env(&[
            ("REFLEXION_LLM_PROVIDER", "anthropic"),
            ("OPENAI_API_KEY", "sk-oai"),
        ]));
        assert!(matches!(
            config.llm_client_config(),
            Err(AgentError::MissingApiKey { .. })
        ));
    }

    #[test]
    fn env_overrides_model_and_database() {
        let mut config = ReflexionConfig::default();
        config.apply_env(env(&[
            ("ANTHROPIC_API_KEY", "k"),
            ("REFLEXION_LLM_MODEL", "claude-test"),
            ("REFLEXION_DB", "/tmp/x.db"),
            ("REFLEXION_EMBEDDING_API_KEY", "emb"),
        ]));
        assert_eq!(config.llm_client_config().unwrap().default_model, "claude-test");
        assert_eq!(config.memory.database, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.embedding_client_config().unwrap().api_key, "emb");
    }

    #[test]
    fn base_url_points_openai_client_at_compatible_endpoint() {
        let mut config = ReflexionConfig::from_toml_str(
            "[llm]\nprovider = \"openai\"\nmodel = \"llama3\"\nbase_url = \"http://localhost:11434/v1\"",
        )
        .unwrap();
        config.apply_env(env(&[("OPENAI_API_KEY", "local")]));
        let client = config.llm_client_config().unwrap();
        assert_eq!(client.provider, LlmProvider::OpenAI);
        assert_eq!(client.base_url, "http://localhost:11434/v1");
        assert_eq!(client.default_model, "llama3");
    }

    #[test]
    fn loop_settings_mirror_memory_section() {
        let config = ReflexionConfig::default();
        let settings = config.loop_settings();
        assert_eq!(settings.task_type, "writing");
        assert_eq!(settings.top_k, 5);
        assert_eq!(settings.relevance_boost, 0.1);
    }
}
