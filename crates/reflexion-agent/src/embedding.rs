//! Embedding client for OpenAI-compatible `/embeddings` endpoints.
//!
//! Implements the store's [`Embedder`] capability so lessons and retrieval
//! queries are embedded with the same model.

use std::time::Duration;

use async_trait::async_trait;
use reflexion_store::{Embedder, StoreError, StoreResult};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Settings for [`EmbeddingClient`].
#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    pub api_key: String,
    /// Base URL; `/embeddings` is appended.
    pub base_url: String,
    pub model: String,
    /// Requested output dimensions, for models that support shortening.
    pub dimensions: Option<usize>,
}

impl EmbeddingClientConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            dimensions: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP embedding provider.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    config: EmbeddingClientConfig,
    http: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingClientConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: "embedding".into(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, http })
    }

    fn url(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    /// Embed one text.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(AgentError::ValidationError {
                reason: "cannot embed empty text".into(),
            });
        }

        let body = EmbeddingRequest {
            input: text,
            model: &self.config.model,
            dimensions: self.config.dimensions,
        };

        tracing::debug!(model = %self.config.model, chars = text.len(), "requesting embedding");

        let resp = self
            .http
            .post(self.url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiError>(&raw)
                .map(|e| e.error.message)
                .unwrap_or(raw);
            return Err(AgentError::LlmRequestFailed {
                reason: format!("embedding API returned {status}: {message}"),
            });
        }

        parse_embedding_response(&raw)
    }
}

fn parse_embedding_response(raw: &str) -> Result<Vec<f32>> {
    let parsed: EmbeddingResponse =
        serde_json::from_str(raw).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid embedding response: {e}"),
        })?;
    parsed
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AgentError::LlmParseFailed {
            reason: "embedding response contained no vector".into(),
        })
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>> {
        self.embed_text(text)
            .await
            .map_err(|e| StoreError::Embedding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_unset_dimensions() {
        let body = EmbeddingRequest {
            input: "x",
            model: DEFAULT_MODEL,
            dimensions: None,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["model"], DEFAULT_MODEL);
        assert!(v.get("dimensions").is_none());
    }

    #[test]
    fn parses_first_vector() {
        let raw = r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.1,-0.2]}],"usage":{"prompt_tokens":2,"total_tokens":2}}"#;
        assert_eq!(parse_embedding_response(raw).unwrap(), vec![0.1, -0.2]);
    }

    #[test]
    fn empty_data_is_a_parse_error() {
        assert!(matches!(
            parse_embedding_response(r#"{"data":[]}"#),
            Err(AgentError::LlmParseFailed { .. })
        ));
    }

    #[test]
    fn url_tolerates_trailing_slash() {
        let mut cfg = EmbeddingClientConfig::openai("k");
        cfg.base_url = "http://localhost:8080/v1/".into();
        let client = EmbeddingClient::new(cfg).unwrap();
        assert_eq!(client.url(), "http://localhost:8080/v1/embeddings");
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(EmbeddingClient::new(EmbeddingClientConfig::openai("")).is_err());
    }
}
