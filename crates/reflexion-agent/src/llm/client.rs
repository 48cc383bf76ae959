//! Multi-provider chat client.
//!
//! Talks to the **Anthropic Messages API** and the **OpenAI Chat Completions
//! API** (including OpenAI-compatible endpoints such as Ollama or vLLM). Every
//! refinement step is a single non-streaming call, so there is no SSE path.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::types::{ChatRequest, LlmResponse, Message, Role, Usage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default Anthropic API base URL.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Default OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta header required when authenticating with an OAuth token.
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

const DEFAULT_TIMEOUT_SECS: u64 = 120;

// ---------------------------------------------------------------------------
// Provider enum
// ---------------------------------------------------------------------------

/// Which wire protocol the client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    /// OpenAI and any OpenAI-compatible endpoint.
    #[serde(alias = "openai-compatible")]
    OpenAI,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
        }
    }
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// Connection settings for one provider endpoint.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub provider: LlmProvider,
    pub api_key: String,
    /// Base URL, e.g. `https://api.anthropic.com`.
    pub base_url: String,
    pub default_model: String,
    pub max_tokens: u32,
    /// Sampling temperature applied when a request does not set one.
    pub temperature: Option<f32>,
    pub timeout_secs: u64,
}

impl LlmClientConfig {
    /// Configuration for the Anthropic API.
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: 4096,
            temperature: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Configuration for the OpenAI API.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: 4096,
            temperature: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Configuration for an OpenAI-compatible endpoint.
    pub fn openai_compatible(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::openai(api_key, model)
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Chat client for one configured provider.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: Arc<LlmClientConfig>,
    http: reqwest::Client,
}

impl LlmClient {
    /// Create a client. Fails if the API key is empty.
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: config.provider.as_str().into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.config.provider
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Send a chat request and wait for the whole response.
    pub async fn chat(&self, request: &ChatRequest) -> Result<LlmResponse> {
        let (url, headers, body) = match self.config.provider {
            LlmProvider::Anthropic => (
                format!("{}/v1/messages", self.config.base_url),
                self.anthropic_headers()?,
                self.build_anthropic_request_body(request),
            ),
            LlmProvider::OpenAI => (
                format!("{}/chat/completions", self.config.base_url),
                self.openai_headers()?,
                self.build_openai_request_body(request),
            ),
        };

        tracing::debug!(
            url = %url,
            model = %body["model"],
            provider = self.config.provider.as_str(),
            "sending LLM request"
        );

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to read response body: {e}"),
            })?;

        if !status.is_success() {
            return Err(AgentError::LlmRequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }

        let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;

        match self.config.provider {
            LlmProvider::Anthropic => parse_anthropic_response(&v),
            LlmProvider::OpenAI => parse_openai_response(&v),
        }
    }

    // =======================================================================
    // Anthropic
    // =======================================================================

    fn build_anthropic_request_body(&self, request: &ChatRequest) -> Value {
        let (system_text, messages) = messages_to_anthropic(&request.messages);

        let mut body = json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });

        if let Some(system) = system_text {
            body["system"] = json!(system);
        }
        if let Some(temp) = request.temperature.or(self.config.temperature) {
            body["temperature"] = json!(temp);
        }
        body
    }

    /// Standard keys go in `x-api-key`; OAuth tokens (`sk-ant-oat...`) use
    /// Bearer auth plus the OAuth beta header.
    fn anthropic_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let api_key = &self.config.api_key;

        if api_key.starts_with("sk-ant-oat") {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {api_key}"))?);
            headers.insert(
                "anthropic-beta",
                HeaderValue::from_static(ANTHROPIC_OAUTH_BETA),
            );
        } else {
            headers.insert("x-api-key", header_value(api_key)?);
        }

        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    // =======================================================================
    // OpenAI
    // =======================================================================

    fn build_openai_request_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages_to_openai(&request.messages),
        });

        if let Some(temp) = request.temperature.or(self.config.temperature) {
            body["temperature"] = json!(temp);
        }
        body
    }

    fn openai_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", self.config.api_key))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn model_for<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        if request.model.is_empty() {
            &self.config.default_model
        } else {
            &request.model
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| AgentError::LlmRequestFailed {
        reason: format!("invalid header value: {e}"),
    })
}

// ===========================================================================
// Wire format conversion (free functions)
// ===========================================================================

/// Anthropic takes the system prompt as a top-level field, so system
/// messages are joined and split out of the message list.
fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User => wire.push(json!({"role": "user", "content": msg.content})),
            Role::Assistant => wire.push(json!({"role": "assistant", "content": msg.content})),
        }
    }

    (system, wire)
}

fn messages_to_openai(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({"role": role, "content": msg.content})
        })
        .collect()
}

/// Parse a non-streaming Anthropic Messages API response.
fn parse_anthropic_response(v: &Value) -> Result<LlmResponse> {
    let content = v["content"]
        .as_array()
        .ok_or_else(|| AgentError::LlmParseFailed {
            reason: "missing `content` array in response".into(),
        })?;

    let text: String = content
        .iter()
        .filter(|block| block["type"].as_str() == Some("text"))
        .filter_map(|block| block["text"].as_str())
        .collect();

    Ok(LlmResponse {
        text,
        usage: Usage {
            input_tokens: token_count(&v["usage"]["input_tokens"]),
            output_tokens: token_count(&v["usage"]["output_tokens"]),
        },
        stop_reason: v["stop_reason"].as_str().map(str::to_owned),
    })
}

/// Parse a non-streaming OpenAI Chat Completions response.
fn parse_openai_response(v: &Value) -> Result<LlmResponse> {
    let choice = &v["choices"][0];
    let message = &choice["message"];

    if message.is_null() {
        return Err(AgentError::LlmParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    Ok(LlmResponse {
        text: message["content"].as_str().unwrap_or_default().to_owned(),
        usage: Usage {
            input_tokens: token_count(&v["usage"]["prompt_tokens"]),
            output_tokens: token_count(&v["usage"]["completion_tokens"]),
        },
        stop_reason: choice["finish_reason"].as_str().map(str::to_owned),
    })
}

fn token_count(v: &Value) -> u32 {
    v.as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
