//! LLM integration layer.
//!
//! - [`types`] -- provider-agnostic messages, requests and responses.
//! - [`client`] -- HTTP client for the Anthropic and OpenAI APIs.
//! - [`completion`] -- the [`CompletionModel`] capability used by the controller.

pub mod client;
pub mod completion;
pub mod types;

pub use client::{LlmClient, LlmClientConfig, LlmProvider};
pub use completion::CompletionModel;
pub use types::{ChatRequest, LlmResponse, Message, Role, Usage};
