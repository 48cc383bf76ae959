//! The single completion capability the refinement loop depends on.

use async_trait::async_trait;

use crate::error::Result;
use crate::llm::client::LlmClient;
use crate::llm::types::{ChatRequest, Message};

/// Given a role instruction and a task instruction, return free-form text.
///
/// Implemented by [`LlmClient`]; tests substitute scripted fakes.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, role_instruction: &str, task_instruction: &str) -> Result<String>;
}

#[async_trait]
impl CompletionModel for LlmClient {
    async fn complete(&self, role_instruction: &str, task_instruction: &str) -> Result<String> {
        let request = ChatRequest {
            messages: vec![
                Message::system(role_instruction),
                Message::user(task_instruction),
            ],
            ..ChatRequest::default()
        };
        let response = self.chat(&request).await?;
        tracing::debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "completion received"
        );
        Ok(response.text)
    }
}
