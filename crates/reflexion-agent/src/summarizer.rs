//! Model-backed consolidation of lessons into principles.

use std::sync::Arc;

use async_trait::async_trait;
use reflexion_store::{StoreError, StoreResult, Summarizer};

use crate::llm::CompletionModel;
use crate::parse::parse_string_list;

const SUMMARIZER_ROLE: &str = "You distill recurring feedback on written drafts into a few \
general, reusable writing principles. Reply with JSON only.";

/// [`Summarizer`] that asks a [`CompletionModel`] for a JSON array of
/// principle strings.
#[derive(Clone)]
pub struct LessonSummarizer {
    model: Arc<dyn CompletionModel>,
}

impl LessonSummarizer {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }
}

fn summarize_prompt(lessons: &[String], max_principles: usize) -> String {
    let numbered: String = lessons
        .iter()
        .enumerate()
        .map(|(i, l)| format!("{}. {}\n", i + 1, l))
        .collect();
    format!(
        "The following lessons were learned while revising drafts against the same \
         criteria.\n\n{numbered}\n\
         Merge them into at most {max_principles} principles. Each principle must be a \
         single actionable sentence that keeps the concrete advice of the lessons it \
         replaces.\n\n\
         Respond with a JSON array of strings, for example:\n\
         [\"First principle.\", \"Second principle.\"]"
    )
}

#[async_trait]
impl Summarizer for LessonSummarizer {
    async fn summarize(&self, lessons: &[String], max_principles: usize) -> StoreResult<Vec<String>> {
        if lessons.is_empty() || max_principles == 0 {
            return Ok(Vec::new());
        }

        let raw = self
            .model
            .complete(SUMMARIZER_ROLE, &summarize_prompt(lessons, max_principles))
            .await
            .map_err(|e| StoreError::Summarization(e.to_string()))?;

        let mut principles = parse_string_list(&raw).ok_or_else(|| {
            StoreError::Summarization("response was not a JSON array of strings".into())
        })?;
        principles.truncate(max_principles);
        tracing::debug!(
            lessons = lessons.len(),
            principles = principles.len(),
            "lessons summarized"
        );
        Ok(principles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, Result};

    struct Canned(std::result::Result<String, String>);

    #[async_trait]
    impl CompletionModel for Canned {
        async fn complete(&self, _role: &str, _task: &str) -> Result<String> {
            self.0.clone().map_err(|reason| AgentError::LlmRequestFailed { reason })
        }
    }

    fn summarizer(reply: std::result::Result<&str, &str>) -> LessonSummarizer {
        let reply = reply.map(str::to_string).map_err(str::to_string);
        LessonSummarizer::new(Arc::new(Canned(reply)))
    }

    fn lessons(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("lesson {i}")).collect()
    }

    #[test]
    fn prompt_numbers_every_lesson() {
        let prompt = summarize_prompt(&lessons(2), 3);
        assert!(prompt.contains("1. lesson 0"));
        assert!(prompt.contains("2. lesson 1"));
        assert!(prompt.contains("at most 3 principles"));
    }

    #[tokio::test]
    async fn truncates_to_max_principles() {
        let s = summarizer(Ok(r#"```json
["a", "b", "c", "d"]
```"#));
        let out = s.summarize(&lessons(11), 3).await.unwrap();
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn malformed_reply_is_a_summarization_error() {
        let s = summarizer(Ok("Here are some thoughts."));
        assert!(matches!(
            s.summarize(&lessons(4), 3).await,
            Err(StoreError::Summarization(_))
        ));
    }

    #[tokio::test]
    async fn model_failure_is_a_summarization_error() {
        let s = summarizer(Err("timeout"));
        let err = s.summarize(&lessons(4), 3).await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }
}
