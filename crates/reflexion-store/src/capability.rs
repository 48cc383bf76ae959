//! External capabilities the memory store depends on.
//!
//! The store never talks to a model provider directly. Callers inject an
//! [`Embedder`] for vectors and a [`Summarizer`] for consolidation.

use async_trait::async_trait;

use crate::error::StoreResult;

/// Turns text into a fixed-dimension embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single piece of text.
    async fn embed(&self, text: &str) -> StoreResult<Vec<f32>>;
}

/// Condenses many lessons into a few general principles.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Return at most `max_principles` principles distilled from `lessons`.
    ///
    /// Implementations may return more; the store truncates.
    async fn summarize(
        &self,
        lessons: &[String],
        max_principles: usize,
    ) -> StoreResult<Vec<String>>;
}
