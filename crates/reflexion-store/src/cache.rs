//! Query embedding cache backed by [`moka`].
//!
//! Retrieval embeds the same `"{topic} {criteria}"` query on every pass of a
//! run. [`EmbeddingCache`] keeps those vectors in memory so only the first
//! pass pays for the embedding call.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::capability::Embedder;
use crate::error::StoreResult;

// ── cache stats ──────────────────────────────────────────────────────

/// Hit and miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate in `[0, 1]`, 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache ────────────────────────────────────────────────────────────

/// Text to vector cache with bounded capacity and a time-to-live.
#[derive(Clone)]
pub struct EmbeddingCache {
    inner: Cache<String, Arc<Vec<f32>>>,
    stats: Arc<CacheStats>,
}

impl EmbeddingCache {
    /// Start building a cache.
    pub fn builder() -> EmbeddingCacheBuilder {
        EmbeddingCacheBuilder {
            max_capacity: 1_000,
            ttl_seconds: 3_600,
        }
    }

    /// Return the cached vector for `text`, embedding it on a miss.
    ///
    /// Embedding failures are returned and nothing is cached.
    pub async fn get_or_embed(&self, text: &str, embedder: &dyn Embedder) -> StoreResult<Vec<f32>> {
        if let Some(hit) = self.inner.get(text).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(len = text.len(), "embedding cache hit");
            return Ok(hit.as_ref().clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let vector = embedder.embed(text).await?;
        self.inner
            .insert(text.to_string(), Arc::new(vector.clone()))
            .await;
        debug!(len = text.len(), dims = vector.len(), "embedding cached");
        Ok(vector)
    }

    /// Drop every cached vector.
    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Builder for [`EmbeddingCache`].
pub struct EmbeddingCacheBuilder {
    max_capacity: u64,
    ttl_seconds: u64,
}

impl EmbeddingCacheBuilder {
    /// Maximum number of cached texts.
    pub fn max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = cap;
        self
    }

    /// Lifetime of each entry in seconds.
    pub fn ttl_seconds(mut self, secs: u64) -> Self {
        self.ttl_seconds = secs;
        self
    }

    pub fn build(self) -> EmbeddingCache {
        debug!(
            max_capacity = self.max_capacity,
            ttl_seconds = self.ttl_seconds,
            "embedding cache created"
        );
        EmbeddingCache {
            inner: Cache::builder()
                .max_capacity(self.max_capacity)
                .time_to_live(Duration::from_secs(self.ttl_seconds))
                .build(),
            stats: Arc::new(CacheStats::default()),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
