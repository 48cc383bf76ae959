//! # reflexion-store
//!
//! Storage engine for Reflexion.
//!
//! Provides SQLite-backed persistence for two things: the lesson memory
//! that outlives individual runs, and the checkpoint log that lets a paused
//! refinement run be resumed after a restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  MemoryStore      search / boost / dedup write │
//! │                   decay, prune, consolidate    │
//! │  EmbeddingCache   (moka, query vectors)        │
//! │  CheckpointStore  per-run transition log       │
//! ├───────────────────────────────────────────────┤
//! │  Database (rusqlite WAL)                       │
//! │  Migrations (versioned, transactional)         │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use reflexion_store::{CheckpointStore, Database, MemoryStore, Scope};
//!
//! let db = Database::open_and_migrate("data/reflexion.db").await?;
//! let memory = MemoryStore::new(db.clone(), embedder, summarizer);
//! let checkpoints = CheckpointStore::new(db);
//! let scope = Scope::for_criteria("writing", "cite sources, be concise");
//! let hits = memory.search("topic criteria", &scope, 5, 0.75).await?;
//! ```

pub mod cache;
pub mod capability;
pub mod checkpoint;
pub mod db;
pub mod error;
pub mod memory;
pub mod migration;
pub mod scope;
mod vector;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheStats, EmbeddingCache, EmbeddingCacheBuilder};
pub use capability::{Embedder, Summarizer};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use memory::{
    ConsolidationOutcome, DEFAULT_UTILITY, Lesson, LessonMetadata, MAX_PRINCIPLES, MAX_UTILITY,
    MaintenancePolicy, MaintenanceReport, MemoryStore, NewLesson, ScopeStats, ScoredLesson,
};
pub use scope::{Scope, criteria_hash};
pub use vector::cosine_similarity;
