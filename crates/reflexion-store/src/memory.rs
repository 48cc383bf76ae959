//! Lesson memory: persistent, scoped, semantically searchable.
//!
//! | Operation            | Effect                                              |
//! |----------------------|-----------------------------------------------------|
//! | `search`             | cosine similarity over one scope, thresholded, top-k |
//! | `boost`              | raise utility of lessons judged relevant (cap 2.0)   |
//! | `write_with_dedup`   | insert unless a near-identical lesson exists         |
//! | `run_maintenance`    | decay and prune, then consolidate crowded scopes     |
//!
//! Every operation takes a [`Scope`] (directly or through the lesson's
//! metadata) and never reads or writes rows outside it.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::EmbeddingCache;
use crate::capability::{Embedder, Summarizer};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::scope::Scope;
use crate::vector::{blob_to_embedding, cosine_similarity, embedding_to_blob};

/// Utility given to freshly written lessons and consolidated principles.
pub const DEFAULT_UTILITY: f64 = 1.0;

/// Upper bound for `utility_score`.
pub const MAX_UTILITY: f64 = 2.0;

/// Upper bound on principles produced by one consolidation.
pub const MAX_PRINCIPLES: usize = 3;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Metadata stored alongside each lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonMetadata {
    pub task_type: String,
    pub criteria_hash: String,
    pub topic: String,
    /// Draft score that produced the lesson, in `[0, 1]`.
    pub score: f64,
    /// Unix seconds.
    pub timestamp: i64,
    pub iteration: u32,
    /// Decaying relevance measure in `[0, 2]`.
    pub utility_score: f64,
    /// Set on principles produced by consolidation.
    pub consolidated: bool,
}

impl LessonMetadata {
    pub fn scope(&self) -> Scope {
        Scope::new(self.task_type.clone(), self.criteria_hash.clone())
    }
}

/// A persisted lesson.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    /// UUID v7.
    pub id: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub metadata: LessonMetadata,
}

/// A search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredLesson {
    pub lesson: Lesson,
    /// Cosine similarity to the query.
    pub similarity: f64,
}

/// Input for [`MemoryStore::write_with_dedup`].
#[derive(Debug, Clone)]
pub struct NewLesson {
    pub text: String,
    pub scope: Scope,
    pub topic: String,
    pub score: f64,
    pub iteration: u32,
}

/// Tunables for [`MemoryStore::run_maintenance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenancePolicy {
    /// Subtracted from every lesson's utility on each pass.
    pub decay_rate: f64,
    /// Lessons whose decayed utility falls below this are deleted.
    pub prune_floor: f64,
    /// Consolidate once a scope holds more than this many lessons.
    pub consolidation_threshold: usize,
    /// Principles kept from one consolidation, at most [`MAX_PRINCIPLES`].
    pub max_principles: usize,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            decay_rate: 0.05,
            prune_floor: 0.3,
            consolidation_threshold: 10,
            max_principles: MAX_PRINCIPLES,
        }
    }
}

/// What happened to a scope's lessons during the consolidation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    /// The scope was at or below the threshold.
    NotNeeded,
    /// `replaced` lessons were swapped for `principles` principle records.
    Consolidated { replaced: usize, principles: usize },
    /// Consolidation was abandoned and the scope left as it was.
    Failed { reason: String },
}

/// Summary of one maintenance pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub scope: Scope,
    pub decayed: usize,
    pub pruned: usize,
    pub consolidation: ConsolidationOutcome,
    /// Lessons left in the scope after the pass.
    pub remaining: usize,
}

/// Per-scope aggregate for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeStats {
    pub scope: Scope,
    pub lessons: usize,
    pub consolidated: usize,
    pub mean_utility: f64,
}

// ═══════════════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════════════

/// Lesson memory backed by the `lessons` table.
///
/// Cheap to clone; clones share the database handle, the capabilities, and
/// the query cache.
#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    query_cache: EmbeddingCache,
}

impl MemoryStore {
    /// Create a store with a default-sized query cache.
    pub fn new(db: Database, embedder: Arc<dyn Embedder>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            db,
            embedder,
            summarizer,
            query_cache: EmbeddingCache::builder().build(),
        }
    }

    /// Replace the query embedding cache.
    pub fn with_query_cache(mut self, cache: EmbeddingCache) -> Self {
        self.query_cache = cache;
        self
    }

    pub fn query_cache(&self) -> &EmbeddingCache {
        &self.query_cache
    }

    // ── search ───────────────────────────────────────────────────────

    /// Lessons in `scope` whose similarity to `query` is at least
    /// `similarity_threshold`, most similar first, at most `top_k`.
    #[instrument(skip(self, query), fields(scope = %scope))]
    pub async fn search(
        &self,
        query: &str,
        scope: &Scope,
        top_k: usize,
        similarity_threshold: f64,
    ) -> StoreResult<Vec<ScoredLesson>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vec = self
            .query_cache
            .get_or_embed(query, self.embedder.as_ref())
            .await?;
        let lessons = self.list_scope(scope).await?;
        let candidates = lessons.len();

        let mut hits: Vec<ScoredLesson> = lessons
            .into_iter()
            .map(|lesson| {
                let similarity = cosine_similarity(&query_vec, &lesson.embedding);
                ScoredLesson { lesson, similarity }
            })
            .filter(|hit| hit.similarity >= similarity_threshold)
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(top_k);

        debug!(candidates, hits = hits.len(), "lesson search complete");
        Ok(hits)
    }

    // ── boost ────────────────────────────────────────────────────────

    /// Raise the utility of each listed lesson by `amount`, capped at
    /// [`MAX_UTILITY`]. Unknown ids are ignored. Returns rows updated.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn boost(&self, ids: &[String], amount: f64) -> StoreResult<usize> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(StoreError::InvalidArgument(format!(
                "boost amount must be a non-negative number, got {amount}"
            )));
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let ids = ids.to_vec();
        let now = Utc::now().timestamp();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let mut updated = 0;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE lessons SET utility_score = MIN(utility_score + ?2, ?3), updated_at = ?4 \
                         WHERE id = ?1",
                    )?;
                    for id in &ids {
                        updated += stmt.execute(params![id, amount, MAX_UTILITY, now])?;
                    }
                }
                tx.commit()?;
                debug!(updated, amount, "lessons boosted");
                Ok(updated)
            })
            .await
    }

    // ── write ────────────────────────────────────────────────────────

    /// Store `lesson` unless its nearest neighbour in the same scope has
    /// similarity at or above `dedup_threshold`.
    ///
    /// Returns the new id, or `None` when the lesson was already known.
    #[instrument(skip(self, lesson), fields(scope = %lesson.scope))]
    pub async fn write_with_dedup(
        &self,
        lesson: NewLesson,
        dedup_threshold: f64,
    ) -> StoreResult<Option<String>> {
        let text = lesson.text.trim().to_string();
        if text.is_empty() {
            return Err(StoreError::InvalidArgument("lesson text is empty".into()));
        }

        let embedding = self.embedder.embed(&text).await?;
        if let Some((nearest_id, similarity)) = self.nearest(&text, &embedding, &lesson.scope).await?
            && similarity >= dedup_threshold
        {
            debug!(%nearest_id, similarity, "lesson already known, skipping write");
            return Ok(None);
        }

        let now = Utc::now().timestamp();
        let record = Lesson {
            id: Uuid::now_v7().to_string(),
            text,
            embedding,
            metadata: LessonMetadata {
                task_type: lesson.scope.task_type,
                criteria_hash: lesson.scope.criteria_hash,
                topic: lesson.topic,
                score: clamp_score(lesson.score),
                timestamp: now,
                iteration: lesson.iteration,
                utility_score: DEFAULT_UTILITY,
                consolidated: false,
            },
        };
        let id = record.id.clone();

        self.db
            .execute(move |conn| insert_lesson(conn, &record))
            .await?;

        info!(lesson_id = %id, "lesson written");
        Ok(Some(id))
    }

    /// Nearest lesson in `scope`. Identical text counts as similarity 1.0.
    async fn nearest(
        &self,
        text: &str,
        embedding: &[f32],
        scope: &Scope,
    ) -> StoreResult<Option<(String, f64)>> {
        let lessons = self.list_scope(scope).await?;
        Ok(lessons
            .into_iter()
            .map(|l| {
                let similarity = if l.text == text {
                    1.0
                } else {
                    cosine_similarity(embedding, &l.embedding)
                };
                (l.id, similarity)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1)))
    }

    // ── maintenance ──────────────────────────────────────────────────

    /// Decay and prune `scope`, then consolidate it if it is still crowded.
    ///
    /// Errors from the decay/prune transaction are returned. A failed
    /// consolidation is reported in [`MaintenanceReport::consolidation`]
    /// and leaves every existing lesson in place.
    #[instrument(skip(self, policy), fields(scope = %scope))]
    pub async fn run_maintenance(
        &self,
        scope: &Scope,
        policy: &MaintenancePolicy,
    ) -> StoreResult<MaintenanceReport> {
        if !policy.decay_rate.is_finite() || policy.decay_rate < 0.0 {
            return Err(StoreError::InvalidArgument(format!(
                "decay rate must be a non-negative number, got {}",
                policy.decay_rate
            )));
        }

        let (decayed, pruned) = self.decay_and_prune(scope, policy).await?;
        let remaining = self.count(scope).await?;

        let consolidation = if remaining > policy.consolidation_threshold {
            match self.consolidate(scope, policy.max_principles).await {
                Ok((replaced, principles)) => {
                    ConsolidationOutcome::Consolidated { replaced, principles }
                }
                Err(err) => {
                    warn!(%err, "consolidation abandoned, scope left unchanged");
                    ConsolidationOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            }
        } else {
            ConsolidationOutcome::NotNeeded
        };

        let remaining = match &consolidation {
            ConsolidationOutcome::Consolidated { .. } => self.count(scope).await?,
            _ => remaining,
        };

        info!(decayed, pruned, remaining, "maintenance pass complete");
        Ok(MaintenanceReport {
            scope: scope.clone(),
            decayed,
            pruned,
            consolidation,
            remaining,
        })
    }

    async fn decay_and_prune(
        &self,
        scope: &Scope,
        policy: &MaintenancePolicy,
    ) -> StoreResult<(usize, usize)> {
        let scope = scope.clone();
        let decay = policy.decay_rate;
        let floor = policy.prune_floor;
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let decayed = tx.execute(
                    "UPDATE lessons SET utility_score = MAX(utility_score - ?3, 0.0), updated_at = ?4 \
                     WHERE task_type = ?1 AND criteria_hash = ?2",
                    params![scope.task_type, scope.criteria_hash, decay, now],
                )?;
                let pruned = tx.execute(
                    "DELETE FROM lessons \
                     WHERE task_type = ?1 AND criteria_hash = ?2 AND utility_score < ?3",
                    params![scope.task_type, scope.criteria_hash, floor],
                )?;
                tx.commit()?;
                Ok((decayed, pruned))
            })
            .await
    }

    /// Replace every lesson in `scope` with at most `max_principles`
    /// principles. Nothing is deleted unless all principles are stored.
    async fn consolidate(&self, scope: &Scope, max_principles: usize) -> StoreResult<(usize, usize)> {
        let originals = self.list_scope(scope).await?;
        let texts: Vec<String> = originals.iter().map(|l| l.text.clone()).collect();
        let limit = max_principles.clamp(1, MAX_PRINCIPLES);

        let mut principles: Vec<String> = self
            .summarizer
            .summarize(&texts, limit)
            .await?
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        principles.truncate(limit);
        if principles.is_empty() {
            return Err(StoreError::Summarization(
                "summarizer returned no principles".into(),
            ));
        }

        let now = Utc::now().timestamp();
        let mean_score = originals.iter().map(|l| l.metadata.score).sum::<f64>()
            / originals.len().max(1) as f64;
        let topic = originals
            .iter()
            .max_by_key(|l| l.metadata.timestamp)
            .map(|l| l.metadata.topic.clone())
            .unwrap_or_default();

        let mut records = Vec::with_capacity(principles.len());
        for text in principles {
            let embedding = self.embedder.embed(&text).await?;
            records.push(Lesson {
                id: Uuid::now_v7().to_string(),
                text,
                embedding,
                metadata: LessonMetadata {
                    task_type: scope.task_type.clone(),
                    criteria_hash: scope.criteria_hash.clone(),
                    topic: topic.clone(),
                    score: clamp_score(mean_score),
                    timestamp: now,
                    iteration: 0,
                    utility_score: DEFAULT_UTILITY,
                    consolidated: true,
                },
            });
        }

        let original_ids: Vec<String> = originals.into_iter().map(|l| l.id).collect();
        let principle_count = records.len();

        // Principles go in first; the originals are only removed in the
        // same transaction, so a failed insert drops both changes.
        let replaced = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                for record in &records {
                    insert_lesson(&tx, record)?;
                }
                let mut replaced = 0;
                {
                    let mut stmt = tx.prepare("DELETE FROM lessons WHERE id = ?1")?;
                    for id in &original_ids {
                        replaced += stmt.execute([id])?;
                    }
                }
                tx.commit()?;
                Ok(replaced)
            })
            .await?;

        info!(replaced, principles = principle_count, "scope consolidated");
        Ok((replaced, principle_count))
    }

    // ── inspection ───────────────────────────────────────────────────

    /// Fetch one lesson, `None` if it does not exist.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Option<Lesson>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("SELECT {LESSON_COLUMNS} FROM lessons WHERE id = ?1"),
                    [&id],
                    LessonRow::from_row,
                );
                match result {
                    Ok(row) => Ok(Some(row.into_lesson())),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Every lesson in `scope`, oldest first.
    pub async fn list_scope(&self, scope: &Scope) -> StoreResult<Vec<Lesson>> {
        let scope = scope.clone();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LESSON_COLUMNS} FROM lessons \
                     WHERE task_type = ?1 AND criteria_hash = ?2 ORDER BY created_at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(
                        params![scope.task_type, scope.criteria_hash],
                        LessonRow::from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().map(LessonRow::into_lesson).collect())
            })
            .await
    }

    /// Number of lessons in `scope`.
    pub async fn count(&self, scope: &Scope) -> StoreResult<usize> {
        let scope = scope.clone();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM lessons WHERE task_type = ?1 AND criteria_hash = ?2",
                    params![scope.task_type, scope.criteria_hash],
                    |row| row.get(0),
                )?;
                Ok(count.max(0) as usize)
            })
            .await
    }

    /// Aggregates for every scope that holds at least one lesson.
    pub async fn scope_stats(&self) -> StoreResult<Vec<ScopeStats>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_type, criteria_hash, count(*), \
                            SUM(CASE WHEN consolidated THEN 1 ELSE 0 END), AVG(utility_score) \
                     FROM lessons GROUP BY task_type, criteria_hash \
                     ORDER BY task_type, criteria_hash",
                )?;
                let stats = stmt
                    .query_map([], |row| {
                        Ok(ScopeStats {
                            scope: Scope::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                            lessons: row.get::<_, i64>(2)?.max(0) as usize,
                            consolidated: row.get::<_, i64>(3)?.max(0) as usize,
                            mean_utility: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(stats)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Row mapping
// ═══════════════════════════════════════════════════════════════════════

const LESSON_COLUMNS: &str = "id, text, embedding, task_type, criteria_hash, topic, score, \
                              iteration, utility_score, consolidated, created_at";

struct LessonRow {
    id: String,
    text: String,
    embedding: Vec<u8>,
    task_type: String,
    criteria_hash: String,
    topic: String,
    score: f64,
    iteration: i64,
    utility_score: f64,
    consolidated: bool,
    created_at: i64,
}

impl LessonRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            text: row.get(1)?,
            embedding: row.get(2)?,
            task_type: row.get(3)?,
            criteria_hash: row.get(4)?,
            topic: row.get(5)?,
            score: row.get(6)?,
            iteration: row.get(7)?,
            utility_score: row.get(8)?,
            consolidated: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_lesson(self) -> Lesson {
        Lesson {
            id: self.id,
            text: self.text,
            embedding: blob_to_embedding(&self.embedding),
            metadata: LessonMetadata {
                task_type: self.task_type,
                criteria_hash: self.criteria_hash,
                topic: self.topic,
                score: self.score,
                timestamp: self.created_at,
                iteration: u32::try_from(self.iteration).unwrap_or(0),
                utility_score: self.utility_score,
                consolidated: self.consolidated,
            },
        }
    }
}

fn insert_lesson(conn: &Connection, lesson: &Lesson) -> StoreResult<()> {
    let m = &lesson.metadata;
    conn.execute(
        "INSERT INTO lessons (id, text, embedding, task_type, criteria_hash, topic, score, \
                              iteration, utility_score, consolidated, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            lesson.id,
            lesson.text,
            embedding_to_blob(&lesson.embedding),
            m.task_type,
            m.criteria_hash,
            m.topic,
            clamp_score(m.score),
            m.iteration,
            m.utility_score.clamp(0.0, MAX_UTILITY),
            m.consolidated,
            m.timestamp,
        ],
    )?;
    Ok(())
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

// ── tests ────────────────────────────────────────────────────────────
