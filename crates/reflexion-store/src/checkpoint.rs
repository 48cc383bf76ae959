//! Durable checkpoints for refinement runs.
//!
//! A run writes one row per completed transition. The row with the highest
//! `seq` is the run's current state; earlier rows are kept as history. The
//! state snapshot is opaque JSON so this crate does not depend on the
//! controller's types.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// One persisted transition of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// 1-based, strictly increasing within a run.
    pub seq: i64,
    /// Phase that just completed.
    pub phase: String,
    /// Phase that will run on resume, `None` once the run has finished.
    pub next_phase: Option<String>,
    /// Whether the run is waiting at an interrupt point.
    pub paused: bool,
    /// Full state snapshot.
    pub state: serde_json::Value,
    /// Unix seconds.
    pub created_at: i64,
}

impl Checkpoint {
    /// Deserialize the snapshot into the caller's state type.
    pub fn state_as<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(self.state.clone())?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  CheckpointStore
// ═══════════════════════════════════════════════════════════════════════

/// Append-only checkpoint log on the `checkpoints` table.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a checkpoint for `run_id` and return it.
    #[instrument(skip(self, state))]
    pub async fn save<T: Serialize>(
        &self,
        run_id: &str,
        phase: &str,
        next_phase: Option<&str>,
        paused: bool,
        state: &T,
    ) -> StoreResult<Checkpoint> {
        if run_id.is_empty() {
            return Err(StoreError::InvalidArgument("run id is empty".into()));
        }

        let state = serde_json::to_value(state)?;
        let state_json = serde_json::to_string(&state)?;
        let run_id = run_id.to_string();
        let phase = phase.to_string();
        let next_phase = next_phase.map(str::to_string);
        let now = Utc::now().timestamp();

        let saved = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE run_id = ?1",
                    [&run_id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO checkpoints (run_id, seq, phase, next_phase, paused, state, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![run_id, seq, phase, next_phase, paused, state_json, now],
                )?;
                tx.commit()?;
                Ok(Checkpoint {
                    run_id,
                    seq,
                    phase,
                    next_phase,
                    paused,
                    state,
                    created_at: now,
                })
            })
            .await?;

        debug!(run_id = %saved.run_id, seq = saved.seq, phase = %saved.phase, paused, "checkpoint saved");
        Ok(saved)
    }

    /// The most recent checkpoint of `run_id`, `None` for an unknown run.
    #[instrument(skip(self))]
    pub async fn latest(&self, run_id: &str) -> StoreResult<Option<Checkpoint>> {
        let run_id = run_id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT run_id, seq, phase, next_phase, paused, state, created_at \
                     FROM checkpoints WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                    [&run_id],
                    CheckpointRow::from_row,
                );
                match result {
                    Ok(row) => row.into_checkpoint().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// Every checkpoint of `run_id`, oldest first.
    #[instrument(skip(self))]
    pub async fn history(&self, run_id: &str) -> StoreResult<Vec<Checkpoint>> {
        let run_id = run_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, seq, phase, next_phase, paused, state, created_at \
                     FROM checkpoints WHERE run_id = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map([&run_id], CheckpointRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
            })
            .await
    }

    /// Latest checkpoint of each run, most recently active run first.
    #[instrument(skip(self))]
    pub async fn list_runs(&self, limit: usize) -> StoreResult<Vec<Checkpoint>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.run_id, c.seq, c.phase, c.next_phase, c.paused, c.state, c.created_at \
                     FROM checkpoints c \
                     JOIN (SELECT run_id, MAX(seq) AS seq FROM checkpoints GROUP BY run_id) m \
                       ON c.run_id = m.run_id AND c.seq = m.seq \
                     ORDER BY c.created_at DESC, c.run_id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], CheckpointRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct CheckpointRow {
    run_id: String,
    seq: i64,
    phase: String,
    next_phase: Option<String>,
    paused: bool,
    state: String,
    created_at: i64,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            seq: row.get(1)?,
            phase: row.get(2)?,
            next_phase: row.get(3)?,
            paused: row.get(4)?,
            state: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_checkpoint(self) -> StoreResult<Checkpoint> {
        Ok(Checkpoint {
            run_id: self.run_id,
            seq: self.seq,
            phase: self.phase,
            next_phase: self.next_phase,
            paused: self.paused,
            state: serde_json::from_str(&self.state)?,
            created_at: self.created_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_store() -> CheckpointStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        CheckpointStore::new(db)
    }

    #[tokio::test]
    async fn save_assigns_increasing_sequence() {
        let store = setup_store().await;
        let a = store
            .save("run-1", "retrieve_memory", Some("grade_relevance"), false, &json!({"i": 0}))
            .await
            .unwrap();
        let b = store
            .save("run-1", "evaluate", Some("reflect"), true, &json!({"i": 1}))
            .await
            .unwrap();
        let other = store
            .save("run-2", "retrieve_memory", Some("grade_relevance"), false, &json!({}))
            .await
            .unwrap();

        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn latest_returns_highest_sequence() {
        let store = setup_store().await;
        store
            .save("run-1", "generate", Some("evaluate"), false, &json!({"draft": "v1"}))
            .await
            .unwrap();
        store
            .save("run-1", "evaluate", Some("finalize"), true, &json!({"draft": "v1", "score": 0.9}))
            .await
            .unwrap();

        let latest = store.latest("run-1").await.unwrap().unwrap();
        assert_eq!(latest.phase, "evaluate");
        assert_eq!(latest.next_phase.as_deref(), Some("finalize"));
        assert!(latest.paused);
        assert_eq!(latest.state["score"], json!(0.9));
    }

    #[tokio::test]
    async fn unknown_run_has_no_checkpoint() {
        let store = setup_store().await;
        assert!(store.latest("nope").await.unwrap().is_none());
        assert!(store.history("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_ordered_oldest_first() {
        let store = setup_store().await;
        for phase in ["retrieve_memory", "grade_relevance", "generate"] {
            store.save("run-1", phase, None, false, &json!({})).await.unwrap();
        }
        let phases: Vec<String> = store
            .history("run-1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.phase)
            .collect();
        assert_eq!(phases, vec!["retrieve_memory", "grade_relevance", "generate"]);
    }

    #[tokio::test]
    async fn list_runs_returns_one_row_per_run() {
        let store = setup_store().await;
        store.save("run-a", "generate", None, false, &json!({})).await.unwrap();
        store.save("run-a", "evaluate", None, true, &json!({})).await.unwrap();
        store.save("run-b", "generate", None, false, &json!({})).await.unwrap();

        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        let a = runs.iter().find(|c| c.run_id == "run-a").unwrap();
        assert_eq!(a.seq, 2);
        assert_eq!(store.list_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn typed_state_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Snapshot {
            iteration: u32,
            draft: String,
        }

        let store = setup_store().await;
        let snap = Snapshot {
            iteration: 2,
            draft: "text".into(),
        };
        store.save("run-1", "reflect", Some("retrieve_memory"), false, &snap).await.unwrap();
        let restored: Snapshot = store.latest("run-1").await.unwrap().unwrap().state_as().unwrap();
        assert_eq!(restored, snap);
    }

    #[tokio::test]
    async fn empty_run_id_is_rejected() {
        let store = setup_store().await;
        let err = store.save("", "x", None, false, &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
