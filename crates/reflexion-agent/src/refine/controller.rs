//! The refinement controller: drives runs between interrupt points and
//! persists every transition.

use std::sync::Arc;

use dashmap::DashMap;
use reflexion_store::{Checkpoint, CheckpointStore, MemoryStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{AgentError, Result};
use crate::llm::CompletionModel;
use crate::refine::nodes::{LoopSettings, Steps};
use crate::refine::state::{Phase, ResumeOverrides, RunStatus, WorkflowState};

/// One row of a run's checkpoint history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: i64,
    pub phase: Phase,
    pub pending_next: Option<Phase>,
    pub paused: bool,
    pub iteration: u32,
    pub score: f64,
    pub created_at: i64,
}

/// Runs the refinement state machine.
///
/// Cheap to clone; clones share the store handles and the per-run locks.
#[derive(Clone)]
pub struct RefinementController {
    model: Arc<dyn CompletionModel>,
    memory: MemoryStore,
    checkpoints: CheckpointStore,
    settings: LoopSettings,
    /// Serializes concurrent `resume` calls on the same run.
    run_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RefinementController {
    pub fn new(
        model: Arc<dyn CompletionModel>,
        memory: MemoryStore,
        checkpoints: CheckpointStore,
        settings: LoopSettings,
    ) -> Self {
        Self {
            model,
            memory,
            checkpoints,
            settings,
            run_locks: Arc::new(DashMap::new()),
        }
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks.entry(run_id.to_owned()).or_default().clone()
    }

    /// Drop the run's lock entry unless another caller still holds it.
    fn release_run_lock(&self, run_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.run_locks
            .remove_if(run_id, |_, held| Arc::strong_count(held) == 1);
    }

    // -- Run control ---------------------------------------------------------

    /// Start a run and drive it to its first interrupt point.
    #[instrument(skip(self, topic, criteria))]
    pub async fn start(
        &self,
        topic: &str,
        criteria: &str,
        max_iterations: u32,
        score_threshold: f64,
    ) -> Result<String> {
        if topic.trim().is_empty() {
            return Err(AgentError::ValidationError {
                reason: "topic must not be empty".into(),
            });
        }
        if criteria.trim().is_empty() {
            return Err(AgentError::ValidationError {
                reason: "criteria must not be empty".into(),
            });
        }
        if max_iterations == 0 {
            return Err(AgentError::ValidationError {
                reason: "max_iterations must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&score_threshold) {
            return Err(AgentError::ValidationError {
                reason: format!("score_threshold must be within [0, 1], got {score_threshold}"),
            });
        }

        // A fresh run id cannot be contended.
        let run_id = uuid::Uuid::now_v7().to_string();
        info!(%run_id, max_iterations, score_threshold, "starting refinement run");
        let state = WorkflowState::new(topic, criteria, max_iterations, score_threshold);
        self.drive(&run_id, state, Phase::RetrieveMemory).await?;
        Ok(run_id)
    }

    /// Continue a run from its latest checkpoint until the next interrupt
    /// point or completion.
    ///
    /// Overrides are only accepted while the run is paused before `reflect`.
    #[instrument(skip(self, overrides))]
    pub async fn resume(
        &self,
        run_id: &str,
        overrides: Option<ResumeOverrides>,
    ) -> Result<WorkflowState> {
        let lock = self.run_lock(run_id);
        let result = {
            let _guard = lock.lock().await;
            self.resume_locked(run_id, overrides).await
        };
        self.release_run_lock(run_id, lock);
        result
    }

    async fn resume_locked(
        &self,
        run_id: &str,
        overrides: Option<ResumeOverrides>,
    ) -> Result<WorkflowState> {
        let latest = self.latest_checkpoint(run_id).await?;
        let Some(pending) = parse_pending(&latest)? else {
            return Err(AgentError::RunFinished {
                run_id: run_id.to_owned(),
            });
        };
        let mut state: WorkflowState = latest.state_as()?;

        if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
            if !(latest.paused && pending == Phase::Reflect) {
                return Err(AgentError::InvalidOverride {
                    run_id: run_id.to_owned(),
                    reason: format!(
                        "overrides are only accepted while paused before reflect, run is pending {pending}"
                    ),
                });
            }
            if let Some(critique) = overrides.critique {
                if critique.trim().is_empty() {
                    return Err(AgentError::InvalidOverride {
                        run_id: run_id.to_owned(),
                        reason: "critique must not be empty".into(),
                    });
                }
                state.critique = critique;
                self.checkpoints
                    .save(
                        run_id,
                        Phase::Evaluate.as_str(),
                        Some(Phase::Reflect.as_str()),
                        true,
                        &state,
                    )
                    .await?;
                info!(%run_id, "critique overridden");
            }
        }

        info!(%run_id, from = %pending, "resuming run");
        self.drive(run_id, state, pending).await
    }

    /// Current status of a run.
    pub async fn get_state(&self, run_id: &str) -> Result<RunStatus> {
        let latest = self.latest_checkpoint(run_id).await?;
        to_status(latest)
    }

    /// Most recently active runs, newest first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunStatus>> {
        self.checkpoints
            .list_runs(limit)
            .await?
            .into_iter()
            .map(to_status)
            .collect()
    }

    /// Every checkpoint of a run, oldest first.
    pub async fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>> {
        let rows = self.checkpoints.history(run_id).await?;
        if rows.is_empty() {
            return Err(AgentError::RunNotFound {
                run_id: run_id.to_owned(),
            });
        }
        rows.into_iter()
            .map(|cp| -> Result<HistoryEntry> {
                let pending_next = parse_pending(&cp)?;
                let state: WorkflowState = cp.state_as()?;
                Ok(HistoryEntry {
                    seq: cp.seq,
                    phase: cp.phase.parse()?,
                    pending_next,
                    paused: cp.paused,
                    iteration: state.iteration,
                    score: state.score,
                    created_at: cp.created_at,
                })
            })
            .collect()
    }

    // -- Internals -----------------------------------------------------------

    async fn latest_checkpoint(&self, run_id: &str) -> Result<Checkpoint> {
        self.checkpoints
            .latest(run_id)
            .await?
            .ok_or_else(|| AgentError::RunNotFound {
                run_id: run_id.to_owned(),
            })
    }

    /// Execute phases from `next`, checkpointing after each, until the run
    /// pauses or finishes.
    async fn drive(
        &self,
        run_id: &str,
        mut state: WorkflowState,
        mut next: Phase,
    ) -> Result<WorkflowState> {
        let steps = Steps {
            model: self.model.as_ref(),
            memory: &self.memory,
            settings: &self.settings,
        };

        loop {
            let phase = next;
            let following = steps.run(phase, &mut state).await;
            let paused = following.is_some_and(Phase::is_interrupt_point);

            self.checkpoints
                .save(
                    run_id,
                    phase.as_str(),
                    following.map(Phase::as_str),
                    paused,
                    &state,
                )
                .await?;

            match following {
                None => {
                    info!(%run_id, iteration = state.iteration, score = state.score, "run finished");
                    return Ok(state);
                }
                Some(p) if paused => {
                    info!(%run_id, before = %p, score = state.score, "run paused");
                    return Ok(state);
                }
                Some(p) => {
                    debug!(%run_id, completed = %phase, next = %p, "phase complete");
                    next = p;
                }
            }
        }
    }
}

fn parse_pending(cp: &Checkpoint) -> Result<Option<Phase>> {
    cp.next_phase.as_deref().map(str::parse::<Phase>).transpose()
}

fn to_status(cp: Checkpoint) -> Result<RunStatus> {
    Ok(RunStatus {
        pending_next: parse_pending(&cp)?,
        phase: cp.phase.parse()?,
        is_paused: cp.paused,
        state: cp.state_as()?,
        updated_at: cp.created_at,
        run_id: cp.run_id,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use reflexion_store::{Database, Embedder, StoreError, StoreResult, Summarizer};

    use super::*;

    /// Answers by role: drafts, fixed evaluations, and reflections.
    struct Scripted {
        evaluations: StdMutex<VecDeque<String>>,
    }

    impl Scripted {
        fn new(evaluations: &[&str]) -> Self {
            Self {
                evaluations: StdMutex::new(evaluations.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl CompletionModel for Scripted {
        async fn complete(&self, role: &str, _task: &str) -> Result<String> {
            if role.contains("evaluator") {
                let next = self.evaluations.lock().unwrap().pop_front();
                return Ok(next.unwrap_or_else(|| r#"{"score": 0.2, "critique": "weak"}"#.into()));
            }
            if role.contains("reflective") {
                return Ok("Lean harder on concrete evidence.".into());
            }
            Ok("draft text".into())
        }
    }

    struct FlatEmbedder;

    #[async_trait]
    impl Embedder for FlatEmbedder {
        async fn embed(&self, _text: &str) -> StoreResult<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct NoSummary;

    #[async_trait]
    impl Summarizer for NoSummary {
        async fn summarize(&self, _l: &[String], _m: usize) -> StoreResult<Vec<String>> {
            Err(StoreError::Summarization("unused".into()))
        }
    }

    async fn controller(evaluations: &[&str]) -> RefinementController {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let memory = MemoryStore::new(db.clone(), Arc::new(FlatEmbedder), Arc::new(NoSummary));
        RefinementController::new(
            Arc::new(Scripted::new(evaluations)),
            memory,
            CheckpointStore::new(db),
            LoopSettings::default(),
        )
    }

    #[tokio::test]
    async fn start_pauses_before_reflect_on_low_score() {
        let ctl = controller(&[r#"{"score": 0.3, "critique": "thin"}"#]).await;
        let run_id = ctl.start("Topic", "criteria", 3, 0.7).await.unwrap();

        let status = ctl.get_state(&run_id).await.unwrap();
        assert!(status.is_paused);
        assert_eq!(status.phase, Phase::Evaluate);
        assert_eq!(status.pending_next, Some(Phase::Reflect));
        assert_eq!(status.state.critique, "thin");
        assert_eq!(status.state.revision_history.len(), 1);
    }

    #[tokio::test]
    async fn start_pauses_before_finalize_on_high_score() {
        let ctl = controller(&[r#"{"score": 0.9, "critique": "great"}"#]).await;
        let run_id = ctl.start("Topic", "criteria", 3, 0.7).await.unwrap();
        let status = ctl.get_state(&run_id).await.unwrap();
        assert_eq!(status.pending_next, Some(Phase::Finalize));

        let state = ctl.resume(&run_id, None).await.unwrap();
        assert_eq!(state.final_output.as_deref(), Some("draft text"));
        assert!(ctl.get_state(&run_id).await.unwrap().is_finished());
    }

    #[tokio::test]
    async fn invalid_start_arguments_are_rejected() {
        let ctl = controller(&[]).await;
        assert!(ctl.start(" ", "c", 3, 0.7).await.is_err());
        assert!(ctl.start("t", "c", 0, 0.7).await.is_err());
        assert!(ctl.start("t", "c", 3, 1.5).await.is_err());
        assert!(ctl.list_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let ctl = controller(&[]).await;
        assert!(matches!(
            ctl.resume("missing", None).await,
            Err(AgentError::RunNotFound { .. })
        ));
        assert!(matches!(
            ctl.get_state("missing").await,
            Err(AgentError::RunNotFound { .. })
        ));
        assert!(matches!(
            ctl.history("missing").await,
            Err(AgentError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn override_before_finalize_is_rejected_and_run_unchanged() {
        let ctl = controller(&[r#"{"score": 0.95, "critique": "fine"}"#]).await;
        let run_id = ctl.start("Topic", "criteria", 3, 0.7).await.unwrap();
        let before = ctl.get_state(&run_id).await.unwrap();

        let err = ctl
            .resume(&run_id, Some(ResumeOverrides::critique("actually bad")))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidOverride { .. }));
        assert_eq!(ctl.get_state(&run_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn run_locks_are_released_on_every_exit() {
        let ctl = controller(&[r#"{"score": 0.3, "critique": "thin"}"#]).await;
        let mut paused = Vec::new();
        for _ in 0..5 {
            paused.push(ctl.start("Topic", "criteria", 3, 0.7).await.unwrap());
        }
        assert_eq!(ctl.run_locks.len(), 0);

        assert!(ctl.resume("missing", None).await.is_err());
        assert_eq!(ctl.run_locks.len(), 0);

        // Paused again before reflect or finalize, not finished.
        ctl.resume(&paused[0], None).await.unwrap();
        assert!(!ctl.get_state(&paused[0]).await.unwrap().is_finished());
        assert_eq!(ctl.run_locks.len(), 0);

        let rejected = ctl
            .resume(&paused[1], Some(ResumeOverrides::critique("  ")))
            .await;
        assert!(matches!(rejected, Err(AgentError::InvalidOverride { .. })));
        assert_eq!(ctl.run_locks.len(), 0);
    }

    #[tokio::test]
    async fn history_records_each_transition() {
        let ctl = controller(&[r#"{"score": 0.3, "critique": "thin"}"#]).await;
        let run_id = ctl.start("Topic", "criteria", 3, 0.7).await.unwrap();
        let phases: Vec<Phase> = ctl
            .history(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.phase)
            .collect();
        assert_eq!(
            phases,
            vec![
                Phase::RetrieveMemory,
                Phase::GradeRelevance,
                Phase::Generate,
                Phase::Evaluate
            ]
        );
    }
}
