//! The individual steps of the refinement loop.
//!
//! Each step mutates the run state in place and never fails: model and store
//! errors are logged and replaced by the fallbacks documented on each step.

use reflexion_store::{MaintenancePolicy, MemoryStore, NewLesson, Scope};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::llm::CompletionModel;
use crate::parse::{Evaluation, parse_evaluation, parse_verdicts};
use crate::refine::prompts;
use crate::refine::state::{Phase, RetrievedLesson, WorkflowState};

/// Retrieval and memory policy shared by all runs of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSettings {
    pub task_type: String,
    pub top_k: usize,
    pub similarity_threshold: f64,
    pub dedup_threshold: f64,
    /// Utility added to stored lessons judged relevant; `0` disables.
    pub relevance_boost: f64,
    pub maintenance: MaintenancePolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            task_type: "writing".into(),
            top_k: 5,
            similarity_threshold: 0.75,
            dedup_threshold: 0.92,
            relevance_boost: 0.1,
            maintenance: MaintenancePolicy::default(),
        }
    }
}

/// Pick the branch after evaluation.
pub fn decide(state: &WorkflowState) -> Phase {
    if state.score >= state.score_threshold || state.iteration >= state.max_iterations {
        Phase::Finalize
    } else {
        Phase::Reflect
    }
}

/// Merge session reflections with store hits, dropping exact duplicates
/// and keeping first-seen order.
pub fn merge_lessons(session: &[String], stored: Vec<RetrievedLesson>) -> Vec<RetrievedLesson> {
    let mut merged: Vec<RetrievedLesson> = Vec::with_capacity(session.len() + stored.len());
    let candidates = session.iter().cloned().map(RetrievedLesson::session).chain(stored);
    for lesson in candidates {
        if !merged.iter().any(|m| m.text == lesson.text) {
            merged.push(lesson);
        }
    }
    merged
}

/// Step executor borrowed by the controller for one drive.
pub struct Steps<'a> {
    pub model: &'a dyn CompletionModel,
    pub memory: &'a MemoryStore,
    pub settings: &'a LoopSettings,
}

impl Steps<'_> {
    fn scope(&self, state: &WorkflowState) -> Scope {
        Scope::for_criteria(self.settings.task_type.as_str(), &state.criteria)
    }

    /// Run `phase` and return the phase that follows, `None` after finalize.
    pub async fn run(&self, phase: Phase, state: &mut WorkflowState) -> Option<Phase> {
        match phase {
            Phase::RetrieveMemory => {
                self.retrieve_memory(state).await;
                Some(Phase::GradeRelevance)
            }
            Phase::GradeRelevance => {
                self.grade_relevance(state).await;
                Some(Phase::Generate)
            }
            Phase::Generate => {
                self.generate(state).await;
                Some(Phase::Evaluate)
            }
            Phase::Evaluate => {
                self.evaluate(state).await;
                Some(decide(state))
            }
            Phase::Reflect => {
                self.reflect(state).await;
                Some(Phase::RetrieveMemory)
            }
            Phase::Finalize => {
                finalize(state);
                None
            }
        }
    }

    /// Search the store for lessons in this run's scope and merge them with
    /// the run's own reflections. A store failure leaves only the latter.
    pub async fn retrieve_memory(&self, state: &mut WorkflowState) {
        let scope = self.scope(state);
        let stored = match self
            .memory
            .search(
                &state.retrieval_query(),
                &scope,
                self.settings.top_k,
                self.settings.similarity_threshold,
            )
            .await
        {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| RetrievedLesson {
                    id: Some(hit.lesson.id),
                    text: hit.lesson.text,
                    similarity: Some(hit.similarity),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, %scope, "lesson search failed, using session reflections only");
                Vec::new()
            }
        };

        state.retrieved_memories = merge_lessons(&state.reflections, stored);
        debug!(
            candidates = state.retrieved_memories.len(),
            session = state.reflections.len(),
            "lessons retrieved"
        );
    }

    /// Keep the candidates the model judges relevant, in one batched call.
    /// Any failure keeps every candidate.
    pub async fn grade_relevance(&self, state: &mut WorkflowState) {
        let candidates = std::mem::take(&mut state.retrieved_memories);
        if candidates.is_empty() {
            state.graded_memories = Vec::new();
            return;
        }

        let verdicts = match self
            .model
            .complete(prompts::GRADER_ROLE, &prompts::grade(state, &candidates))
            .await
        {
            Ok(raw) => {
                let parsed = parse_verdicts(&raw, candidates.len());
                if parsed.is_none() {
                    warn!(candidates = candidates.len(), "unusable relevance verdicts, keeping all");
                }
                parsed
            }
            Err(e) => {
                warn!(error = %e, "relevance grading failed, keeping all");
                None
            }
        };

        let graded: Vec<RetrievedLesson> = match &verdicts {
            Some(keep) => candidates
                .iter()
                .zip(keep)
                .filter(|(_, keep)| **keep)
                .map(|(c, _)| c.clone())
                .collect(),
            None => candidates.clone(),
        };

        if verdicts.is_some() && self.settings.relevance_boost > 0.0 {
            let ids: Vec<String> = graded.iter().filter_map(|l| l.id.clone()).collect();
            if !ids.is_empty() {
                match self.memory.boost(&ids, self.settings.relevance_boost).await {
                    Ok(n) => debug!(boosted = n, "relevant lessons reinforced"),
                    Err(e) => warn!(error = %e, "failed to boost relevant lessons"),
                }
            }
        }

        debug!(kept = graded.len(), of = candidates.len(), "lessons graded");
        state.retrieved_memories = candidates;
        state.graded_memories = graded;
    }

    /// Write a new draft. On failure the previous draft is carried forward.
    pub async fn generate(&self, state: &mut WorkflowState) {
        match self
            .model
            .complete(prompts::WRITER_ROLE, &prompts::draft(state))
            .await
        {
            Ok(draft) => state.current_draft = draft,
            Err(e) => warn!(error = %e, "draft generation failed, keeping previous draft"),
        }
        state.revision_history.push(state.current_draft.clone());
        debug!(
            revision = state.revision_history.len(),
            chars = state.current_draft.len(),
            "draft generated"
        );
    }

    /// Score the draft. Failures yield the neutral evaluation.
    pub async fn evaluate(&self, state: &mut WorkflowState) {
        let evaluation = match self
            .model
            .complete(prompts::EVALUATOR_ROLE, &prompts::evaluate(state))
            .await
        {
            Ok(raw) => {
                let e = parse_evaluation(&raw);
                if !e.parsed {
                    warn!("unparseable evaluation, using neutral score");
                }
                e
            }
            Err(e) => {
                warn!(error = %e, "evaluation failed, using neutral score");
                Evaluation::fallback()
            }
        };

        state.score = evaluation.score;
        state.critique = evaluation.critique;
        info!(score = state.score, iteration = state.iteration, "draft evaluated");
    }

    /// Turn the critique into a lesson, remember it, and maintain the scope.
    pub async fn reflect(&self, state: &mut WorkflowState) {
        let lesson = match self
            .model
            .complete(prompts::REFLECTOR_ROLE, &prompts::reflect(state))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_owned(),
            Ok(_) => {
                warn!("empty reflection, deriving lesson from critique");
                prompts::fallback_lesson(&state.critique)
            }
            Err(e) => {
                warn!(error = %e, "reflection failed, deriving lesson from critique");
                prompts::fallback_lesson(&state.critique)
            }
        };

        let scope = self.scope(state);
        let record = NewLesson {
            text: lesson.clone(),
            scope: scope.clone(),
            topic: state.topic.clone(),
            score: state.score,
            iteration: state.iteration,
        };

        state.iteration += 1;
        state.reflections.push(lesson);
        info!(iteration = state.iteration, "reflection recorded");

        match self
            .memory
            .write_with_dedup(record, self.settings.dedup_threshold)
            .await
        {
            Ok(Some(id)) => debug!(%id, %scope, "lesson stored"),
            Ok(None) => debug!(%scope, "similar lesson already stored, skipped"),
            Err(e) => warn!(error = %e, %scope, "failed to store lesson"),
        }

        match self
            .memory
            .run_maintenance(&scope, &self.settings.maintenance)
            .await
        {
            Ok(report) => debug!(
                %scope,
                decayed = report.decayed,
                pruned = report.pruned,
                remaining = report.remaining,
                "memory maintained"
            ),
            Err(e) => warn!(error = %e, %scope, "memory maintenance failed"),
        }
    }
}

/// Publish the current draft as the final output.
pub fn finalize(state: &mut WorkflowState) {
    state.final_output = Some(state.current_draft.clone());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use reflexion_store::{Database, Embedder, StoreError, StoreResult, Summarizer};

    use super::*;
    use crate::error::{AgentError, Result};

    /// Replies from a queue; an exhausted queue is a request failure.
    struct Script(Mutex<VecDeque<std::result::Result<String, String>>>);

    impl Script {
        fn new(replies: &[std::result::Result<&str, &str>]) -> Self {
            Self(Mutex::new(
                replies
                    .iter()
                    .copied()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ))
        }

        fn remaining(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionModel for Script {
        async fn complete(&self, _role: &str, _task: &str) -> Result<String> {
            let next = self.0.lock().unwrap().pop_front();
            match next {
                Some(Ok(text)) => Ok(text),
                Some(Err(reason)) => Err(AgentError::LlmRequestFailed { reason }),
                None => Err(AgentError::LlmRequestFailed {
                    reason: "script exhausted".into(),
                }),
            }
        }
    }

    struct LengthEmbedder;

    #[async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> StoreResult<Vec<f32>> {
            let words = text.split_whitespace().count() as f32;
            Ok(vec![1.0, words, text.len() as f32])
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> StoreResult<Vec<f32>> {
            Err(StoreError::Embedding("offline".into()))
        }
    }

    struct NoSummary;

    #[async_trait]
    impl Summarizer for NoSummary {
        async fn summarize(&self, _l: &[String], _m: usize) -> StoreResult<Vec<String>> {
            Err(StoreError::Summarization("unused".into()))
        }
    }

    async fn memory(embedder: Arc<dyn Embedder>) -> MemoryStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        MemoryStore::new(db, embedder, Arc::new(NoSummary))
    }

    fn state() -> WorkflowState {
        WorkflowState::new("Tidal energy", "clarity, evidence", 3, 0.7)
    }

    #[test]
    fn decide_finalizes_on_score_or_iteration_cap() {
        let mut s = state();
        s.score = 0.7;
        assert_eq!(decide(&s), Phase::Finalize);
        s.score = 0.69;
        assert_eq!(decide(&s), Phase::Reflect);
        s.iteration = 3;
        assert_eq!(decide(&s), Phase::Finalize);
    }

    #[test]
    fn merge_keeps_session_first_and_drops_exact_duplicates() {
        let session = vec!["a".to_string(), "b".to_string()];
        let stored = vec![
            RetrievedLesson {
                id: Some("1".into()),
                text: "b".into(),
                similarity: Some(0.9),
            },
            RetrievedLesson {
                id: Some("2".into()),
                text: "c".into(),
                similarity: Some(0.8),
            },
        ];
        let merged = merge_lessons(&session, stored);
        let texts: Vec<&str> = merged.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(merged[1].id, None);
    }

    #[tokio::test]
    async fn retrieve_falls_back_to_session_on_store_error() {
        let mem = memory(Arc::new(BrokenEmbedder)).await;
        let model = Script::new(&[]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        s.reflections = vec!["Use headings.".into()];
        steps.retrieve_memory(&mut s).await;
        assert_eq!(s.retrieved_memories, vec![RetrievedLesson::session("Use headings.")]);
    }

    #[tokio::test]
    async fn grading_without_candidates_makes_no_call() {
        let mem = memory(Arc::new(LengthEmbedder)).await;
        let model = Script::new(&[Ok("[true]")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        steps.grade_relevance(&mut s).await;
        assert!(s.graded_memories.is_empty());
        assert_eq!(model.remaining(), 1);
    }

    #[tokio::test]
    async fn grading_filters_by_verdict_and_keeps_all_on_garbage() {
        let mem = memory(Arc::new(LengthEmbedder)).await;
        let model = Script::new(&[Ok(r#"[false, true]"#), Ok("no idea")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        s.retrieved_memories = vec![RetrievedLesson::session("a"), RetrievedLesson::session("b")];
        steps.grade_relevance(&mut s).await;
        assert_eq!(s.graded_memories, vec![RetrievedLesson::session("b")]);

        steps.grade_relevance(&mut s).await;
        assert_eq!(s.graded_memories.len(), 2);
    }

    /// Write two unrelated lessons into the run's scope and return them as
    /// retrieval candidates.
    async fn stored_candidates(mem: &MemoryStore, s: &WorkflowState) -> Vec<RetrievedLesson> {
        let scope = Scope::for_criteria("writing", &s.criteria);
        let mut candidates = Vec::new();
        for text in ["Cite figures.", "Open with a scene"] {
            let id = mem
                .write_with_dedup(
                    NewLesson {
                        text: text.into(),
                        scope: scope.clone(),
                        topic: s.topic.clone(),
                        score: 0.4,
                        iteration: 0,
                    },
                    1.01,
                )
                .await
                .unwrap()
                .unwrap();
            candidates.push(RetrievedLesson {
                id: Some(id),
                text: text.into(),
                similarity: Some(0.9),
            });
        }
        candidates
    }

    async fn utility(mem: &MemoryStore, id: &Option<String>) -> f64 {
        let id = id.as_deref().unwrap();
        mem.get(id).await.unwrap().unwrap().metadata.utility_score
    }

    #[tokio::test]
    async fn grading_boosts_only_lessons_judged_relevant() {
        let mem = memory(Arc::new(LengthEmbedder)).await;
        let model = Script::new(&[Ok("[true, false]")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        let candidates = stored_candidates(&mem, &s).await;
        s.retrieved_memories = candidates.clone();
        steps.grade_relevance(&mut s).await;

        assert_eq!(s.graded_memories, vec![candidates[0].clone()]);
        let kept = utility(&mem, &candidates[0].id).await;
        let dropped = utility(&mem, &candidates[1].id).await;
        assert!((kept - (1.0 + settings.relevance_boost)).abs() < 1e-9);
        assert!((dropped - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn grading_fallback_boosts_nothing() {
        let mem = memory(Arc::new(LengthEmbedder)).await;
        let model = Script::new(&[Ok("both look fine to me")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        let candidates = stored_candidates(&mem, &s).await;
        s.retrieved_memories = candidates.clone();
        steps.grade_relevance(&mut s).await;

        assert_eq!(s.graded_memories, candidates);
        for c in &candidates {
            assert!((utility(&mem, &c.id).await - 1.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn generate_failure_carries_previous_draft() {
        let mem = memory(Arc::new(LengthEmbedder)).await;
        let model = Script::new(&[Ok("first draft"), Err("rate limited")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        steps.generate(&mut s).await;
        steps.generate(&mut s).await;
        assert_eq!(s.current_draft, "first draft");
        assert_eq!(s.revision_history, vec!["first draft", "first draft"]);
    }

    #[tokio::test]
    async fn evaluate_failure_is_neutral() {
        let mem = memory(Arc::new(LengthEmbedder)).await;
        let model = Script::new(&[Err("timeout")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        steps.evaluate(&mut s).await;
        assert_eq!(s.score, 0.5);
        assert_eq!(s.critique, crate::parse::PLACEHOLDER_CRITIQUE);
    }

    #[tokio::test]
    async fn reflect_stores_lesson_with_pre_increment_iteration() {
        let mem = memory(Arc::new(LengthEmbedder)).await;
        let model = Script::new(&[Ok("  I skipped the evidence; cite figures next time. ")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        s.score = 0.4;
        steps.reflect(&mut s).await;

        assert_eq!(s.iteration, 1);
        assert_eq!(s.reflections, vec!["I skipped the evidence; cite figures next time."]);

        let scope = Scope::for_criteria("writing", &s.criteria);
        let stored = mem.list_scope(&scope).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].metadata.iteration, 0);
        assert_eq!(stored[0].metadata.topic, "Tidal energy");
        assert!((stored[0].metadata.score - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reflect_failure_uses_critique_and_survives_store_outage() {
        let mem = memory(Arc::new(BrokenEmbedder)).await;
        let model = Script::new(&[Err("overloaded")]);
        let settings = LoopSettings::default();
        let steps = Steps {
            model: &model,
            memory: &mem,
            settings: &settings,
        };

        let mut s = state();
        s.critique = "No sources cited.".into();
        steps.reflect(&mut s).await;
        assert_eq!(s.iteration, 1);
        assert!(s.reflections[0].contains("No sources cited."));
    }

    #[test]
    fn finalize_copies_draft() {
        let mut s = state();
        s.current_draft = "done".into();
        finalize(&mut s);
        assert_eq!(s.final_output.as_deref(), Some("done"));
    }
}
