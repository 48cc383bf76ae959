//! Run state and phases of the refinement loop.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// A lesson offered to the drafting step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedLesson {
    /// Store record id; `None` for reflections from the current run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

impl RetrievedLesson {
    pub fn session(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            similarity: None,
        }
    }
}

/// Everything a run knows. Checkpointed after every phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub topic: String,
    pub criteria: String,
    pub max_iterations: u32,
    pub score_threshold: f64,

    pub current_draft: String,
    /// One entry per drafting step.
    pub revision_history: Vec<String>,
    /// Lessons derived during this run, oldest first.
    pub reflections: Vec<String>,
    /// Number of reflect steps taken.
    pub iteration: u32,
    pub score: f64,
    pub critique: String,

    /// Recomputed on every pass.
    pub retrieved_memories: Vec<RetrievedLesson>,
    pub graded_memories: Vec<RetrievedLesson>,

    /// Set by the finalize step only.
    pub final_output: Option<String>,
}

impl WorkflowState {
    pub fn new(
        topic: impl Into<String>,
        criteria: impl Into<String>,
        max_iterations: u32,
        score_threshold: f64,
    ) -> Self {
        Self {
            topic: topic.into(),
            criteria: criteria.into(),
            max_iterations,
            score_threshold,
            current_draft: String::new(),
            revision_history: Vec::new(),
            reflections: Vec::new(),
            iteration: 0,
            score: 0.0,
            critique: String::new(),
            retrieved_memories: Vec::new(),
            graded_memories: Vec::new(),
            final_output: None,
        }
    }

    /// Query used for lesson retrieval.
    pub fn retrieval_query(&self) -> String {
        format!("{} {}", self.topic, self.criteria)
    }

    pub fn is_finished(&self) -> bool {
        self.final_output.is_some()
    }
}

/// A step of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RetrieveMemory,
    GradeRelevance,
    Generate,
    Evaluate,
    Reflect,
    Finalize,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetrieveMemory => "retrieve_memory",
            Self::GradeRelevance => "grade_relevance",
            Self::Generate => "generate",
            Self::Evaluate => "evaluate",
            Self::Reflect => "reflect",
            Self::Finalize => "finalize",
        }
    }

    /// Runs pause before entering these phases.
    pub fn is_interrupt_point(self) -> bool {
        matches!(self, Self::Reflect | Self::Finalize)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retrieve_memory" => Ok(Self::RetrieveMemory),
            "grade_relevance" => Ok(Self::GradeRelevance),
            "generate" => Ok(Self::Generate),
            "evaluate" => Ok(Self::Evaluate),
            "reflect" => Ok(Self::Reflect),
            "finalize" => Ok(Self::Finalize),
            other => Err(AgentError::ValidationError {
                reason: format!("unknown phase: {other}"),
            }),
        }
    }
}

/// Snapshot of a run as reported by `get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    /// Last completed phase.
    pub phase: Phase,
    pub is_paused: bool,
    /// Phase that runs on resume; `None` once finished.
    pub pending_next: Option<Phase>,
    pub state: WorkflowState,
    /// Unix seconds of the latest checkpoint.
    pub updated_at: i64,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        self.pending_next.is_none()
    }
}

/// State edits accepted by `resume`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeOverrides {
    /// Replaces the evaluator's critique. Only allowed before `reflect`.
    pub critique: Option<String>,
}

impl ResumeOverrides {
    pub fn critique(text: impl Into<String>) -> Self {
        Self {
            critique: Some(text.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.critique.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_roundtrip() {
        for phase in [
            Phase::RetrieveMemory,
            Phase::GradeRelevance,
            Phase::Generate,
            Phase::Evaluate,
            Phase::Reflect,
            Phase::Finalize,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
            assert_eq!(
                serde_json::to_value(phase).unwrap(),
                serde_json::json!(phase.as_str())
            );
        }
        assert!("draft".parse::<Phase>().is_err());
    }

    #[test]
    fn only_reflect_and_finalize_interrupt() {
        assert!(Phase::Reflect.is_interrupt_point());
        assert!(Phase::Finalize.is_interrupt_point());
        assert!(!Phase::Evaluate.is_interrupt_point());
    }

    #[test]
    fn retrieval_query_joins_topic_and_criteria() {
        let state = WorkflowState::new("Solar power", "clarity, evidence", 3, 0.7);
        assert_eq!(state.retrieval_query(), "Solar power clarity, evidence");
        assert!(!state.is_finished());
    }

    #[test]
    fn session_lessons_omit_store_fields() {
        let v = serde_json::to_value(RetrievedLesson::session("x")).unwrap();
        assert_eq!(v, serde_json::json!({"text": "x"}));
    }
}
