//! Role and task instructions for each model-backed step.

use crate::refine::state::{RetrievedLesson, WorkflowState};

pub const WRITER_ROLE: &str = "You are a professional long-form writer. Write a complete, \
well-structured article of at least 1500 words on the given topic that satisfies the given \
criteria. Include an introduction, several developed body sections and a conclusion.";

pub const EVALUATOR_ROLE: &str = "You are a strict writing evaluator. Judge the article on \
depth and quality of argument, structural completeness (introduction, body, conclusion), \
length (strong articles run at least 1500 words and short ones lose points) and fit with the \
stated criteria. Only genuinely excellent work scores above 0.8.\n\
Reply with valid JSON only:\n\
{\"score\": <float between 0.0 and 1.0>, \"critique\": \"<specific problems and how to fix them>\"}";

pub const GRADER_ROLE: &str = "You decide whether past writing lessons apply to a new \
writing task. Reply with JSON only.";

pub const REFLECTOR_ROLE: &str = "You are a reflective learning agent. From a reviewer's \
critique, write one short lesson explaining what went wrong and what to do differently next \
time, e.g. \"I let the tone drift between sections; next time I will keep a formal register \
throughout.\" Reply with the lesson text only.";

/// Drafting instruction, listing the lessons to apply.
pub fn draft(state: &WorkflowState) -> String {
    let mut out = format!("Topic: {}\nCriteria: {}", state.topic, state.criteria);
    if !state.graded_memories.is_empty() {
        out.push_str("\n\nLessons learned from earlier attempts:\n");
        for lesson in &state.graded_memories {
            out.push_str("- ");
            out.push_str(&lesson.text);
            out.push('\n');
        }
        out.push_str("Apply every one of these lessons so the same mistakes are not repeated.");
    }
    out.push_str("\n\nWrite the complete article.");
    out
}

pub fn evaluate(state: &WorkflowState) -> String {
    format!(
        "Criteria: {}\n\nArticle:\n{}",
        state.criteria, state.current_draft
    )
}

/// Batched relevance question over all candidates, in order.
pub fn grade(state: &WorkflowState, candidates: &[RetrievedLesson]) -> String {
    let numbered: String = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}\n", i + 1, c.text))
        .collect();
    format!(
        "Task topic: {}\nTask criteria: {}\n\nCandidate lessons:\n{numbered}\n\
         For each candidate, in order, decide whether it would help with this task. \
         Respond with a JSON array of exactly {} booleans, for example [true, false].",
        state.topic,
        state.criteria,
        candidates.len()
    )
}

pub fn reflect(state: &WorkflowState) -> String {
    format!(
        "Score: {:.2}\n\nReviewer critique: {}\n\nCriteria: {}\n\nArticle:\n{}\n\n\
         Write the lesson.",
        state.score, state.critique, state.criteria, state.current_draft
    )
}

/// Lesson used when the reflection call fails.
pub fn fallback_lesson(critique: &str) -> String {
    let critique = critique.trim();
    if critique.is_empty() {
        "The draft fell short of the criteria; next time check every criterion explicitly \
         before finishing."
            .to_owned()
    } else {
        format!("Address this reviewer feedback next time: {critique}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_lists_graded_lessons_only_when_present() {
        let mut state = WorkflowState::new("Tides", "accuracy", 3, 0.7);
        assert!(!draft(&state).contains("Lessons learned"));

        state.graded_memories = vec![RetrievedLesson::session("Cite sources.")];
        let prompt = draft(&state);
        assert!(prompt.contains("Lessons learned"));
        assert!(prompt.contains("- Cite sources."));
    }

    #[test]
    fn grade_states_expected_length() {
        let state = WorkflowState::new("Tides", "accuracy", 3, 0.7);
        let candidates = vec![RetrievedLesson::session("a"), RetrievedLesson::session("b")];
        let prompt = grade(&state, &candidates);
        assert!(prompt.contains("1. a"));
        assert!(prompt.contains("2. b"));
        assert!(prompt.contains("exactly 2 booleans"));
    }

    #[test]
    fn fallback_lesson_carries_critique() {
        assert!(fallback_lesson("Needs data.").contains("Needs data."));
        assert!(!fallback_lesson("  ").is_empty());
    }
}
