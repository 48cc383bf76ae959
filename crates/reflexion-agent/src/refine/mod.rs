//! The self-correcting refinement loop.
//!
//! ```text
//! retrieve_memory -> grade_relevance -> generate -> evaluate -+-> reflect -> retrieve_memory
//!                                                             +-> finalize
//! ```
//!
//! Runs pause before `reflect` and before `finalize`, and every completed
//! phase is checkpointed so a run can be resumed after a restart.

pub mod controller;
pub mod nodes;
pub mod prompts;
pub mod state;

pub use controller::{HistoryEntry, RefinementController};
pub use nodes::{LoopSettings, decide, merge_lessons};
pub use state::{Phase, ResumeOverrides, RetrievedLesson, RunStatus, WorkflowState};
