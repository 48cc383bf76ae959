//! CLI argument definitions for Reflexion.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Reflexion -- self-correcting long-form writing with lesson memory.
#[derive(Parser)]
#[command(
    name = "reflexion",
    version,
    about = "Reflexion -- self-correcting long-form writing",
    long_about = "Drafts, scores and revises long-form text, learning reusable lessons from \
                  each failed attempt. Runs pause for human review before every reflection \
                  and before the final output."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run and drive it to the first review point.
    Start {
        /// What to write about.
        #[arg(long, short)]
        topic: String,

        /// Criteria the text is judged against.
        #[arg(long, short)]
        criteria: String,

        /// Maximum number of reflect steps (config default if omitted).
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Score in [0, 1] that ends the loop (config default if omitted).
        #[arg(long)]
        score_threshold: Option<f64>,

        /// Enter the interactive review loop right away.
        #[arg(long)]
        review: bool,

        /// Write the final output to this file (with `--review`).
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Resume a paused run until its next review point.
    Resume {
        run_id: String,

        /// Replace the evaluator's critique (only before a reflection).
        #[arg(long)]
        critique: Option<String>,
    },

    /// Show the current state of a run.
    Status {
        run_id: String,

        /// Print the full state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Review a run interactively until it finishes or you quit.
    Review {
        run_id: String,

        /// Write the final output to this file.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// List recent runs.
    Runs {
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// Show every checkpoint of a run.
    History { run_id: String },

    /// Inspect and maintain the lesson memory.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

/// Actions on the lesson memory.
#[derive(Subcommand)]
pub enum MemoryAction {
    /// Search lessons for a topic and criteria.
    Search {
        #[arg(long, short)]
        topic: String,

        #[arg(long, short)]
        criteria: String,

        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum cosine similarity (config default if omitted).
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Show lesson counts and mean utility per scope.
    Stats,

    /// Run decay, pruning and consolidation on one scope.
    Maintain {
        /// Criteria identifying the scope.
        #[arg(long, short)]
        criteria: String,

        /// Task type of the scope (config default if omitted).
        #[arg(long)]
        task_type: Option<String>,
    },
}
