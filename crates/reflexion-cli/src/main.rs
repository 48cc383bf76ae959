//! CLI entry point for Reflexion.
//!
//! This binary provides the `reflexion` command: run control (`start`,
//! `resume`, `status`, `review`, `runs`, `history`) and lesson memory
//! inspection (`memory search|stats|maintain`).

mod cli;
mod helpers;
mod review;

use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use reflexion_agent::{ResumeOverrides, RunStatus};
use reflexion_store::{MaintenancePolicy, Scope};
use tracing::info;

use cli::{Cli, Commands, MemoryAction};
use helpers::{Access, App, format_timestamp, init_tracing, load_config, open_app, truncate};
use review::ReviewChoice;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let read_only = matches!(
        cli.command,
        Commands::Status { .. }
            | Commands::Runs { .. }
            | Commands::History { .. }
            | Commands::Memory {
                action: MemoryAction::Stats
            }
    );
    init_tracing(if read_only { "warn" } else { "info" });

    let config = load_config(&cli.config)?;
    let access = if read_only { Access::ReadOnly } else { Access::Online };
    let app = open_app(config, access).await?;

    match cli.command {
        Commands::Start {
            topic,
            criteria,
            max_iterations,
            score_threshold,
            review,
            output,
        } => {
            cmd_start(
                &app,
                &topic,
                &criteria,
                max_iterations,
                score_threshold,
                review,
                output.as_deref(),
            )
            .await
        }
        Commands::Resume { run_id, critique } => cmd_resume(&app, &run_id, critique).await,
        Commands::Status { run_id, json } => cmd_status(&app, &run_id, json).await,
        Commands::Review { run_id, output } => cmd_review(&app, &run_id, output.as_deref()).await,
        Commands::Runs { limit } => cmd_runs(&app, limit).await,
        Commands::History { run_id } => cmd_history(&app, &run_id).await,
        Commands::Memory { action } => match action {
            MemoryAction::Search {
                topic,
                criteria,
                top_k,
                threshold,
            } => cmd_memory_search(&app, &topic, &criteria, top_k, threshold).await,
            MemoryAction::Stats => cmd_memory_stats(&app).await,
            MemoryAction::Maintain {
                criteria,
                task_type,
            } => cmd_memory_maintain(&app, &criteria, task_type).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

async fn cmd_start(
    app: &App,
    topic: &str,
    criteria: &str,
    max_iterations: Option<u32>,
    score_threshold: Option<f64>,
    review: bool,
    output: Option<&Path>,
) -> Result<()> {
    let max_iterations = max_iterations.unwrap_or(app.config.refinement.max_iterations);
    let score_threshold = score_threshold.unwrap_or(app.config.refinement.score_threshold);

    let run_id = app
        .controller
        .start(topic, criteria, max_iterations, score_threshold)
        .await
        .context("failed to start run")?;
    println!("  Run started: {run_id}");

    if review {
        return cmd_review(app, &run_id, output).await;
    }

    let status = app.controller.get_state(&run_id).await?;
    print_summary(&status)?;
    println!("  Review with `reflexion review {run_id}`.");
    Ok(())
}

async fn cmd_resume(app: &App, run_id: &str, critique: Option<String>) -> Result<()> {
    let overrides = critique.map(ResumeOverrides::critique);
    let state = app
        .controller
        .resume(run_id, overrides)
        .await
        .with_context(|| format!("failed to resume run {run_id}"))?;

    if let Some(output) = &state.final_output {
        println!("{output}");
        return Ok(());
    }
    let status = app.controller.get_state(run_id).await?;
    print_summary(&status)
}

async fn cmd_status(app: &App, run_id: &str, json: bool) -> Result<()> {
    let status = app.controller.get_state(run_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    print_summary(&status)?;
    if let Some(output) = &status.state.final_output {
        println!("{output}");
    }
    Ok(())
}

/// Interactive loop: show the paused run, act on the reviewer's choice,
/// repeat until the run finishes or the reviewer quits.
async fn cmd_review(app: &App, run_id: &str, output: Option<&Path>) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let status = app.controller.get_state(run_id).await?;

        if status.is_finished() {
            let final_output = status.state.final_output.unwrap_or_default();
            println!();
            println!("  Run finished after {} iteration(s), score {:.2}.", status.state.iteration, status.state.score);
            println!();
            println!("{final_output}");
            if let Some(path) = output {
                write_output(path, &final_output)?;
                println!();
                println!("  Saved to {}", path.display());
            }
            return Ok(());
        }

        if !status.is_paused {
            info!(%run_id, "run was interrupted mid-loop, continuing");
            app.controller.resume(run_id, None).await?;
            continue;
        }

        print_summary(&status)?;
        let choice = review::prompt_choice(&mut stdin.lock(), &mut stdout.lock(), status.pending_next)?;

        match choice {
            ReviewChoice::Continue => {
                app.controller.resume(run_id, None).await?;
            }
            ReviewChoice::ViewDraft => {
                println!();
                println!("{}", status.state.current_draft);
                println!();
            }
            ReviewChoice::OverrideCritique => {
                let critique = review::read_critique(&mut stdin.lock(), &mut stdout.lock())?;
                match critique {
                    Some(text) => {
                        app.controller
                            .resume(run_id, Some(ResumeOverrides::critique(text)))
                            .await?;
                    }
                    None => println!("  Critique unchanged."),
                }
            }
            ReviewChoice::Quit => {
                println!("  Run left paused. Continue later with `reflexion review {run_id}`.");
                return Ok(());
            }
        }
    }
}

async fn cmd_runs(app: &App, limit: usize) -> Result<()> {
    let runs = app.controller.list_runs(limit).await?;
    if runs.is_empty() {
        println!("  No runs yet.");
        return Ok(());
    }

    println!();
    println!("  {:<38} {:<16} {:>5} {:>6}  {:<19}  TOPIC", "RUN", "NEXT", "ITER", "SCORE", "UPDATED");
    for run in &runs {
        let next = run
            .pending_next
            .map_or_else(|| "finished".to_owned(), |p| p.to_string());
        println!(
            "  {:<38} {:<16} {:>5} {:>6.2}  {:<19}  {}",
            run.run_id,
            next,
            run.state.iteration,
            run.state.score,
            format_timestamp(run.updated_at),
            truncate(&run.state.topic, 40)
        );
    }
    println!();
    Ok(())
}

async fn cmd_history(app: &App, run_id: &str) -> Result<()> {
    let entries = app.controller.history(run_id).await?;
    println!();
    for e in &entries {
        let next = e.pending_next.map_or_else(|| "-".to_owned(), |p| p.to_string());
        println!(
            "  #{:<3} {:<16} -> {:<16} iter {} score {:.2}{}  {}",
            e.seq,
            e.phase,
            next,
            e.iteration,
            e.score,
            if e.paused { "  [paused]" } else { "" },
            format_timestamp(e.created_at)
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

async fn cmd_memory_search(
    app: &App,
    topic: &str,
    criteria: &str,
    top_k: Option<usize>,
    threshold: Option<f64>,
) -> Result<()> {
    let scope = Scope::for_criteria(app.config.refinement.task_type.as_str(), criteria);
    let query = format!("{topic} {criteria}");
    let hits = app
        .memory
        .search(
            &query,
            &scope,
            top_k.unwrap_or(app.config.memory.top_k),
            threshold.unwrap_or(app.config.memory.similarity_threshold),
        )
        .await
        .context("lesson search failed")?;

    if hits.is_empty() {
        println!("  No lessons in scope {scope} above the threshold.");
        return Ok(());
    }
    println!();
    for hit in &hits {
        let m = &hit.lesson.metadata;
        println!(
            "  {:.3}  utility {:.2}{}  {}",
            hit.similarity,
            m.utility_score,
            if m.consolidated { "  [principle]" } else { "" },
            hit.lesson.text
        );
    }
    println!();
    Ok(())
}

async fn cmd_memory_stats(app: &App) -> Result<()> {
    let stats = app.memory.scope_stats().await?;
    if stats.is_empty() {
        println!("  Lesson memory is empty.");
        return Ok(());
    }
    println!();
    println!("  {:<24} {:>8} {:>12} {:>13}", "SCOPE", "LESSONS", "PRINCIPLES", "MEAN UTILITY");
    for s in &stats {
        println!(
            "  {:<24} {:>8} {:>12} {:>13.2}",
            s.scope.to_string(),
            s.lessons,
            s.consolidated,
            s.mean_utility
        );
    }
    println!();
    Ok(())
}

async fn cmd_memory_maintain(app: &App, criteria: &str, task_type: Option<String>) -> Result<()> {
    let task_type = task_type.unwrap_or_else(|| app.config.refinement.task_type.clone());
    let scope = Scope::for_criteria(task_type, criteria);
    let policy: MaintenancePolicy = app.config.maintenance_policy();

    let report = app
        .memory
        .run_maintenance(&scope, &policy)
        .await
        .context("memory maintenance failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn print_summary(status: &RunStatus) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    review::write_summary(&mut out, status)?;
    out.flush()?;
    Ok(())
}

fn write_output(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn output_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("out/nested/essay.md");
        write_output(&path, "final text").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "final text");
    }

    #[test]
    fn cli_parses_review_override_flow() {
        let cli = Cli::parse_from(["reflexion", "resume", "run-1", "--critique", "Cut the intro."]);
        match cli.command {
            Commands::Resume { run_id, critique } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(critique.as_deref(), Some("Cut the intro."));
            }
            _ => panic!("expected resume"),
        }
        assert_eq!(cli.config, PathBuf::from("config/default.toml"));
    }

    #[test]
    fn cli_parses_memory_search() {
        let cli = Cli::parse_from([
            "reflexion", "memory", "search", "--topic", "tides", "--criteria", "clarity", "--top-k", "3",
        ]);
        assert!(matches!(
            cli.command,
            Commands::Memory {
                action: MemoryAction::Search { top_k: Some(3), .. }
            }
        ));
    }
}
