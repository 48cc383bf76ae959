//! Terminal rendering and prompts for the human review loop.

use std::io::{BufRead, Write};

use reflexion_agent::{Phase, RunStatus};

use crate::helpers::truncate;

/// What the reviewer chose at a paused run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewChoice {
    Continue,
    ViewDraft,
    OverrideCritique,
    Quit,
}

/// Map one line of input to a choice. Override is only accepted when
/// `allow_override` is set.
pub fn parse_choice(input: &str, allow_override: bool) -> Option<ReviewChoice> {
    match input.trim().to_ascii_lowercase().as_str() {
        "c" | "continue" => Some(ReviewChoice::Continue),
        "v" | "view" => Some(ReviewChoice::ViewDraft),
        "d" | "override" if allow_override => Some(ReviewChoice::OverrideCritique),
        "q" | "quit" => Some(ReviewChoice::Quit),
        _ => None,
    }
}

/// Print the review summary of a paused run.
pub fn write_summary(out: &mut dyn Write, status: &RunStatus) -> std::io::Result<()> {
    let s = &status.state;
    let pending = status
        .pending_next
        .map_or_else(|| "finished".to_owned(), |p| p.to_string());

    writeln!(out)?;
    writeln!(out, "  Run {}", status.run_id)?;
    writeln!(out, "  ─────────────────────────────────────")?;
    writeln!(out, "  Topic:          {}", s.topic)?;
    writeln!(out, "  Score:          {:.2} (threshold {:.2})", s.score, s.score_threshold)?;
    writeln!(out, "  Iteration:      {}/{}", s.iteration, s.max_iterations)?;
    writeln!(out, "  Next step:      {pending}{}", if status.is_paused { " (paused)" } else { "" })?;
    writeln!(out, "  Draft:          {} chars, revision {}", s.current_draft.chars().count(), s.revision_history.len())?;
    writeln!(out, "  Critique:       {}", if s.critique.is_empty() { "-" } else { s.critique.as_str() })?;
    if !s.reflections.is_empty() {
        writeln!(out, "  Reflections:")?;
        for (i, r) in s.reflections.iter().enumerate() {
            writeln!(out, "    {}. {}", i + 1, truncate(r, 100))?;
        }
    }
    if !s.graded_memories.is_empty() {
        writeln!(out, "  Lessons used:   {}", s.graded_memories.len())?;
    }
    writeln!(out)?;
    Ok(())
}

/// Ask until a valid choice is entered. End of input counts as quit.
pub fn prompt_choice(
    stdin: &mut dyn BufRead,
    out: &mut dyn Write,
    pending: Option<Phase>,
) -> std::io::Result<ReviewChoice> {
    let allow_override = pending == Some(Phase::Reflect);
    loop {
        write!(out, "  [c] continue  [v] view draft  ")?;
        if allow_override {
            write!(out, "[d] override critique  ")?;
        }
        write!(out, "[q] quit > ")?;
        out.flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            return Ok(ReviewChoice::Quit);
        }
        match parse_choice(&line, allow_override) {
            Some(choice) => return Ok(choice),
            None => writeln!(out, "  Invalid choice.")?,
        }
    }
}

/// Read a replacement critique. Empty input cancels.
pub fn read_critique(stdin: &mut dyn BufRead, out: &mut dyn Write) -> std::io::Result<Option<String>> {
    write!(out, "  New critique: ")?;
    out.flush()?;
    let mut line = String::new();
    stdin.read_line(&mut line)?;
    let critique = line.trim();
    Ok((!critique.is_empty()).then(|| critique.to_owned()))
}
