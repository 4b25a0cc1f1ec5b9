//! Command-line subcommands.

pub mod config;
pub mod course;
pub mod extract;
pub mod idempotency;
pub mod list;
pub mod simulate;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use labsim::config::Config;
use labsim::remote::SshSession;
use labsim::simulator::{SimulationResult, StepOutcome};

/// Loads the configuration from `path`, or from the default location.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) if !path.exists() => anyhow::bail!("Config file {} does not exist", path.display()),
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

/// Builds an unconnected session to the named remote, or the default one.
pub(crate) fn open_session(config: &Config, remote: Option<&str>) -> Result<SshSession> {
    let remote = config.resolve_remote(remote)?;
    log::debug!("Using lab host {}", remote.connection_string());
    Ok(SshSession::new(remote.clone()))
}

/// Writes `value` as pretty JSON to `output`, or to stdout.
pub(crate) fn emit_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// JSON to stdout by default; with `--output` the JSON goes to the file and
/// a summary to stdout.
pub(crate) fn report<T: Serialize>(value: &T, output: Option<&Path>, summary: bool, print: impl FnOnce()) -> Result<()> {
    match output {
        Some(path) => {
            emit_json(value, Some(path))?;
            print();
        }
        None if summary => print(),
        None => emit_json(value, None)?,
    }
    Ok(())
}

fn outcome_marker(outcome: StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Pass => "✓",
        StepOutcome::Fail => "✗",
        StepOutcome::Warn => "!",
        StepOutcome::Skip => "-",
    }
}

fn one_line(text: &str, width: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > width {
        let cut: String = line.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// Prints a human-readable report of one simulation.
pub(crate) fn print_result(result: &SimulationResult, verbose: bool) {
    let status = if result.success { "PASSED" } else { "FAILED" };
    println!(
        "{} ({}) on {} cycle {}: {}",
        result.exercise_id,
        result.exercise_type.label(),
        result.host,
        result.cycle,
        status
    );
    println!("  Simulation ID: {}", result.simulation_id);
    println!("  Phase reached: {}", result.phase);
    println!("  Duration: {:.1}s", result.duration.as_secs_f64());
    if let Some(container) = &result.container {
        println!("  Container: {}", container);
    }
    println!(
        "  Steps: {} passed, {} failed, {} warnings, {} skipped",
        result.steps_passed(),
        result.steps_with(StepOutcome::Fail),
        result.steps_with(StepOutcome::Warn),
        result.steps_with(StepOutcome::Skip)
    );
    if let Some(expected) = result.grade_without_solution {
        println!("  Grade without solution: {}", if expected { "failed as expected" } else { "UNEXPECTED" });
    }
    if let Some(expected) = result.grade_with_solution {
        println!("  Grade with solution: {}", if expected { "passed as expected" } else { "UNEXPECTED" });
    }

    if verbose {
        println!();
        for step in &result.steps {
            println!(
                "  {} [{:<12}] {:<8} {}",
                outcome_marker(step.outcome),
                step.phase.as_str(),
                step.step_number,
                one_line(&step.command, 80)
            );
            if let Some(note) = &step.note {
                if step.outcome != StepOutcome::Pass {
                    println!("      {}", one_line(note, 100));
                }
            }
        }
    }

    if result.bugs.is_empty() {
        return;
    }
    println!();
    println!("  Bugs ({}):", result.bugs.len());
    for bug in &result.bugs {
        println!("  [{}] {} {} ({})", bug.severity, bug.id, bug.description, bug.phase);
        println!("      Fix: {}", bug.fix);
        if verbose {
            for check in &bug.verification_steps {
                println!("      • {}", check);
            }
        }
    }
}
