//! Repeated full cycles of one exercise.
//!
//! A course exercise is repeatable when every cycle succeeds on the host left
//! behind by the previous one. The driver stops at the first failed cycle;
//! when an earlier cycle passed, that failure is reported as a
//! non-idempotency defect on the failing cycle.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use super::bugs::{BugKind, Finding};
use super::engine::SimulationEngine;
use super::SimulationResult;
use crate::extractor::ExerciseInstructions;

#[derive(Debug, Clone, Serialize)]
pub struct IdempotencyReport {
    pub exercise_id: String,
    pub cycles_requested: u32,
    pub results: Vec<SimulationResult>,
    pub idempotent: bool,
    pub started_at: DateTime<Utc>,
}

impl IdempotencyReport {
    pub fn cycles_run(&self) -> usize {
        self.results.len()
    }

    /// First cycle that did not succeed.
    pub fn first_failure(&self) -> Option<&SimulationResult> {
        self.results.iter().find(|r| !r.success)
    }
}

pub fn run_cycles(engine: &mut SimulationEngine, exercise: &ExerciseInstructions, cycles: u32) -> IdempotencyReport {
    let cycles = cycles.max(1);
    let started_at = Utc::now();
    let mut results: Vec<SimulationResult> = Vec::new();

    for cycle in 1..=cycles {
        let mut result = engine.run_cycle(exercise, cycle);
        if result.success {
            info!("{} cycle {}/{} succeeded", exercise.exercise_id, cycle, cycles);
            results.push(result);
            continue;
        }

        if results.last().map(|r| r.success).unwrap_or(false) {
            warn!(
                "{} passed cycle {} but failed cycle {} in phase {}",
                exercise.exercise_id,
                cycle - 1,
                cycle,
                result.phase
            );
            let cause = result
                .bugs
                .first()
                .map(|b| b.description.clone())
                .unwrap_or_else(|| format!("stopped in phase {}", result.phase));
            result.record(Finding::new(
                BugKind::NonIdempotent,
                format!("cycle {} failed after cycle {} passed: {}", cycle, cycle - 1, cause),
            ));
        }
        results.push(result);
        break;
    }

    let idempotent = results.len() == cycles as usize && results.iter().all(|r| r.success);
    IdempotencyReport {
        exercise_id: exercise.exercise_id.clone(),
        cycles_requested: cycles,
        results,
        idempotent,
        started_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::extractor::ExerciseType;
    use crate::simulator::{Phase, Severity};
    use crate::test_support::{command, exercise, step, Reply, ScriptedShell};

    fn guided() -> ExerciseInstructions {
        exercise(
            "repeat-ge",
            ExerciseType::GuidedExercise,
            vec![step("1", "Run.", vec![command("echo hi")])],
        )
    }

    #[test]
    fn test_all_cycles_pass() {
        let mut shell = ScriptedShell::new("workstation");
        let config = Config::default();
        let mut engine = SimulationEngine::new(&mut shell, &config);

        let report = run_cycles(&mut engine, &guided(), 3);

        assert!(report.idempotent);
        assert_eq!(report.cycles_run(), 3);
        let cycles: Vec<u32> = report.results.iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, vec![1, 2, 3]);
        assert_eq!(shell.count_exact("lab start repeat-ge"), 6);
    }

    #[test]
    fn test_failure_after_pass_is_non_idempotent_and_stops() {
        // each cycle issues two starts: the real one and the cleanup check
        let mut shell = ScriptedShell::new("workstation").on_sequence(
            "lab start repeat-ge",
            vec![Reply::ok(""), Reply::ok(""), Reply::fail(1, "directory already exists")],
        );
        let config = Config::default();
        let mut engine = SimulationEngine::new(&mut shell, &config);

        let report = run_cycles(&mut engine, &guided(), 5);

        assert!(!report.idempotent);
        assert_eq!(report.cycles_run(), 2);
        let failed = report.first_failure().unwrap();
        assert_eq!(failed.cycle, 2);
        assert_eq!(failed.phase, Phase::Start);
        let bug = failed.bugs.iter().find(|b| b.kind == BugKind::NonIdempotent).unwrap();
        assert_eq!(bug.severity, Severity::P1);
        assert!(bug.description.contains("cycle 2 failed after cycle 1 passed"));
    }

    #[test]
    fn test_first_cycle_failure_is_not_idempotency_defect() {
        let mut shell = ScriptedShell::new("workstation").on("lab start repeat-ge", Reply::fail(1, "boom"));
        let config = Config::default();
        let mut engine = SimulationEngine::new(&mut shell, &config);

        let report = run_cycles(&mut engine, &guided(), 3);

        assert!(!report.idempotent);
        assert_eq!(report.cycles_run(), 1);
        assert!(report.results[0].bugs.iter().all(|b| b.kind != BugKind::NonIdempotent));
    }
}
