//! Whole-course runs.
//!
//! Exercises are simulated in parallel on a bounded rayon pool, each worker
//! checking a session out of a shared [`SessionPool`]. Results come back in
//! the order the exercises were given.

use chrono::{DateTime, Utc};
use log::{error, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::time::{Duration, Instant};

use super::bugs::{BugKind, Finding};
use super::engine::SimulationEngine;
use super::{Phase, SimulationResult};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extractor::ExerciseInstructions;
use crate::remote::{RemoteShell, SessionPool};

#[derive(Debug, Clone, Serialize)]
pub struct CourseResult {
    pub course: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub results: Vec<SimulationResult>,
    /// Exercise ids that could not be extracted
    pub missing: Vec<String>,
}

impl CourseResult {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    pub fn total_bugs(&self) -> usize {
        self.results.iter().map(|r| r.bugs.len()).sum()
    }
}

/// Runs many exercises against a session pool.
pub struct CourseRunner {
    config: Config,
    host: String,
    workers: usize,
}

impl CourseRunner {
    pub fn new(config: Config, workers: usize) -> Self {
        let host = config
            .resolve_remote(None)
            .map(|remote| remote.host.clone())
            .unwrap_or_else(|_| "lab host".to_string());
        Self {
            config,
            host,
            workers: workers.max(1),
        }
    }

    /// Names the host in results for exercises that never got a session.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Simulates every exercise, calling `on_done` as each one finishes.
    pub fn run<S, F>(
        &self,
        course: &str,
        exercises: &[ExerciseInstructions],
        sessions: &SessionPool<S>,
        on_done: F,
    ) -> Result<CourseResult>
    where
        S: RemoteShell,
        F: Fn(&SimulationResult) + Sync,
    {
        let started = Instant::now();
        let started_at = Utc::now();
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build worker pool: {}", e)))?;

        info!("Simulating {} exercises from {} with {} workers", exercises.len(), course, self.workers);
        let results: Vec<SimulationResult> = pool.install(|| {
            exercises
                .par_iter()
                .map(|exercise| {
                    let result = self.run_one(exercise, sessions);
                    on_done(&result);
                    result
                })
                .collect()
        });

        Ok(CourseResult {
            course: course.to_string(),
            started_at,
            duration: started.elapsed(),
            results,
            missing: Vec::new(),
        })
    }

    fn run_one<S: RemoteShell>(&self, exercise: &ExerciseInstructions, sessions: &SessionPool<S>) -> SimulationResult {
        match sessions.checkout() {
            Ok(mut session) => SimulationEngine::new(&mut *session, &self.config).run(exercise),
            Err(e) => {
                error!("No session available for {}: {}", exercise.exercise_id, e);
                unreachable_result(exercise, &self.host, &e.to_string())
            }
        }
    }
}

/// A result for an exercise that never got a working session.
pub fn unreachable_result(exercise: &ExerciseInstructions, host: &str, detail: &str) -> SimulationResult {
    let mut result = SimulationResult::new(exercise, host, 1);
    result.record(Finding::new(BugKind::HostUnreachable, detail));
    result.finish(Phase::Connect, Duration::ZERO);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ExerciseType;
    use crate::test_support::{command, exercise, step, Reply, ScriptedShell};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exercises() -> Vec<ExerciseInstructions> {
        ["alpha-ge", "beta-ge", "gamma-ge", "delta-ge"]
            .iter()
            .map(|id| exercise(id, ExerciseType::GuidedExercise, vec![step("1", "Run.", vec![command("echo ok")])]))
            .collect()
    }

    #[test]
    fn test_results_keep_input_order() {
        let sessions = SessionPool::new(2, || {
            Ok(ScriptedShell::new("workstation").on("lab start gamma-ge", Reply::fail(1, "boom")))
        });
        let runner = CourseRunner::new(Config::default(), 3);
        let done = AtomicUsize::new(0);

        let course = runner
            .run("course", &exercises(), &sessions, |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let ids: Vec<&str> = course.results.iter().map(|r| r.exercise_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha-ge", "beta-ge", "gamma-ge", "delta-ge"]);
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(course.passed(), 3);
        assert_eq!(course.failed(), 1);
        assert!(!course.results[2].success);
        assert!(sessions.stats().unwrap().created <= 2);
    }

    #[test]
    fn test_unreachable_host_reports_p0_per_exercise() {
        let sessions = SessionPool::new(2, || Ok(ScriptedShell::new("workstation").unreachable()));
        let runner = CourseRunner::new(Config::default(), 2);

        let course = runner.run("course", &exercises(), &sessions, |_| {}).unwrap();

        assert_eq!(course.failed(), 4);
        for result in &course.results {
            assert_eq!(result.phase, Phase::Connect);
            assert_eq!(result.bugs[0].kind, BugKind::HostUnreachable);
            assert_eq!(result.bugs[0].severity, crate::simulator::Severity::P0);
        }
    }
}
