//! The per-exercise state machine.
//!
//! Phases run strictly in order; the first phase that fails terminates the
//! run and becomes its terminal phase. Grading phases only run for labs.

use log::{error, info, warn};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Instant;

use super::bugs::{BugKind, Finding};
use super::context::ExecutionContext;
use super::grading::{self, GradeVerdict};
use super::walker::{walk, RemoteVisitor};
use super::{ExecutedStep, Phase, SimulationResult, StepOutcome};
use crate::config::{Config, ContainerSettings, LabSettings};
use crate::error::{Error, Result};
use crate::extractor::ExerciseInstructions;
use crate::lifecycle::{LifecycleResult, LifecycleRunner, LifecycleVerb};
use crate::remote::{ContainerRouter, RemoteShell};

static LAB_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("lab name regex is valid"));

/// Drives exercises through their lifecycle on one shell.
pub struct SimulationEngine<'a> {
    shell: &'a mut dyn RemoteShell,
    settings: LabSettings,
    containers: ContainerSettings,
    router: ContainerRouter,
}

impl<'a> SimulationEngine<'a> {
    pub fn new(shell: &'a mut dyn RemoteShell, config: &Config) -> Self {
        Self {
            shell,
            settings: config.lab.clone(),
            containers: config.container.clone(),
            router: ContainerRouter::new(config.container.clone(), config.lab.lifecycle_timeout()),
        }
    }

    pub fn host(&self) -> &str {
        self.shell.host()
    }

    pub fn run(&mut self, exercise: &ExerciseInstructions) -> SimulationResult {
        self.run_cycle(exercise, 1)
    }

    /// Runs one full cycle. Never fails: errors become a P0 bug.
    pub fn run_cycle(&mut self, exercise: &ExerciseInstructions, cycle: u32) -> SimulationResult {
        let started = Instant::now();
        let mut result = SimulationResult::new(exercise, self.shell.host(), cycle);
        info!("Simulating {} (cycle {}) on {}", exercise.exercise_id, cycle, result.host);

        let terminal = match self.drive(exercise, &mut result) {
            Ok(phase) => phase,
            Err(e) => {
                error!("Simulation of {} aborted in {}: {}", exercise.exercise_id, result.phase, e);
                result.record(Finding::new(BugKind::UnexpectedError, e.to_string()));
                result.phase
            }
        };
        result.finish(terminal, started.elapsed());

        if result.success {
            info!(
                "{} completed: {} steps passed, {} bugs",
                exercise.exercise_id,
                result.steps_passed(),
                result.bugs.len()
            );
        } else {
            warn!("{} stopped in phase {} with {} bugs", exercise.exercise_id, result.phase, result.bugs.len());
        }
        result
    }

    fn drive(&mut self, exercise: &ExerciseInstructions, result: &mut SimulationResult) -> Result<Phase> {
        let lab_name = exercise.lab_name();
        if !LAB_NAME.is_match(lab_name) {
            return Err(Error::Config(format!(
                "'{}' is not a usable lab name for exercise {}",
                lab_name, exercise.exercise_id
            )));
        }
        let lifecycle = LifecycleRunner::new(&self.settings).with_profile(exercise.profile().map(str::to_string));

        result.phase = Phase::Connect;
        if !self.connect(result) {
            return Ok(Phase::Connect);
        }

        result.phase = Phase::Start;
        let report = lifecycle.start_with_recovery(self.shell, lab_name);
        let mut attempts = report.attempts.iter();
        if let Some(first) = attempts.next() {
            result.steps.push(lifecycle_step("start", Phase::Start, first));
        }
        for recovery in &report.recovery {
            result.steps.push(lifecycle_step("recovery", Phase::Start, recovery));
        }
        for retry in attempts {
            result.steps.push(lifecycle_step("start", Phase::Start, retry));
        }
        if let Some(last) = report.last().filter(|r| !r.status.is_success()) {
            result.record(Finding::new(BugKind::StartFailed, last.status.describe()).with_command(&last.outcome.command));
            return Ok(Phase::Start);
        }

        let context = self.container_context(exercise, result);

        if exercise.exercise_type.is_lab() {
            result.phase = Phase::GradeWithoutSolution;
            let graded = lifecycle.run(self.shell, LifecycleVerb::Grade, lab_name);
            let (report, verdict) = grading::judge_unsolved(&graded.outcome);
            result.grade_without_solution = Some(verdict.is_expected());
            result
                .steps
                .push(grade_step(Phase::GradeWithoutSolution, &graded, &verdict).with_note(report.describe()));
            if let Some(finding) = grade_finding(verdict, &graded.outcome.command) {
                self.discard_container(&context);
                result.record(finding);
                return Ok(Phase::GradeWithoutSolution);
            }
        }

        result.phase = Phase::Instructions;
        let walked = {
            let mut visitor = RemoteVisitor::new(&mut *self.shell, &self.router, self.settings.command_timeout());
            walk(&exercise.steps, context, &mut visitor)
        };
        result.steps.extend(walked.steps);
        for finding in walked.findings {
            result.record(finding);
        }
        if walked.aborted {
            self.discard_container(&walked.context);
            return Ok(Phase::Instructions);
        }

        if let Some(binding) = &walked.context.container {
            result.phase = Phase::StopContainer;
            let removed = self.router.teardown(self.shell, binding);
            let outcome = if removed.is_success() {
                StepOutcome::Pass
            } else {
                StepOutcome::Warn
            };
            result
                .steps
                .push(ExecutedStep::from_outcome("stop container", Phase::StopContainer, &removed, outcome));
        }

        if exercise.exercise_type.is_lab() {
            result.phase = Phase::GradeWithSolution;
            if self.settings.solve_before_grade {
                let solved = lifecycle.run(self.shell, LifecycleVerb::Solve, lab_name);
                result.steps.push(lifecycle_step("solve", Phase::GradeWithSolution, &solved));
                if !solved.status.is_success() {
                    result.record(
                        Finding::new(BugKind::SolveFailed, solved.status.describe()).with_command(&solved.outcome.command),
                    );
                    return Ok(Phase::GradeWithSolution);
                }
            }
            let graded = lifecycle.run(self.shell, LifecycleVerb::Grade, lab_name);
            let (report, verdict) = grading::judge_solved(&graded.outcome);
            result.grade_with_solution = Some(verdict.is_expected());
            result
                .steps
                .push(grade_step(Phase::GradeWithSolution, &graded, &verdict).with_note(report.describe()));
            if let Some(finding) = grade_finding(verdict, &graded.outcome.command) {
                result.record(finding);
                return Ok(Phase::GradeWithSolution);
            }
        }

        result.phase = Phase::Finish;
        if !self.finish_and_verify(&lifecycle, lab_name, result) {
            return Ok(Phase::Finish);
        }
        Ok(Phase::Complete)
    }

    fn connect(&mut self, result: &mut SimulationResult) -> bool {
        if !self.shell.is_alive() {
            if let Err(e) = self.shell.connect() {
                error!("Cannot connect to {}: {}", self.shell.host(), e);
                result.record(Finding::new(BugKind::HostUnreachable, e.to_string()));
                return false;
            }
        }

        let probe = self
            .shell
            .exec(&format!("command -v {}", self.settings.binary), self.settings.command_timeout());
        if probe.is_success() {
            result
                .steps
                .push(ExecutedStep::from_outcome("connect", Phase::Connect, &probe, StepOutcome::Pass));
            return true;
        }

        result
            .steps
            .push(ExecutedStep::from_outcome("connect", Phase::Connect, &probe, StepOutcome::Fail));
        let finding = if probe.exit_code < 0 {
            Finding::new(BugKind::HostUnreachable, probe.summary())
        } else {
            Finding::new(
                BugKind::ToolMissing,
                format!("`{}` not found on PATH", self.settings.binary),
            )
            .with_command(&probe.command)
        };
        result.record(finding);
        false
    }

    /// Launches the exercise container, or falls back to the host.
    fn container_context(&mut self, exercise: &ExerciseInstructions, result: &mut SimulationResult) -> ExecutionContext {
        if !self.containers.enabled {
            return ExecutionContext::on_host();
        }
        match self.router.setup(self.shell, &exercise.exercise_id, exercise.lab_name()) {
            Ok(binding) => {
                info!("Running steps of {} in container {}", exercise.exercise_id, binding.name);
                result.container = Some(binding.name.clone());
                ExecutionContext::in_container(binding)
            }
            Err(e) => {
                warn!("Container setup for {} failed, running on the host: {}", exercise.exercise_id, e);
                ExecutionContext::on_host()
            }
        }
    }

    fn discard_container(&mut self, context: &ExecutionContext) {
        if let Some(binding) = &context.container {
            self.router.teardown(self.shell, binding);
        }
    }

    /// Finishes the exercise, then proves the environment is clean by
    /// starting and finishing it once more.
    fn finish_and_verify(&mut self, lifecycle: &LifecycleRunner, lab_name: &str, result: &mut SimulationResult) -> bool {
        let finished = lifecycle.run(self.shell, LifecycleVerb::Finish, lab_name);
        result.steps.push(lifecycle_step("finish", Phase::Finish, &finished));
        if !finished.status.is_success() {
            result.record(
                Finding::new(BugKind::FinishFailed, finished.status.describe()).with_command(&finished.outcome.command),
            );
            return false;
        }

        let restarted = lifecycle.run(self.shell, LifecycleVerb::Start, lab_name);
        result.steps.push(lifecycle_step("cleanup check start", Phase::Finish, &restarted));
        if !restarted.status.is_success() {
            result.record(
                Finding::new(BugKind::CleanupIncomplete, restarted.status.describe())
                    .with_command(&restarted.outcome.command),
            );
            return false;
        }

        let refinished = lifecycle.run(self.shell, LifecycleVerb::Finish, lab_name);
        result.steps.push(lifecycle_step("cleanup check finish", Phase::Finish, &refinished));
        if !refinished.status.is_success() {
            result.record(
                Finding::new(
                    BugKind::FinishFailed,
                    format!("second finish failed: {}", refinished.status.describe()),
                )
                .with_command(&refinished.outcome.command),
            );
            return false;
        }
        true
    }
}

fn lifecycle_step(label: &str, phase: Phase, run: &LifecycleResult) -> ExecutedStep {
    let outcome = if run.status.is_success() {
        StepOutcome::Pass
    } else {
        StepOutcome::Fail
    };
    let step = ExecutedStep::from_outcome(label, phase, &run.outcome, outcome);
    if run.status.is_success() {
        step
    } else {
        step.with_note(run.status.describe())
    }
}

fn grade_step(phase: Phase, graded: &LifecycleResult, verdict: &GradeVerdict) -> ExecutedStep {
    let outcome = if verdict.is_expected() {
        StepOutcome::Pass
    } else {
        StepOutcome::Fail
    };
    ExecutedStep::from_outcome("grade", phase, &graded.outcome, outcome)
}

fn grade_finding(verdict: GradeVerdict, command: &str) -> Option<Finding> {
    let finding = match verdict {
        GradeVerdict::Expected => return None,
        GradeVerdict::FalsePositive { detail } => Finding::new(BugKind::GradeFalsePositive, detail),
        GradeVerdict::FalseNegative { detail } => Finding::new(BugKind::GradeFalseNegative, detail),
        GradeVerdict::Crashed { detail } => Finding::new(BugKind::GradeScriptCrashed, detail),
    };
    Some(finding.with_command(command))
}
