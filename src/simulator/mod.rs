//! Lab simulation.
//!
//! A simulation drives one exercise through its whole lifecycle on a lab
//! host the way a student would: start it, grade it unsolved (labs only),
//! perform every extracted step, grade it solved, finish it and make sure
//! it can be started again. Every action is recorded as an [`ExecutedStep`]
//! and every defect as a [`Bug`].

pub mod bugs;
pub mod context;
pub mod course;
pub mod engine;
pub mod grading;
pub mod idempotency;
pub mod tty;
pub mod walker;


use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extractor::{ExerciseCache, ExerciseInstructions, ExerciseType, ExtractionOutcome, InstructionExtractor};
use crate::remote::{CommandOutcome, RemoteShell};

pub use bugs::{Bug, BugKind, Finding, Severity};
pub use context::ExecutionContext;
pub use course::{CourseResult, CourseRunner};
pub use engine::SimulationEngine;
pub use grading::{GradeReport, GradeVerdict};
pub use idempotency::IdempotencyReport;

/// Where a simulation is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connect,
    Start,
    GradeWithoutSolution,
    Instructions,
    StopContainer,
    GradeWithSolution,
    Finish,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::Start => "start",
            Phase::GradeWithoutSolution => "grade_without_solution",
            Phase::Instructions => "instructions",
            Phase::StopContainer => "stop_container",
            Phase::GradeWithSolution => "grade_with_solution",
            Phase::Finish => "finish",
            Phase::Complete => "complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepOutcome {
    Pass,
    Fail,
    Warn,
    Skip,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepOutcome::Pass => "PASS",
            StepOutcome::Fail => "FAIL",
            StepOutcome::Warn => "WARN",
            StepOutcome::Skip => "SKIP",
        };
        write!(f, "{}", label)
    }
}

/// One recorded action of a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedStep {
    /// Step number, or the lifecycle action for non-instruction phases
    pub step_number: String,
    pub phase: Phase,
    pub command: String,
    pub outcome: StepOutcome,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub note: Option<String>,
}

impl ExecutedStep {
    pub fn from_outcome(step_number: &str, phase: Phase, result: &CommandOutcome, outcome: StepOutcome) -> Self {
        Self {
            step_number: step_number.to_string(),
            phase,
            command: result.command.clone(),
            outcome,
            duration: result.elapsed,
            exit_code: Some(result.exit_code),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            note: result.message.clone(),
        }
    }

    pub fn skipped(step_number: &str, phase: Phase, command: &str, reason: &str) -> Self {
        Self {
            step_number: step_number.to_string(),
            phase,
            command: command.to_string(),
            outcome: StepOutcome::Skip,
            duration: Duration::ZERO,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            note: Some(reason.to_string()),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub simulation_id: String,
    pub exercise_id: String,
    pub exercise_type: ExerciseType,
    pub lab_name: String,
    pub host: String,
    /// Terminal phase: `Complete`, or the phase where the run stopped
    pub phase: Phase,
    pub success: bool,
    pub steps: Vec<ExecutedStep>,
    pub bugs: Vec<Bug>,
    /// Whether the unsolved grade failed as expected; `None` when not graded
    pub grade_without_solution: Option<bool>,
    /// Whether the solved grade passed as expected; `None` when not graded
    pub grade_with_solution: Option<bool>,
    pub container: Option<String>,
    pub cycle: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl SimulationResult {
    pub fn new(exercise: &ExerciseInstructions, host: &str, cycle: u32) -> Self {
        Self {
            simulation_id: Uuid::new_v4().to_string(),
            exercise_id: exercise.exercise_id.clone(),
            exercise_type: exercise.exercise_type,
            lab_name: exercise.lab_name().to_string(),
            host: host.to_string(),
            phase: Phase::Connect,
            success: false,
            steps: Vec::new(),
            bugs: Vec::new(),
            grade_without_solution: None,
            grade_with_solution: None,
            container: None,
            cycle,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Classifies a finding as a bug of the current phase.
    pub fn record(&mut self, finding: Finding) {
        let scope = bugs::BugScope {
            exercise_id: &self.exercise_id,
            lab_name: &self.lab_name,
            host: &self.host,
        };
        let bug = bugs::classify(&finding, self.phase, &scope, self.bugs.len() + 1);
        self.bugs.push(bug);
    }

    /// Instruction steps that passed. Lifecycle actions are not counted.
    pub fn steps_passed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.phase == Phase::Instructions && s.outcome == StepOutcome::Pass)
            .count()
    }

    pub fn steps_with(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn worst_severity(&self) -> Option<Severity> {
        self.bugs.iter().map(|b| b.severity).min()
    }

    /// Records the terminal phase and derives success from it.
    pub fn finish(&mut self, phase: Phase, duration: Duration) {
        self.phase = phase;
        self.success = phase == Phase::Complete;
        self.duration = duration;
    }
}

/// Extracts exercises from a content path and simulates them on a shell.
///
/// Extracted trees are cached per content path for the simulator's
/// lifetime, so repeated runs of one exercise parse the markup once.
pub struct LabSimulator {
    config: Config,
    content: PathBuf,
    extractor: InstructionExtractor,
    cache: ExerciseCache,
}

impl LabSimulator {
    pub fn new(config: Config, content: &Path) -> Self {
        let extractor = InstructionExtractor::new(config.lab.known_passwords.clone());
        Self {
            config,
            content: content.to_path_buf(),
            extractor,
            cache: ExerciseCache::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Looks up an exercise; a missing anchor is an error here.
    pub fn instructions(&mut self, exercise_id: &str) -> Result<ExerciseInstructions> {
        match self.cache.get_or_extract(&self.extractor, &self.content, exercise_id)? {
            ExtractionOutcome::Found(instructions) => Ok(*instructions),
            ExtractionOutcome::NotFound {
                exercise_id,
                files_searched,
            } => Err(Error::Extraction(format!(
                "exercise {} not found in {} content files under {}\n\nSuggestions:\n• Run 'labsim list {}' to see the available exercise ids\n• Check that the content path points at the unpacked course book",
                exercise_id,
                files_searched,
                self.content.display(),
                self.content.display()
            ))),
        }
    }

    pub fn run(&mut self, shell: &mut dyn RemoteShell, exercise_id: &str) -> Result<SimulationResult> {
        let instructions = self.instructions(exercise_id)?;
        Ok(SimulationEngine::new(shell, &self.config).run(&instructions))
    }

    pub fn run_idempotency(
        &mut self,
        shell: &mut dyn RemoteShell,
        exercise_id: &str,
        cycles: u32,
    ) -> Result<IdempotencyReport> {
        let instructions = self.instructions(exercise_id)?;
        let mut engine = SimulationEngine::new(shell, &self.config);
        Ok(idempotency::run_cycles(&mut engine, &instructions, cycles))
    }
}
