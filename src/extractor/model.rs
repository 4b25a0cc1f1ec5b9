use serde::Serialize;
use std::path::PathBuf;

use crate::remote::PromptResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExerciseType {
    GuidedExercise,
    Lab,
}

impl ExerciseType {
    /// Reads the type from an exercise heading such as "Lab: Managing Users".
    pub fn from_title(title: &str) -> Option<Self> {
        let lower = title.trim().to_lowercase();
        if lower.starts_with("lab:") {
            Some(ExerciseType::Lab)
        } else if lower.starts_with("guided exercise:") {
            Some(ExerciseType::GuidedExercise)
        } else {
            None
        }
    }

    /// Falls back to the id's type marker: `-lab` is a Lab, anything else a
    /// guided exercise.
    pub fn from_id(exercise_id: &str) -> Self {
        if exercise_id.ends_with("-lab") {
            ExerciseType::Lab
        } else {
            ExerciseType::GuidedExercise
        }
    }

    pub fn is_lab(&self) -> bool {
        matches!(self, ExerciseType::Lab)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExerciseType::GuidedExercise => "GE",
            ExerciseType::Lab => "Lab",
        }
    }
}

/// The documented `lab start` invocation for an exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupCommand {
    pub command: String,
    pub lab_name: String,
    /// Named profile passed with `-t`
    pub profile: Option<String>,
}

/// A shell command typed by the student.
///
/// Only constructible through [`Command::new`] and [`Command::with_prompts`],
/// which keep `is_interactive` in step with the prompt list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    text: String,
    is_interactive: bool,
    prompts: Vec<PromptResponse>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_prompts(text, Vec::new())
    }

    pub fn with_prompts(text: impl Into<String>, prompts: Vec<PromptResponse>) -> Self {
        Self {
            text: text.into(),
            is_interactive: !prompts.is_empty(),
            prompts,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_interactive(&self) -> bool {
        self.is_interactive
    }

    pub fn prompts(&self) -> &[PromptResponse] {
        &self.prompts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileActionKind {
    Create,
    Modify,
}

/// A file the student is told to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAction {
    pub filename: String,
    pub content: String,
    pub kind: FileActionKind,
}

impl FileAction {
    /// Normalizes `content` to end with exactly one newline.
    pub fn new(filename: impl Into<String>, content: &str, kind: FileActionKind) -> Self {
        let body = content.trim_end_matches(['\n', '\r']);
        Self {
            filename: filename.into(),
            content: format!("{}\n", body),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Command(Command),
    File(FileAction),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstructionStep {
    /// Dotted path such as `3.b.ii`
    pub number: String,
    pub lead: String,
    pub is_verification: bool,
    pub actions: Vec<StepAction>,
    pub substeps: Vec<InstructionStep>,
}

impl InstructionStep {
    pub fn action_count(&self) -> usize {
        self.actions.len() + self.substeps.iter().map(InstructionStep::action_count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExerciseInstructions {
    pub exercise_id: String,
    pub exercise_type: ExerciseType,
    pub title: String,
    pub outcomes: Vec<String>,
    pub setup: Option<SetupCommand>,
    pub steps: Vec<InstructionStep>,
    pub source: Option<PathBuf>,
}

impl ExerciseInstructions {
    /// Commands plus file actions across the whole tree.
    pub fn total_commands(&self) -> usize {
        self.steps.iter().map(InstructionStep::action_count).sum()
    }

    /// Name passed to the lifecycle verbs.
    pub fn lab_name(&self) -> &str {
        self.setup
            .as_ref()
            .map(|s| s.lab_name.as_str())
            .unwrap_or(&self.exercise_id)
    }

    pub fn profile(&self) -> Option<&str> {
        self.setup.as_ref().and_then(|s| s.profile.as_deref())
    }
}

/// Result of looking an exercise up in the content.
#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    Found(Box<ExerciseInstructions>),
    NotFound { exercise_id: String, files_searched: usize },
}

impl ExtractionOutcome {
    pub fn found(self) -> Option<ExerciseInstructions> {
        match self {
            ExtractionOutcome::Found(instructions) => Some(*instructions),
            ExtractionOutcome::NotFound { .. } => None,
        }
    }
}

/// An exercise anchor found while listing content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExerciseSummary {
    pub id: String,
    pub exercise_type: ExerciseType,
    pub title: String,
    pub source: PathBuf,
}
