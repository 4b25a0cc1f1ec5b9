use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

use labsim::extractor::{
    ExerciseInstructions, ExtractionOutcome, InstructionExtractor, InstructionStep, StepAction,
};

#[derive(Serialize)]
struct ExtractReport<'a> {
    #[serde(flatten)]
    instructions: &'a ExerciseInstructions,
    total_commands: usize,
}

#[derive(Args)]
#[command(about = "Extract the instruction tree of one exercise")]
pub struct ExtractCommand {
    #[arg(help = "Course content directory or markup file")]
    content: PathBuf,

    #[arg(help = "Exercise id, e.g. deploy-app-ge")]
    exercise: String,

    #[arg(short, long, help = "Configuration file (defaults to the user config directory)")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Write the JSON tree to a file")]
    output: Option<PathBuf>,

    #[arg(short, long, help = "Print an indented outline instead of JSON")]
    tree: bool,
}

impl ExtractCommand {
    pub fn execute(self) -> Result<()> {
        let config = super::load_config(self.config.as_deref())?;
        let extractor = InstructionExtractor::new(config.lab.known_passwords.clone());

        let instructions = match extractor.extract(&self.content, &self.exercise)? {
            ExtractionOutcome::Found(instructions) => instructions,
            ExtractionOutcome::NotFound {
                exercise_id,
                files_searched,
            } => bail!(
                "Exercise '{}' not found in {} content files\n\nSuggestions:\n• Run 'labsim list {}' to see the available exercise ids",
                exercise_id,
                files_searched,
                self.content.display()
            ),
        };

        let report = ExtractReport {
            instructions: &instructions,
            total_commands: instructions.total_commands(),
        };
        super::report(&report, self.output.as_deref(), self.tree, || print_tree(&instructions))
    }
}

fn print_tree(instructions: &ExerciseInstructions) {
    println!("{} ({})", instructions.title, instructions.exercise_type.label());
    match &instructions.setup {
        Some(setup) => println!("Setup: {}", setup.command),
        None => println!("Setup: (none found, using lab name {})", instructions.lab_name()),
    }
    if !instructions.outcomes.is_empty() {
        println!("Outcomes:");
        for outcome in &instructions.outcomes {
            println!("  • {}", outcome);
        }
    }
    println!();
    println!("{} steps, {} actions", instructions.steps.len(), instructions.total_commands());
    println!("{:-<80}", "");
    for step in &instructions.steps {
        print_step(step, 0);
    }
}

fn print_step(step: &InstructionStep, depth: usize) {
    let indent = "  ".repeat(depth);
    let marker = if step.is_verification { " [verify]" } else { "" };
    println!("{}{}. {}{}", indent, step.number, step.lead, marker);
    for action in &step.actions {
        match action {
            StepAction::Command(command) => {
                println!("{}    $ {}", indent, command.text());
                for prompt in command.prompts() {
                    println!("{}      {} -> {}", indent, prompt.prompt, prompt.response);
                }
            }
            StepAction::File(file) => {
                println!("{}    [{:?} {}] {} lines", indent, file.kind, file.filename, file.content.lines().count());
            }
        }
    }
    for substep in &step.substeps {
        print_step(substep, depth + 1);
    }
}
