use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use labsim::extractor::{list_exercises, ExerciseType};

#[derive(Args)]
#[command(about = "List the exercises found in course content")]
pub struct ListCommand {
    #[arg(help = "Course content directory or markup file")]
    content: PathBuf,

    #[arg(long, help = "Only list labs")]
    labs: bool,

    #[arg(long, help = "Only list guided exercises")]
    guided: bool,

    #[arg(short, long, help = "Show the source file of each exercise")]
    verbose: bool,

    #[arg(long, help = "Print as JSON")]
    json: bool,
}

impl ListCommand {
    pub fn execute(self) -> Result<()> {
        let exercises: Vec<_> = list_exercises(&self.content)?
            .into_iter()
            .filter(|e| match e.exercise_type {
                ExerciseType::Lab => !self.guided,
                ExerciseType::GuidedExercise => !self.labs,
            })
            .collect();

        if self.json {
            return super::emit_json(&exercises, None);
        }

        if exercises.is_empty() {
            println!("No exercises found under {}", self.content.display());
            return Ok(());
        }

        println!("Found {} exercises in {}:", exercises.len(), self.content.display());
        println!("{:-<80}", "");
        for exercise in &exercises {
            println!("  {:<32} {:<4} {}", exercise.id, exercise.exercise_type.label(), exercise.title);
            if self.verbose {
                println!("  {:<32}      {}", "", exercise.source.display());
            }
        }

        Ok(())
    }
}
