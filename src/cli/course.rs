use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use labsim::extractor::{list_exercises, ExerciseType, ExtractionOutcome, InstructionExtractor};
use labsim::remote::{SessionPool, SshSession};
use labsim::simulator::{CourseResult, CourseRunner, SimulationResult};

#[derive(Args)]
#[command(about = "Simulate every exercise of a course in parallel")]
pub struct CourseCommand {
    #[arg(help = "Course content directory")]
    content: PathBuf,

    #[arg(short, long, value_delimiter = ',', help = "Only these exercise ids (comma-separated)")]
    exercises: Vec<String>,

    #[arg(long, help = "Only simulate labs")]
    labs: bool,

    #[arg(long, help = "Only simulate guided exercises")]
    guided: bool,

    #[arg(short, long, help = "Parallel workers (defaults to pool.max_sessions)")]
    workers: Option<usize>,

    #[arg(short, long, help = "Remote from the configuration (defaults to defaults.remote)")]
    remote: Option<String>,

    #[arg(short, long, help = "Configuration file (defaults to the user config directory)")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Write the JSON course result to a file")]
    output: Option<PathBuf>,

    #[arg(short, long, help = "Print a readable summary instead of JSON")]
    summary: bool,

    #[arg(short, long, help = "Include the full report of every exercise in the summary")]
    verbose: bool,
}

impl CourseCommand {
    fn selected_ids(&self) -> Result<Vec<String>> {
        if !self.exercises.is_empty() {
            return Ok(self.exercises.clone());
        }
        Ok(list_exercises(&self.content)?
            .into_iter()
            .filter(|e| match e.exercise_type {
                ExerciseType::Lab => !self.guided,
                ExerciseType::GuidedExercise => !self.labs,
            })
            .map(|e| e.id)
            .collect())
    }

    pub fn execute(self) -> Result<()> {
        let config = super::load_config(self.config.as_deref())?;
        let remote = config.resolve_remote(self.remote.as_deref())?.clone();
        let course = self
            .content
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.content.display().to_string());

        let extractor = InstructionExtractor::new(config.lab.known_passwords.clone());
        let mut exercises = Vec::new();
        let mut missing = Vec::new();
        for outcome in extractor.extract_many(&self.content, &self.selected_ids()?)? {
            match outcome {
                ExtractionOutcome::Found(instructions) => exercises.push(*instructions),
                ExtractionOutcome::NotFound { exercise_id, .. } => {
                    warn!("Skipping {}: not found in {}", exercise_id, self.content.display());
                    missing.push(exercise_id);
                }
            }
        }
        if exercises.is_empty() {
            anyhow::bail!(
                "No exercises to simulate in {}\n\nSuggestions:\n• Run 'labsim list {}' to see the available exercise ids",
                self.content.display(),
                self.content.display()
            );
        }

        let workers = self.workers.unwrap_or(config.pool.max_sessions);
        let capacity = config.pool.max_sessions.max(workers);
        let host = remote.host.clone();
        let sessions = SessionPool::new(capacity, move || Ok(SshSession::new(remote.clone())));
        let runner = CourseRunner::new(config, workers).with_host(&host);

        let pb = ProgressBar::new(exercises.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );
        let passed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        let on_done = |result: &SimulationResult| {
            if result.success {
                passed.fetch_add(1, Ordering::Relaxed);
            } else {
                failed.fetch_add(1, Ordering::Relaxed);
                pb.println(format!("✗ {} stopped in {}", result.exercise_id, result.phase));
            }
            pb.set_message(format!(
                "✓{} ✗{}",
                passed.load(Ordering::Relaxed),
                failed.load(Ordering::Relaxed)
            ));
            pb.inc(1);
        };

        let mut result = runner.run(&course, &exercises, &sessions, on_done)?;
        pb.finish_with_message("done");
        result.missing = missing;

        if let Ok(stats) = sessions.stats() {
            info!(
                "Pool used {} sessions ({} replaced); oldest idle {:?}",
                stats.created, stats.replaced, stats.oldest_idle
            );
        }
        match sessions.close_all() {
            Ok(closed) => info!("Closed {} sessions to {}", closed, host),
            Err(e) => warn!("Failed to close sessions: {}", e),
        }

        super::report(&result, self.output.as_deref(), self.summary, || {
            print_course(&result, &host, self.verbose)
        })?;

        if result.failed() > 0 {
            anyhow::bail!("{} of {} exercises failed", result.failed(), result.results.len());
        }
        Ok(())
    }
}

fn print_course(result: &CourseResult, host: &str, verbose: bool) {
    if verbose {
        for exercise in &result.results {
            println!();
            super::print_result(exercise, true);
        }
    }
    println!();
    println!("Course {} on {}", result.course, host);
    println!("{:-<80}", "");
    for exercise in &result.results {
        let worst = exercise
            .worst_severity()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<32} {:<12} {:>3} bugs (worst {})",
            if exercise.success { "✓" } else { "✗" },
            exercise.exercise_id,
            exercise.phase.as_str(),
            exercise.bugs.len(),
            worst
        );
    }
    for id in &result.missing {
        println!("  ? {:<32} not found", id);
    }
    println!();
    println!(
        "Results: {} passed, {} failed, {} bugs in {:.1}s",
        result.passed(),
        result.failed(),
        result.total_bugs(),
        result.duration.as_secs_f64()
    );
}
