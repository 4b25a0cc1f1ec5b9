use anyhow::Result;
use clap::Args;
use log::info;
use std::path::PathBuf;

use labsim::remote::RemoteShell;
use labsim::simulator::LabSimulator;

#[derive(Args)]
#[command(about = "Simulate one exercise on a lab host")]
pub struct SimulateCommand {
    #[arg(help = "Course content directory or markup file")]
    content: PathBuf,

    #[arg(help = "Exercise id, e.g. deploy-app-ge")]
    exercise: String,

    #[arg(short, long, help = "Remote from the configuration (defaults to defaults.remote)")]
    remote: Option<String>,

    #[arg(short, long, help = "Configuration file (defaults to the user config directory)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Run the solve verb before grading with solution")]
    solve: bool,

    #[arg(long, help = "Run commands inside the exercise's development container")]
    containers: bool,

    #[arg(short, long, help = "Write the JSON result to a file")]
    output: Option<PathBuf>,

    #[arg(short, long, help = "Print a readable summary instead of JSON")]
    summary: bool,

    #[arg(short, long, help = "Include every executed step in the summary")]
    verbose: bool,
}

impl SimulateCommand {
    pub fn execute(self) -> Result<()> {
        let mut config = super::load_config(self.config.as_deref())?;
        if self.solve {
            config.lab.solve_before_grade = true;
        }
        if self.containers {
            config.container.enabled = true;
        }

        let mut session = super::open_session(&config, self.remote.as_deref())?;
        let mut simulator = LabSimulator::new(config, &self.content);

        info!("Simulating {} on {}", self.exercise, session.host());
        let result = simulator.run(&mut session, &self.exercise);
        session.disconnect();
        let result = result?;

        super::report(&result, self.output.as_deref(), self.summary, || {
            super::print_result(&result, self.verbose)
        })?;

        if !result.success {
            anyhow::bail!(
                "{} stopped in phase {} with {} bugs",
                result.exercise_id,
                result.phase,
                result.bugs.len()
            );
        }
        Ok(())
    }
}
