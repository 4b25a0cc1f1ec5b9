use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use labsim::remote::RemoteShell;
use labsim::simulator::{IdempotencyReport, LabSimulator};

#[derive(Args)]
#[command(about = "Run full cycles of one exercise back to back to check it is repeatable")]
pub struct IdempotencyCommand {
    #[arg(help = "Course content directory or markup file")]
    content: PathBuf,

    #[arg(help = "Exercise id, e.g. deploy-app-ge")]
    exercise: String,

    #[arg(short = 'n', long, default_value = "3", help = "Number of cycles to run")]
    cycles: u32,

    #[arg(short, long, help = "Remote from the configuration (defaults to defaults.remote)")]
    remote: Option<String>,

    #[arg(short, long, help = "Configuration file (defaults to the user config directory)")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Write the JSON report to a file")]
    output: Option<PathBuf>,

    #[arg(short, long, help = "Print a readable summary instead of JSON")]
    summary: bool,

    #[arg(short, long, help = "Include every executed step in the summary")]
    verbose: bool,
}

impl IdempotencyCommand {
    pub fn execute(self) -> Result<()> {
        let config = super::load_config(self.config.as_deref())?;
        let mut session = super::open_session(&config, self.remote.as_deref())?;
        let mut simulator = LabSimulator::new(config, &self.content);

        let report = simulator.run_idempotency(&mut session, &self.exercise, self.cycles);
        session.disconnect();
        let report = report?;

        super::report(&report, self.output.as_deref(), self.summary, || {
            print_report(&report, self.verbose)
        })?;

        if !report.idempotent {
            let cycle = report.first_failure().map(|r| r.cycle).unwrap_or(0);
            anyhow::bail!("{} failed on cycle {}", report.exercise_id, cycle);
        }
        Ok(())
    }
}

fn print_report(report: &IdempotencyReport, verbose: bool) {
    for result in &report.results {
        super::print_result(result, verbose);
        println!();
    }
    println!(
        "{}: {} of {} cycles run, {}",
        report.exercise_id,
        report.cycles_run(),
        report.cycles_requested,
        if report.idempotent { "idempotent" } else { "NOT idempotent" }
    );
}
