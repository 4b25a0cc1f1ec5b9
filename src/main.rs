use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

use cli::config::ConfigCommand;
use cli::course::CourseCommand;
use cli::extract::ExtractCommand;
use cli::idempotency::IdempotencyCommand;
use cli::list::ListCommand;
use cli::simulate::SimulateCommand;

#[derive(Parser)]
#[command(name = "labsim")]
#[command(about = "Simulates hands-on lab exercises against a live lab host and reports the defects found", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    List(ListCommand),
    Extract(ExtractCommand),
    Simulate(SimulateCommand),
    Idempotency(IdempotencyCommand),
    Course(CourseCommand),
    Config(ConfigCommand),
}

fn main() -> Result<()> {
    // Initialize logging with INFO level by default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List(cmd) => cmd.execute(),
        Commands::Extract(cmd) => cmd.execute(),
        Commands::Simulate(cmd) => cmd.execute(),
        Commands::Idempotency(cmd) => cmd.execute(),
        Commands::Course(cmd) => cmd.execute(),
        Commands::Config(cmd) => cmd.execute(),
    }
}
