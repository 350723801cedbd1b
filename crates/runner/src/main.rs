mod cmd;
mod engine;
mod error;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "runner", version)]
struct Cli {
    /// Path to the engine YAML config
    #[arg(long, short, global = true, env = "RUNNER_CONFIG", default_value = "engine.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured execution environments
    Environments,
    /// Execute one source file in a sandbox and print the outcome as JSON
    Run(cmd::RunArgs),
    /// Run a source file against a YAML list of test cases and print the grade
    Grade(cmd::GradeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Environments => cmd::run_environments(&cli.config)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::Run(args) => cmd::run_run(&cli.config, args).await,
        Command::Grade(args) => cmd::run_grade(&cli.config, args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
