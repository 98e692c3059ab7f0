mod cmd;
mod error;

use std::fmt;
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
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one analysis script against referenced files and print the envelope
    Execute(cmd::ExecuteArgs),
    /// List uploaded files, plus a public bucket's files when given
    Files(cmd::FilesArgs),
    /// Show the first rows of a stored file
    Preview(cmd::PreviewArgs),
    /// Generate a script for a question from file manifests
    Generate(cmd::GenerateArgs),
    /// Validate the config and verify host prerequisites
    Check(cmd::CheckArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Execute(args) => cmd::run_execute(args).await,
        Command::Files(args) => cmd::run_files(args).await.map(|()| ExitCode::SUCCESS),
        Command::Preview(args) => cmd::run_preview(args).await.map(|()| ExitCode::SUCCESS),
        Command::Generate(args) => cmd::run_generate(args).await,
        Command::Check(args) => cmd::run_check(args).await.map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
