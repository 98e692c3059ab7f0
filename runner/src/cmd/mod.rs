mod check;
mod execute;
mod files;
mod generate;
mod preview;

use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use crate::error::{RunnerError, RunnerResult};

pub use check::{CheckArgs, run_check};
pub use execute::{ExecuteArgs, run_execute};
pub use files::{FilesArgs, run_files};
pub use generate::{GenerateArgs, run_generate};
pub use preview::{PreviewArgs, run_preview};

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to the engine YAML config file
    #[arg(long, short, env = "ENGINE_CONFIG")]
    pub config: PathBuf,
}

impl ConfigArgs {
    async fn load(&self) -> RunnerResult<engine::EngineConfig> {
        Ok(engine::config::load(&self.config).await?)
    }
}

/// Write `value` to stdout as pretty JSON.
fn print_json<T: Serialize>(value: &T) -> RunnerResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| RunnerError::Internal(format!("encode output: {e}")))?;
    println!("{text}");
    Ok(())
}
