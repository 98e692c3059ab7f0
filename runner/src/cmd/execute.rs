use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;
use engine::{ExecutionRequest, FileReference, Orchestrator};
use sandbox::GuestLanguage;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ConfigArgs, print_json};
use crate::error::{RunnerError, RunnerResult};

/// Exit code when the envelope reports a failure.
const EXIT_FAILED_EXECUTION: u8 = 2;

#[derive(Args)]
pub struct ExecuteArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Script file to run, or `-` to read it from stdin
    #[arg(long, short)]
    script: PathBuf,
    /// File reference, `uploaded:<key>` or `public:<bucket>/<key>` (repeatable)
    #[arg(long = "file", short = 'f')]
    files: Vec<FileReference>,
    /// Guest language of the script (python or sql)
    #[arg(long, short, default_value = "python")]
    language: GuestLanguage,
    /// Caller identity recorded in logs
    #[arg(long)]
    caller: Option<String>,
}

pub async fn run_execute(args: ExecuteArgs) -> RunnerResult<ExitCode> {
    let config = args.config.load().await?;
    let script = read_script(&args.script).await?;
    let orchestrator = Orchestrator::from_config(&config)?;

    let mut request = ExecutionRequest::new(script)
        .with_language(args.language)
        .with_files(args.files);
    if let Some(caller) = args.caller {
        request = request.with_caller(caller);
    }

    // Ctrl-C cancels the request; the envelope is still printed.
    let cancel = CancellationToken::new();
    let mut handle = orchestrator.spawn(request, cancel.clone());
    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling execution");
            cancel.cancel();
            handle.await
        }
    };
    let envelope = joined.map_err(|e| RunnerError::Internal(format!("execution task: {e}")))?;

    print_json(&envelope)?;
    Ok(if envelope.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED_EXECUTION)
    })
}

async fn read_script(path: &Path) -> RunnerResult<String> {
    if path == Path::new("-") {
        let mut script = String::new();
        tokio::io::stdin().read_to_string(&mut script).await?;
        return Ok(script);
    }
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::InvalidArgument(format!("read {}: {e}", path.display())))
}
