use std::path::Path;

use sandbox::SandboxError;
use tracing::warn;

use crate::config::{Isolation, ProcessSandboxConfig};

/// Verify that the host can run guests with `config` before accepting work.
///
/// Checks the isolation binary, the interpreter, and that the base directory
/// is writable. Collects all failures into a single `BackendNotAvailable`.
pub async fn check_prerequisites(
    config: &ProcessSandboxConfig,
    interpreter: &Path,
) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    if which::which(interpreter).is_err() {
        errors.push(format!("interpreter not found: {}", interpreter.display()));
    }
    if let Isolation::Bubblewrap { binary } = &config.isolation {
        check_bwrap(binary, &mut errors).await;
    }
    if let Some(base) = &config.base_dir {
        check_writable(base, &mut errors).await;
    }
    if !config.isolation.protects_workspace() {
        warn!("isolation 'none' as root leaves staged workspaces writable; use bubblewrap");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

async fn check_bwrap(binary: &Path, errors: &mut Vec<String>) {
    if which::which(binary).is_err() {
        errors.push(format!("bubblewrap not found: {}", binary.display()));
        return;
    }
    // Unprivileged user namespaces may be disabled on the host.
    let probe = tokio::process::Command::new(binary)
        .args(["--unshare-all", "--ro-bind", "/", "/", "--", "true"])
        .output()
        .await;
    match probe {
        Ok(output) if output.status.success() => {}
        Ok(output) => errors.push(format!(
            "bubblewrap cannot create namespaces: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) => errors.push(format!("bubblewrap failed to start: {e}")),
    }
}

async fn check_writable(dir: &Path, errors: &mut Vec<String>) {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        errors.push(format!("cannot create {}: {e}", dir.display()));
        return;
    }
    if let Err(e) = tempfile::tempdir_in(dir) {
        errors.push(format!("{} is not writable: {e}", dir.display()));
    }
}
