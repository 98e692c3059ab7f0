use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sandbox::{
    DeclaredResult, ExecRequest, GuestLanguage, GuestRequest, GuestRuntime, GuestStatus,
    RawOutcome, Result, Sandbox, SandboxError, TerminationReason,
};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::command::{GuestLaunch, build_command, format_command_display, guest_layout};
use crate::config::{Isolation, ProcessSandboxConfig};
use crate::limits::GuestRlimits;
use crate::monitor::{Ending, supervise};
use crate::paths::ExecutionPaths;
use crate::process::{ExitKind, decode_exit, sigxcpu};

/// Largest result slot read back from the guest.
const RESULT_SLOT_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Runs each guest as a fresh host process (optionally inside bubblewrap)
/// with its own process group, scratch directory, and channel directory.
pub struct ProcessSandbox {
    config: ProcessSandboxConfig,
    runtimes: Vec<Arc<dyn GuestRuntime>>,
}

impl ProcessSandbox {
    pub fn new(config: ProcessSandboxConfig, runtimes: Vec<Arc<dyn GuestRuntime>>) -> Self {
        if !config.isolation.protects_workspace() {
            warn!("isolation 'none' as root: guests can write to staged workspaces");
        }
        Self { config, runtimes }
    }

    pub fn config(&self) -> &ProcessSandboxConfig {
        &self.config
    }

    pub fn languages(&self) -> Vec<GuestLanguage> {
        self.runtimes.iter().map(|r| r.language()).collect()
    }

    fn runtime_for(&self, language: GuestLanguage) -> Result<&Arc<dyn GuestRuntime>> {
        self.runtimes
            .iter()
            .find(|r| r.language() == language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
    }

    fn via_bwrap(&self) -> bool {
        matches!(self.config.isolation, Isolation::Bubblewrap { .. })
    }

    fn create_exec_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("exec-");
        let dir = match &self.config.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn prepare(
        &self,
        runtime: &dyn GuestRuntime,
        request: &ExecRequest<'_>,
        paths: &ExecutionPaths,
    ) -> Result<()> {
        tokio::fs::create_dir(paths.scratch()).await?;
        tokio::fs::create_dir(paths.channel()).await?;
        tokio::fs::write(paths.script(), request.script).await?;
        for file in runtime.support_files() {
            tokio::fs::write(paths.support(file.name), file.contents).await?;
        }

        let layout = guest_layout(&self.config.isolation, paths, request.workspace.path());
        let data_dir = layout.data_dir.to_string_lossy();
        let scratch_dir = layout.scratch_dir.to_string_lossy();
        let descriptor = GuestRequest {
            data_dir: &data_dir,
            scratch_dir: &scratch_dir,
            files: request.workspace.entries(),
            max_result_rows: request.limits.max_result_rows,
        };
        let json = serde_json::to_vec(&descriptor)
            .map_err(|e| SandboxError::Protocol(format!("encode request: {e}")))?;
        tokio::fs::write(paths.request(), json).await?;
        Ok(())
    }

    async fn run(
        &self,
        runtime: &dyn GuestRuntime,
        request: &ExecRequest<'_>,
        paths: &ExecutionPaths,
    ) -> Result<RawOutcome> {
        self.prepare(runtime, request, paths).await?;

        let layout = guest_layout(&self.config.isolation, paths, request.workspace.path());
        let guest = runtime.command(&layout);
        let host_paths = runtime.host_paths();
        let launch = GuestLaunch {
            config: &self.config,
            guest: &guest,
            paths,
            workspace: request.workspace.path(),
            host_paths: &host_paths,
            rlimits: GuestRlimits::from_limits(request.limits, self.config.max_processes),
        };
        let mut cmd = build_command(&launch);
        debug!(command = %format_command_display(&cmd), "launching guest");

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            SandboxError::LaunchFailed(format!("{}: {e}", cmd.as_std().get_program().to_string_lossy()))
        })?;
        let supervised = supervise(
            &mut child,
            request.limits.wall_clock,
            request.limits.max_output_bytes,
            request.cancel,
        )
        .await?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ending = ?supervised.ending,
            stdout_bytes = supervised.output.stdout.len(),
            stderr_bytes = supervised.output.stderr.len(),
            "guest finished"
        );

        let output = supervised.output;
        let status = match supervised.ending {
            Ending::OutputLimit => return Ok(terminated(TerminationReason::OutputSize, output)),
            Ending::WallClock => return Ok(terminated(TerminationReason::WallClock, output)),
            Ending::Cancelled => return Ok(terminated(TerminationReason::Cancelled, output)),
            Ending::Exited(status) => status,
        };

        let code = match decode_exit(status, self.via_bwrap()) {
            ExitKind::Signal(signal) if signal == sigxcpu() => {
                return Ok(terminated(TerminationReason::CpuTime, output));
            }
            ExitKind::Signal(signal) => {
                return Ok(terminated(
                    TerminationReason::AbnormalExit {
                        code: None,
                        signal: Some(signal),
                    },
                    output,
                ));
            }
            ExitKind::Code(code) => code,
        };

        let abnormal = TerminationReason::AbnormalExit {
            code: Some(code),
            signal: None,
        };
        let Some(guest_status) = read_status(paths).await? else {
            return Ok(terminated(abnormal, output));
        };
        if let Some(fault) = guest_status.fault() {
            return Ok(RawOutcome::Faulted { fault, output });
        }
        if guest_status == GuestStatus::Memory {
            return Ok(terminated(TerminationReason::Memory, output));
        }
        if code != 0 {
            return Ok(terminated(abnormal, output));
        }

        match read_result(paths).await? {
            Some(declared) => Ok(RawOutcome::Completed { declared, output }),
            None => Ok(terminated(TerminationReason::OutputSize, output)),
        }
    }
}

fn terminated(reason: TerminationReason, output: sandbox::CapturedOutput) -> RawOutcome {
    RawOutcome::Terminated { reason, output }
}

async fn read_status(paths: &ExecutionPaths) -> Result<Option<GuestStatus>> {
    match tokio::fs::read(paths.status()).await {
        Ok(bytes) => GuestStatus::from_slot(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read the declared result. `None` when the slot exceeds the size ceiling.
async fn read_result(paths: &ExecutionPaths) -> Result<Option<DeclaredResult>> {
    let path = paths.result();
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Some(DeclaredResult::Absent));
        }
        Err(e) => return Err(e.into()),
    };
    if meta.len() > RESULT_SLOT_MAX_BYTES {
        return Ok(None);
    }
    let bytes = tokio::fs::read(&path).await?;
    DeclaredResult::from_slot(&bytes).map(Some)
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        match self.config.isolation {
            Isolation::None => "process",
            Isolation::Bubblewrap { .. } => "bubblewrap",
        }
    }

    async fn execute(&self, request: &ExecRequest<'_>) -> Result<RawOutcome> {
        let runtime = self.runtime_for(request.language)?;
        let exec_dir = self.create_exec_dir()?;
        let paths = ExecutionPaths::new(exec_dir.path().to_path_buf());

        let outcome = self.run(runtime.as_ref(), request, &paths).await;

        if let Err(e) = exec_dir.close() {
            warn!(path = %paths.root().display(), error = %e, "scratch teardown failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sandbox::{
        FaultKind, FormatHint, ManifestEntry, SandboxLimits, Workspace, WorkspaceBuilder,
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::python::PythonRuntime;

    fn python_available() -> bool {
        which::which("python3").is_ok()
    }

    fn sandbox(base: &std::path::Path) -> ProcessSandbox {
        let runtimes: Vec<Arc<dyn GuestRuntime>> = vec![
            Arc::new(PythonRuntime::new("python3", GuestLanguage::Python).unwrap()),
            Arc::new(PythonRuntime::new("python3", GuestLanguage::Sql).unwrap()),
        ];
        ProcessSandbox::new(
            ProcessSandboxConfig {
                base_dir: Some(base.to_path_buf()),
                ..ProcessSandboxConfig::default()
            },
            runtimes,
        )
    }

    fn limits() -> SandboxLimits {
        SandboxLimits {
            cpu_time: Duration::from_secs(2),
            wall_clock: Duration::from_secs(10),
            memory_bytes: 1024 * 1024 * 1024,
            max_output_bytes: 64 * 1024,
            max_result_rows: 100,
        }
    }

    async fn workspace(base: &std::path::Path) -> Workspace {
        let mut builder = WorkspaceBuilder::create(Some(base.join("ws").as_path())).unwrap();
        let bytes = b"city,population\nOslo,700000\nBergen,290000\nTromso,77000\n";
        builder
            .stage(
                ManifestEntry {
                    name: "cities.csv".into(),
                    alias: "cities".into(),
                    byte_size: bytes.len() as u64,
                    format_hint: FormatHint::Tabular,
                    origin: "uploaded".into(),
                    location: "bucket/cities.csv".into(),
                    digest: String::new(),
                },
                bytes,
            )
            .await
            .unwrap();
        builder.seal().unwrap()
    }

    async fn run(script: &str, language: GuestLanguage, limits: SandboxLimits) -> RawOutcome {
        let base = tempfile::tempdir().unwrap();
        let sb = sandbox(base.path());
        let ws = workspace(base.path()).await;
        let cancel = CancellationToken::new();
        let request = ExecRequest {
            script,
            language,
            workspace: &ws,
            limits: &limits,
            cancel: &cancel,
        };
        let outcome = sb.execute(&request).await.unwrap();
        ws.release().unwrap();
        outcome
    }

    #[tokio::test]
    async fn reads_staged_table() {
        if !python_available() {
            eprintln!("python3 not available, skipping");
            return;
        }
        let outcome = run("result = read_table(files[0])", GuestLanguage::Python, limits()).await;
        match outcome {
            RawOutcome::Completed {
                declared: DeclaredResult::Table { columns, rows, truncated },
                ..
            } => {
                assert_eq!(columns, vec!["city", "population"]);
                assert_eq!(rows.len(), 3);
                assert_eq!(rows[0], vec![json!("Oslo"), json!(700000)]);
                assert!(!truncated);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_result_is_absent() {
        if !python_available() {
            return;
        }
        let outcome = run("print('hello')", GuestLanguage::Python, limits()).await;
        match outcome {
            RawOutcome::Completed { declared, output } => {
                assert_eq!(declared, DeclaredResult::Absent);
                assert_eq!(output.stdout_lossy(), "hello\n");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn division_by_zero_is_runtime_fault() {
        if !python_available() {
            return;
        }
        let outcome = run("x = 1 / 0", GuestLanguage::Python, limits()).await;
        match outcome {
            RawOutcome::Faulted { fault, .. } => {
                assert_eq!(fault.kind, FaultKind::Runtime);
                assert!(fault.message.starts_with("ZeroDivisionError"), "got: {}", fault.message);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparsable_script_is_syntax_fault() {
        if !python_available() {
            return;
        }
        let outcome = run("def broken(:\n", GuestLanguage::Python, limits()).await;
        assert!(matches!(
            outcome,
            RawOutcome::Faulted { fault, .. } if fault.kind == FaultKind::Syntax
        ));
    }

    #[tokio::test]
    async fn busy_loop_hits_cpu_limit() {
        if !python_available() {
            return;
        }
        let limits = SandboxLimits {
            cpu_time: Duration::from_secs(1),
            ..limits()
        };
        let started = Instant::now();
        let outcome = run("while True:\n    pass\n", GuestLanguage::Python, limits).await;
        assert!(matches!(
            outcome,
            RawOutcome::Terminated { reason: TerminationReason::CpuTime, .. }
        ), "got: {outcome:?}");
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn sleeping_script_hits_wall_clock() {
        if !python_available() {
            return;
        }
        let limits = SandboxLimits {
            wall_clock: Duration::from_millis(1500),
            ..limits()
        };
        let outcome = run("import time\ntime.sleep(30)", GuestLanguage::Python, limits).await;
        assert!(matches!(
            outcome,
            RawOutcome::Terminated { reason: TerminationReason::WallClock, .. }
        ));
    }

    #[tokio::test]
    async fn chatty_script_hits_output_limit() {
        if !python_available() {
            return;
        }
        let limits = SandboxLimits {
            max_output_bytes: 1024,
            ..limits()
        };
        let outcome = run(
            "import sys\nwhile True:\n    sys.stdout.write('x' * 4096)\n    sys.stdout.flush()\n",
            GuestLanguage::Python,
            limits,
        )
        .await;
        assert!(matches!(
            outcome,
            RawOutcome::Terminated { reason: TerminationReason::OutputSize, .. }
        ));
    }

    #[tokio::test]
    async fn hard_exit_is_abnormal() {
        if !python_available() {
            return;
        }
        let outcome = run("import os\nos._exit(7)", GuestLanguage::Python, limits()).await;
        assert!(matches!(
            outcome,
            RawOutcome::Terminated {
                reason: TerminationReason::AbnormalExit { code: Some(7), signal: None },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sql_queries_tabular_files() {
        if !python_available() {
            return;
        }
        let outcome = run(
            "SELECT city FROM cities WHERE population > 100000 ORDER BY city;",
            GuestLanguage::Sql,
            limits(),
        )
        .await;
        match outcome {
            RawOutcome::Completed {
                declared: DeclaredResult::Table { columns, rows, .. },
                ..
            } => {
                assert_eq!(columns, vec!["city"]);
                assert_eq!(rows, vec![vec![json!("Bergen")], vec![json!("Oslo")]]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exec_dir_is_removed() {
        if !python_available() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let sb = sandbox(base.path());
        let ws = workspace(base.path()).await;
        let cancel = CancellationToken::new();
        let limits = limits();
        let request = ExecRequest {
            script: "open('scratch.txt', 'w').write('x')",
            language: GuestLanguage::Python,
            workspace: &ws,
            limits: &limits,
            cancel: &cancel,
        };
        sb.execute(&request).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(base.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("exec-"))
            .collect();
        assert!(leftovers.is_empty());
        ws.release().unwrap();
    }

    #[tokio::test]
    async fn unsupported_language_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        let sb = ProcessSandbox::new(ProcessSandboxConfig::default(), Vec::new());
        let ws = workspace(base.path()).await;
        let cancel = CancellationToken::new();
        let limits = limits();
        let request = ExecRequest {
            script: "1",
            language: GuestLanguage::Sql,
            workspace: &ws,
            limits: &limits,
            cancel: &cancel,
        };
        let err = sb.execute(&request).await.unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(_)));
    }
}
