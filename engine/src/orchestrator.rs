use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbox::{ExecRequest, GuestLanguage, GuestRuntime, RawOutcome, Sandbox, SandboxLimits, Workspace};
use sandbox_process::{ProcessSandbox, PythonRuntime};
use storage::{GcsStore, LocalStore, ObjectStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::classifier;
use crate::config::{EngineConfig, StorageBackend};
use crate::error::{EngineError, EngineResult};
use crate::limiter::AdmissionLimiter;
use crate::resolver::Resolver;
use crate::serializer::{self, SerializerLimits};
use crate::telemetry::{RequestTelemetry, Stage};
use crate::types::{Envelope, ExecutionRequest, ExecutionResult, Failure};

/// Time the running stage gets to kill and reap its guest after the watchdog fires.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub limits: SandboxLimits,
    pub max_result_columns: usize,
    /// Watchdog over admission, resolution, execution, and serialization.
    pub timeout: Duration,
    pub max_script_bytes: usize,
    pub max_file_references: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            limits: config.sandbox_limits(),
            max_result_columns: config.limits.max_result_columns,
            timeout: config.orchestration_timeout(),
            max_script_bytes: config.orchestration.max_script_bytes,
            max_file_references: config.resolver.max_file_references,
        }
    }

    fn serializer_limits(&self) -> SerializerLimits {
        SerializerLimits {
            max_rows: self.limits.max_result_rows,
            max_columns: self.max_result_columns,
            max_text_bytes: self.limits.max_output_bytes,
        }
    }
}

/// Drives one request through admission, resolution, execution, and
/// serialization, and always answers with an [`Envelope`].
///
/// Clone is cheap; every clone shares the same admission limiter.
#[derive(Clone)]
pub struct Orchestrator {
    resolver: Resolver,
    sandbox: Arc<dyn Sandbox>,
    limiter: AdmissionLimiter,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        resolver: Resolver,
        sandbox: Arc<dyn Sandbox>,
        limiter: AdmissionLimiter,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            resolver,
            sandbox,
            limiter,
            settings,
        }
    }

    /// Wire the store, the Python and SQL runtimes, and the process sandbox from config.
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        let store = build_store(config)?;
        let resolver = Resolver::new(
            store,
            config.resolver.default_bucket.clone(),
            config.resolver.max_bytes_per_request,
            config.fetch_timeout(),
            config.resolver.staging_dir.clone(),
        );

        let runtimes: Vec<Arc<dyn GuestRuntime>> = vec![
            Arc::new(PythonRuntime::new(&config.sandbox.python, GuestLanguage::Python)?),
            Arc::new(PythonRuntime::new(&config.sandbox.python, GuestLanguage::Sql)?),
        ];
        let sandbox = Arc::new(ProcessSandbox::new(config.process_sandbox_config(), runtimes));
        let limiter = AdmissionLimiter::new(
            config.admission.max_concurrent_executions,
            config.admission_policy(),
        );

        info!(
            sandbox = sandbox.name(),
            store = resolver.store().name(),
            max_concurrent = limiter.capacity(),
            "orchestrator initialized"
        );
        Ok(Self::new(
            resolver,
            sandbox,
            limiter,
            OrchestratorSettings::from_config(config),
        ))
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Envelope {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run `request` on its own task.
    pub fn spawn(&self, request: ExecutionRequest, cancel: CancellationToken) -> JoinHandle<Envelope> {
        let this = self.clone();
        tokio::spawn(async move { this.execute_with_cancel(request, cancel).await })
    }

    /// Execute, stopping early when `cancel` fires. The workspace is released
    /// on every path.
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Envelope {
        let span = info_span!("execution", request_id = %request.id);
        self.run(request, cancel).instrument(span).await
    }

    async fn run(&self, request: ExecutionRequest, cancel: CancellationToken) -> Envelope {
        let mut telemetry = RequestTelemetry::new(request.id);

        if let Err(failure) = self.validate(&request) {
            info!(kind = %failure.kind, "request rejected");
            telemetry.finish(failure.kind.as_str());
            return Envelope::new(request.id, ExecutionResult::Failure(failure));
        }
        info!(
            language = %request.language,
            files = request.files.len(),
            caller = request.caller.as_deref().unwrap_or("-"),
            "request accepted"
        );

        let stage_cancel = cancel.child_token();
        let mut slot: Option<Workspace> = None;
        let result = {
            let pipeline = self.pipeline(&request, &stage_cancel, &mut slot, &mut telemetry);
            tokio::pin!(pipeline);
            tokio::select! {
                result = &mut pipeline => result,
                () = tokio::time::sleep(self.settings.timeout) => {
                    warn!(
                        timeout_ms = self.settings.timeout.as_millis() as u64,
                        "orchestration timeout, stopping request"
                    );
                    stage_cancel.cancel();
                    if tokio::time::timeout(TEARDOWN_GRACE, &mut pipeline).await.is_err() {
                        error!(target: "diagnostics", "pipeline did not stop within grace period");
                    }
                    ExecutionResult::Failure(classifier::orchestration_timeout())
                }
            }
        };

        self.teardown(slot, &mut telemetry);

        match &result {
            ExecutionResult::Success(payload) => {
                info!(truncated = payload.truncated(), "request succeeded");
                telemetry.finish("success");
            }
            ExecutionResult::Failure(failure) => {
                info!(kind = %failure.kind, message = %failure.message, "request failed");
                telemetry.finish(failure.kind.as_str());
            }
        }
        Envelope::new(request.id, result)
    }

    fn validate(&self, request: &ExecutionRequest) -> Result<(), Failure> {
        if request.script.trim().is_empty() {
            return Err(classifier::validation("script is empty"));
        }
        if request.script.len() > self.settings.max_script_bytes {
            warn!(
                target: "diagnostics",
                script_bytes = request.script.len(),
                limit = self.settings.max_script_bytes,
                "script over size limit"
            );
            return Err(classifier::validation("script exceeds the size limit"));
        }
        if request.files.len() > self.settings.max_file_references {
            warn!(
                target: "diagnostics",
                files = request.files.len(),
                limit = self.settings.max_file_references,
                "too many file references"
            );
            return Err(classifier::validation("too many file references"));
        }
        for (i, file) in request.files.iter().enumerate() {
            if file.key.is_empty() {
                return Err(classifier::validation(format!(
                    "file reference {} has an empty key",
                    i + 1
                )));
            }
            if file.bucket.as_deref().is_some_and(str::is_empty) {
                return Err(classifier::validation(format!(
                    "file reference {} has an empty bucket",
                    i + 1
                )));
            }
        }
        Ok(())
    }

    /// Accepted -> Resolving -> Running -> Serializing. The staged workspace is
    /// parked in `slot` so the caller can release it however this future ends.
    async fn pipeline(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        slot: &mut Option<Workspace>,
        telemetry: &mut RequestTelemetry,
    ) -> ExecutionResult {
        let started = Instant::now();
        let acquired = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return failed(telemetry, Stage::Admission, started, classifier::cancelled());
            }
            acquired = self.limiter.acquire() => acquired,
        };
        let _permit = match acquired {
            Ok(permit) => permit,
            Err(e) => {
                return failed(telemetry, Stage::Admission, started, classifier::classify_admission(&e));
            }
        };
        telemetry.record(Stage::Admission, started.elapsed(), true, None);

        let started = Instant::now();
        let resolved = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return failed(telemetry, Stage::Resolving, started, classifier::cancelled());
            }
            resolved = self.resolver.resolve(&request.files) => resolved,
        };
        let workspace: &Workspace = match resolved {
            Ok(workspace) => slot.insert(workspace),
            Err(e) => {
                return failed(telemetry, Stage::Resolving, started, classifier::classify_resolution(&e));
            }
        };
        telemetry.record(Stage::Resolving, started.elapsed(), true, None);

        let started = Instant::now();
        let exec = ExecRequest {
            script: &request.script,
            language: request.language,
            workspace,
            limits: &self.settings.limits,
            cancel,
        };
        let outcome = match self.sandbox.execute(&exec).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return failed(telemetry, Stage::Running, started, classifier::classify_sandbox_error(&e));
            }
        };
        let (declared, output) = match outcome {
            RawOutcome::Completed { declared, output } => (declared, output),
            RawOutcome::Faulted { fault, output } => {
                return failed(telemetry, Stage::Running, started, classifier::classify_fault(&fault, &output));
            }
            RawOutcome::Terminated { reason, output } => {
                let failure = classifier::classify_termination(reason, &output, &self.settings.limits);
                return failed(telemetry, Stage::Running, started, failure);
            }
        };
        telemetry.record(Stage::Running, started.elapsed(), true, None);

        let started = Instant::now();
        match serializer::serialize(&declared, &output.stdout, &self.settings.serializer_limits()) {
            Ok(payload) => {
                telemetry.record(Stage::Serializing, started.elapsed(), true, None);
                ExecutionResult::Success(payload)
            }
            Err(e) => failed(
                telemetry,
                Stage::Serializing,
                started,
                classifier::malformed_result(&e.to_string()),
            ),
        }
    }

    /// Remove the workspace. A workspace that cannot be removed would leak
    /// request data into later requests, so that failure aborts the process.
    fn teardown(&self, slot: Option<Workspace>, telemetry: &mut RequestTelemetry) {
        let Some(workspace) = slot else {
            return;
        };
        let started = Instant::now();
        let root = workspace.path().to_path_buf();
        match workspace.release() {
            Ok(()) => telemetry.record(Stage::Teardown, started.elapsed(), true, None),
            Err(e) => {
                error!(
                    target: "diagnostics",
                    path = %root.display(),
                    error = %e,
                    "workspace teardown failed, aborting"
                );
                std::process::abort();
            }
        }
    }
}

fn failed(
    telemetry: &mut RequestTelemetry,
    stage: Stage,
    started: Instant,
    failure: Failure,
) -> ExecutionResult {
    telemetry.record(stage, started.elapsed(), false, Some(failure.kind.as_str()));
    ExecutionResult::Failure(failure)
}

/// Object store selected by `storage.backend`.
pub fn build_store(config: &EngineConfig) -> EngineResult<Arc<dyn ObjectStore>> {
    match config.storage.backend {
        StorageBackend::Gcs => Ok(Arc::new(GcsStore::new(
            &config.storage.endpoint,
            config.credentials(),
        )?)),
        StorageBackend::Local => {
            let root = config
                .storage
                .root
                .clone()
                .ok_or_else(|| EngineError::Config("storage.root is required for the local backend".into()))?;
            Ok(Arc::new(LocalStore::new(root)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use sandbox::{CapturedOutput, DeclaredResult, SandboxError, TerminationReason};
    use serde_json::json;

    use super::*;
    use crate::classifier::ErrorKind;
    use crate::limiter::AdmissionPolicy;
    use crate::resolver::tests::SlowStore;
    use crate::types::FileReference;

    /// Scripted stand-in for a real backend.
    enum Behavior {
        Table,
        Sleep(Duration),
        /// Wait for cancellation, like a guest killed by the backend.
        UntilCancelled,
        Fail,
    }

    struct FakeSandbox {
        behavior: Behavior,
        calls: AtomicUsize,
        seen_workspace: std::sync::Mutex<Option<std::path::PathBuf>>,
    }

    impl FakeSandbox {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                seen_workspace: std::sync::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn name(&self) -> &str {
            "fake"
        }

        async fn execute(&self, request: &ExecRequest<'_>) -> sandbox::Result<RawOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen_workspace.lock().unwrap() = Some(request.workspace.path().to_path_buf());
            let output = CapturedOutput::default();
            match self.behavior {
                Behavior::Table => Ok(RawOutcome::Completed {
                    declared: DeclaredResult::Table {
                        columns: vec!["n".into()],
                        rows: (0..request.limits.max_result_rows + 3).map(|i| vec![json!(i)]).collect(),
                        truncated: false,
                    },
                    output,
                }),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(RawOutcome::Completed {
                        declared: DeclaredResult::Absent,
                        output,
                    })
                }
                Behavior::UntilCancelled => {
                    request.cancel.cancelled().await;
                    Ok(RawOutcome::Terminated {
                        reason: TerminationReason::Cancelled,
                        output,
                    })
                }
                Behavior::Fail => Err(SandboxError::LaunchFailed("spawn: EPERM".into())),
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        sandbox: Arc<FakeSandbox>,
        orchestrator: Orchestrator,
    }

    async fn fixture(behavior: Behavior, policy: AdmissionPolicy, timeout: Duration) -> Fixture {
        fixture_with_store(behavior, policy, timeout, Duration::ZERO, Duration::from_secs(5)).await
    }

    /// Fixture whose store answers each call after `store_delay`.
    async fn fixture_with_store(
        behavior: Behavior,
        policy: AdmissionPolicy,
        timeout: Duration,
        store_delay: Duration,
        fetch_timeout: Duration,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("store/uploads");
        tokio::fs::create_dir_all(&bucket).await.unwrap();
        tokio::fs::write(bucket.join("data.csv"), "n\n1\n2\n").await.unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(SlowStore::new(
            LocalStore::new(dir.path().join("store")),
            store_delay,
        ));
        let resolver = Resolver::new(
            store,
            "uploads",
            1024 * 1024,
            fetch_timeout,
            Some(dir.path().join("staging")),
        );
        let sandbox = FakeSandbox::new(behavior);
        let settings = OrchestratorSettings {
            limits: SandboxLimits {
                cpu_time: Duration::from_secs(1),
                wall_clock: Duration::from_secs(1),
                memory_bytes: 64 * 1024 * 1024,
                max_output_bytes: 1024,
                max_result_rows: 5,
            },
            max_result_columns: 10,
            timeout,
            max_script_bytes: 128,
            max_file_references: 2,
        };
        let orchestrator = Orchestrator::new(
            resolver,
            sandbox.clone(),
            AdmissionLimiter::new(1, policy),
            settings,
        );
        Fixture {
            dir,
            sandbox,
            orchestrator,
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("result = read_table('data.csv')")
            .with_files(vec![FileReference::uploaded("data.csv")])
    }

    async fn staging_is_empty(dir: &std::path::Path) -> bool {
        let staging = dir.join("staging");
        match tokio::fs::read_dir(&staging).await {
            Ok(mut entries) => entries.next_entry().await.unwrap().is_none(),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn success_truncates_rows_and_releases_workspace() {
        let f = fixture(Behavior::Table, AdmissionPolicy::Reject, Duration::from_secs(10)).await;
        let envelope = f.orchestrator.execute(request()).await;

        assert!(envelope.success);
        assert!(envelope.error.is_none());
        let table = envelope.table.unwrap();
        assert_eq!(table.rows.len(), 5);
        assert!(table.truncated);
        assert_eq!(envelope.truncated, Some(true));

        let seen = f.sandbox.seen_workspace.lock().unwrap().clone().unwrap();
        assert!(!seen.exists());
        assert!(staging_is_empty(f.dir.path()).await);
        assert_eq!(f.orchestrator.limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn validation_happens_before_admission() {
        let f = fixture(Behavior::Table, AdmissionPolicy::Reject, Duration::from_secs(10)).await;
        let cases = [
            ExecutionRequest::new("   "),
            ExecutionRequest::new("x".repeat(129)),
            ExecutionRequest::new("x").with_files(vec![FileReference::uploaded(""); 1]),
            ExecutionRequest::new("x").with_files(vec![FileReference::uploaded("a"); 3]),
        ];
        for request in cases {
            let envelope = f.orchestrator.execute(request).await;
            assert!(!envelope.success);
            let error = envelope.error.unwrap();
            assert_eq!(error.kind, ErrorKind::ValidationError);
            assert!(!error.message.contains("128"), "got: {}", error.message);
            assert!(!error.message.contains('2'), "got: {}", error.message);
        }
        assert_eq!(f.sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_file_never_reaches_sandbox() {
        let f = fixture(Behavior::Table, AdmissionPolicy::Reject, Duration::from_secs(10)).await;
        let request = ExecutionRequest::new("x").with_files(vec![FileReference::uploaded("nope.csv")]);
        let envelope = f.orchestrator.execute(request).await;

        let error = envelope.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ResolutionError);
        assert!(error.kind.before_execution());
        assert!(staging_is_empty(f.dir.path()).await);
        assert_eq!(f.sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn saturated_limiter_rejects_with_busy() {
        let f = fixture(
            Behavior::Sleep(Duration::from_millis(300)),
            AdmissionPolicy::Reject,
            Duration::from_secs(10),
        )
        .await;
        let first = f.orchestrator.spawn(request(), CancellationToken::new());
        while f.orchestrator.limiter().in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let second = f.orchestrator.execute(request()).await;
        assert_eq!(second.error.unwrap().kind, ErrorKind::Busy);

        let first = first.await.unwrap();
        assert!(first.success);
        assert_eq!(first.text.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn queued_request_is_served_after_release() {
        let f = fixture(
            Behavior::Sleep(Duration::from_millis(100)),
            AdmissionPolicy::Queue {
                max_waiting: 1,
                timeout: Duration::from_secs(5),
            },
            Duration::from_secs(10),
        )
        .await;
        let a = f.orchestrator.spawn(request(), CancellationToken::new());
        let b = f.orchestrator.spawn(request(), CancellationToken::new());
        assert!(a.await.unwrap().success);
        assert!(b.await.unwrap().success);
        assert_eq!(f.sandbox.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn watchdog_forces_orchestration_timeout() {
        let f = fixture(
            Behavior::UntilCancelled,
            AdmissionPolicy::Reject,
            Duration::from_millis(200),
        )
        .await;
        let envelope = f.orchestrator.execute(request()).await;
        assert_eq!(envelope.error.unwrap().kind, ErrorKind::OrchestrationTimeout);
        assert!(staging_is_empty(f.dir.path()).await);
        assert_eq!(f.orchestrator.limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn slow_storage_fails_resolution_inside_the_budget() {
        // Budget as derived from config: fetch timeout + wall clock + margin.
        let fetch_timeout = Duration::from_millis(250);
        let budget = fetch_timeout + Duration::from_secs(1) + Duration::from_millis(100);
        let f = fixture_with_store(
            Behavior::Table,
            AdmissionPolicy::Reject,
            budget,
            Duration::from_millis(200),
            fetch_timeout,
        )
        .await;
        let envelope = f.orchestrator.execute(request()).await;
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ResolutionError);
        assert_eq!(error.message, "timed out fetching referenced files");
        assert_eq!(f.sandbox.calls.load(Ordering::SeqCst), 0);
        assert!(staging_is_empty(f.dir.path()).await);
    }

    #[tokio::test]
    async fn caller_cancellation_releases_workspace() {
        let f = fixture(
            Behavior::UntilCancelled,
            AdmissionPolicy::Reject,
            Duration::from_secs(10),
        )
        .await;
        let cancel = CancellationToken::new();
        let handle = f.orchestrator.spawn(request(), cancel.clone());
        while f.sandbox.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let envelope = handle.await.unwrap();
        assert_eq!(envelope.error.unwrap().kind, ErrorKind::Cancelled);
        assert!(staging_is_empty(f.dir.path()).await);
    }

    #[tokio::test]
    async fn backend_failure_is_opaque_crash() {
        let f = fixture(Behavior::Fail, AdmissionPolicy::Reject, Duration::from_secs(10)).await;
        let envelope = f.orchestrator.execute(request()).await;
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, ErrorKind::CrashError);
        assert!(!error.message.contains("EPERM"));
        assert!(envelope.table.is_none());
        assert!(envelope.text.is_none());
    }
}
