use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::SandboxLimits;
use sandbox_process::{Isolation, ProcessSandboxConfig};
use serde::{Deserialize, Serialize};
use storage::Credentials;

use crate::error::{EngineError, EngineResult};
use crate::limiter::AdmissionPolicy;

pub(crate) const DEFAULT_CPU_TIME_MS: u64 = 2_000;
pub(crate) const DEFAULT_WALL_CLOCK_MS: u64 = 30_000;
pub(crate) const DEFAULT_MEMORY_MB: u64 = 512;
pub(crate) const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub(crate) const DEFAULT_MAX_RESULT_ROWS: usize = 1_000;
pub(crate) const DEFAULT_MAX_RESULT_COLUMNS: usize = 100;

pub(crate) const DEFAULT_MAX_BYTES_PER_REQUEST: u64 = 64 * 1024 * 1024;
pub(crate) const DEFAULT_FETCH_TIMEOUT_MS: u64 = 20_000;
pub(crate) const DEFAULT_MAX_FILE_REFERENCES: usize = 16;
pub(crate) const DEFAULT_BUCKET: &str = "ai-analysis-default-bucket";

pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 4;
pub(crate) const DEFAULT_MAX_QUEUED: usize = 16;
pub(crate) const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5_000;

pub(crate) const DEFAULT_MAX_SCRIPT_BYTES: usize = 64 * 1024;
/// Slack added on top of the stage timeouts for the default orchestration timeout.
pub(crate) const ORCHESTRATION_MARGIN_MS: u64 = 5_000;

pub(crate) const DEFAULT_PYTHON: &str = "python3";
pub(crate) const DEFAULT_BWRAP: &str = "bwrap";

pub(crate) const DEFAULT_CODEGEN_MODEL: &str = "gemini-2.5-pro";
pub(crate) const DEFAULT_CODEGEN_KEY_ENV: &str = "GEMINI_API_KEY";
pub(crate) const DEFAULT_CODEGEN_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub(crate) const DEFAULT_CODEGEN_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: LimitsConfig,
    pub resolver: ResolverConfig,
    pub admission: AdmissionConfig,
    pub orchestration: OrchestrationConfig,
    pub sandbox: SandboxConfig,
    pub storage: StorageConfig,
    pub codegen: CodegenConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub cpu_time_ms: u64,
    pub wall_clock_ms: u64,
    pub memory_mb: u64,
    pub max_output_bytes: usize,
    pub max_result_rows: usize,
    pub max_result_columns: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_time_ms: DEFAULT_CPU_TIME_MS,
            wall_clock_ms: DEFAULT_WALL_CLOCK_MS,
            memory_mb: DEFAULT_MEMORY_MB,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_result_rows: DEFAULT_MAX_RESULT_ROWS,
            max_result_columns: DEFAULT_MAX_RESULT_COLUMNS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub max_bytes_per_request: u64,
    pub fetch_timeout_ms: u64,
    pub max_file_references: usize,
    /// Bucket holding the caller's uploads.
    pub default_bucket: String,
    /// Parent of workspace directories. System temp dir when unset.
    pub staging_dir: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_request: DEFAULT_MAX_BYTES_PER_REQUEST,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_file_references: DEFAULT_MAX_FILE_REFERENCES,
            default_bucket: DEFAULT_BUCKET.to_string(),
            staging_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_concurrent_executions: usize,
    pub policy: PolicyKind,
    pub max_queued: usize,
    pub queue_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT,
            policy: PolicyKind::default(),
            max_queued: DEFAULT_MAX_QUEUED,
            queue_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Watchdog for the whole request. Derived from the stage timeouts when unset.
    pub timeout_ms: Option<u64>,
    pub max_script_bytes: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            max_script_bytes: DEFAULT_MAX_SCRIPT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    #[default]
    None,
    Bubblewrap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// `none` relies on file modes for the read-only workspace, which root ignores.
    pub isolation: IsolationKind,
    pub python: PathBuf,
    pub bwrap: PathBuf,
    /// Parent of per-execution scratch directories. System temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    pub env_allowlist: Vec<String>,
    pub max_processes: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationKind::default(),
            python: PathBuf::from(DEFAULT_PYTHON),
            bwrap: PathBuf::from(DEFAULT_BWRAP),
            scratch_dir: None,
            env_allowlist: ProcessSandboxConfig::default().env_allowlist,
            max_processes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Gcs,
    Local,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CredentialsConfig {
    #[default]
    Anonymous,
    Static { token: String },
    Env { var: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the `local` backend (one sub-directory per bucket).
    pub root: Option<PathBuf>,
    pub endpoint: String,
    pub credentials: CredentialsConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root: None,
            endpoint: storage::GCS_DEFAULT_ENDPOINT.to_string(),
            credentials: CredentialsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    pub model: String,
    pub api_key_env: String,
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_CODEGEN_MODEL.to_string(),
            api_key_env: DEFAULT_CODEGEN_KEY_ENV.to_string(),
            endpoint: DEFAULT_CODEGEN_ENDPOINT.to_string(),
            timeout_ms: DEFAULT_CODEGEN_TIMEOUT_MS,
        }
    }
}

/// Load and validate an engine config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> EngineResult<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: EngineConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| EngineError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl EngineConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        if let Some(dir) = &mut self.resolver.staging_dir {
            resolve(dir);
        }
        if let Some(dir) = &mut self.sandbox.scratch_dir {
            resolve(dir);
        }
        if let Some(root) = &mut self.storage.root {
            resolve(root);
        }
        // Bare program names are looked up on PATH.
        for program in [&mut self.sandbox.python, &mut self.sandbox.bwrap] {
            if program.components().count() > 1 {
                resolve(program);
            }
        }
    }

    /// Check cross-field constraints. Reports every problem at once.
    pub fn validate(&self) -> EngineResult<()> {
        let mut errors = Vec::new();
        let limits = &self.limits;

        if limits.cpu_time_ms == 0 {
            errors.push("limits.cpu_time_ms must be positive".to_string());
        }
        if limits.wall_clock_ms == 0 {
            errors.push("limits.wall_clock_ms must be positive".to_string());
        }
        if limits.memory_mb == 0 {
            errors.push("limits.memory_mb must be positive".to_string());
        }
        if limits.max_result_rows == 0 {
            errors.push("limits.max_result_rows must be positive".to_string());
        }
        if limits.max_result_columns == 0 {
            errors.push("limits.max_result_columns must be positive".to_string());
        }
        if self.resolver.fetch_timeout_ms == 0 {
            errors.push("resolver.fetch_timeout_ms must be positive".to_string());
        }
        if self.resolver.default_bucket.is_empty() {
            errors.push("resolver.default_bucket must not be empty".to_string());
        }
        if self.admission.max_concurrent_executions == 0 {
            errors.push("admission.max_concurrent_executions must be positive".to_string());
        }

        let timeout = self.orchestration_timeout();
        if timeout <= self.wall_clock() {
            errors.push(format!(
                "orchestration.timeout_ms ({}) must exceed limits.wall_clock_ms ({})",
                timeout.as_millis(),
                limits.wall_clock_ms
            ));
        }
        if self.admission.policy == PolicyKind::Queue
            && timeout <= Duration::from_millis(self.admission.queue_timeout_ms)
        {
            errors.push(format!(
                "orchestration.timeout_ms ({}) must exceed admission.queue_timeout_ms ({})",
                timeout.as_millis(),
                self.admission.queue_timeout_ms
            ));
        }

        if self.storage.backend == StorageBackend::Local && self.storage.root.is_none() {
            errors.push("storage.root is required for the local backend".to_string());
        }
        match &self.storage.credentials {
            CredentialsConfig::Static { token } if token.is_empty() => {
                errors.push("storage.credentials.token must not be empty".to_string());
            }
            CredentialsConfig::Env { var } if var.is_empty() => {
                errors.push("storage.credentials.var must not be empty".to_string());
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(errors.join("; ")))
        }
    }

    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.limits.wall_clock_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.resolver.fetch_timeout_ms)
    }

    /// Configured watchdog, or queue wait + fetch + wall clock + margin.
    pub fn orchestration_timeout(&self) -> Duration {
        let ms = self.orchestration.timeout_ms.unwrap_or_else(|| {
            let queue = match self.admission.policy {
                PolicyKind::Reject => 0,
                PolicyKind::Queue => self.admission.queue_timeout_ms,
            };
            queue + self.resolver.fetch_timeout_ms + self.limits.wall_clock_ms + ORCHESTRATION_MARGIN_MS
        });
        Duration::from_millis(ms)
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            cpu_time: Duration::from_millis(self.limits.cpu_time_ms),
            wall_clock: self.wall_clock(),
            memory_bytes: self.limits.memory_mb * 1024 * 1024,
            max_output_bytes: self.limits.max_output_bytes,
            max_result_rows: self.limits.max_result_rows,
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        match self.admission.policy {
            PolicyKind::Reject => AdmissionPolicy::Reject,
            PolicyKind::Queue => AdmissionPolicy::Queue {
                max_waiting: self.admission.max_queued,
                timeout: Duration::from_millis(self.admission.queue_timeout_ms),
            },
        }
    }

    pub fn process_sandbox_config(&self) -> ProcessSandboxConfig {
        ProcessSandboxConfig {
            base_dir: self.sandbox.scratch_dir.clone(),
            isolation: match self.sandbox.isolation {
                IsolationKind::None => Isolation::None,
                IsolationKind::Bubblewrap => Isolation::Bubblewrap {
                    binary: self.sandbox.bwrap.clone(),
                },
            },
            env_allowlist: self.sandbox.env_allowlist.clone(),
            max_processes: self.sandbox.max_processes,
        }
    }

    pub fn credentials(&self) -> Credentials {
        match &self.storage.credentials {
            CredentialsConfig::Anonymous => Credentials::Anonymous,
            CredentialsConfig::Static { token } => Credentials::Static(token.clone()),
            CredentialsConfig::Env { var } => Credentials::Env(var.clone()),
        }
    }
}
