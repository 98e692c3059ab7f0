//! Maps every failure path onto the public error taxonomy.
//!
//! Envelopes only ever carry the one-line messages built here. Host paths,
//! exit statuses, and guest stderr go to the `diagnostics` tracing target.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use sandbox::{
    CapturedOutput, FaultKind, GuestFault, RawOutcome, SandboxError, SandboxLimits,
    TerminationReason,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::limiter::AdmissionError;
use crate::resolver::ResolutionFailure;
use crate::types::Failure;

/// Longest guest diagnostic passed through to the caller.
const MAX_MESSAGE_CHARS: usize = 500;
/// Bytes of guest stderr kept in operator diagnostics.
const STDERR_TAIL_BYTES: usize = 2048;

/// Absolute path, preceded by start of text or a separator.
static ABSOLUTE_PATH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?P<pre>^|[\s"'(\[=,:])(?:/[\w.\-]+)*/(?P<base>[\w.\-]+)"#).ok()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ResolutionError,
    SyntaxError,
    RuntimeError,
    TimeoutError,
    ResourceLimitError,
    CrashError,
    OrchestrationTimeout,
    Busy,
    ValidationError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResolutionError => "ResolutionError",
            Self::SyntaxError => "SyntaxError",
            Self::RuntimeError => "RuntimeError",
            Self::TimeoutError => "TimeoutError",
            Self::ResourceLimitError => "ResourceLimitError",
            Self::CrashError => "CrashError",
            Self::OrchestrationTimeout => "OrchestrationTimeout",
            Self::Busy => "Busy",
            Self::ValidationError => "ValidationError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether the failure happened before any guest code ran.
    pub fn before_execution(self) -> bool {
        matches!(
            self,
            Self::ResolutionError | Self::Busy | Self::ValidationError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a sandbox outcome. `None` when the script completed.
pub fn classify_outcome(outcome: &RawOutcome, limits: &SandboxLimits) -> Option<Failure> {
    match outcome {
        RawOutcome::Completed { .. } => None,
        RawOutcome::Faulted { fault, output } => Some(classify_fault(fault, output)),
        RawOutcome::Terminated { reason, output } => {
            Some(classify_termination(*reason, output, limits))
        }
    }
}

pub fn classify_fault(fault: &GuestFault, output: &CapturedOutput) -> Failure {
    let kind = match fault.kind {
        FaultKind::Syntax => ErrorKind::SyntaxError,
        FaultKind::Runtime => ErrorKind::RuntimeError,
    };
    warn!(
        target: "diagnostics",
        kind = %kind,
        guest_message = %fault.message,
        stderr_tail = %stderr_tail(output),
        "guest reported a script error"
    );
    let message = sanitize(&fault.message);
    if !message.is_empty() {
        return Failure::new(kind, message);
    }
    match kind {
        ErrorKind::SyntaxError => Failure::new(kind, "script could not be parsed"),
        _ => Failure::new(kind, "script raised an error"),
    }
}

pub fn classify_termination(
    reason: TerminationReason,
    output: &CapturedOutput,
    limits: &SandboxLimits,
) -> Failure {
    let (kind, message) = match reason {
        TerminationReason::CpuTime => {
            (ErrorKind::TimeoutError, "script exceeded the CPU time limit")
        }
        TerminationReason::WallClock => {
            (ErrorKind::TimeoutError, "script exceeded the wall-clock limit")
        }
        TerminationReason::Memory => {
            (ErrorKind::ResourceLimitError, "script exceeded the memory limit")
        }
        TerminationReason::OutputSize => {
            (ErrorKind::ResourceLimitError, "script output exceeded the size limit")
        }
        TerminationReason::Cancelled => return cancelled(),
        TerminationReason::AbnormalExit { code, signal } => {
            error!(
                target: "diagnostics",
                exit_code = ?code,
                signal = ?signal,
                stderr_tail = %stderr_tail(output),
                "guest terminated abnormally"
            );
            return Failure::new(ErrorKind::CrashError, "script terminated abnormally");
        }
    };
    warn!(
        target: "diagnostics",
        reason = %reason,
        cpu_time_ms = limits.cpu_time.as_millis() as u64,
        wall_clock_ms = limits.wall_clock.as_millis() as u64,
        memory_bytes = limits.memory_bytes,
        max_output_bytes = limits.max_output_bytes,
        stderr_tail = %stderr_tail(output),
        "guest stopped at a resource limit"
    );
    Failure::new(kind, message)
}

/// Failure of the sandbox backend itself, as opposed to the script.
pub fn classify_sandbox_error(err: &SandboxError) -> Failure {
    match err {
        SandboxError::UnsupportedLanguage(language) => Failure::new(
            ErrorKind::ValidationError,
            format!("language {language} is not supported"),
        ),
        other => {
            error!(target: "diagnostics", error = %other, "sandbox backend failed");
            Failure::new(ErrorKind::CrashError, "execution environment failed")
        }
    }
}

pub fn classify_resolution(failure: &ResolutionFailure) -> Failure {
    warn!(target: "diagnostics", error = ?failure, "file resolution failed");
    Failure::new(ErrorKind::ResolutionError, failure.to_string())
}

pub fn classify_admission(failure: &AdmissionError) -> Failure {
    Failure::new(ErrorKind::Busy, failure.to_string())
}

pub fn validation(message: impl Into<String>) -> Failure {
    Failure::new(ErrorKind::ValidationError, message)
}

pub fn orchestration_timeout() -> Failure {
    Failure::new(
        ErrorKind::OrchestrationTimeout,
        "execution did not finish within the orchestration timeout",
    )
}

pub fn cancelled() -> Failure {
    Failure::new(ErrorKind::Cancelled, "execution was cancelled")
}

/// Failure for a result the serializer could not convert.
pub fn malformed_result(detail: &str) -> Failure {
    warn!(target: "diagnostics", detail, "declared result rejected");
    Failure::new(ErrorKind::RuntimeError, sanitize(detail))
}

/// Make a guest diagnostic safe to show: absolute paths become file names,
/// only the first non-empty line is kept, and the length is capped.
pub fn sanitize(message: &str) -> String {
    let line = message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let line = match ABSOLUTE_PATH.as_ref() {
        Some(re) => re.replace_all(line, "${pre}${base}").into_owned(),
        None => line.to_string(),
    };
    if line.chars().count() <= MAX_MESSAGE_CHARS {
        return line;
    }
    let mut capped: String = line.chars().take(MAX_MESSAGE_CHARS).collect();
    capped.push_str("...");
    capped
}

fn stderr_tail(output: &CapturedOutput) -> String {
    let start = output.stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(output.stderr.get(start..).unwrap_or_default()).into_owned()
}
