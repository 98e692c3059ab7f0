use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::SandboxLimits;
use crate::result::DeclaredResult;
use crate::workspace::Workspace;

/// Guest languages a [`GuestRuntime`](crate::GuestRuntime) can host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestLanguage {
    #[default]
    Python,
    Sql,
}

impl GuestLanguage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Sql => "sql",
        }
    }
}

impl fmt::Display for GuestLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuestLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "sql" => Ok(Self::Sql),
            other => Err(format!("unknown language: {other}")),
        }
    }
}

pub struct ExecRequest<'a> {
    pub script: &'a str,
    pub language: GuestLanguage,
    pub workspace: &'a Workspace,
    pub limits: &'a SandboxLimits,
    /// Fired by the caller to stop the guest early. The backend kills and
    /// reaps the guest before returning [`TerminationReason::Cancelled`].
    pub cancel: &'a CancellationToken,
}

/// Bytes the guest wrote to its standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn total_len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The script failed to parse or compile.
    Syntax,
    /// The script raised at run time.
    Runtime,
}

/// An error the guest runtime caught and reported about the script itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFault {
    pub kind: FaultKind,
    /// Guest-level diagnostic. May still contain guest paths; callers sanitize.
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    CpuTime,
    WallClock,
    Memory,
    OutputSize,
    Cancelled,
    AbnormalExit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuTime => f.write_str("cpu time limit exceeded"),
            Self::WallClock => f.write_str("wall clock limit exceeded"),
            Self::Memory => f.write_str("memory limit exceeded"),
            Self::OutputSize => f.write_str("output size limit exceeded"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::AbnormalExit { code, signal } => {
                write!(f, "abnormal exit")?;
                if let Some(code) = code {
                    write!(f, " code={code}")?;
                }
                if let Some(signal) = signal {
                    write!(f, " signal={signal}")?;
                }
                Ok(())
            }
        }
    }
}

/// What a single guest execution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    /// The script ran to completion. `declared` is [`DeclaredResult::Absent`]
    /// when nothing was assigned to the result slot.
    Completed {
        declared: DeclaredResult,
        output: CapturedOutput,
    },
    /// The guest runtime caught a syntax or runtime error in the script.
    Faulted {
        fault: GuestFault,
        output: CapturedOutput,
    },
    /// The host stopped the guest, or the guest died without reporting.
    Terminated {
        reason: TerminationReason,
        output: CapturedOutput,
    },
}

impl RawOutcome {
    pub fn output(&self) -> &CapturedOutput {
        match self {
            Self::Completed { output, .. }
            | Self::Faulted { output, .. }
            | Self::Terminated { output, .. } => output,
        }
    }
}
