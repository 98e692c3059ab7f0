use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::types::{FaultKind, GuestFault};
use crate::workspace::ManifestEntry;

/// Script body, written verbatim.
pub const SCRIPT_FILE: &str = "script";
/// [`GuestRequest`] as JSON.
pub const REQUEST_FILE: &str = "request.json";
/// Declared result, written at most once after top-level completion.
pub const RESULT_FILE: &str = "result.json";
/// [`GuestStatus`] as JSON, written last.
pub const STATUS_FILE: &str = "status.json";

/// Everything the guest runtime learns about its execution.
#[derive(Debug, Serialize)]
pub struct GuestRequest<'a> {
    pub data_dir: &'a str,
    pub scratch_dir: &'a str,
    pub files: &'a [ManifestEntry],
    pub max_result_rows: usize,
}

/// Final report of the guest runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GuestStatus {
    Ok,
    SyntaxError { message: String },
    RuntimeError { message: String },
    /// The interpreter ran out of memory and still managed to report it.
    Memory,
}

impl GuestStatus {
    pub fn from_slot(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SandboxError::Protocol(format!("status slot: {e}")))
    }

    /// The script-level fault carried by this status, if any.
    pub fn fault(&self) -> Option<GuestFault> {
        match self {
            Self::SyntaxError { message } => Some(GuestFault {
                kind: FaultKind::Syntax,
                message: message.clone(),
            }),
            Self::RuntimeError { message } => Some(GuestFault {
                kind: FaultKind::Runtime,
                message: message.clone(),
            }),
            Self::Ok | Self::Memory => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decodes_runtime_error() {
        let status =
            GuestStatus::from_slot(br#"{"status":"runtime_error","message":"ZeroDivisionError: division by zero (line 1)"}"#)
                .unwrap();
        let fault = status.fault().unwrap();
        assert_eq!(fault.kind, FaultKind::Runtime);
        assert!(fault.message.starts_with("ZeroDivisionError"));
    }

    #[test]
    fn ok_and_memory_carry_no_fault() {
        assert!(GuestStatus::from_slot(br#"{"status":"ok"}"#).unwrap().fault().is_none());
        assert_eq!(
            GuestStatus::from_slot(br#"{"status":"memory"}"#).unwrap(),
            GuestStatus::Memory
        );
    }

    #[test]
    fn unknown_status_is_protocol_error() {
        let err = GuestStatus::from_slot(br#"{"status":"weird"}"#).unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
    }
}
