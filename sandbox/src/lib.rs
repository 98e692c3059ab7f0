mod channel;
mod config;
mod error;
mod result;
mod runtime;
mod sandbox;
mod types;
mod workspace;

pub use channel::{
    GuestRequest, GuestStatus, REQUEST_FILE, RESULT_FILE, SCRIPT_FILE, STATUS_FILE,
};
pub use config::SandboxLimits;
pub use error::{Result, SandboxError};
pub use result::DeclaredResult;
pub use runtime::{GuestCommand, GuestLayout, GuestRuntime, SupportFile};
pub use sandbox::Sandbox;
pub use types::{
    CapturedOutput, ExecRequest, FaultKind, GuestFault, GuestLanguage, RawOutcome,
    TerminationReason,
};
pub use workspace::{FormatHint, ManifestEntry, Workspace, WorkspaceBuilder};
