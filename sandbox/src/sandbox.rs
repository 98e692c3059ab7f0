use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ExecRequest, RawOutcome};

/// An isolation backend that runs one guest script per call.
///
/// Every call gets a fresh execution context; nothing written by the guest
/// survives the call. Implementations never retry. Guest misbehaviour is
/// reported through [`RawOutcome`]; `Err` is reserved for host-side failures
/// (the backend could not launch, read back, or tear down the guest).
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Human-readable name for this backend (e.g. "process", "bubblewrap").
    fn name(&self) -> &str;

    async fn execute(&self, request: &ExecRequest<'_>) -> Result<RawOutcome>;
}
