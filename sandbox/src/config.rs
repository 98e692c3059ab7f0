use std::time::Duration;

/// Per-execution ceilings. Every violation ends the execution with a
/// [`TerminationReason`](crate::TerminationReason).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// CPU time the guest may consume across all of its processes.
    pub cpu_time: Duration,
    /// Real time from launch until the guest is killed.
    pub wall_clock: Duration,
    /// Address-space ceiling for each guest process.
    pub memory_bytes: u64,
    /// Combined stdout + stderr bytes before the guest is killed.
    pub max_output_bytes: usize,
    /// Rows the guest exports into the result slot before marking it truncated.
    pub max_result_rows: usize,
}
