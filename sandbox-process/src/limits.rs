use nix::sys::resource::{Resource, setrlimit};
use sandbox::SandboxLimits;

const OPEN_FILES: libc::rlim_t = 256;

/// Kernel resource limits installed in the guest between `fork` and `exec`.
///
/// `RLIMIT_CPU` is per process: the soft limit delivers `SIGXCPU`, the hard
/// limit one second later delivers `SIGKILL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GuestRlimits {
    pub cpu_soft_secs: libc::rlim_t,
    pub cpu_hard_secs: libc::rlim_t,
    pub address_space: libc::rlim_t,
    /// Largest file the guest may write (scratch files and the result slot).
    pub file_size: libc::rlim_t,
    pub processes: Option<libc::rlim_t>,
}

impl GuestRlimits {
    pub fn from_limits(limits: &SandboxLimits, max_processes: Option<u64>) -> Self {
        let cpu = limits.cpu_time;
        let mut cpu_secs = cpu.as_secs();
        if cpu.subsec_nanos() > 0 || cpu_secs == 0 {
            cpu_secs += 1;
        }
        Self {
            cpu_soft_secs: cpu_secs,
            cpu_hard_secs: cpu_secs + 1,
            address_space: limits.memory_bytes,
            file_size: limits.memory_bytes,
            processes: max_processes,
        }
    }

    /// Install the limits in the calling process. Runs in the forked child,
    /// so it only issues `setrlimit` system calls.
    pub fn apply(&self) -> std::io::Result<()> {
        setrlimit(Resource::RLIMIT_CPU, self.cpu_soft_secs, self.cpu_hard_secs)?;
        setrlimit(Resource::RLIMIT_AS, self.address_space, self.address_space)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        setrlimit(Resource::RLIMIT_NOFILE, OPEN_FILES, OPEN_FILES)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(processes) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, processes, processes)?;
        }
        Ok(())
    }
}
