use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// SIGKILL every process in the guest's group. The guest is spawned with
/// `process_group(0)`, so its pid names the group.
pub(crate) fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        kill_group(pid);
    }
}

/// `killpg(SIGKILL)` on the group led by `pid`. Used once the leader has been
/// reaped and `Child::id` no longer reports it.
pub(crate) fn kill_group(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitKind {
    Code(i32),
    Signal(i32),
}

/// Decode how the guest ended.
///
/// `bwrap` reports a guest killed by signal `n` as exit code `128 + n`, so
/// with `via_bwrap` such codes are mapped back to signals.
pub(crate) fn decode_exit(status: ExitStatus, via_bwrap: bool) -> ExitKind {
    if let Some(signal) = status.signal() {
        return ExitKind::Signal(signal);
    }
    match status.code() {
        Some(code) if via_bwrap && code > 128 && code < 128 + 65 => ExitKind::Signal(code - 128),
        Some(code) => ExitKind::Code(code),
        None => ExitKind::Code(-1),
    }
}

/// Signal number of `SIGXCPU`, delivered when `RLIMIT_CPU` is exceeded.
pub(crate) fn sigxcpu() -> i32 {
    nix::sys::signal::Signal::SIGXCPU as i32
}
