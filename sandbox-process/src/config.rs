use std::path::PathBuf;

/// How the guest process is fenced off from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Resource limits, a cleared environment, and a private process group.
    /// The guest shares the host's filesystem view and network; development only.
    ///
    /// The workspace is read-only through file modes alone, so a runner
    /// running as root hands the guest a writable workspace.
    None,
    /// Run the guest under `bwrap` with fresh mount, pid, network, ipc, and uts
    /// namespaces. Only system directories, the workspace, the scratch area,
    /// and the channel are visible.
    Bubblewrap { binary: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ProcessSandboxConfig {
    /// Parent of per-execution directories. System temp dir when `None`.
    pub base_dir: Option<PathBuf>,
    pub isolation: Isolation,
    /// Host environment variables passed through to the guest.
    pub env_allowlist: Vec<String>,
    /// `RLIMIT_NPROC` for the guest. Counted per host user, so leave unset
    /// when the runner shares its uid with other workloads.
    pub max_processes: Option<u64>,
}

impl Isolation {
    /// Whether the guest is kept from writing to the staged workspace.
    pub fn protects_workspace(&self) -> bool {
        match self {
            Self::None => !nix::unistd::Uid::effective().is_root(),
            Self::Bubblewrap { .. } => true,
        }
    }
}

impl Default for ProcessSandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            isolation: Isolation::None,
            env_allowlist: vec!["LANG".into(), "LC_ALL".into(), "TZ".into()],
            max_processes: None,
        }
    }
}
