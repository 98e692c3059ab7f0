use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sandbox::{GuestCommand, GuestLayout};
use tokio::process::Command;

use crate::config::{Isolation, ProcessSandboxConfig};
use crate::limits::GuestRlimits;
use crate::paths::{ExecutionPaths, GUEST_CHANNEL_DIR, GUEST_DATA_DIR, GUEST_SCRATCH_DIR};

/// Host directories bound read-only into a bubblewrap guest.
const SYSTEM_DIRS: &[&str] = &[
    "/usr",
    "/lib",
    "/lib64",
    "/bin",
    "/sbin",
    "/etc/alternatives",
    "/etc/ld.so.cache",
    "/etc/localtime",
];

/// Everything needed to start one guest.
pub(crate) struct GuestLaunch<'a> {
    pub config: &'a ProcessSandboxConfig,
    pub guest: &'a GuestCommand,
    pub paths: &'a ExecutionPaths,
    pub workspace: &'a Path,
    pub host_paths: &'a [PathBuf],
    pub rlimits: GuestRlimits,
}

/// Paths as the guest will see them under the configured isolation.
pub(crate) fn guest_layout(
    isolation: &Isolation,
    paths: &ExecutionPaths,
    workspace: &Path,
) -> GuestLayout {
    match isolation {
        Isolation::None => GuestLayout {
            data_dir: workspace.to_path_buf(),
            scratch_dir: paths.scratch(),
            channel_dir: paths.channel(),
        },
        Isolation::Bubblewrap { .. } => GuestLayout {
            data_dir: PathBuf::from(GUEST_DATA_DIR),
            scratch_dir: PathBuf::from(GUEST_SCRATCH_DIR),
            channel_dir: PathBuf::from(GUEST_CHANNEL_DIR),
        },
    }
}

/// Host environment variables named in the allow-list, followed by the
/// runtime's own variables.
fn guest_env(allowlist: &[String], guest: &GuestCommand) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = allowlist
        .iter()
        .filter_map(|key| std::env::var_os(key).map(|value| (OsString::from(key), value)))
        .collect();
    env.extend(
        guest
            .env
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    env
}

fn bwrap_args(launch: &GuestLaunch<'_>, env: &[(OsString, OsString)]) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--unshare-all",
        "--die-with-parent",
        "--new-session",
        "--clearenv",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    let mut bind = |flag: &str, src: &Path, dst: &Path| {
        args.push(flag.into());
        args.push(src.into());
        args.push(dst.into());
    };
    for dir in SYSTEM_DIRS {
        bind("--ro-bind-try", Path::new(dir), Path::new(dir));
    }
    for path in launch.host_paths {
        bind("--ro-bind-try", path, path);
    }
    bind(
        "--ro-bind",
        launch.workspace,
        Path::new(GUEST_DATA_DIR),
    );
    bind(
        "--bind",
        &launch.paths.scratch(),
        Path::new(GUEST_SCRATCH_DIR),
    );
    bind(
        "--bind",
        &launch.paths.channel(),
        Path::new(GUEST_CHANNEL_DIR),
    );

    for flag in [
        ["--proc", "/proc"],
        ["--dev", "/dev"],
        ["--tmpfs", "/tmp"],
        ["--chdir", GUEST_SCRATCH_DIR],
    ] {
        args.extend(flag.into_iter().map(OsString::from));
    }
    for (key, value) in env {
        args.push("--setenv".into());
        args.push(key.clone());
        args.push(value.clone());
    }

    args.push("--".into());
    args.push(launch.guest.program.clone().into());
    args.extend(launch.guest.args.iter().map(OsString::from));
    args
}

/// Build the host command that starts the guest in its own process group,
/// with a cleared environment and the guest rlimits installed pre-exec.
pub(crate) fn build_command(launch: &GuestLaunch<'_>) -> Command {
    let env = guest_env(&launch.config.env_allowlist, launch.guest);
    let mut cmd = match &launch.config.isolation {
        Isolation::None => {
            let mut cmd = Command::new(&launch.guest.program);
            cmd.args(&launch.guest.args)
                .current_dir(launch.paths.scratch())
                .env_clear()
                .envs(env);
            cmd
        }
        Isolation::Bubblewrap { binary } => {
            let mut cmd = Command::new(binary);
            cmd.args(bwrap_args(launch, &env))
                .current_dir(launch.paths.root())
                .env_clear();
            cmd
        }
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let rlimits = launch.rlimits;
    // SAFETY: the closure runs between fork and exec and only calls setrlimit.
    unsafe {
        cmd.pre_exec(move || rlimits.apply());
    }
    cmd
}

/// Human-readable rendering of a command for logs.
pub(crate) fn format_command_display(cmd: &Command) -> String {
    let std = cmd.as_std();
    let mut parts = vec![std.get_program().to_string_lossy().into_owned()];
    parts.extend(std.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}
