use std::path::PathBuf;

use crate::types::GuestLanguage;

/// Guest-visible locations of the execution context.
///
/// These are the paths the guest sees, which differ from host paths when the
/// backend remaps its filesystem view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestLayout {
    /// Staged workspace files, read-only.
    pub data_dir: PathBuf,
    /// Private read-write area, discarded at teardown.
    pub scratch_dir: PathBuf,
    /// Holds the script, the request descriptor, and the result/status slots.
    pub channel_dir: PathBuf,
}

/// A file the runtime needs in the channel directory before launch.
#[derive(Debug, Clone, Copy)]
pub struct SupportFile {
    pub name: &'static str,
    pub contents: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment the runtime needs, on top of the backend allow-list.
    pub env: Vec<(String, String)>,
}

/// Capability for hosting one guest language inside any isolation backend.
///
/// A runtime decides how to start its interpreter. It agrees with the
/// backend only on the channel protocol: it reads
/// [`SCRIPT_FILE`](crate::SCRIPT_FILE) and [`REQUEST_FILE`](crate::REQUEST_FILE),
/// and writes [`STATUS_FILE`](crate::STATUS_FILE) and, when the script
/// declared one, [`RESULT_FILE`](crate::RESULT_FILE).
pub trait GuestRuntime: Send + Sync {
    fn language(&self) -> GuestLanguage;

    /// Host paths the backend must make visible to the guest (interpreter
    /// binaries that live outside the usual system directories).
    fn host_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn support_files(&self) -> &[SupportFile];

    fn command(&self, layout: &GuestLayout) -> GuestCommand;
}
