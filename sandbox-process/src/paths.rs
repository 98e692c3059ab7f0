use std::path::{Path, PathBuf};

use sandbox::{REQUEST_FILE, RESULT_FILE, SCRIPT_FILE, STATUS_FILE};

/// Guest-side mount points used when the filesystem view is remapped.
pub const GUEST_DATA_DIR: &str = "/data";
pub const GUEST_SCRATCH_DIR: &str = "/scratch";
pub const GUEST_CHANNEL_DIR: &str = "/channel";

/// Host-side layout of one execution: `<root>/scratch` and `<root>/channel`.
pub struct ExecutionPaths {
    root: PathBuf,
}

impl ExecutionPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn channel(&self) -> PathBuf {
        self.root.join("channel")
    }

    pub fn script(&self) -> PathBuf {
        self.channel().join(SCRIPT_FILE)
    }

    pub fn request(&self) -> PathBuf {
        self.channel().join(REQUEST_FILE)
    }

    pub fn result(&self) -> PathBuf {
        self.channel().join(RESULT_FILE)
    }

    pub fn status(&self) -> PathBuf {
        self.channel().join(STATUS_FILE)
    }

    pub fn support(&self, name: &str) -> PathBuf {
        self.channel().join(name)
    }
}
