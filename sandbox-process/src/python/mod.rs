use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use sandbox::{
    GuestCommand, GuestLanguage, GuestLayout, GuestRuntime, SandboxError, SupportFile,
};

const DRIVER: SupportFile = SupportFile {
    name: "driver.py",
    contents: include_str!("driver.py"),
};

/// Prefixes that are always visible inside a bubblewrap guest.
const SYSTEM_PREFIXES: &[&str] = &["/usr", "/bin", "/lib", "/lib64", "/sbin"];

/// Hosts Python scripts, or SQL queries over SQLite, with one interpreter.
///
/// Python scripts see `files`, `catalog`, `read_table`, `read_text`, and
/// `read_frame` (pandas, when installed) and declare their answer by
/// assigning `result`. SQL scripts are a single read-only query over tables
/// named after each tabular file's alias.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    interpreter: PathBuf,
    language: GuestLanguage,
}

impl PythonRuntime {
    /// Resolve `interpreter` on `PATH` (or as a path) for `language`.
    pub fn new(interpreter: impl AsRef<OsStr>, language: GuestLanguage) -> Result<Self, SandboxError> {
        let name = interpreter.as_ref();
        let interpreter = which::which(name).map_err(|e| {
            SandboxError::BackendNotAvailable(format!(
                "python interpreter {}: {e}",
                name.to_string_lossy()
            ))
        })?;
        Ok(Self {
            interpreter,
            language,
        })
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }
}

impl GuestRuntime for PythonRuntime {
    fn language(&self) -> GuestLanguage {
        self.language
    }

    fn host_paths(&self) -> Vec<PathBuf> {
        if SYSTEM_PREFIXES
            .iter()
            .any(|prefix| self.interpreter.starts_with(prefix))
        {
            return Vec::new();
        }
        // <prefix>/bin/python3: the whole installation must be visible.
        self.interpreter
            .parent()
            .and_then(Path::parent)
            .map(|prefix| vec![prefix.to_path_buf()])
            .unwrap_or_default()
    }

    fn support_files(&self) -> &[SupportFile] {
        std::slice::from_ref(&DRIVER)
    }

    fn command(&self, layout: &GuestLayout) -> GuestCommand {
        let scratch = layout.scratch_dir.to_string_lossy().into_owned();
        GuestCommand {
            program: self.interpreter.clone(),
            args: vec![
                "-I".into(),
                "-B".into(),
                layout
                    .channel_dir
                    .join(DRIVER.name)
                    .to_string_lossy()
                    .into_owned(),
                layout.channel_dir.to_string_lossy().into_owned(),
                self.language.as_str().into(),
            ],
            env: vec![
                ("PYTHONIOENCODING".into(), "utf-8".into()),
                ("PYTHONHASHSEED".into(), "0".into()),
                ("OPENBLAS_NUM_THREADS".into(), "1".into()),
                ("OMP_NUM_THREADS".into(), "1".into()),
                ("MPLBACKEND".into(), "Agg".into()),
                ("HOME".into(), scratch.clone()),
                ("TMPDIR".into(), scratch),
            ],
        }
    }
}
