use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;

const SEALED_FILE_MODE: u32 = 0o444;
const SEALED_DIR_MODE: u32 = 0o555;
const OPEN_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatHint {
    /// Row/column data with a known structure (CSV with header, Parquet, Excel).
    Tabular,
    /// Line-oriented text with a delimiter but no reliable header.
    DelimitedText,
    /// JSON, NDJSON, XML and similar.
    SemiStructured,
    Binary,
}

impl FormatHint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tabular => "tabular",
            Self::DelimitedText => "delimited-text",
            Self::SemiStructured => "semi-structured",
            Self::Binary => "binary",
        }
    }
}

/// One staged file as the guest and the caller see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// File name inside the workspace directory.
    pub name: String,
    /// Identifier-safe name for the file (used as a SQL table name).
    pub alias: String,
    pub byte_size: u64,
    pub format_hint: FormatHint,
    /// Origin label of the reference (`uploaded` or `public`).
    pub origin: String,
    /// `bucket/key` the bytes came from.
    pub location: String,
    /// Hex SHA-256 of the staged bytes.
    pub digest: String,
}

/// A workspace still being filled. Dropping it removes everything staged so far.
pub struct WorkspaceBuilder {
    dir: TempDir,
    entries: Vec<ManifestEntry>,
}

impl WorkspaceBuilder {
    /// Allocate a private directory under `parent`, or the system temp dir.
    pub fn create(parent: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ws-");
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self {
            dir,
            entries: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `bytes` under `entry.name` and record the entry.
    pub async fn stage(&mut self, entry: ManifestEntry, bytes: &[u8]) -> io::Result<()> {
        if entry.name.is_empty()
            || entry.name.contains('/')
            || entry.name == "."
            || entry.name == ".."
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid staged file name: {:?}", entry.name),
            ));
        }
        if self.entries.iter().any(|e| e.name == entry.name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file already staged: {}", entry.name),
            ));
        }
        tokio::fs::write(self.dir.path().join(&entry.name), bytes).await?;
        self.entries.push(entry);
        Ok(())
    }

    /// Make every staged file and the directory itself read-only.
    pub fn seal(self) -> io::Result<Workspace> {
        for entry in &self.entries {
            let path = self.dir.path().join(&entry.name);
            fs::set_permissions(&path, fs::Permissions::from_mode(SEALED_FILE_MODE))?;
        }
        fs::set_permissions(
            self.dir.path(),
            fs::Permissions::from_mode(SEALED_DIR_MODE),
        )?;
        let root = self.dir.path().to_path_buf();
        Ok(Workspace {
            dir: Some(self.dir),
            root,
            entries: self.entries,
        })
    }
}

/// Request-scoped, read-only directory of staged files.
///
/// Owned by exactly one execution. [`Workspace::release`] removes it and
/// reports failures; dropping an unreleased workspace removes it best-effort.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    root: PathBuf,
    entries: Vec<ManifestEntry>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn file_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.root.join(&entry.name)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.byte_size).sum()
    }

    /// Recursively remove the workspace.
    pub fn release(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                unseal(dir.path())?;
                dir.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let _ = unseal(dir.path());
            drop(dir);
        }
    }
}

fn unseal(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(OPEN_DIR_MODE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, size: u64) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            alias: name.replace('.', "_"),
            byte_size: size,
            format_hint: FormatHint::Tabular,
            origin: "uploaded".to_string(),
            location: format!("bucket/{name}"),
            digest: String::new(),
        }
    }

    #[tokio::test]
    async fn seal_makes_files_read_only() {
        let parent = tempfile::tempdir().unwrap();
        let mut builder = WorkspaceBuilder::create(Some(parent.path())).unwrap();
        builder.stage(entry("a.csv", 4), b"x,y\n").await.unwrap();
        let ws = builder.seal().unwrap();

        let file_mode = fs::metadata(ws.path().join("a.csv"))
            .unwrap()
            .permissions()
            .mode();
        let dir_mode = fs::metadata(ws.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, SEALED_FILE_MODE);
        assert_eq!(dir_mode & 0o777, SEALED_DIR_MODE);
        assert_eq!(ws.total_bytes(), 4);

        ws.release().unwrap();
    }

    #[tokio::test]
    async fn release_removes_directory() {
        let parent = tempfile::tempdir().unwrap();
        let mut builder = WorkspaceBuilder::create(Some(parent.path())).unwrap();
        builder.stage(entry("a.csv", 1), b"1").await.unwrap();
        let ws = builder.seal().unwrap();
        let path = ws.path().to_path_buf();

        ws.release().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_sealed_directory() {
        let parent = tempfile::tempdir().unwrap();
        let mut builder = WorkspaceBuilder::create(Some(parent.path())).unwrap();
        builder.stage(entry("a.csv", 1), b"1").await.unwrap();
        let ws = builder.seal().unwrap();
        let path = ws.path().to_path_buf();

        drop(ws);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropped_builder_leaves_nothing() {
        let parent = tempfile::tempdir().unwrap();
        let mut builder = WorkspaceBuilder::create(Some(parent.path())).unwrap();
        builder.stage(entry("a.csv", 1), b"1").await.unwrap();
        let path = builder.path().to_path_buf();

        drop(builder);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stage_rejects_path_separators_and_duplicates() {
        let mut builder = WorkspaceBuilder::create(None).unwrap();
        let err = builder.stage(entry("../x", 1), b"1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        builder.stage(entry("a.csv", 1), b"1").await.unwrap();
        let err = builder.stage(entry("a.csv", 1), b"1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
