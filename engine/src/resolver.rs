use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::try_join_all;
use sandbox::{FormatHint, ManifestEntry, Workspace, WorkspaceBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use storage::{ObjectMeta, ObjectStore, Origin, StorageError};
use tracing::{debug, info};

use crate::format;
use crate::types::FileReference;

/// Why a set of references could not be turned into a workspace.
///
/// `Display` is user-safe; variant fields hold operator detail.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionFailure {
    #[error("file not found: {reference}")]
    NotFound { reference: String },

    #[error("access denied: {reference}")]
    AccessDenied { reference: String },

    #[error("referenced files exceed the size limit")]
    TooLarge { limit: u64 },

    #[error("timed out fetching referenced files")]
    Timeout { references: Vec<String> },

    #[error("storage unavailable while fetching {reference}")]
    Unavailable { reference: String, detail: String },

    #[error("invalid file reference: {0}")]
    InvalidReference(String),

    #[error("could not stage referenced files")]
    Staging { detail: String },
}

/// Metadata-only view of a reference, for prompting and previews.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescription {
    pub name: String,
    pub alias: String,
    pub origin: Origin,
    pub bucket: String,
    pub key: String,
    pub byte_size: u64,
    pub format_hint: FormatHint,
}

/// Fetches referenced objects into a private, sealed workspace.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn ObjectStore>,
    default_bucket: String,
    max_bytes: u64,
    fetch_timeout: Duration,
    staging_dir: Option<PathBuf>,
}

/// Staged name and alias for one reference, decided before any fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    name: String,
    alias: String,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        default_bucket: impl Into<String>,
        max_bytes: u64,
        fetch_timeout: Duration,
        staging_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            default_bucket: default_bucket.into(),
            max_bytes,
            fetch_timeout,
            staging_dir,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// Fetch every reference and stage it. All-or-nothing: on any failure
    /// nothing is handed out and everything staged so far is removed.
    ///
    /// The whole fetch, metadata lookups included, is bounded by one
    /// `fetch_timeout`.
    pub async fn resolve(&self, refs: &[FileReference]) -> Result<Workspace, ResolutionFailure> {
        let slots = plan_slots(refs)?;

        let (metas, blobs) = self.within_timeout(refs, self.download(refs)).await?;

        let mut builder = WorkspaceBuilder::create(self.staging_dir.as_deref()).map_err(staging)?;
        for (((reference, slot), meta), bytes) in refs.iter().zip(slots).zip(&metas).zip(&blobs) {
            let entry = ManifestEntry {
                format_hint: format::infer(&slot.name, meta.content_type.as_deref(), bytes),
                name: slot.name,
                alias: slot.alias,
                byte_size: bytes.len() as u64,
                origin: reference.origin.to_string(),
                location: format!("{}/{}", reference.bucket_or(&self.default_bucket), reference.key),
                digest: hex_digest(bytes),
            };
            builder.stage(entry, bytes).await.map_err(staging)?;
        }
        let workspace = builder.seal().map_err(staging)?;

        info!(
            files = workspace.entries().len(),
            bytes = workspace.total_bytes(),
            "workspace staged"
        );
        Ok(workspace)
    }

    /// Describe references from object metadata alone. Nothing is downloaded.
    pub async fn describe(
        &self,
        refs: &[FileReference],
    ) -> Result<Vec<FileDescription>, ResolutionFailure> {
        let slots = plan_slots(refs)?;
        let metas = self
            .within_timeout(refs, try_join_all(refs.iter().map(|r| self.stat(r))))
            .await?;
        Ok(refs
            .iter()
            .zip(slots)
            .zip(metas)
            .map(|((reference, slot), meta)| FileDescription {
                format_hint: format::infer(&slot.name, meta.content_type.as_deref(), &[]),
                name: slot.name,
                alias: slot.alias,
                origin: reference.origin,
                bucket: reference.bucket_or(&self.default_bucket).to_string(),
                key: reference.key.clone(),
                byte_size: meta.size,
            })
            .collect())
    }

    async fn within_timeout<T>(
        &self,
        refs: &[FileReference],
        work: impl Future<Output = Result<T, ResolutionFailure>>,
    ) -> Result<T, ResolutionFailure> {
        match tokio::time::timeout(self.fetch_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ResolutionFailure::Timeout {
                references: refs.iter().map(|r| self.label(r)).collect(),
            }),
        }
    }

    /// Check declared sizes against the request budget, then download one
    /// object at a time, each capped at what is left of the budget.
    async fn download(
        &self,
        refs: &[FileReference],
    ) -> Result<(Vec<ObjectMeta>, Vec<Bytes>), ResolutionFailure> {
        let metas = try_join_all(refs.iter().map(|r| self.stat(r))).await?;
        let declared: u64 = metas.iter().map(|m| m.size).sum();
        if declared > self.max_bytes {
            debug!(declared, limit = self.max_bytes, "declared sizes exceed request limit");
            return Err(ResolutionFailure::TooLarge {
                limit: self.max_bytes,
            });
        }

        let mut remaining = self.max_bytes;
        let mut blobs = Vec::with_capacity(refs.len());
        for reference in refs {
            let bytes = self.fetch(reference, remaining).await?;
            remaining = remaining.saturating_sub(bytes.len() as u64);
            blobs.push(bytes);
        }
        Ok((metas, blobs))
    }

    async fn stat(&self, reference: &FileReference) -> Result<ObjectMeta, ResolutionFailure> {
        let bucket = reference.bucket_or(&self.default_bucket);
        self.store
            .stat_object(bucket, &reference.key)
            .await
            .map_err(|e| self.storage_failure(self.label(reference), e))
    }

    async fn fetch(&self, reference: &FileReference, budget: u64) -> Result<Bytes, ResolutionFailure> {
        let bucket = reference.bucket_or(&self.default_bucket);
        self.store
            .get_object(bucket, &reference.key, budget)
            .await
            .map_err(|e| self.storage_failure(self.label(reference), e))
    }

    fn label(&self, reference: &FileReference) -> String {
        format!("{}/{}", reference.bucket_or(&self.default_bucket), reference.key)
    }

    fn storage_failure(&self, reference: String, err: StorageError) -> ResolutionFailure {
        match err {
            StorageError::NotFound { .. } | StorageError::BucketNotFound(_) => {
                ResolutionFailure::NotFound { reference }
            }
            StorageError::AccessDenied(_) | StorageError::Credentials(_) => {
                ResolutionFailure::AccessDenied { reference }
            }
            StorageError::TooLarge { .. } => ResolutionFailure::TooLarge {
                limit: self.max_bytes,
            },
            StorageError::InvalidKey(_) => ResolutionFailure::InvalidReference(reference),
            e @ (StorageError::Unavailable(_) | StorageError::Io(_)) => {
                ResolutionFailure::Unavailable {
                    reference,
                    detail: e.to_string(),
                }
            }
        }
    }
}

fn staging(e: std::io::Error) -> ResolutionFailure {
    ResolutionFailure::Staging {
        detail: e.to_string(),
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Assign each reference a unique staged file name and a unique alias.
/// Collisions get `_2`, `_3`, ... in reference order.
fn plan_slots(refs: &[FileReference]) -> Result<Vec<Slot>, ResolutionFailure> {
    let mut names = HashSet::new();
    let mut aliases = HashSet::new();
    refs.iter()
        .map(|r| {
            if r.key.is_empty() || r.key.ends_with('/') {
                return Err(ResolutionFailure::InvalidReference(r.to_string()));
            }
            let base = staged_name(&r.key);
            let name = unique(&mut names, &base, |n| {
                match base.rsplit_once('.').filter(|(stem, _)| !stem.is_empty()) {
                    Some((stem, ext)) => format!("{stem}_{n}.{ext}"),
                    None => format!("{base}_{n}"),
                }
            });
            let stem = alias_for(&base);
            let alias = unique(&mut aliases, &stem, |n| format!("{stem}_{n}"));
            Ok(Slot { name, alias })
        })
        .collect()
}

fn unique(taken: &mut HashSet<String>, first: &str, nth: impl Fn(usize) -> String) -> String {
    let mut candidate = first.to_string();
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = nth(n);
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

/// Last path segment of an object key, restricted to a portable character set.
fn staged_name(key: &str) -> String {
    let base = key.rsplit('/').next().unwrap_or(key);
    let name: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.trim_matches('.').is_empty() {
        "file".to_string()
    } else {
        name
    }
}

/// Identifier-safe name: text before the first `.`, non-alphanumerics as `_`,
/// lower-cased, `df_`-prefixed when it would start with a digit.
pub fn alias_for(file_name: &str) -> String {
    let stem = file_name.split('.').next().unwrap_or_default();
    let alias: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    match alias.chars().next() {
        None => "file".to_string(),
        Some(c) if c.is_ascii_digit() => format!("df_{alias}"),
        Some(_) => alias,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use storage::{LocalStore, StorageResult};

    use super::*;

    /// Local store that answers every call after `delay` and records the
    /// byte budget of each download.
    pub(crate) struct SlowStore {
        pub inner: LocalStore,
        pub delay: Duration,
        pub budgets: Mutex<Vec<u64>>,
    }

    impl SlowStore {
        pub(crate) fn new(inner: LocalStore, delay: Duration) -> Self {
            Self {
                inner,
                delay,
                budgets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for SlowStore {
        fn name(&self) -> &str {
            "slow"
        }

        async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectMeta>> {
            tokio::time::sleep(self.delay).await;
            self.inner.list_objects(bucket).await
        }

        async fn stat_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
            tokio::time::sleep(self.delay).await;
            self.inner.stat_object(bucket, key).await
        }

        async fn get_object(&self, bucket: &str, key: &str, max_bytes: u64) -> StorageResult<Bytes> {
            self.budgets.lock().unwrap().push(max_bytes);
            tokio::time::sleep(self.delay).await;
            self.inner.get_object(bucket, key, max_bytes).await
        }
    }

    async fn fixture() -> (tempfile::TempDir, Resolver) {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("store/uploads");
        tokio::fs::create_dir_all(uploads.join("2024")).await.unwrap();
        tokio::fs::write(uploads.join("sales.csv"), "a,b\n1,2\n3,4\n5,6\n")
            .await
            .unwrap();
        tokio::fs::write(uploads.join("2024/sales.csv"), "a,b\n7,8\n")
            .await
            .unwrap();
        tokio::fs::write(uploads.join("events.json"), "[{\"x\": 1}]")
            .await
            .unwrap();
        let open = dir.path().join("store/open-data");
        tokio::fs::create_dir_all(&open).await.unwrap();
        tokio::fs::write(open.join("big.bin"), vec![7u8; 4096]).await.unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path().join("store")));
        let resolver = Resolver::new(
            store,
            "uploads",
            1024,
            Duration::from_secs(5),
            Some(dir.path().join("staging")),
        );
        (dir, resolver)
    }

    #[test]
    fn aliases_follow_naming_rule() {
        assert_eq!(alias_for("Sales Data.2024.csv"), "sales_data");
        assert_eq!(alias_for("2024-orders.csv"), "df_2024_orders");
        assert_eq!(alias_for("olist_orders_dataset.csv"), "olist_orders_dataset");
        assert_eq!(alias_for(".csv"), "file");
    }

    #[test]
    fn slots_are_unique_and_deterministic() {
        let refs = vec![
            FileReference::uploaded("a/sales.csv"),
            FileReference::uploaded("b/sales.csv"),
            FileReference::public("open", "sales.csv"),
            FileReference::uploaded("weird name?.txt"),
        ];
        let slots = plan_slots(&refs).unwrap();
        let names: Vec<_> = slots.iter().map(|s| s.name.as_str()).collect();
        let aliases: Vec<_> = slots.iter().map(|s| s.alias.as_str()).collect();
        assert_eq!(names, ["sales.csv", "sales_2.csv", "sales_3.csv", "weird_name_.txt"]);
        assert_eq!(aliases, ["sales", "sales_2", "sales_3", "weird_name_"]);
        assert_eq!(plan_slots(&refs).unwrap(), slots);
    }

    #[test]
    fn rejects_directory_keys() {
        let err = plan_slots(&[FileReference::uploaded("folder/")]).unwrap_err();
        assert!(matches!(err, ResolutionFailure::InvalidReference(_)));
    }

    #[tokio::test]
    async fn resolve_stages_sealed_workspace() {
        let (_dir, resolver) = fixture().await;
        let refs = vec![
            FileReference::uploaded("sales.csv"),
            FileReference::uploaded("2024/sales.csv"),
            FileReference::uploaded("events.json"),
        ];
        let workspace = resolver.resolve(&refs).await.unwrap();

        let entries = workspace.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "sales.csv");
        assert_eq!(entries[0].format_hint, FormatHint::Tabular);
        assert_eq!(entries[0].byte_size, 16);
        assert_eq!(entries[0].location, "uploads/sales.csv");
        assert_eq!(entries[0].origin, "uploaded");
        assert_eq!(entries[1].name, "sales_2.csv");
        assert_eq!(entries[2].format_hint, FormatHint::SemiStructured);
        assert_eq!(entries[0].digest.len(), 64);

        let staged = tokio::fs::read_to_string(workspace.file_path(&entries[0]))
            .await
            .unwrap();
        assert_eq!(staged, "a,b\n1,2\n3,4\n5,6\n");
        let mode = std::fs::metadata(workspace.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);

        let root = workspace.path().to_path_buf();
        workspace.release().unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn resolving_twice_is_stable() {
        let (_dir, resolver) = fixture().await;
        let refs = vec![FileReference::uploaded("sales.csv")];
        let first = resolver.resolve(&refs).await.unwrap();
        let second = resolver.resolve(&refs).await.unwrap();
        assert_eq!(first.entries()[0].format_hint, second.entries()[0].format_hint);
        assert_eq!(first.entries()[0].byte_size, second.entries()[0].byte_size);
        assert_ne!(first.path(), second.path());
    }

    #[tokio::test]
    async fn missing_object_fails_whole_call() {
        let (dir, resolver) = fixture().await;
        let refs = vec![
            FileReference::uploaded("sales.csv"),
            FileReference::uploaded("missing.csv"),
        ];
        let err = resolver.resolve(&refs).await.unwrap_err();
        assert!(matches!(err, ResolutionFailure::NotFound { .. }), "got: {err:?}");
        assert_eq!(err.to_string(), "file not found: uploads/missing.csv");

        // Nothing was staged.
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn byte_ceiling_fails_before_download() {
        let (_dir, resolver) = fixture().await;
        let refs = vec![FileReference::public("open-data", "big.bin")];
        let err = resolver.resolve(&refs).await.unwrap_err();
        assert!(matches!(err, ResolutionFailure::TooLarge { limit: 1024 }), "got: {err:?}");
    }

    #[tokio::test]
    async fn downloads_share_the_remaining_budget() {
        let (dir, _) = fixture().await;
        let store = Arc::new(SlowStore::new(
            LocalStore::new(dir.path().join("store")),
            Duration::ZERO,
        ));
        let resolver = Resolver::new(store.clone(), "uploads", 1024, Duration::from_secs(5), None);
        let refs = vec![
            FileReference::uploaded("sales.csv"),
            FileReference::uploaded("2024/sales.csv"),
            FileReference::uploaded("events.json"),
        ];
        let workspace = resolver.resolve(&refs).await.unwrap();
        assert_eq!(*store.budgets.lock().unwrap(), [1024, 1008, 1000]);
        workspace.release().unwrap();
    }

    #[tokio::test]
    async fn lookup_and_download_share_one_deadline() {
        let (dir, _) = fixture().await;
        // Each round trip alone fits the timeout; the two together do not.
        let store = Arc::new(SlowStore::new(
            LocalStore::new(dir.path().join("store")),
            Duration::from_millis(150),
        ));
        let resolver = Resolver::new(
            store,
            "uploads",
            1024,
            Duration::from_millis(250),
            Some(dir.path().join("staging")),
        );
        let err = resolver
            .resolve(&[FileReference::uploaded("sales.csv")])
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionFailure::Timeout { .. }), "got: {err:?}");
        assert_eq!(err.to_string(), "timed out fetching referenced files");
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn too_large_message_hides_the_limit() {
        let (_dir, resolver) = fixture().await;
        let err = resolver
            .resolve(&[FileReference::public("open-data", "big.bin")])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "referenced files exceed the size limit");
    }

    #[tokio::test]
    async fn describe_reads_metadata_only() {
        let (_dir, resolver) = fixture().await;
        let refs = vec![
            FileReference::uploaded("2024/sales.csv"),
            FileReference::public("open-data", "big.bin"),
        ];
        let described = resolver.describe(&refs).await.unwrap();
        assert_eq!(described[0].alias, "sales");
        assert_eq!(described[0].bucket, "uploads");
        assert_eq!(described[0].byte_size, 8);
        assert_eq!(described[0].format_hint, FormatHint::Tabular);
        assert_eq!(described[1].byte_size, 4096);
        assert_eq!(described[1].origin, Origin::Public);
    }
}
