use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;

use crate::error::{StorageError, StorageResult};
use crate::store::{ObjectMeta, ObjectStore};

/// Directory-backed store: bucket `b`, key `k` lives at `<root>/b/k`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> StorageResult<PathBuf> {
        if bucket.is_empty() || !is_plain_relative(Path::new(bucket)) || bucket.contains('/') {
            return Err(StorageError::InvalidKey(format!("bucket {bucket:?}")));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        let dir = self.bucket_dir(bucket)?;
        if key.is_empty() || !is_plain_relative(Path::new(key)) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(dir.join(key))
    }
}

/// Only normal components: no root, no `.`/`..`.
fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn content_type_for(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let ct = match ext.as_str() {
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "json" => "application/json",
        "jsonl" | "ndjson" => "application/x-ndjson",
        "txt" => "text/plain",
        "parquet" => "application/vnd.apache.parquet",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => return None,
    };
    Some(ct.to_string())
}

async fn meta_for(path: &Path, name: String) -> std::io::Result<ObjectMeta> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(ObjectMeta {
        content_type: content_type_for(&name),
        name,
        size: meta.len(),
        updated: meta.modified().ok().map(DateTime::<Utc>::from),
        created: meta.created().ok().map(DateTime::<Utc>::from),
    })
}

fn not_found(bucket: &str, key: &str, e: std::io::Error) -> StorageError {
    match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        std::io::ErrorKind::PermissionDenied => {
            StorageError::AccessDenied(format!("{bucket}/{key}"))
        }
        _ => StorageError::Io(e),
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectMeta>> {
        let dir = self.bucket_dir(bucket)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }

        let mut objects = Vec::new();
        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(&dir)
                {
                    let name = rel.to_string_lossy().into_owned();
                    objects.push(meta_for(&path, name).await?);
                }
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(bucket, key)?;
        let meta = meta_for(&path, key.to_string())
            .await
            .map_err(|e| not_found(bucket, key, e))?;
        Ok(meta)
    }

    async fn get_object(&self, bucket: &str, key: &str, max_bytes: u64) -> StorageResult<Bytes> {
        let path = self.object_path(bucket, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found(bucket, key, e))?;
        let mut buf = Vec::new();
        // Read one byte past the cap to detect oversize objects.
        file.take(max_bytes.saturating_add(1))
            .read_to_end(&mut buf)
            .await?;
        if buf.len() as u64 > max_bytes {
            return Err(StorageError::TooLarge {
                bucket: bucket.to_string(),
                key: key.to_string(),
                limit: max_bytes,
            });
        }
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("data");
        tokio::fs::create_dir_all(bucket.join("nested")).await.unwrap();
        tokio::fs::write(bucket.join("a.csv"), b"x,y\n1,2\n").await.unwrap();
        tokio::fs::write(bucket.join("nested/b.json"), b"[]").await.unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn lists_nested_objects_sorted() {
        let (_dir, store) = fixture().await;
        let objects = store.list_objects("data").await.unwrap();
        let names: Vec<_> = objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "nested/b.json"]);
        assert_eq!(objects[0].size, 8);
        assert_eq!(objects[0].content_type.as_deref(), Some("text/csv"));
    }

    #[tokio::test]
    async fn missing_bucket_and_object() {
        let (_dir, store) = fixture().await;
        assert!(matches!(
            store.list_objects("other").await,
            Err(StorageError::BucketNotFound(_))
        ));
        assert!(matches!(
            store.get_object("data", "nope.csv", 100).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let (_dir, store) = fixture().await;
        for key in ["../secret", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(
                    store.get_object("data", key, 100).await,
                    Err(StorageError::InvalidKey(_))
                ),
                "key {key:?} was accepted"
            );
        }
        assert!(matches!(
            store.list_objects("..").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn get_respects_byte_cap() {
        let (_dir, store) = fixture().await;
        let bytes = store.get_object("data", "a.csv", 8).await.unwrap();
        assert_eq!(&bytes[..], b"x,y\n1,2\n");
        assert!(matches!(
            store.get_object("data", "a.csv", 7).await,
            Err(StorageError::TooLarge { .. })
        ));
    }
}
