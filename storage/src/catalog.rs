use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::ObjectStore;

/// Where a referenced file comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The caller's own uploads, kept in the default bucket.
    Uploaded,
    /// A bucket named by the caller.
    Public,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "public" => Ok(Self::Public),
            other => Err(format!("unknown origin: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    pub origin: Origin,
    pub bucket: String,
    /// One-line description of where the file comes from.
    pub source_info: String,
}

/// Files from the uploads bucket followed by those of `public_bucket`.
///
/// An uploaded file shadows a public file with the same name. A bucket that
/// cannot be listed contributes nothing; the failure is logged.
pub async fn combined_listing(
    store: &dyn ObjectStore,
    uploads_bucket: &str,
    public_bucket: Option<&str>,
) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();

    match store.list_objects(uploads_bucket).await {
        Ok(objects) => entries.extend(objects.into_iter().map(|o| CatalogEntry {
            name: o.name,
            size: o.size,
            content_type: o.content_type,
            updated: o.updated,
            origin: Origin::Uploaded,
            bucket: uploads_bucket.to_string(),
            source_info: "Your uploaded files".to_string(),
        })),
        Err(e) => warn!(bucket = uploads_bucket, error = %e, "uploads bucket listing failed"),
    }

    let Some(public) = public_bucket.filter(|b| *b != uploads_bucket) else {
        return entries;
    };
    match store.list_objects(public).await {
        Ok(objects) => {
            let taken: HashSet<String> = entries.iter().map(|e| e.name.clone()).collect();
            entries.extend(
                objects
                    .into_iter()
                    .filter(|o| !taken.contains(&o.name))
                    .map(|o| CatalogEntry {
                        name: o.name,
                        size: o.size,
                        content_type: o.content_type,
                        updated: o.updated,
                        origin: Origin::Public,
                        bucket: public.to_string(),
                        source_info: format!("Public bucket: {public}"),
                    }),
            );
        }
        Err(e) => warn!(bucket = public, error = %e, "public bucket listing failed"),
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;

    async fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        for (bucket, name) in [
            ("uploads", "sales.csv"),
            ("uploads", "mine.json"),
            ("open", "sales.csv"),
            ("open", "weather.csv"),
        ] {
            let path = dir.path().join(bucket);
            tokio::fs::create_dir_all(&path).await.unwrap();
            tokio::fs::write(path.join(name), bucket.as_bytes()).await.unwrap();
        }
        let store = LocalStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn uploaded_files_take_priority() {
        let (_dir, store) = store().await;
        let entries = combined_listing(&store, "uploads", Some("open")).await;
        let summary: Vec<_> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.origin, e.bucket.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("mine.json", Origin::Uploaded, "uploads"),
                ("sales.csv", Origin::Uploaded, "uploads"),
                ("weather.csv", Origin::Public, "open"),
            ]
        );
        assert_eq!(entries[2].source_info, "Public bucket: open");
    }

    #[tokio::test]
    async fn unreadable_bucket_is_skipped() {
        let (_dir, store) = store().await;
        let entries = combined_listing(&store, "missing", Some("open")).await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.origin == Origin::Public));
    }

    #[tokio::test]
    async fn same_bucket_is_listed_once() {
        let (_dir, store) = store().await;
        let entries = combined_listing(&store, "uploads", Some("uploads")).await;
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn origin_parses() {
        assert_eq!("public".parse::<Origin>().unwrap(), Origin::Public);
        assert!("private".parse::<Origin>().is_err());
    }
}
