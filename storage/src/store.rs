use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StorageResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Read-only access to named objects grouped in buckets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable name for this backend (e.g. "gcs", "local").
    fn name(&self) -> &str;

    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectMeta>>;

    async fn stat_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta>;

    /// Fetch the object's bytes. Fails with `TooLarge` as soon as more than
    /// `max_bytes` would be returned.
    async fn get_object(&self, bucket: &str, key: &str, max_bytes: u64) -> StorageResult<Bytes>;
}
