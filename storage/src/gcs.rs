use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::credentials::Credentials;
use crate::error::{StorageError, StorageResult};
use crate::store::{ObjectMeta, ObjectStore};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Timeout for a single request; large downloads are bounded by the caller.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Google Cloud Storage over the JSON API. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct GcsStore {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    endpoint: Url,
    credentials: Credentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    /// The JSON API encodes sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
    content_type: Option<String>,
    updated: Option<DateTime<Utc>>,
    time_created: Option<DateTime<Utc>>,
}

impl GcsObject {
    fn into_meta(self) -> StorageResult<ObjectMeta> {
        let size = match self.size {
            Some(s) => s
                .parse()
                .map_err(|e| StorageError::Unavailable(format!("size of {}: {e}", self.name)))?,
            None => 0,
        };
        Ok(ObjectMeta {
            name: self.name,
            size,
            content_type: self.content_type,
            updated: self.updated,
            created: self.time_created,
        })
    }
}

impl GcsStore {
    pub fn new(endpoint: &str, credentials: Credentials) -> StorageResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StorageError::Unavailable(format!("endpoint {endpoint}: {e}")))?;
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Unavailable(format!("http client: {e}")))?;

        info!(endpoint = %endpoint, credentials = ?credentials_kind(&credentials), "gcs store initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoint,
                credentials,
            }),
        })
    }

    /// `<endpoint>/storage/v1/b/<bucket>/o[/<key>]`, each segment percent-encoded.
    fn object_url(&self, bucket: &str, key: Option<&str>) -> StorageResult<Url> {
        let mut url = self.inner.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| StorageError::Unavailable("endpoint cannot be a base".into()))?;
            segments
                .pop_if_empty()
                .extend(["storage", "v1", "b", bucket, "o"]);
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    /// Build a request carrying the bearer token, when the credentials provide one.
    fn request(&self, url: Url) -> StorageResult<reqwest::RequestBuilder> {
        let req = self.inner.client.get(url);
        Ok(match self.inner.credentials.token()? {
            Some(token) => req.bearer_auth(token),
            None => req,
        })
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        bucket: &str,
        key: Option<&str>,
    ) -> StorageResult<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("request: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match (status, key) {
            (StatusCode::NOT_FOUND, Some(key)) => StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            (StatusCode::NOT_FOUND, None) => StorageError::BucketNotFound(bucket.to_string()),
            (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
                StorageError::AccessDenied(format!("{bucket}: {status}"))
            }
            _ => StorageError::Unavailable(format!("{status}: {}", body.trim())),
        })
    }
}

fn credentials_kind(credentials: &Credentials) -> &'static str {
    match credentials {
        Credentials::Anonymous => "anonymous",
        Credentials::Static(_) => "static",
        Credentials::Env(_) => "env",
    }
}

fn check_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".into()));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn name(&self) -> &str {
        "gcs"
    }

    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.object_url(bucket, None)?;
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let resp = self.send(self.request(url)?, bucket, None).await?;
            let page: ListResponse = resp
                .json()
                .await
                .map_err(|e| StorageError::Unavailable(format!("list decode: {e}")))?;
            for item in page.items {
                objects.push(item.into_meta()?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(bucket, count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        check_key(key)?;
        let url = self.object_url(bucket, Some(key))?;
        let resp = self.send(self.request(url)?, bucket, Some(key)).await?;
        let object: GcsObject = resp
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(format!("stat decode: {e}")))?;
        object.into_meta()
    }

    async fn get_object(&self, bucket: &str, key: &str, max_bytes: u64) -> StorageResult<Bytes> {
        check_key(key)?;
        let mut url = self.object_url(bucket, Some(key))?;
        url.query_pairs_mut().append_pair("alt", "media");
        let mut resp = self.send(self.request(url)?, bucket, Some(key)).await?;

        let too_large = || StorageError::TooLarge {
            bucket: bucket.to_string(),
            key: key.to_string(),
            limit: max_bytes,
        };
        if let Some(len) = resp.content_length()
            && len > max_bytes
        {
            return Err(too_large());
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| StorageError::Unavailable(format!("download {bucket}/{key}: {e}")))?
        {
            if (buf.len() + chunk.len()) as u64 > max_bytes {
                return Err(too_large());
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}
