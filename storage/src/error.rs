#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("object too large: {bucket}/{key} exceeds {limit} bytes")]
    TooLarge {
        bucket: String,
        key: String,
        limit: u64,
    },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
