use crate::error::{StorageError, StorageResult};

/// Source of bearer tokens for private buckets.
///
/// Tokens are looked up per call and never cached by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// Public buckets only; no `Authorization` header is sent.
    #[default]
    Anonymous,
    Static(String),
    /// Read the token from this environment variable at call time.
    Env(String),
}

impl Credentials {
    pub fn token(&self) -> StorageResult<Option<String>> {
        match self {
            Self::Anonymous => Ok(None),
            Self::Static(token) => Ok(Some(token.clone())),
            Self::Env(var) => match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
                Ok(_) => Err(StorageError::Credentials(format!("{var} is empty"))),
                Err(e) => Err(StorageError::Credentials(format!("{var}: {e}"))),
            },
        }
    }
}
