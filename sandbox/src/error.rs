#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("unsupported guest language: {0}")]
    UnsupportedLanguage(String),

    #[error("sandbox launch failed: {0}")]
    LaunchFailed(String),

    #[error("guest protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
