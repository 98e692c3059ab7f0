#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Resolution(#[from] engine::ResolutionFailure),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
