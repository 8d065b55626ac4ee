use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Preflight(String),
    #[error("file exceeds the maximum allowed download size")]
    SizeLimit,
    #[error("download aborted")]
    Aborted,
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("injection error: {0}")]
    Inject(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
