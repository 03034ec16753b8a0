use std::{path::PathBuf, time::Duration};

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the pipeline
/// can decide what is user-facing, what is retryable and what is terminal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    Validation(String),

    /// Platform flood control: the call may be repeated after the given delay.
    #[error("rate limited, retry after {0:?}")]
    RetryAfter(Duration),

    #[error("download service error: {0}")]
    Rpc(String),

    #[error("download job not found: {0}")]
    JobNotFound(String),

    #[error("segmentation failed: {0}")]
    Segmentation(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("cancelled")]
    Cancelled,

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
