//! Buffer layer error types.

use crate::page::PageId;
use thiserror::Error;

/// Errors that can occur in the buffer layer.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Buffer pool is full: every frame is pinned")]
    BufferPoolFull,

    #[error("Page not found on disk: {0}")]
    PageNotFound(PageId),

    #[error("Page buffer must be {expected} bytes, got {actual}")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for buffer layer operations.
pub type BufferResult<T> = Result<T, BufferError>;
