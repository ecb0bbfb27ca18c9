//! Page cache error types.

use crate::cache::key::{PageKey, StorageId};
use thiserror::Error;

/// Errors that can occur in the page cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The storage id could not be resolved; its registration was removed
    /// concurrently. Recoverable: the caller may re-register or abort.
    #[error("Storage {0} is closed or was never registered")]
    ClosedStorage(StorageId),

    #[error("{0} access denied by storage context")]
    AccessDenied(&'static str),

    /// The page buffer was already released back to the allocator.
    #[error("Page {0} is already released")]
    PageReleased(PageKey),

    /// A buffer was still locked where none may be (shutdown check).
    #[error("Page {0} is still locked")]
    BufferLocked(PageKey),

    /// One or more per-page flush failures in an owner-scoped flush.
    /// Every page was attempted before this was raised.
    #[error("Flush failed for {} page(s)", .0.len())]
    FlushFailed(Vec<(PageKey, std::io::Error)>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for page cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
