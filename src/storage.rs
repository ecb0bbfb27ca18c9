//! File-backed storage collaborators for the page cache.
//!
//! A [`FileStorage`] owns the disk side of its pages: it knows the page
//! size, maps byte offsets to file content, and writes dirty buffers
//! back. The cache never inspects buffer contents; it only moves whole
//! pages between the storage and its tables.

pub mod file;

use crate::cache::error::{CacheError, CacheResult};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use file::PagedFile;

/// A registered file-backed storage. Implementations must tolerate
/// concurrent calls; the cache invokes `read_page` under its allocation
/// lock and `write_page` from flush and disposal paths.
pub trait FileStorage: Send + Sync {
    /// Fixed page size of this storage, in bytes.
    fn page_size(&self) -> usize;

    /// Permission context checked before page materialization and
    /// owner-scoped operations.
    fn access_context(&self) -> &AccessContext;

    /// Fill `buf` with content at `offset`. Offsets past the current end
    /// of the storage read as zeroes.
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write a page buffer back at `offset`, extending the storage if
    /// needed.
    fn write_page(&self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

/// Storage handles are compared by identity: two `Arc`s denote the same
/// storage iff they point at the same object.
pub(crate) fn same_storage(a: &Arc<dyn FileStorage>, b: &Arc<dyn FileStorage>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Read/write permission flags attached to a storage. Both directions are
/// allowed by default; an embedding system can forbid one while e.g. a
/// storage is mid-teardown or opened read-only.
#[derive(Debug, Default)]
pub struct AccessContext {
    read_forbidden: AtomicBool,
    write_forbidden: AtomicBool,
}

impl AccessContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_read_access(&self) -> CacheResult<()> {
        if self.read_forbidden.load(Ordering::Acquire) {
            return Err(CacheError::AccessDenied("read"));
        }
        Ok(())
    }

    pub fn check_write_access(&self) -> CacheResult<()> {
        if self.write_forbidden.load(Ordering::Acquire) {
            return Err(CacheError::AccessDenied("write"));
        }
        Ok(())
    }

    pub fn set_read_allowed(&self, allowed: bool) {
        self.read_forbidden.store(!allowed, Ordering::Release);
    }

    pub fn set_write_allowed(&self, allowed: bool) {
        self.write_forbidden.store(!allowed, Ordering::Release);
    }
}
