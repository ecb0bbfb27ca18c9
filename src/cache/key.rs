use std::fmt;

/// Identifier assigned to a registered storage. Unique among currently
/// registered storages; may be reused after the storage is removed.
pub type StorageId = u32;

/// Packed 64-bit page identity: `(storage_id << 32) | page_index`.
///
/// `page_index` is the page's zero-based index within its storage, not a
/// byte offset, so a single storage can address up to 2^32 pages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey(u64);

impl PageKey {
    pub fn new(storage_id: StorageId, page_index: u32) -> Self {
        Self(((storage_id as u64) << 32) | page_index as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn storage_id(self) -> StorageId {
        (self.0 >> 32) as u32
    }

    pub fn page_index(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.storage_id(), self.page_index())
    }
}

impl fmt::Debug for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageKey({}:{})", self.storage_id(), self.page_index())
    }
}
