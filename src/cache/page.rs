use crate::cache::error::{CacheError, CacheResult};
use crate::cache::key::PageKey;
use crate::storage::FileStorage;
use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;

const STATE_RESIDENT: u8 = 0;
const STATE_PENDING_RELEASE: u8 = 1;
const STATE_RELEASED: u8 = 2;

/// A resident page: one fixed-size buffer of its owning storage's content.
///
/// At any instant a page is owned by exactly one of the cache's live
/// table, its trash table, or (once released) the external allocator.
/// Callers that got a page from [`PageCacheManager::get`] mark active use
/// with [`lock`]/[`unlock`]; a locked page is never force-released by a
/// routine disposal pass.
///
/// [`PageCacheManager::get`]: crate::cache::manager::PageCacheManager::get
/// [`lock`]: Page::lock
/// [`unlock`]: Page::unlock
pub struct Page {
    key: PageKey,
    owner: Arc<dyn FileStorage>,
    /// Byte offset of this page within its owning storage.
    offset: u64,
    len: usize,
    /// `None` once the buffer has been handed back to the allocator.
    buf: RwLock<Option<Box<[u8]>>>,
    state: AtomicU8,
    dirty: AtomicBool,
    lock_count: AtomicU32,
}

impl Page {
    /// Allocate a buffer and fill it from the owning storage. May perform
    /// blocking I/O; failures propagate and leave no page behind.
    pub(crate) fn materialize(
        key: PageKey,
        owner: Arc<dyn FileStorage>,
        offset: u64,
    ) -> io::Result<Arc<Page>> {
        let mut buf = vec![0u8; owner.page_size()].into_boxed_slice();
        owner.read_page(offset, &mut buf)?;
        Ok(Arc::new(Page {
            key,
            len: buf.len(),
            offset,
            owner,
            buf: RwLock::new(Some(buf)),
            state: AtomicU8::new(STATE_RESIDENT),
            dirty: AtomicBool::new(false),
            lock_count: AtomicU32::new(0),
        }))
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn owner(&self) -> &Arc<dyn FileStorage> {
        &self.owner
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Buffer length in bytes; stable across release.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count.load(Ordering::Acquire) > 0
    }

    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RELEASED
    }

    /// Mark the page as in active use, shielding it from routine
    /// disposal. Calls nest; every `lock` needs a matching [`unlock`].
    ///
    /// [`unlock`]: Page::unlock
    pub fn lock(&self) {
        self.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        let previous = self.lock_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unlock without matching lock");
    }

    /// Read buffer contents through a closure.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> CacheResult<R> {
        let guard = self.buf.read();
        match guard.as_deref() {
            Some(data) => Ok(f(data)),
            None => Err(CacheError::PageReleased(self.key)),
        }
    }

    /// Mutate buffer contents through a closure; marks the page dirty.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> CacheResult<R> {
        let mut guard = self.buf.write();
        match guard.as_deref_mut() {
            Some(data) => {
                self.dirty.store(true, Ordering::Release);
                Ok(f(data))
            }
            None => Err(CacheError::PageReleased(self.key)),
        }
    }

    /// Write dirty contents back to the owning storage. No-op when clean
    /// or already released.
    pub fn flush(&self) -> io::Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let guard = self.buf.read();
        if let Some(data) = guard.as_deref() {
            self.owner.write_page(self.offset, data)?;
            self.dirty.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Hand the buffer back to the allocator. Idempotent. Returns `false`
    /// when the page is locked and `force` is not set; dirty contents are
    /// flushed first, and a flush failure leaves the page unreleased.
    pub fn try_release(&self, force: bool) -> io::Result<bool> {
        if self.is_released() {
            return Ok(true);
        }
        if !force && self.is_locked() {
            return Ok(false);
        }
        self.flush()?;
        *self.buf.write() = None;
        self.state.store(STATE_RELEASED, Ordering::Release);
        Ok(true)
    }

    /// Structural move out of the live table: the page is now awaiting
    /// disposal unless it gets resurrected first.
    pub(crate) fn mark_evicted(&self) {
        let _ = self.state.compare_exchange(
            STATE_RESIDENT,
            STATE_PENDING_RELEASE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Resurrection from the trash table back into the live table.
    pub(crate) fn mark_resident(&self) {
        let _ = self.state.compare_exchange(
            STATE_PENDING_RELEASE,
            STATE_RESIDENT,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("key", &self.key)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("dirty", &self.is_dirty())
            .field("locked", &self.is_locked())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AccessContext;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory storage recording every write, for page-level tests.
    struct MemStorage {
        page_size: usize,
        context: AccessContext,
        written: Mutex<HashMap<u64, Vec<u8>>>,
    }

    impl MemStorage {
        fn new(page_size: usize) -> Arc<Self> {
            Arc::new(Self {
                page_size,
                context: AccessContext::new(),
                written: Mutex::new(HashMap::new()),
            })
        }
    }

    impl FileStorage for MemStorage {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn access_context(&self) -> &AccessContext {
            &self.context
        }

        fn read_page(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            match self.written.lock().get(&offset) {
                Some(data) => buf.copy_from_slice(data),
                None => buf.fill(0),
            }
            Ok(())
        }

        fn write_page(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
            self.written.lock().insert(offset, buf.to_vec());
            Ok(())
        }
    }

    fn make_page(storage: &Arc<MemStorage>) -> Arc<Page> {
        let owner: Arc<dyn FileStorage> = storage.clone();
        Page::materialize(PageKey::new(0, 0), owner, 0).unwrap()
    }

    #[test]
    fn test_write_marks_dirty_and_flush_clears() {
        let storage = MemStorage::new(16);
        let page = make_page(&storage);

        assert!(!page.is_dirty());
        page.write(|data| data[3] = 9).unwrap();
        assert!(page.is_dirty());

        page.flush().unwrap();
        assert!(!page.is_dirty());
        assert_eq!(storage.written.lock().get(&0).unwrap()[3], 9);
    }

    #[test]
    fn test_locked_page_resists_release() {
        let storage = MemStorage::new(16);
        let page = make_page(&storage);

        page.lock();
        assert!(!page.try_release(false).unwrap());
        assert!(!page.is_released());

        page.unlock();
        assert!(page.try_release(false).unwrap());
        assert!(page.is_released());
    }

    #[test]
    fn test_force_release_ignores_lock() {
        let storage = MemStorage::new(16);
        let page = make_page(&storage);

        page.lock();
        assert!(page.try_release(true).unwrap());
        assert!(page.is_released());
    }

    #[test]
    fn test_release_is_idempotent_and_flushes_dirty() {
        let storage = MemStorage::new(16);
        let page = make_page(&storage);

        page.write(|data| data[0] = 42).unwrap();
        assert!(page.try_release(false).unwrap());
        assert!(page.try_release(false).unwrap());

        // Dirty contents reached the storage exactly once.
        assert_eq!(storage.written.lock().get(&0).unwrap()[0], 42);
    }

    #[test]
    fn test_access_after_release_fails() {
        let storage = MemStorage::new(16);
        let page = make_page(&storage);

        page.try_release(false).unwrap();
        assert!(matches!(
            page.read(|_| ()),
            Err(CacheError::PageReleased(_))
        ));
        assert!(matches!(
            page.write(|_| ()),
            Err(CacheError::PageReleased(_))
        ));
    }

    #[test]
    fn test_eviction_state_round_trip() {
        let storage = MemStorage::new(16);
        let page = make_page(&storage);

        page.mark_evicted();
        assert!(!page.is_released());
        page.mark_resident();
        assert!(!page.is_released());

        page.try_release(false).unwrap();
        // A released page stays released.
        page.mark_resident();
        assert!(page.is_released());
    }
}
