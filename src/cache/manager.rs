use crate::cache::error::{CacheError, CacheResult};
use crate::cache::key::{PageKey, StorageId};
use crate::cache::page::Page;
use crate::cache::registry::StorageRegistry;
use crate::cache::stats::CacheStatistics;
use crate::storage::{same_storage, FileStorage};
use log::{error, warn};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live pages, access-ordered: a lookup bumps the entry to
/// most-recently-used, so eviction pops from the cold end.
///
/// Guarded by the manager's access lock, together with the aggregate-size
/// accounting and the hit/miss counters that are bumped at the same
/// places the table is touched.
struct LiveTable {
    pages: LruCache<PageKey, Arc<Page>>,
    /// Sum of lengths of live pages, bytes.
    total_bytes: u64,
    max_bytes: u64,
    hits: u64,
    misses: u64,
    loads: u64,
}

impl LiveTable {
    fn new() -> Self {
        Self {
            pages: LruCache::unbounded(),
            total_bytes: 0,
            max_bytes: 0,
            hits: 0,
            misses: 0,
            loads: 0,
        }
    }

    fn insert(&mut self, key: PageKey, page: Arc<Page>) -> Option<Arc<Page>> {
        self.total_bytes += page.len() as u64;
        let previous = self.pages.put(key, page);
        if let Some(previous) = &previous {
            self.total_bytes -= previous.len() as u64;
        }
        self.max_bytes = self.max_bytes.max(self.total_bytes);
        previous
    }

    fn remove(&mut self, key: &PageKey) -> Option<Arc<Page>> {
        let page = self.pages.pop(key);
        if let Some(page) = &page {
            self.total_bytes -= page.len() as u64;
        }
        page
    }

    fn pop_eldest(&mut self) -> Option<(PageKey, Arc<Page>)> {
        let entry = self.pages.pop_lru();
        if let Some((_, page)) = &entry {
            self.total_bytes -= page.len() as u64;
        }
        entry
    }
}

/// Pages evicted from the live table but not yet confirmed released,
/// kept in insertion order. Guarded by the manager's allocation lock; the
/// guard over this table is what the deadlock-freedom argument hangs on,
/// see [`PageCacheManager`].
struct TrashTable {
    order: VecDeque<PageKey>,
    pages: HashMap<PageKey, Arc<Page>>,
    /// Counts every live-to-trash move (evictions and unmaps).
    mapping_changes: u64,
}

impl TrashTable {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            pages: HashMap::new(),
            mapping_changes: 0,
        }
    }

    fn insert(&mut self, key: PageKey, page: Arc<Page>) {
        self.mapping_changes += 1;
        if self.pages.insert(key, page).is_none() {
            self.order.push_back(key);
        }
    }

    fn remove(&mut self, key: &PageKey) -> Option<Arc<Page>> {
        let page = self.pages.remove(key)?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        Some(page)
    }
}

/// Bounded cache of pages from registered [`FileStorage`]s.
///
/// Two locks govern all page state, with a fixed acquisition order:
///
/// - the **allocation lock** (around [`TrashTable`]) serializes loads,
///   evictions, disposal, and owner-scoped teardown;
/// - the **access lock** (around [`LiveTable`]) serializes live-table
///   lookups. Every lookup is a write because hit tracking reorders the
///   LRU chain.
///
/// When both are needed the allocation lock is taken first, never the
/// reverse. The order is enforced by construction: every helper that
/// touches the live table while the allocation lock is held takes a
/// reference to the guarded [`TrashTable`], obtainable only from the
/// allocation guard, as a parameter.
pub struct PageCacheManager {
    registry: StorageRegistry,
    capacity_bytes: u64,
    /// Access lock.
    live: Mutex<LiveTable>,
    /// Allocation lock.
    trash: Mutex<TrashTable>,
    uncached_access: AtomicU64,
    fast_hits: AtomicU64,
}

impl PageCacheManager {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            registry: StorageRegistry::new(),
            capacity_bytes,
            live: Mutex::new(LiveTable::new()),
            trash: Mutex::new(TrashTable::new()),
            uncached_access: AtomicU64::new(0),
            fast_hits: AtomicU64::new(0),
        }
    }

    /// Register a storage and return the id to build [`PageKey`]s with.
    pub fn register_storage(&self, storage: Arc<dyn FileStorage>) -> StorageId {
        self.registry.register(storage)
    }

    /// Unregister a storage id and force-unmap its resident pages, so a
    /// later reuse of the id can never alias pages of the closed
    /// storage. Callers must no longer hold locks on any of its pages.
    ///
    /// The id is unregistered before the unmap: a concurrent load either
    /// resolved the id earlier, in which case it holds the allocation
    /// lock and the unmap serializes after its insertion, or it resolves
    /// after this point and fails with [`CacheError::ClosedStorage`].
    pub fn remove_storage(&self, id: StorageId) {
        let storage = self.registry.resolve(id).ok();
        self.registry.remove(id);
        if let Some(storage) = storage {
            if let Err(e) = self.unmap_buffers_for_owner(&storage) {
                warn!("could not unmap pages of storage {} on removal: {}", id, e);
            }
        }
    }

    /// Look up or load the page behind `key`.
    ///
    /// Order of consultation: live table, trash table (resurrection),
    /// then materialization through the owning storage. The capacity
    /// bound is re-established before the allocation lock is yielded, so
    /// aggregate live bytes never exceed the limit once this returns.
    ///
    /// `for_write` selects which permission is checked when
    /// `check_access` is set. I/O failures during materialization
    /// propagate unmodified and leave no page behind in either table.
    pub fn get(&self, key: PageKey, for_write: bool, check_access: bool) -> CacheResult<Arc<Page>> {
        // Fast path: live-table hit under the access lock alone.
        {
            let mut live = self.live.lock();
            let hit = live.pages.get(&key).cloned();
            if let Some(page) = hit {
                live.hits += 1;
                return Ok(page);
            }
        }

        // Slow path, fully serialized by the allocation lock.
        let mut trash = self.trash.lock();

        // Evicted but not yet released? Resurrect without touching disk.
        // A page that already slipped through release is never
        // reinserted; it falls through to a fresh load instead.
        if let Some(page) = trash.remove(&key) {
            if !page.is_released() {
                page.mark_resident();
                {
                    let mut live = self.live.lock();
                    let previous = live.insert(key, page.clone());
                    debug_assert!(previous.is_none(), "page {} was both live and trashed", key);
                    live.hits += 1;
                }
                self.ensure_size(&mut trash);
                return Ok(page);
            }
        }

        // Double-check: another thread may have finished loading this
        // page while we waited for the allocation lock.
        {
            let mut live = self.live.lock();
            let loaded = live.pages.get(&key).cloned();
            if let Some(page) = loaded {
                return Ok(page);
            }
        }

        let storage = self.registry.resolve(key.storage_id())?;

        // Best-effort reclamation before allocating a new buffer.
        self.dispose_trashed(&mut trash, None);

        let page = Self::allocate_and_load(key, for_write, &storage, check_access)?;

        {
            let mut live = self.live.lock();
            // Purely observational: with headroom it's a load, at or near
            // capacity it's a miss.
            if live.total_bytes + storage.page_size() as u64 <= self.capacity_bytes {
                live.loads += 1;
            } else {
                live.misses += 1;
            }
            let previous = live.insert(key, page.clone());
            debug_assert!(previous.is_none(), "page {} loaded twice", key);
        }

        self.ensure_size(&mut trash);

        Ok(page)
    }

    /// Evict every live page owned by `storage` and force-release them.
    /// Used when the owner itself is being torn down; callers must
    /// guarantee no other thread still holds a lock on those pages.
    ///
    /// The owned pages are collected while already holding the
    /// allocation lock, so the unmap serializes after any in-flight load
    /// of the same owner and cannot miss its insertion.
    pub fn unmap_buffers_for_owner(&self, storage: &Arc<dyn FileStorage>) -> CacheResult<()> {
        let mut trash = self.trash.lock();
        let owned = self.buffers_for_owner(&trash, storage)?;

        if !owned.is_empty() {
            let mut live = self.live.lock();
            for (key, _) in &owned {
                if let Some(page) = live.remove(key) {
                    page.mark_evicted();
                    trash.insert(*key, page);
                }
            }
        }
        self.dispose_trashed(&mut trash, Some(storage));
        Ok(())
    }

    /// Flush every dirty, not-yet-released live page owned by `storage`.
    /// Every page is attempted even when an earlier one fails; failures
    /// are collected and raised together as [`CacheError::FlushFailed`].
    pub fn flush_buffers_for_owner(&self, storage: &Arc<dyn FileStorage>) -> CacheResult<()> {
        let mut failures = Vec::new();
        {
            // Hold the allocation lock across collection and flush so no
            // flushed page is concurrently disposed out from under us.
            let allocation = self.trash.lock();
            let owned = self.buffers_for_owner(&allocation, storage)?;
            for (key, page) in owned {
                if page.is_dirty() && !page.is_released() {
                    if let Err(e) = page.flush() {
                        failures.push((key, e));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CacheError::FlushFailed(failures))
        }
    }

    /// Evict everything and run an unrestricted disposal pass. Used for
    /// full cache teardown; locked pages survive in trash for a later
    /// pass.
    pub fn flush_buffers(&self) {
        let mut trash = self.trash.lock();
        {
            let mut live = self.live.lock();
            while let Some((key, page)) = live.pop_eldest() {
                page.mark_evicted();
                trash.insert(key, page);
            }
        }
        self.dispose_trashed(&mut trash, None);
    }

    /// Snapshot all counters atomically under both locks. Safe to call
    /// concurrently with any other operation.
    pub fn statistics(&self) -> CacheStatistics {
        let trash = self.trash.lock();
        let live = self.live.lock();
        CacheStatistics {
            hits: live.hits,
            fast_hits: self.fast_hits.load(Ordering::Relaxed),
            misses: live.misses,
            loads: live.loads,
            uncached_access: self.uncached_access.load(Ordering::Relaxed),
            mapping_changes: trash.mapping_changes,
            cached_bytes: live.total_bytes,
            max_cached_bytes: live.max_bytes,
            max_registered_storages: self.registry.max_registered(),
            capacity_bytes: self.capacity_bytes,
        }
    }

    /// Consistency check for shutdown and tests: no page in either table
    /// may still be locked.
    pub fn assert_no_buffers_locked(&self) -> CacheResult<()> {
        let trash = self.trash.lock();
        let live = self.live.lock();
        for (key, page) in live.pages.iter() {
            if page.is_locked() {
                return Err(CacheError::BufferLocked(*key));
            }
        }
        for (key, page) in trash.pages.iter() {
            if page.is_locked() {
                return Err(CacheError::BufferLocked(*key));
            }
        }
        Ok(())
    }

    pub fn max_capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Record a storage access that bypassed the cache. Lock-free; the
    /// count is informational and tolerates races.
    pub fn note_uncached_access(&self) {
        self.uncached_access.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a hit in a caller-side fast cache sitting in front of this
    /// one.
    pub fn note_fast_hit(&self) {
        self.fast_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Collect live pages owned by `storage`, in key order. Read access
    /// is checked under the access lock. Takes the allocation guard's
    /// contents so the access lock is only ever acquired second.
    fn buffers_for_owner(
        &self,
        _allocation: &TrashTable,
        storage: &Arc<dyn FileStorage>,
    ) -> CacheResult<Vec<(PageKey, Arc<Page>)>> {
        let live = self.live.lock();
        storage.access_context().check_read_access()?;
        let mut owned: Vec<(PageKey, Arc<Page>)> = live
            .pages
            .iter()
            .filter(|(_, page)| same_storage(page.owner(), storage))
            .map(|(key, page)| (*key, page.clone()))
            .collect();
        owned.sort_by_key(|(key, _)| *key);
        Ok(owned)
    }

    fn allocate_and_load(
        key: PageKey,
        for_write: bool,
        storage: &Arc<dyn FileStorage>,
        check_access: bool,
    ) -> CacheResult<Arc<Page>> {
        if check_access {
            let context = storage.access_context();
            if for_write {
                context.check_write_access()?;
            } else {
                context.check_read_access()?;
            }
        }
        let offset = key.page_index() as u64 * storage.page_size() as u64;
        Ok(Page::materialize(key, storage.clone(), offset)?)
    }

    /// Evict least-recently-used pages into trash until aggregate live
    /// bytes fit the capacity again, then attempt disposal. Requires the
    /// allocation guard.
    fn ensure_size(&self, trash: &mut TrashTable) {
        {
            let mut live = self.live.lock();
            while live.total_bytes > self.capacity_bytes {
                let Some((key, page)) = live.pop_eldest() else {
                    break;
                };
                page.mark_evicted();
                trash.insert(key, page);
            }
        }
        self.dispose_trashed(trash, None);
    }

    /// One disposal pass over the trash table. Pages that refuse release
    /// (still locked) stay for a later pass. Pages owned by
    /// `verification` are released unconditionally: their owner is being
    /// torn down. Per-page I/O failures are logged, never raised.
    fn dispose_trashed(&self, trash: &mut TrashTable, verification: Option<&Arc<dyn FileStorage>>) {
        if trash.pages.is_empty() {
            return;
        }
        let keys: Vec<PageKey> = trash.order.iter().copied().collect();
        for key in keys {
            let Some(page) = trash.pages.get(&key).cloned() else {
                continue;
            };
            let force = verification.is_some_and(|s| same_storage(page.owner(), s));
            match page.try_release(force) {
                Ok(true) => {
                    trash.remove(&key);
                }
                Ok(false) => {}
                Err(e) => error!("failed to release trashed page {}: {}", key, e),
            }
        }
    }
}
