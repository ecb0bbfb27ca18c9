/// Snapshot of the cache's counters, taken atomically under both page
/// locks by [`PageCacheManager::statistics`].
///
/// [`PageCacheManager::statistics`]: crate::cache::manager::PageCacheManager::statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Page found in the live table.
    pub hits: u64,
    /// Page found in a caller's own fast cache, reported via
    /// [`note_fast_hit`]; counted here, not computed here.
    ///
    /// [`note_fast_hit`]: crate::cache::manager::PageCacheManager::note_fast_hit
    pub fast_hits: u64,
    /// Page loaded while the cache was at or near capacity.
    pub misses: u64,
    /// Page loaded while the cache still had headroom.
    pub loads: u64,
    /// Storage accesses that bypassed the cache entirely.
    pub uncached_access: u64,
    /// Live-to-trash moves (evictions and unmaps).
    pub mapping_changes: u64,
    /// Aggregate bytes of live pages at snapshot time.
    pub cached_bytes: u64,
    /// Maximum aggregate live bytes ever observed.
    pub max_cached_bytes: u64,
    /// Maximum number of simultaneously registered storages.
    pub max_registered_storages: usize,
    /// Configured capacity bound, bytes.
    pub capacity_bytes: u64,
}
