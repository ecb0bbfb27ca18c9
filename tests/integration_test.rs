use anyhow::Result;
use filecache::cache::{CacheError, PageCacheManager, PageKey};
use filecache::storage::{AccessContext, FileStorage, PagedFile};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory storage with a configurable read delay, to widen race
/// windows in the concurrency tests.
struct SlowStorage {
    page_size: usize,
    context: AccessContext,
    reads: AtomicUsize,
    read_delay: Duration,
    written: Mutex<HashMap<u64, Vec<u8>>>,
}

impl SlowStorage {
    fn new(page_size: usize, read_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            context: AccessContext::new(),
            reads: AtomicUsize::new(0),
            read_delay,
            written: Mutex::new(HashMap::new()),
        })
    }
}

impl FileStorage for SlowStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn access_context(&self) -> &AccessContext {
        &self.context
    }

    fn read_page(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.read_delay);
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

#[test]
fn test_concurrent_cold_get_materializes_once() -> Result<()> {
    init_logging();

    let cache = Arc::new(PageCacheManager::new(16 * 64));
    let storage = SlowStorage::new(64, Duration::from_millis(50));
    let id = cache.register_storage(storage.clone());
    let key = PageKey::new(id, 0);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || cache.get(key, false, true)));
    }
    let pages: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    // Exactly one thread hit the storage; both got the identical page.
    assert_eq!(storage.reads.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&pages[0], &pages[1]));
    Ok(())
}

#[test]
fn test_concurrent_gets_respect_capacity() -> Result<()> {
    init_logging();

    const PAGE_SIZE: usize = 64;
    const CAPACITY_PAGES: u64 = 4;
    let cache = Arc::new(PageCacheManager::new(CAPACITY_PAGES * PAGE_SIZE as u64));
    let storage = SlowStorage::new(PAGE_SIZE, Duration::ZERO);
    let id = cache.register_storage(storage);

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            for i in 0..100u32 {
                let key = PageKey::new(id, (t * 7 + i) % 16);
                let page = cache.get(key, false, true)?;
                page.lock();
                let _ = page.read(|data| data[0]);
                page.unlock();

                let stats = cache.statistics();
                assert!(stats.cached_bytes <= stats.capacity_bytes);
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    cache.assert_no_buffers_locked()?;
    cache.flush_buffers();
    assert_eq!(cache.statistics().cached_bytes, 0);
    Ok(())
}

#[test]
fn test_concurrent_readers_and_unmap() -> Result<()> {
    init_logging();

    const PAGE_SIZE: usize = 64;
    let cache = Arc::new(PageCacheManager::new(8 * PAGE_SIZE as u64));
    let storage = SlowStorage::new(PAGE_SIZE, Duration::ZERO);
    let keep = SlowStorage::new(PAGE_SIZE, Duration::ZERO);
    let id = cache.register_storage(storage.clone());
    let keep_id = cache.register_storage(keep.clone());

    let mut handles = Vec::new();
    for _ in 0..3 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            for i in 0..50u32 {
                // Pages of a removed storage fail with ClosedStorage;
                // that is the documented recoverable outcome.
                match cache.get(PageKey::new(id, i % 4), false, true) {
                    Ok(_) | Err(CacheError::ClosedStorage(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                cache.get(PageKey::new(keep_id, i % 4), false, true)?;
            }
            Ok(())
        }));
    }

    thread::sleep(Duration::from_millis(5));
    cache.remove_storage(id);

    for handle in handles {
        handle.join().unwrap()?;
    }

    // The survivor storage is untouched by the removal.
    cache.get(PageKey::new(keep_id, 0), false, true)?;
    cache.assert_no_buffers_locked()?;
    Ok(())
}

#[test]
fn test_remove_storage_catches_in_flight_load() -> Result<()> {
    init_logging();

    const PAGE_SIZE: usize = 64;
    let cache = Arc::new(PageCacheManager::new(16 * PAGE_SIZE as u64));
    let storage = SlowStorage::new(PAGE_SIZE, Duration::from_millis(50));
    let id = cache.register_storage(storage);
    let key = PageKey::new(id, 0);

    let loader = {
        let cache = cache.clone();
        thread::spawn(move || cache.get(key, false, true))
    };

    // Removal lands while the load is still materializing; it must
    // serialize after the insertion and tear the fresh page down too.
    thread::sleep(Duration::from_millis(10));
    cache.remove_storage(id);

    match loader.join().unwrap() {
        // The load won the race to resolve the id: its page must not
        // survive the removal as an unreachable resident orphan.
        Ok(page) => assert!(page.is_released()),
        Err(CacheError::ClosedStorage(_)) => {}
        Err(e) => return Err(e.into()),
    }
    assert_eq!(cache.statistics().cached_bytes, 0);
    assert!(matches!(
        cache.get(key, false, true),
        Err(CacheError::ClosedStorage(_))
    ));
    Ok(())
}

#[test]
fn test_paged_file_round_trip() -> Result<()> {
    init_logging();

    const PAGE_SIZE: usize = 128;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("storage.dat");

    {
        let cache = PageCacheManager::new(4 * PAGE_SIZE as u64);
        let storage: Arc<dyn FileStorage> = Arc::new(PagedFile::create(&path, PAGE_SIZE)?);
        let id = cache.register_storage(storage.clone());

        let page = cache.get(PageKey::new(id, 2), true, true)?;
        page.write(|data| {
            data[0] = 0xDE;
            data[PAGE_SIZE - 1] = 0xAD;
        })?;
        cache.flush_buffers_for_owner(&storage)?;
        cache.flush_buffers();
        cache.assert_no_buffers_locked()?;
    }

    // Reopen through a fresh cache and verify the bytes survived.
    let cache = PageCacheManager::new(4 * PAGE_SIZE as u64);
    let storage: Arc<dyn FileStorage> = Arc::new(PagedFile::open(&path, PAGE_SIZE)?);
    let id = cache.register_storage(storage);

    let page = cache.get(PageKey::new(id, 2), false, true)?;
    page.read(|data| {
        assert_eq!(data[0], 0xDE);
        assert_eq!(data[PAGE_SIZE - 1], 0xAD);
    })?;

    // An untouched page reads as zeroes.
    let empty = cache.get(PageKey::new(id, 1), false, true)?;
    empty.read(|data| assert!(data.iter().all(|&b| b == 0)))?;
    Ok(())
}

#[test]
fn test_owner_flush_survives_partial_eviction() -> Result<()> {
    init_logging();

    const PAGE_SIZE: usize = 64;
    let cache = PageCacheManager::new(2 * PAGE_SIZE as u64);
    let storage = SlowStorage::new(PAGE_SIZE, Duration::ZERO);
    let id = cache.register_storage(storage.clone());

    let p0 = cache.get(PageKey::new(id, 0), true, true)?;
    p0.write(|data| data[0] = 1)?;
    let p1 = cache.get(PageKey::new(id, 1), true, true)?;
    p1.write(|data| data[0] = 2)?;
    // Evicts page 0; its dirty contents are flushed on release.
    cache.get(PageKey::new(id, 2), false, true)?;

    let owner: Arc<dyn FileStorage> = storage.clone();
    cache.flush_buffers_for_owner(&owner)?;

    let written = storage.written.lock();
    assert_eq!(written.get(&0).unwrap()[0], 1);
    assert_eq!(written.get(&(PAGE_SIZE as u64)).unwrap()[0], 2);
    Ok(())
}
