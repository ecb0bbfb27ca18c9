use crate::cache::error::{CacheError, CacheResult};
use crate::cache::key::StorageId;
use crate::storage::FileStorage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Assigns and resolves numeric ids for registered storages.
///
/// The registry has its own lock, independent of the page locks, so
/// registration and removal never contend with page traffic. Id
/// assignment probes upward from the current registry size; storages are
/// rarely closed, so the probe is short, and a low id is reused only
/// after an explicit [`remove`].
///
/// [`remove`]: StorageRegistry::remove
#[derive(Default)]
pub struct StorageRegistry {
    storages: Mutex<HashMap<StorageId, Arc<dyn FileStorage>>>,
    /// High-water mark of simultaneously registered storages.
    max_registered: AtomicUsize,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage and return its unique id. The id stays valid
    /// until [`remove`] is called for it.
    ///
    /// [`remove`]: StorageRegistry::remove
    pub fn register(&self, storage: Arc<dyn FileStorage>) -> StorageId {
        let mut storages = self.storages.lock();
        let mut id = storages.len() as StorageId;
        while storages.contains_key(&id) {
            id += 1;
        }
        storages.insert(id, storage);
        self.max_registered
            .fetch_max(storages.len(), Ordering::AcqRel);
        id
    }

    /// Look up the storage behind `id`. Fails with
    /// [`CacheError::ClosedStorage`] when the registration was removed
    /// concurrently; callers treat that as "storage was closed", not as a
    /// programming error.
    pub fn resolve(&self, id: StorageId) -> CacheResult<Arc<dyn FileStorage>> {
        self.storages
            .lock()
            .get(&id)
            .cloned()
            .ok_or(CacheError::ClosedStorage(id))
    }

    pub fn remove(&self, id: StorageId) {
        self.storages.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.storages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.lock().is_empty()
    }

    pub fn max_registered(&self) -> usize {
        self.max_registered.load(Ordering::Acquire)
    }
}
