//! Bounded, process-wide cache of fixed-size pages backed by registered
//! file storages. Key components:
//!
//! - **PageKey**: packed 64-bit page identity (storage id + page index)
//! - **Page**: a resident page buffer, handed out to callers
//! - **StorageRegistry**: assigns and resolves numeric storage ids
//! - **PageCacheManager**: lookups, loads, LRU eviction, deferred release
//!
//! The cache keeps aggregate resident bytes under a fixed capacity. When
//! the limit is exceeded, least-recently-used pages are evicted into a
//! trash table and released back to the allocator once no caller holds
//! them; a page requested again before its release completes is
//! resurrected from trash without touching disk.

pub mod error;
pub mod key;
pub mod manager;
pub mod page;
pub mod registry;
pub mod stats;

pub use error::{CacheError, CacheResult};
pub use key::{PageKey, StorageId};
pub use manager::PageCacheManager;
pub use page::Page;
pub use registry::StorageRegistry;
pub use stats::CacheStatistics;
