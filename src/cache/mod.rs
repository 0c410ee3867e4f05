//! Local ticket cache with stale-while-revalidate reads and offline support.
//!
//! - Persists the last unfiltered ticket list as two JSON files
//! - Serves the snapshot immediately and flags it stale past the TTL
//! - Falls back to the snapshot when the network is unavailable

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheMetadata, CacheStorage, FileStorage, NoopStorage, CACHE_VERSION};
pub use traits::{CacheEvent, CacheResult, CacheStatus};
