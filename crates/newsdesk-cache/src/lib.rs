// Local payload cache
// Keeps the last good copy of every resource so the app still has something to show offline

pub mod cache;
pub mod memory;
pub mod store;

pub use cache::SqliteCache;
pub use memory::MemoryCache;
pub use store::{CacheError, CacheStore, CachedResource, Result};
