use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::store::{CacheError, CacheStore, CachedResource, Result};

/// Process-local cache. Nothing survives a restart.
///
/// Entries are swapped whole under the write lock.
#[derive(Default, Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Arc<CachedResource>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResource>> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(key).map(|entry| CachedResource::clone(entry)))
    }

    async fn put(&self, key: &str, payload: &serde_json::Value) -> Result<()> {
        let entry = Arc::new(CachedResource::new(key, payload.clone()));
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.clear();
        Ok(())
    }
}
