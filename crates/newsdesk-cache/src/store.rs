use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Cache worker failed: {0}")]
    Worker(String),

    #[error("Cache lock poisoned")]
    Poisoned,
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Worker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Last known good payload for one logical resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResource {
    pub key: String,
    pub payload: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

impl CachedResource {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
            saved_at: Utc::now(),
        }
    }
}

/// Keyed store of last known good payloads.
///
/// `put` replaces the whole entry for a key in one step: a concurrent `get`
/// sees either the old value or the new one, never a mix. A missing key is
/// `Ok(None)`, not an error.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResource>>;
    async fn put(&self, key: &str, payload: &serde_json::Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}
