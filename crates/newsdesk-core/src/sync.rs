// Cache-first loading with background refresh and offline fallback
use newsdesk_api::retry::{with_retry_if, RetryConfig};
use newsdesk_api::{ApiError, ErrorKind};
use newsdesk_cache::CacheStore;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::machine::StateSink;
use crate::state::RequestState;

/// How a single load should treat the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip the cache and go to the network first
    pub force_refresh: bool,
    /// After serving from cache, fetch in the background and swap in fresh data
    pub refresh_in_background: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            refresh_in_background: true,
        }
    }
}

impl LoadOptions {
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }

    pub fn cache_only_if_present() -> Self {
        Self {
            force_refresh: false,
            refresh_in_background: false,
        }
    }
}

/// Reconciles network fetches with the local cache for named resources.
///
/// Policy:
/// - cached copy present and no forced refresh: show it right away, maybe
///   refresh in the background
/// - otherwise go to the network; on a transient failure fall back to
///   whatever is cached, else fail
///
/// A broken cache never fails a request - it just behaves as if empty.
///
/// Every load remembers the epoch it started in. `reset` bumps the epoch, so
/// results from loads that began earlier are never written or shown.
pub struct ResourceSynchronizer {
    cache: Arc<dyn CacheStore>,
    background_retry: RetryConfig,
    background: Mutex<JoinSet<()>>,
    epoch: Arc<RwLock<u64>>,
}

impl ResourceSynchronizer {
    pub fn new(cache: Arc<dyn CacheStore>, background_retry: RetryConfig) -> Self {
        Self {
            cache,
            background_retry,
            background: Mutex::new(JoinSet::new()),
            epoch: Arc::new(RwLock::new(0)),
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Run one load for `key`, pushing every transition into `sink`.
    ///
    /// Returns the state this call settled on in the foreground. A background
    /// refresh, if started, reports through the sink later. A load overtaken
    /// by `reset` touches neither cache nor sink and settles on Idle.
    pub async fn load<T, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        options: LoadOptions,
        sink: StateSink<T>,
    ) -> RequestState<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let epoch = *self.epoch.read().await;

        if !options.force_refresh {
            if let Some(cached) = read_cache::<T>(self.cache.as_ref(), key).await {
                let Some(_admitted) = admit(&self.epoch, epoch).await else {
                    return discarded(key, &sink);
                };
                info!(key, seq = sink.seq(), "Serving cached data");
                let state = RequestState::cached(cached);
                sink.emit(state.clone());

                if options.refresh_in_background {
                    self.spawn_background(key.to_string(), fetcher, sink, epoch);
                }
                return state;
            }
        }

        sink.emit(RequestState::Loading);

        let outcome = fetcher().await;

        let Some(_admitted) = admit(&self.epoch, epoch).await else {
            return discarded(key, &sink);
        };
        let state = match outcome {
            Ok(fresh) => {
                write_cache(self.cache.as_ref(), key, &fresh).await;
                RequestState::fresh(fresh)
            }
            Err(err) => self.fallback(key, err).await,
        };

        sink.emit(state.clone());
        state
    }

    async fn fallback<T>(&self, key: &str, err: ApiError) -> RequestState<T>
    where
        T: DeserializeOwned,
    {
        let kind = err.kind();

        if kind.is_transient() {
            if let Some(cached) = read_cache::<T>(self.cache.as_ref(), key).await {
                warn!(key, kind = ?kind, error = %err, fallback = true, "Fetch failed; serving cached data");
                return RequestState::cached(cached);
            }
        }

        warn!(key, kind = ?kind, error = %err, fallback = false, "Fetch failed");
        RequestState::Failed(kind)
    }

    fn spawn_background<T, F, Fut>(&self, key: String, fetcher: F, sink: StateSink<T>, epoch: u64)
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let retry = self.background_retry.clone();
        let gate = Arc::clone(&self.epoch);

        let task = async move {
            debug!(key = %key, seq = sink.seq(), "Background refresh started");

            let outcome = with_retry_if(&retry, || fetcher(), |err: &ApiError| {
                err.is_retryable() && sink.is_current()
            })
            .await;

            match outcome {
                Ok(_) if !sink.is_current() => {
                    debug!(key = %key, seq = sink.seq(), "Background refresh superseded; discarding result");
                }
                Ok(fresh) => {
                    let Some(_admitted) = admit(&gate, epoch).await else {
                        debug!(key = %key, seq = sink.seq(), "Background refresh outlived a reset; discarding result");
                        return;
                    };
                    write_cache(cache.as_ref(), &key, &fresh).await;
                    sink.emit(RequestState::fresh(fresh));
                    info!(key = %key, seq = sink.seq(), "Background refresh completed");
                }
                Err(err) => {
                    // What's on screen stays; this only goes to the log
                    warn!(
                        key = %key,
                        seq = sink.seq(),
                        kind = ?err.kind(),
                        error = %err,
                        "Background refresh failed; keeping cached data"
                    );
                }
            }
        };

        match self.background.lock() {
            Ok(mut tasks) => {
                while tasks.try_join_next().is_some() {}
                tasks.spawn(task);
            }
            Err(_) => {
                tokio::spawn(task);
            }
        }
    }

    /// Cancel background refreshes and fence off every load already running.
    ///
    /// Once this returns no earlier load can write the cache or emit, so the
    /// caller may clear the cache without it being repopulated.
    pub async fn reset(&self) {
        let mut epoch = self.epoch.write().await;
        *epoch += 1;

        if let Ok(mut tasks) = self.background.lock() {
            tasks.abort_all();
        }
        info!(epoch = *epoch, "Synchronizer reset; in-flight loads will be dropped");
    }

    /// Wait for every background refresh started so far
    pub async fn settle_background(&self) {
        let mut tasks = match self.background.lock() {
            Ok(mut tasks) => std::mem::replace(&mut *tasks, JoinSet::new()),
            Err(_) => return,
        };

        while let Some(result) = tasks.join_next().await {
            match result {
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Background refresh task failed: {}", e),
                Ok(()) => {}
            }
        }
    }
}

/// Read guard that keeps `reset` out while a result is written and emitted.
/// None when the epoch has moved on since `epoch` was taken.
async fn admit(gate: &RwLock<u64>, epoch: u64) -> Option<RwLockReadGuard<'_, u64>> {
    let current = gate.read().await;
    (*current == epoch).then_some(current)
}

fn discarded<T: Clone>(key: &str, sink: &StateSink<T>) -> RequestState<T> {
    debug!(key, seq = sink.seq(), "Load outlived a reset; discarding result");
    RequestState::Idle
}

/// Cached value for `key`, or None when missing, unreadable or undecodable
async fn read_cache<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Option<T> {
    match cache.get(key).await {
        Ok(Some(entry)) => match serde_json::from_value::<T>(entry.payload) {
            Ok(data) => {
                debug!(key, saved_at = %entry.saved_at, "Cache hit");
                Some(data)
            }
            Err(e) => {
                warn!(key, error = %e, "Cached payload no longer decodes; ignoring it");
                None
            }
        },
        Ok(None) => {
            debug!(key, "Cache miss");
            None
        }
        Err(e) => {
            warn!(key, kind = ?ErrorKind::CacheUnavailable, error = %e, "Cache read failed; continuing without it");
            None
        }
    }
}

async fn write_cache<T: Serialize>(cache: &dyn CacheStore, key: &str, data: &T) {
    let payload = match serde_json::to_value(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(key, error = %e, "Could not serialize payload for cache");
            return;
        }
    };

    if let Err(e) = cache.put(key, &payload).await {
        warn!(key, kind = ?ErrorKind::CacheUnavailable, error = %e, "Cache write failed");
    }
}
