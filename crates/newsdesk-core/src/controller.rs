use newsdesk_api::ApiError;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::machine::{RequestMachine, Snapshot};
use crate::state::RequestState;
use crate::sync::{LoadOptions, ResourceSynchronizer};

/// One logical request slot (the feed, the open article, ...) that UI code
/// drives and observes.
pub struct RequestController<T> {
    machine: RequestMachine<T>,
    sync: Arc<ResourceSynchronizer>,
}

impl<T> RequestController<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, sync: Arc<ResourceSynchronizer>) -> Self {
        Self {
            machine: RequestMachine::new(name),
            sync,
        }
    }

    /// Start a new explicit request, superseding whatever was in flight.
    ///
    /// Resolves with the foreground outcome; a background refresh keeps
    /// reporting through [`RequestController::subscribe`].
    pub async fn request<F, Fut>(&self, key: &str, fetcher: F, options: LoadOptions) -> RequestState<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let sink = self.machine.begin();
        self.sync.load(key, fetcher, options, sink).await
    }

    /// Supersede whatever is shown or in flight and go back to Idle
    pub fn reset(&self) {
        self.machine.reset();
    }

    pub fn name(&self) -> &str {
        self.machine.name()
    }

    pub fn state(&self) -> RequestState<T> {
        self.machine.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot<T>> {
        self.machine.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
        self.machine.watch()
    }
}
