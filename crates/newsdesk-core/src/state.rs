use newsdesk_api::ErrorKind;

/// Where the data in a `Loaded` state came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Network,
    Cache,
}

/// What the UI gets to see for one logical request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestState<T> {
    Idle,
    Loading,
    Loaded {
        data: T,
        source: Source,
        is_stale: bool,
    },
    Failed(ErrorKind),
}

impl<T> Default for RequestState<T> {
    fn default() -> Self {
        RequestState::Idle
    }
}

impl<T> RequestState<T> {
    /// Straight off the wire
    pub fn fresh(data: T) -> Self {
        RequestState::Loaded {
            data,
            source: Source::Network,
            is_stale: false,
        }
    }

    /// From the local cache, possibly behind the server
    pub fn cached(data: T) -> Self {
        RequestState::Loaded {
            data,
            source: Source::Cache,
            is_stale: true,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            RequestState::Loaded { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<Source> {
        match self {
            RequestState::Loaded { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, RequestState::Loaded { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, RequestState::Loaded { is_stale: true, .. })
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            RequestState::Failed(kind) => Some(*kind),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestState::Idle => "idle",
            RequestState::Loading => "loading",
            RequestState::Loaded { source: Source::Network, .. } => "loaded (network)",
            RequestState::Loaded { source: Source::Cache, .. } => "loaded (cache)",
            RequestState::Failed(_) => "failed",
        }
    }

    /// Whether `next` may follow `self`.
    ///
    /// `same_request` is false when `next` belongs to a newer request than
    /// the one that produced `self`; a new request may start from anywhere.
    pub fn can_transition_to(&self, next: &RequestState<T>, same_request: bool) -> bool {
        if matches!(next, RequestState::Idle) {
            return false;
        }
        if !same_request {
            return true;
        }

        match (self, next) {
            (RequestState::Idle, _) => true,
            (RequestState::Loading, RequestState::Loaded { .. } | RequestState::Failed(_)) => true,
            // Background refresh landing on top of what is already shown
            (RequestState::Loaded { .. }, RequestState::Loaded { .. }) => true,
            _ => false,
        }
    }
}
