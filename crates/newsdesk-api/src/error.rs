use std::fmt;

use thiserror::Error;

use crate::retry::is_retryable_status;

/// Everything the HTTP client core can hand back to a caller.
///
/// Transport detail stays in here; anything above the synchronizer only
/// ever sees the coarser [`ErrorKind`].
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("Server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Request rejected (status {status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkFailure(String),

    #[error("Credential refresh failed: {0}")]
    AuthRefreshFailed(String),

    #[error("Unexpected response payload: {0}")]
    InvalidResponse(String),

    #[error("Could not encode request body: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    /// Collapse into the kind the UI is allowed to see
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Unauthorized => ErrorKind::Unauthorized,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            // A 2xx body we cannot decode is the server's fault, not the caller's
            ApiError::ServerError { .. } | ApiError::InvalidResponse(_) => ErrorKind::ServerError,
            ApiError::ClientError { .. } | ApiError::InvalidRequest(_) => ErrorKind::ClientError,
            ApiError::NetworkFailure(_) => ErrorKind::NetworkFailure,
            ApiError::AuthRefreshFailed(_) => ErrorKind::AuthRefreshFailed,
        }
    }

    /// Whether repeating the same request could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::NetworkFailure(_) | ApiError::RateLimited { .. } => true,
            ApiError::ServerError { status, .. } | ApiError::ClientError { status, .. } => {
                reqwest::StatusCode::from_u16(*status)
                    .map(is_retryable_status)
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Map a non-2xx status to an error
    pub fn from_status(status: reqwest::StatusCode, path: &str, body: String, retry_after: Option<u64>) -> Self {
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            404 => ApiError::NotFound(path.to_string()),
            429 => ApiError::RateLimited { retry_after },
            code if status.is_server_error() => ApiError::ServerError {
                status: code,
                message: body,
            },
            code => ApiError::ClientError {
                status: code,
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            // Timeouts, DNS, refused and reset connections all land here
            ApiError::NetworkFailure(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

/// Failures reported by the identity provider while renewing a credential
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No refresh credential available")]
    NotSignedIn,

    #[error("Identity provider rejected the refresh: {0}")]
    Rejected(String),

    #[error("Identity provider unreachable: {0}")]
    Unavailable(String),
}

/// Human-presentable failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkFailure,
    Unauthorized,
    RateLimited,
    ServerError,
    ClientError,
    NotFound,
    CacheUnavailable,
    AuthRefreshFailed,
}

impl ErrorKind {
    /// Failures worth papering over with cached data
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkFailure | ErrorKind::ServerError | ErrorKind::RateLimited
        )
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::NetworkFailure => "You appear to be offline. Check your connection and try again.",
            ErrorKind::Unauthorized => "You need to sign in to see this.",
            ErrorKind::RateLimited => "Too many requests. Please wait a moment.",
            ErrorKind::ServerError => "The news service is having trouble right now.",
            ErrorKind::ClientError => "That request could not be completed.",
            ErrorKind::NotFound => "We couldn't find what you were looking for.",
            ErrorKind::CacheUnavailable => "Local storage is unavailable.",
            ErrorKind::AuthRefreshFailed => "Your session has expired. Please sign in again.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
