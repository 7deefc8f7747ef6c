use newsdesk_api::{ApiError, ErrorKind};
use newsdesk_cache::CacheError;
use thiserror::Error;

/// All the ways things can go wrong in NewsDesk
///
/// We use thiserror here because it generates the boilerplate for us.
/// Life's too short to manually implement Display and Error traits.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Cache operation failed: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// The kind a UI would show for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Api(e) => e.kind(),
            Error::Cache(_) => ErrorKind::CacheUnavailable,
            Error::AuthError(_) => ErrorKind::AuthRefreshFailed,
            Error::ConfigError(_) | Error::SerializationError(_) => ErrorKind::ClientError,
            Error::IoError(_) => ErrorKind::CacheUnavailable,
        }
    }
}
