// Data layer glue - cache-first loading, request state, session, config
pub mod config;
pub mod controller;
pub mod credentials;
pub mod desk;
pub mod error;
pub mod machine;
pub mod session;
pub mod state;
pub mod sync;
pub mod token_store;

pub use config::Config;
pub use controller::RequestController;
pub use credentials::StoredCredentials;
pub use desk::NewsDesk;
pub use error::Error;
pub use machine::{RequestMachine, Snapshot, StateSink};
pub use session::Session;
pub use state::{RequestState, Source};
pub use sync::{LoadOptions, ResourceSynchronizer};
pub use token_store::TokenStore;

/// Result type alias because typing Result<T, Error> everywhere is tedious
pub type Result<T> = std::result::Result<T, Error>;
