// Credential contract plus the single-flight refresh gate
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AuthError;

/// A bearer token plus when it was handed out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            issued_at: Utc::now(),
        }
    }
}

/// Whatever owns identity: hands out the current token and knows how to renew it.
///
/// The client never caches what this returns - it asks again on every call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current_token(&self) -> Option<String>;
    async fn refresh_token(&self) -> Result<String, AuthError>;
}

/// Provider for anonymous access - nothing to attach, nothing to refresh
pub struct Anonymous;

#[async_trait]
impl CredentialProvider for Anonymous {
    async fn current_token(&self) -> Option<String> {
        None
    }

    async fn refresh_token(&self) -> Result<String, AuthError> {
        Err(AuthError::NotSignedIn)
    }
}

/// Makes sure concurrent 401s share one refresh call.
///
/// Every outbound request notes the generation before it reads the token.
/// A request that comes back 401 calls [`RefreshCoordinator::refresh`] with
/// that generation: if a refresh finished after it, the outcome is reused,
/// otherwise this caller performs the refresh while everyone else waits on
/// the gate.
#[derive(Default)]
pub struct RefreshCoordinator {
    generation: AtomicU64,
    gate: Mutex<RefreshState>,
}

#[derive(Default)]
struct RefreshState {
    generation: u64,
    outcome: Option<Result<String, AuthError>>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation to pass back into `refresh` if the request gets a 401
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn refresh(
        &self,
        provider: &dyn CredentialProvider,
        seen_generation: u64,
    ) -> Result<String, AuthError> {
        let mut state = self.gate.lock().await;

        if state.generation > seen_generation {
            if let Some(outcome) = &state.outcome {
                debug!(
                    generation = state.generation,
                    "Reusing credential refresh completed by a concurrent request"
                );
                return outcome.clone();
            }
        }

        info!(generation = state.generation + 1, "Refreshing bearer credential");
        let outcome = provider.refresh_token().await;
        if let Err(e) = &outcome {
            warn!("Credential refresh failed: {}", e);
        }

        state.generation += 1;
        state.outcome = Some(outcome.clone());
        self.generation.store(state.generation, Ordering::SeqCst);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_refresh_calls_provider_once() {
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_refresh_token()
            .times(1)
            .returning(|| Ok("fresh".to_string()));

        let coordinator = RefreshCoordinator::new();
        let seen = coordinator.generation();

        let token = coordinator.refresh(&provider, seen).await;
        assert_eq!(token, Ok("fresh".to_string()));
        assert_eq!(coordinator.generation(), seen + 1);
    }

    #[tokio::test]
    async fn test_stale_generation_reuses_outcome() {
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_refresh_token()
            .times(1)
            .returning(|| Ok("fresh".to_string()));

        let coordinator = RefreshCoordinator::new();
        let seen = coordinator.generation();

        // Two requests that both went out before the refresh
        let first = coordinator.refresh(&provider, seen).await;
        let second = coordinator.refresh(&provider, seen).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_shared_too() {
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_refresh_token()
            .times(1)
            .returning(|| Err(AuthError::Rejected("refresh token revoked".into())));

        let coordinator = RefreshCoordinator::new();
        let seen = coordinator.generation();

        let first = coordinator.refresh(&provider, seen).await;
        let second = coordinator.refresh(&provider, seen).await;

        assert!(matches!(first, Err(AuthError::Rejected(_))));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_later_generation_refreshes_again() {
        let mut provider = MockCredentialProvider::new();
        let mut seq = mockall::Sequence::new();
        provider
            .expect_refresh_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok("first".to_string()));
        provider
            .expect_refresh_token()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok("second".to_string()));

        let coordinator = RefreshCoordinator::new();
        let first = coordinator.refresh(&provider, coordinator.generation()).await;
        // A request sent after the first refresh is a new 401, not a duplicate
        let second = coordinator.refresh(&provider, coordinator.generation()).await;

        assert_eq!(first, Ok("first".to_string()));
        assert_eq!(second, Ok("second".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_refresh() {
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_refresh_token()
            .times(1)
            .returning(|| Ok("fresh".to_string()));

        let provider: Arc<dyn CredentialProvider> = Arc::new(provider);
        let coordinator = Arc::new(RefreshCoordinator::new());
        let seen = coordinator.generation();

        let waiters = (0..8).map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { coordinator.refresh(provider.as_ref(), seen).await })
        });

        for handle in waiters {
            assert_eq!(handle.await.unwrap(), Ok("fresh".to_string()));
        }
    }

    #[tokio::test]
    async fn test_anonymous_has_no_token() {
        assert_eq!(Anonymous.current_token().await, None);
        assert_eq!(Anonymous.refresh_token().await, Err(AuthError::NotSignedIn));
    }
}
