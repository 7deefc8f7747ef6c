// Credential provider backed by the local secret store
use async_trait::async_trait;
use newsdesk_api::{ApiError, AuthClient, AuthError, CredentialProvider};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::token_store::{TokenStore, ACCESS_TOKEN, REFRESH_TOKEN};

/// Hands the client whatever access token the store currently holds and
/// renews it through the identity provider's refresh endpoint.
#[derive(Clone)]
pub struct StoredCredentials {
    tokens: Arc<RwLock<TokenStore>>,
    auth: Arc<AuthClient>,
    valid_for_days: u64,
}

impl StoredCredentials {
    pub fn new(tokens: Arc<RwLock<TokenStore>>, auth: Arc<AuthClient>, valid_for_days: u64) -> Self {
        Self {
            tokens,
            auth,
            valid_for_days,
        }
    }

    fn refresh_token_value(&self) -> Option<String> {
        self.tokens.read().ok()?.get_token(REFRESH_TOKEN)
    }
}

fn auth_error(err: ApiError) -> AuthError {
    if err.kind().is_transient() {
        AuthError::Unavailable(err.to_string())
    } else {
        AuthError::Rejected(err.to_string())
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentials {
    async fn current_token(&self) -> Option<String> {
        self.tokens.read().ok()?.get_token(ACCESS_TOKEN)
    }

    async fn refresh_token(&self) -> Result<String, AuthError> {
        let refresh = self.refresh_token_value().ok_or(AuthError::NotSignedIn)?;

        let session = self.auth.refresh(&refresh).await.map_err(auth_error)?;

        {
            let mut tokens = self
                .tokens
                .write()
                .map_err(|_| AuthError::Unavailable("token store lock poisoned".into()))?;
            if tokens.get_token(REFRESH_TOKEN).as_deref() != Some(refresh.as_str()) {
                // Signed out, or in as someone else, while the call was out
                info!("Session changed during refresh; dropping refreshed tokens");
                return tokens.get_token(ACCESS_TOKEN).ok_or(AuthError::NotSignedIn);
            }
            tokens.store_session(&session, self.valid_for_days);
        }

        if let Err(e) = TokenStore::persist(Arc::clone(&self.tokens)).await {
            // The new token still works for this process
            warn!(error = %e, "Could not persist refreshed tokens");
        }

        info!("Access token refreshed");
        Ok(session.access_token)
    }
}
