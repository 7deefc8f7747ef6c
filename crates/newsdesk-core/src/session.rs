use newsdesk_api::{AuthClient, AuthSession, Credential};
use newsdesk_cache::CacheStore;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::Error;
use crate::token_store::{TokenStore, ACCESS_TOKEN};
use crate::Result;

/// Sign-in state: the secret store plus the payload cache it protects
pub struct Session {
    tokens: Arc<RwLock<TokenStore>>,
    cache: Arc<dyn CacheStore>,
    auth: Arc<AuthClient>,
    valid_for_days: u64,
}

impl Session {
    pub fn new(
        tokens: Arc<RwLock<TokenStore>>,
        cache: Arc<dyn CacheStore>,
        auth: Arc<AuthClient>,
        valid_for_days: u64,
    ) -> Self {
        Self {
            tokens,
            cache,
            auth,
            valid_for_days,
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession> {
        let session = self.auth.login(email, password).await?;
        self.remember(&session).await?;
        info!(email, "Signed in");
        Ok(session)
    }

    pub async fn register(&self, email: &str, password: &str, display_name: &str) -> Result<AuthSession> {
        let session = self.auth.register(email, password, display_name).await?;
        self.remember(&session).await?;
        info!(email, "Registered new account");
        Ok(session)
    }

    async fn remember(&self, session: &AuthSession) -> Result<()> {
        self.tokens
            .write()
            .map_err(|_| poisoned())?
            .store_session(session, self.valid_for_days);
        TokenStore::persist(Arc::clone(&self.tokens)).await
    }

    pub fn is_signed_in(&self) -> bool {
        self.tokens
            .read()
            .map(|t| t.has_valid_token(ACCESS_TOKEN))
            .unwrap_or(false)
    }

    pub fn credential(&self) -> Option<Credential> {
        self.tokens.read().ok()?.credential()
    }

    /// Forget the user: secrets first, then every cached payload.
    ///
    /// Both are attempted even if the first one fails; Ok only when both
    /// are actually gone.
    pub async fn sign_out(&self) -> Result<()> {
        let secrets = self.clear_secrets().await;
        if let Err(e) = &secrets {
            warn!(error = %e, "Could not clear stored tokens");
        }

        let cache = self.cache.clear().await;
        if let Err(e) = &cache {
            warn!(error = %e, "Could not clear payload cache");
        }

        secrets?;
        cache?;
        info!("Signed out");
        Ok(())
    }

    async fn clear_secrets(&self) -> Result<()> {
        self.tokens.write().map_err(|_| poisoned())?.clear();
        TokenStore::persist(Arc::clone(&self.tokens)).await
    }
}

fn poisoned() -> Error {
    Error::AuthError("token store lock poisoned".into())
}
