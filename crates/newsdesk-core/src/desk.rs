// Wires the client, cache, synchronizer and session together
use newsdesk_api::{
    ApiClient, AuthClient, FeedQuery, NewsDetail, NewsFeed, StatusMessage, SubscriptionPlans,
    UserPreferences,
};
use newsdesk_cache::{CacheStore, MemoryCache, SqliteCache};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::{Config, SyncConfig};
use crate::controller::RequestController;
use crate::credentials::StoredCredentials;
use crate::session::Session;
use crate::state::RequestState;
use crate::sync::{LoadOptions, ResourceSynchronizer};
use crate::token_store::TokenStore;
use crate::Result;

pub const PLANS_KEY: &str = "plans";
pub const PREFERENCES_KEY: &str = "user:preferences";

pub fn article_key(id: &str) -> String {
    format!("article:{}", id)
}

/// Everything a screen needs, built once at startup and passed around.
pub struct NewsDesk {
    client: Arc<ApiClient>,
    sync: Arc<ResourceSynchronizer>,
    session: Session,
    refresh_in_background: bool,
    feed: RequestController<NewsFeed>,
    article: RequestController<NewsDetail>,
    plans: RequestController<SubscriptionPlans>,
    preferences: RequestController<UserPreferences>,
}

impl NewsDesk {
    /// Build the whole stack from configuration. Must run inside a Tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let token_path = match &config.auth.token_store {
            Some(path) => path.clone(),
            None => TokenStore::default_path()?,
        };
        let tokens = Arc::new(RwLock::new(TokenStore::open(token_path)?));

        let cache = open_cache(config);
        let options = config.client_options();
        let auth = Arc::new(AuthClient::new(&options, config.auth.refresh_path.clone())?);
        let credentials = StoredCredentials::new(
            Arc::clone(&tokens),
            Arc::clone(&auth),
            config.auth.token_valid_days,
        );
        let client = Arc::new(ApiClient::new(&options, Arc::new(credentials))?);
        let session = Session::new(tokens, Arc::clone(&cache), auth, config.auth.token_valid_days);

        info!(base_url = client.base_url(), "NewsDesk ready");
        Ok(Self::from_parts(client, cache, session, &config.sync))
    }

    /// Build from already-constructed pieces, e.g. a test server and an in-memory cache
    pub fn from_parts(
        client: Arc<ApiClient>,
        cache: Arc<dyn CacheStore>,
        session: Session,
        sync: &SyncConfig,
    ) -> Self {
        let synchronizer = Arc::new(ResourceSynchronizer::new(cache, sync.background_retry()));

        Self {
            feed: RequestController::new("feed", Arc::clone(&synchronizer)),
            article: RequestController::new("article", Arc::clone(&synchronizer)),
            plans: RequestController::new("plans", Arc::clone(&synchronizer)),
            preferences: RequestController::new("preferences", Arc::clone(&synchronizer)),
            client,
            sync: synchronizer,
            session,
            refresh_in_background: sync.refresh_in_background,
        }
    }

    fn options(&self, force: bool) -> LoadOptions {
        LoadOptions {
            force_refresh: force,
            refresh_in_background: self.refresh_in_background,
        }
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn feed(&self) -> &RequestController<NewsFeed> {
        &self.feed
    }

    pub fn article(&self) -> &RequestController<NewsDetail> {
        &self.article
    }

    pub fn plans(&self) -> &RequestController<SubscriptionPlans> {
        &self.plans
    }

    pub fn preferences(&self) -> &RequestController<UserPreferences> {
        &self.preferences
    }

    pub async fn load_feed(&self, query: FeedQuery, force: bool) -> RequestState<NewsFeed> {
        let query = query.normalized();
        let key = query.cache_key();
        let client = Arc::clone(&self.client);

        self.feed
            .request(
                &key,
                move || {
                    let client = Arc::clone(&client);
                    let query = query.clone();
                    async move { client.news_feed(&query).await }
                },
                self.options(force),
            )
            .await
    }

    pub async fn load_article(&self, id: &str, force: bool) -> RequestState<NewsDetail> {
        let client = Arc::clone(&self.client);
        let article_id = id.to_string();

        self.article
            .request(
                &article_key(id),
                move || {
                    let client = Arc::clone(&client);
                    let id = article_id.clone();
                    async move { client.news_detail(&id).await }
                },
                self.options(force),
            )
            .await
    }

    pub async fn load_plans(&self, force: bool) -> RequestState<SubscriptionPlans> {
        let client = Arc::clone(&self.client);

        self.plans
            .request(
                PLANS_KEY,
                move || {
                    let client = Arc::clone(&client);
                    async move { client.subscription_plans().await }
                },
                self.options(force),
            )
            .await
    }

    pub async fn load_preferences(&self, force: bool) -> RequestState<UserPreferences> {
        let client = Arc::clone(&self.client);

        self.preferences
            .request(
                PREFERENCES_KEY,
                move || {
                    let client = Arc::clone(&client);
                    async move { client.preferences().await }
                },
                self.options(force),
            )
            .await
    }

    /// Push new preferences, then show and cache what the server accepted
    pub async fn save_preferences(&self, preferences: UserPreferences) -> Result<StatusMessage> {
        let ack = self.client.update_preferences(&preferences).await?;

        self.preferences
            .request(
                PREFERENCES_KEY,
                move || {
                    let saved = preferences.clone();
                    async move { Ok(saved) }
                },
                LoadOptions::force_refresh(),
            )
            .await;

        info!(status = %ack.status, "Preferences saved");
        Ok(ack)
    }

    pub async fn sign_out(&self) -> Result<()> {
        // Nothing that started under the old session may land after the clear
        self.feed.reset();
        self.article.reset();
        self.plans.reset();
        self.preferences.reset();
        self.sync.reset().await;

        self.session.sign_out().await
    }

    /// Let in-flight background refreshes finish
    pub async fn shutdown(&self) {
        self.sync.settle_background().await;
    }
}

/// SQLite when enabled and openable, memory otherwise. A cache that can't
/// open is not a reason to refuse to start.
fn open_cache(config: &Config) -> Arc<dyn CacheStore> {
    if !config.cache.enabled {
        return Arc::new(MemoryCache::new());
    }

    let opened = config
        .cache_path()
        .and_then(|path| SqliteCache::open(&path).map_err(crate::Error::from));

    match opened {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!(error = %e, "Payload cache unavailable; falling back to memory");
            Arc::new(MemoryCache::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Snapshot;
    use crate::state::Source;
    use crate::token_store::{ACCESS_TOKEN, REFRESH_TOKEN};
    use newsdesk_api::{ClientOptions, ErrorKind};
    use serde_json::json;
    use tokio::sync::broadcast;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_body(total: u32) -> serde_json::Value {
        json!({
            "items": [{
                "id": "a1",
                "title": "Fed holds rates",
                "sentiment": {"compound_score": 0.1, "category": "neutral"},
                "entities": [{"name": "Federal Reserve", "type": "ORG", "relevance": 0.9}],
                "published_at": "2024-05-01T12:00:00Z",
                "source": "wire"
            }],
            "total": total,
            "page": 1,
            "limit": 20
        })
    }

    fn article_body(title: &str) -> serde_json::Value {
        json!({"id": "a1", "title": title, "content": "...", "topics": ["rates"]})
    }

    async fn next<T: Clone>(rx: &mut broadcast::Receiver<Snapshot<T>>) -> RequestState<T> {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a transition")
            .expect("event channel closed")
            .state
    }

    fn quiet_sync() -> SyncConfig {
        SyncConfig {
            refresh_in_background: true,
            background_max_retries: 0,
            background_initial_delay_ms: 1,
            background_max_delay_ms: 1,
        }
    }

    fn signed_in_tokens() -> TokenStore {
        let mut tokens = TokenStore::in_memory();
        tokens.set_token(ACCESS_TOKEN, "old", 30);
        tokens.set_token(REFRESH_TOKEN, "r1", 30);
        tokens
    }

    fn desk_with(server: &MockServer, tokens: TokenStore, cache: Arc<dyn CacheStore>) -> NewsDesk {
        let options = ClientOptions::with_base_url(server.uri());
        let tokens = Arc::new(RwLock::new(tokens));
        let auth = Arc::new(AuthClient::new(&options, "/api/auth/refresh").unwrap());
        let credentials = StoredCredentials::new(Arc::clone(&tokens), Arc::clone(&auth), 30);
        let client = Arc::new(ApiClient::new(&options, Arc::new(credentials)).unwrap());
        let session = Session::new(tokens, Arc::clone(&cache), auth, 30);
        NewsDesk::from_parts(client, cache, session, &quiet_sync())
    }

    #[tokio::test]
    async fn test_feed_online_then_offline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/news"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feed_body(1)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/news"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let desk = desk_with(&server, TokenStore::in_memory(), Arc::clone(&cache));

        let first = desk.load_feed(FeedQuery::default(), false).await;
        assert_eq!(first.source(), Some(Source::Network));
        assert!(cache.get("feed:page1").await.unwrap().is_some());

        // Server down: the cached page still shows, forced or not
        let second = desk.load_feed(FeedQuery::default(), true).await;
        assert_eq!(second.source(), Some(Source::Cache));
        assert_eq!(second.data().unwrap().items[0].id, "a1");

        let third = desk.load_feed(FeedQuery::default(), false).await;
        desk.shutdown().await;
        assert!(third.is_stale());
        assert!(desk.feed().state().is_stale());
    }

    #[tokio::test]
    async fn test_filtered_feed_has_its_own_cache_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/news"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feed_body(1)))
            .mount(&server)
            .await;

        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let desk = desk_with(&server, TokenStore::in_memory(), Arc::clone(&cache));

        let query = FeedQuery {
            sentiment: Some("positive".into()),
            ..FeedQuery::default()
        };
        desk.load_feed(query.clone(), true).await;

        assert!(cache.get("feed:page1").await.unwrap().is_none());
        assert!(cache.get(&query.cache_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_article_refreshes_expired_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/news/a1"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/news/a1"))
            .and(header("authorization", "Bearer new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(article_body("Fed holds rates")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new",
                "refresh_token": "r2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let desk = desk_with(&server, signed_in_tokens(), Arc::new(MemoryCache::new()));
        let mut events = desk.article().subscribe();
        let state = desk.load_article("a1", false).await;

        assert_eq!(state.data().unwrap().title, "Fed holds rates");
        assert_eq!(next(&mut events).await, RequestState::Loading);
        assert_eq!(next(&mut events).await.source(), Some(Source::Network));
        assert_eq!(desk.session().credential().unwrap().access_token, "new");
    }

    #[tokio::test]
    async fn test_refresh_failure_with_empty_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/news/a1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let desk = desk_with(&server, signed_in_tokens(), Arc::new(MemoryCache::new()));
        let mut events = desk.article().subscribe();
        desk.load_article("a1", false).await;

        assert_eq!(next(&mut events).await, RequestState::Loading);
        assert_eq!(
            next(&mut events).await,
            RequestState::Failed(ErrorKind::AuthRefreshFailed)
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_surfaces_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/news/a1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        cache.put(&article_key("a1"), &article_body("cached")).await.unwrap();
        let desk = desk_with(&server, signed_in_tokens(), cache);

        // Auth failures are not papered over with cached data
        let state = desk.load_article("a1", true).await;
        assert_eq!(state, RequestState::Failed(ErrorKind::AuthRefreshFailed));
    }

    #[tokio::test]
    async fn test_save_preferences_writes_through() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/user/preferences"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "message": "Preferences updated"
            })))
            .mount(&server)
            .await;

        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let desk = desk_with(&server, signed_in_tokens(), Arc::clone(&cache));

        let mut prefs = UserPreferences::default();
        prefs.theme = "dark".into();
        let ack = desk.save_preferences(prefs.clone()).await.unwrap();
        assert_eq!(ack.status, "success");

        let stored = cache.get(PREFERENCES_KEY).await.unwrap().unwrap();
        assert_eq!(stored.payload["theme"], "dark");
        assert_eq!(desk.preferences().state().data(), Some(&prefs));
    }

    #[tokio::test]
    async fn test_rejected_save_leaves_cache_alone() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/user/preferences"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let desk = desk_with(&server, signed_in_tokens(), Arc::clone(&cache));

        let err = desk.save_preferences(UserPreferences::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientError);
        assert!(cache.get(PREFERENCES_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_drops_cached_payloads() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "plans": [{"id": "pro", "name": "Pro", "price": 9.99, "interval": "month"}]
            })))
            .mount(&server)
            .await;

        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let desk = desk_with(&server, signed_in_tokens(), Arc::clone(&cache));

        desk.load_plans(false).await;
        assert!(cache.get(PLANS_KEY).await.unwrap().is_some());

        desk.sign_out().await.unwrap();
        assert!(cache.get(PLANS_KEY).await.unwrap().is_none());
        assert!(!desk.session().is_signed_in());
    }

    #[tokio::test]
    async fn test_sign_out_discards_loads_still_in_flight() {
        let server = MockServer::start().await;
        let slow = std::time::Duration::from_millis(300);
        Mock::given(method("GET"))
            .and(path("/api/subscriptions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "plans": [{"id": "team", "name": "Team", "price": 29.0, "interval": "month"}]
                    }))
                    .set_delay(slow),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/news"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feed_body(3)).set_delay(slow))
            .mount(&server)
            .await;

        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        cache
            .put(PLANS_KEY, &json!({"plans": [{"id": "pro", "name": "Pro", "price": 9.99, "interval": "month"}]}))
            .await
            .unwrap();
        let desk = desk_with(&server, signed_in_tokens(), Arc::clone(&cache));

        // Served from cache; the background refresh is now waiting on the server
        let cached = desk.load_plans(false).await;
        assert_eq!(cached.source(), Some(Source::Cache));

        // A forced feed load is mid-flight when the user signs out
        let (feed, signed_out) = tokio::join!(desk.load_feed(FeedQuery::default(), true), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            desk.sign_out().await
        });
        signed_out.unwrap();
        assert_eq!(feed, RequestState::Idle);

        tokio::time::sleep(slow).await;
        desk.shutdown().await;

        assert!(cache.get(PLANS_KEY).await.unwrap().is_none());
        assert!(cache.get(&FeedQuery::default().normalized().cache_key()).await.unwrap().is_none());
        assert_eq!(desk.plans().state(), RequestState::Idle);
        assert_eq!(desk.feed().state(), RequestState::Idle);
        assert!(!desk.session().is_signed_in());
    }

    #[tokio::test]
    async fn test_from_config_with_disabled_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.enabled = false;
        config.auth.token_store = Some(dir.path().join("tokens.json"));

        let desk = NewsDesk::from_config(&config).unwrap();
        assert_eq!(desk.client().base_url(), "http://localhost:8000");
        assert!(!desk.session().is_signed_in());
    }
}
