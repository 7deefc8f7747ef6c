use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::auth::{CredentialProvider, RefreshCoordinator};
use crate::error::{ApiError, Result};
use crate::models::{
    AuthSession, FeedQuery, NewsDetail, NewsFeed, StatusMessage, SubscriptionPlans, UserPreferences,
};

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_REFRESH_PATH: &str = "/api/auth/refresh";

/// Transport settings shared by the data client and the auth client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Upper bound for the whole exchange, body included
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            user_agent: concat!("newsdesk/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientOptions {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

fn build_http(options: &ClientOptions) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(&options.user_agent)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid user agent: {}", e)))?,
    );
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

    let client = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(options.connect_timeout)
        .timeout(options.request_timeout)
        .build()?;

    Ok(client)
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Send one attempt, map the outcome and log it.
///
/// Exactly one log record per attempt, success or not.
async fn dispatch<T: DeserializeOwned>(
    request: RequestBuilder,
    method: &Method,
    path: &str,
    retried: bool,
) -> Result<T> {
    let started = Instant::now();

    let (status, result) = match request.send().await {
        Ok(response) => {
            let status = response.status();
            let decoded = if status.is_success() {
                response.json::<T>().await.map_err(ApiError::from)
            } else {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok());
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::from_status(status, path, body, retry_after))
            };
            (Some(status.as_u16()), decoded)
        }
        Err(e) => (None, Err(ApiError::from(e))),
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(method = %method, path, status, latency_ms, retried, "Request completed"),
        Err(e) => warn!(
            method = %method,
            path,
            status,
            latency_ms,
            retried,
            error = %e,
            "Request failed"
        ),
    }

    result
}

/// HTTP client core for the news backend.
///
/// Reads the bearer token from the credential provider on every call and
/// renews it at most once per request when the server answers 401.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    refresh: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(options: &ClientOptions, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Ok(Self {
            http: build_http(options)?,
            base_url: trim_base(&options.base_url),
            credentials,
            refresh: RefreshCoordinator::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue a request and decode the 2xx body into `T`
    pub async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        // Generation first, token second: a refresh that lands in between is
        // then treated as one we have not seen yet.
        let seen_generation = self.refresh.generation();
        let token = self.credentials.current_token().await;

        match self
            .attempt(&method, path, query, body, token.as_deref(), false)
            .await
        {
            Err(ApiError::Unauthorized) => {}
            other => return other,
        }

        let fresh = self
            .refresh
            .refresh(self.credentials.as_ref(), seen_generation)
            .await
            .map_err(|e| ApiError::AuthRefreshFailed(e.to_string()))?;

        match self
            .attempt(&method, path, query, body, Some(&fresh), true)
            .await
        {
            Err(ApiError::Unauthorized) => {
                warn!(method = %method, path, "Credential rejected again after refresh");
                Err(ApiError::AuthRefreshFailed(
                    "credential rejected after refresh".to_string(),
                ))
            }
            other => other,
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        token: Option<&str>,
        retried: bool,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);

        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        dispatch(request, method, path, retried).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.execute(Method::GET, path, query, None).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.execute(Method::PUT, path, &[], Some(&body)).await
    }

    /// One page of the analysed news feed
    pub async fn news_feed(&self, query: &FeedQuery) -> Result<NewsFeed> {
        self.get("/api/news", &query.to_query()).await
    }

    pub async fn news_detail(&self, id: &str) -> Result<NewsDetail> {
        let path = format!("/api/news/{}", urlencoding::encode(id));
        self.get(&path, &[]).await
    }

    pub async fn subscription_plans(&self) -> Result<SubscriptionPlans> {
        self.get("/api/subscriptions", &[]).await
    }

    pub async fn preferences(&self) -> Result<UserPreferences> {
        self.get("/api/user/preferences", &[]).await
    }

    pub async fn update_preferences(&self, preferences: &UserPreferences) -> Result<StatusMessage> {
        self.put("/api/user/preferences", preferences).await
    }
}

/// Talks to the identity endpoints.
///
/// Sits outside the 401 loop: these calls carry no bearer and are never
/// retried, otherwise a failing refresh would try to refresh itself.
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    refresh_path: String,
}

impl AuthClient {
    pub fn new(options: &ClientOptions, refresh_path: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_http(options)?,
            base_url: trim_base(&options.base_url),
            refresh_path: refresh_path.into(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<AuthSession> {
        let url = format!("{}{}", self.base_url, path);
        let request = self.http.post(&url).json(&body);
        dispatch(request, &Method::POST, path, false).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        self.post(
            "/api/auth/login",
            serde_json::json!({ "email": email, "password": password }),
        )
        .await
    }

    pub async fn register(&self, email: &str, password: &str, display_name: &str) -> Result<AuthSession> {
        self.post(
            "/api/auth/register",
            serde_json::json!({
                "email": email,
                "password": password,
                "display_name": display_name,
            }),
        )
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthSession> {
        self.post(
            &self.refresh_path,
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.base_url, DEFAULT_API_BASE);
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.request_timeout, Duration::from_secs(15));
        assert!(options.user_agent.starts_with("newsdesk/"));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = ApiClient::new(
            &ClientOptions::with_base_url("https://news.example.com/"),
            Arc::new(crate::auth::Anonymous),
        )
        .unwrap();
        assert_eq!(client.base_url(), "https://news.example.com");
    }

    #[test]
    fn test_bad_user_agent_is_rejected() {
        let options = ClientOptions {
            user_agent: "bad\nagent".to_string(),
            ..ClientOptions::default()
        };
        assert!(matches!(build_http(&options), Err(ApiError::InvalidRequest(_))));
    }
}
