// HTTP client core for the news analysis backend
pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod retry;

// Re-export common types
pub use auth::{Anonymous, Credential, CredentialProvider, RefreshCoordinator};
pub use client::{ApiClient, AuthClient, ClientOptions, DEFAULT_API_BASE, DEFAULT_REFRESH_PATH};
pub use error::{ApiError, AuthError, ErrorKind, Result};
pub use models::{
    AuthSession, Entity, FeedQuery, NewsDetail, NewsFeed, NewsItem, NotificationSettings,
    RelatedArticle, Sentiment, SortField, SortOrder, StatusMessage, SubscriptionPlan,
    SubscriptionPlans, UserPreferences, UserProfile,
};
pub use retry::RetryConfig;
