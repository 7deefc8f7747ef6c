use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentiment block the analysis pipeline attaches to every article
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Sentiment {
    /// -1.0 (negative) to 1.0 (positive)
    #[serde(default)]
    pub compound_score: f64,
    /// positive / negative / neutral
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub positive_aspects: Vec<String>,
    #[serde(default)]
    pub negative_aspects: Vec<String>,
    #[serde(default)]
    pub neutral_aspects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub relevance: f64,
    pub sentiment: Option<f64>,
}

/// One row of the news feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sentiment: Sentiment,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub published_at: String,
    #[serde(default)]
    pub source: String,
}

/// A page of the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsFeed {
    pub items: Vec<NewsItem>,
    pub total: u32,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedArticle {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub similarity: Option<f64>,
}

/// Full article with analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsDetail {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sentiment: Sentiment,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub published_at: String,
    #[serde(default)]
    pub analyzed_at: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub url: String,
    pub related_articles: Option<Vec<RelatedArticle>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub interval: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPlans {
    pub plans: Vec<SubscriptionPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_sentiment_threshold")]
    pub sentiment_threshold: f64,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
    #[serde(default)]
    pub watchlist: Vec<String>,
}

fn default_sentiment_threshold() -> f64 {
    0.7
}

fn default_relevance_threshold() -> f64 {
    0.5
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            sentiment_threshold: default_sentiment_threshold(),
            relevance_threshold: default_relevance_threshold(),
            watchlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default)]
    pub notification_settings: NotificationSettings,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_view")]
    pub default_view: String,
}

fn default_theme() -> String {
    "light".to_string()
}

fn default_view() -> String {
    "feed".to_string()
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            notification_settings: NotificationSettings::default(),
            theme: default_theme(),
            default_view: default_view(),
        }
    }
}

/// `{"status": "...", "message": "..."}` acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub subscription_tier: String,
}

/// Token grant from sign-in, registration or refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Date,
    Relevance,
    Sentiment,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            SortField::Date => "date",
            SortField::Relevance => "relevance",
            SortField::Sentiment => "sentiment",
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "date" => Ok(SortField::Date),
            "relevance" => Ok(SortField::Relevance),
            "sentiment" => Ok(SortField::Sentiment),
            other => Err(format!("unknown sort field '{}' (expected date, relevance or sentiment)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order '{}' (expected asc or desc)", other)),
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Parameters for the feed list endpoint.
///
/// Every distinct combination is its own logical resource, so two filters
/// never share a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    pub page: u32,
    pub limit: u32,
    pub sort: SortField,
    pub order: SortOrder,
    pub sentiment: Option<String>,
    pub entity: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
            sort: SortField::default(),
            order: SortOrder::default(),
            sentiment: None,
            entity: None,
            from_date: None,
            to_date: None,
        }
    }
}

impl FeedQuery {
    pub fn page(page: u32) -> Self {
        Self {
            page,
            ..Self::default()
        }
        .normalized()
    }

    /// Clamp page and limit into what the server accepts
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.limit = self.limit.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("page", self.page.to_string()),
            ("limit", self.limit.to_string()),
            ("sort", self.sort.to_string()),
            ("order", self.order.to_string()),
        ];

        let optional = [
            ("sentiment", &self.sentiment),
            ("entity", &self.entity),
            ("from_date", &self.from_date),
            ("to_date", &self.to_date),
        ];
        for (name, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                params.push((name, value.to_string()));
            }
        }

        params
    }

    /// `feed:page1` for the default view, `feed:page1?sort=relevance&...` otherwise
    pub fn cache_key(&self) -> String {
        let base = format!("feed:page{}", self.page);
        let defaults = Self::default();

        let extras: Vec<String> = self
            .to_query()
            .into_iter()
            .filter(|(name, _)| match *name {
                "page" => false,
                "limit" => self.limit != defaults.limit,
                "sort" => self.sort != defaults.sort,
                "order" => self.order != defaults.order,
                _ => true,
            })
            .map(|(name, value)| format!("{}={}", name, urlencoding::encode(&value)))
            .collect();

        if extras.is_empty() {
            base
        } else {
            format!("{}?{}", base, extras.join("&"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_feed_key() {
        assert_eq!(FeedQuery::default().cache_key(), "feed:page1");
        assert_eq!(FeedQuery::page(3).cache_key(), "feed:page3");
    }

    #[test]
    fn test_filters_get_their_own_key() {
        let query = FeedQuery {
            sort: SortField::Relevance,
            sentiment: Some("positive".into()),
            entity: Some("Tesla Inc".into()),
            ..FeedQuery::default()
        };

        assert_eq!(
            query.cache_key(),
            "feed:page1?sort=relevance&sentiment=positive&entity=Tesla%20Inc"
        );
        assert_ne!(query.cache_key(), FeedQuery::default().cache_key());
    }

    #[test]
    fn test_query_params() {
        let query = FeedQuery {
            page: 2,
            limit: 50,
            order: SortOrder::Asc,
            from_date: Some("2024-01-01".into()),
            to_date: Some(String::new()),
            ..FeedQuery::default()
        };

        let params = query.to_query();
        assert!(params.contains(&("page", "2".to_string())));
        assert!(params.contains(&("limit", "50".to_string())));
        assert!(params.contains(&("sort", "date".to_string())));
        assert!(params.contains(&("order", "asc".to_string())));
        assert!(params.contains(&("from_date", "2024-01-01".to_string())));
        // Empty filters are dropped
        assert!(!params.iter().any(|(name, _)| *name == "to_date"));
    }

    #[test]
    fn test_normalized_clamps() {
        let query = FeedQuery {
            page: 0,
            limit: 500,
            ..FeedQuery::default()
        }
        .normalized();

        assert_eq!(query.page, 1);
        assert_eq!(query.limit, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!("Relevance".parse::<SortField>(), Ok(SortField::Relevance));
        assert_eq!("desc".parse::<SortOrder>(), Ok(SortOrder::Desc));
        assert!("popularity".parse::<SortField>().is_err());
    }

    #[test]
    fn test_feed_decodes_with_missing_optional_fields() {
        let body = serde_json::json!({
            "items": [{
                "id": "a1",
                "title": "Chipmaker beats estimates",
                "sentiment": {"compound_score": 0.62, "category": "positive"},
                "entities": [{"name": "NVDA", "type": "ticker", "relevance": 0.9}]
            }],
            "total": 1,
            "page": 1,
            "limit": 20
        });

        let feed: NewsFeed = serde_json::from_value(body).unwrap();
        assert_eq!(feed.items[0].id, "a1");
        assert_eq!(feed.items[0].sentiment.category, "positive");
        assert_eq!(feed.items[0].entities[0].kind, "ticker");
        assert_eq!(feed.items[0].entities[0].sentiment, None);
        assert!(feed.items[0].summary.is_empty());
    }

    #[test]
    fn test_feed_missing_required_field_is_rejected() {
        let body = serde_json::json!({"items": [{"title": "no id"}], "total": 1, "page": 1, "limit": 20});
        assert!(serde_json::from_value::<NewsFeed>(body).is_err());
    }

    #[test]
    fn test_preferences_defaults() {
        let prefs: UserPreferences = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(prefs, UserPreferences::default());
        assert_eq!(prefs.notification_settings.sentiment_threshold, 0.7);
        assert_eq!(prefs.theme, "light");
        assert_eq!(prefs.default_view, "feed");
    }
}
