use anyhow::Context;
use clap::{Parser, Subcommand};
use newsdesk_api::{
    ErrorKind, FeedQuery, NewsDetail, NewsFeed, SortField, SortOrder, SubscriptionPlans, UserPreferences,
};
use newsdesk_cache::SqliteCache;
use newsdesk_core::{Config, NewsDesk, RequestState, Snapshot, Source};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the event stream must stay quiet before we stop printing
const SETTLE: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "newsdesk")]
#[command(version, about = "Offline-friendly client for the financial news analysis API", long_about = None)]
struct Cli {
    /// Backend URL (overrides config and NEWSDESK_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Use this SQLite file as the payload cache
    #[arg(long, global = true)]
    offline_cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a page of the news feed
    Feed {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// date, relevance or sentiment
        #[arg(long, default_value = "date")]
        sort: SortField,
        /// asc or desc
        #[arg(long, default_value = "desc")]
        order: SortOrder,
        /// positive, negative or neutral
        #[arg(long)]
        sentiment: Option<String>,
        #[arg(long)]
        entity: Option<String>,
        /// ISO date, inclusive
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        /// Skip the cache and hit the network first
        #[arg(long)]
        refresh: bool,
    },
    /// Show one article with its analysis
    Article {
        id: String,
        #[arg(long)]
        refresh: bool,
    },
    /// List subscription plans
    Plans {
        #[arg(long)]
        refresh: bool,
    },
    /// Show or update your preferences
    Prefs {
        #[arg(long)]
        theme: Option<String>,
        /// Default screen: feed, ...
        #[arg(long)]
        view: Option<String>,
        #[arg(long)]
        refresh: bool,
    },
    /// Sign in and remember the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account and sign in
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: String,
    },
    /// Forget stored tokens and cached data
    Logout,
    /// Maintain the payload cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop entries older than the configured max age
    Prune {
        /// Override cache.max_age_hours
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging - stderr, so it stays out of the way of the output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "newsdesk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load config")?;
    if let Some(url) = cli.api_url {
        config.api.base_url = url;
    }
    if let Some(path) = cli.offline_cache {
        config.cache.enabled = true;
        config.cache.path = Some(path);
    }

    // Pruning doesn't need the network stack
    if let Commands::Cache { action: CacheAction::Prune { max_age_hours } } = cli.command {
        let hours = max_age_hours.unwrap_or(config.cache.max_age_hours);
        let cache = SqliteCache::open(config.cache_path()?)?;
        let removed = cache.prune_older_than(chrono::Duration::hours(hours as i64)).await?;
        println!("Removed {} cache entries older than {}h", removed, hours);
        return Ok(());
    }

    let desk = NewsDesk::from_config(&config)?;

    let outcome = match cli.command {
        Commands::Feed {
            page,
            limit,
            sort,
            order,
            sentiment,
            entity,
            from,
            to,
            refresh,
        } => {
            let query = FeedQuery {
                page,
                limit,
                sort,
                order,
                sentiment,
                entity,
                from_date: from,
                to_date: to,
            };
            let events = desk.feed().subscribe();
            let state = desk.load_feed(query, refresh).await;
            desk.shutdown().await;
            print_transitions(events, print_feed).await;
            state.error()
        }
        Commands::Article { id, refresh } => {
            let events = desk.article().subscribe();
            let state = desk.load_article(&id, refresh).await;
            desk.shutdown().await;
            print_transitions(events, print_article).await;
            state.error()
        }
        Commands::Plans { refresh } => {
            let events = desk.plans().subscribe();
            let state = desk.load_plans(refresh).await;
            desk.shutdown().await;
            print_transitions(events, print_plans).await;
            state.error()
        }
        Commands::Prefs { theme, view, refresh } => {
            let events = desk.preferences().subscribe();
            let mut state = desk.load_preferences(refresh).await;

            if theme.is_some() || view.is_some() {
                let mut prefs = editable_preferences(&state)?;
                if let Some(theme) = theme {
                    prefs.theme = theme;
                }
                if let Some(view) = view {
                    prefs.default_view = view;
                }
                let ack = desk.save_preferences(prefs).await?;
                println!("{}", ack.message);
                state = desk.preferences().state();
            }

            desk.shutdown().await;
            print_transitions(events, print_preferences).await;
            state.error()
        }
        Commands::Login { email, password } => {
            let session = desk.session().sign_in(&email, &password).await?;
            match session.user {
                Some(user) if !user.display_name.is_empty() => println!("Signed in as {}", user.display_name),
                _ => println!("Signed in as {}", email),
            }
            None
        }
        Commands::Register { email, password, name } => {
            desk.session().register(&email, &password, &name).await?;
            println!("Welcome, {}", name);
            None
        }
        Commands::Logout => {
            desk.sign_out().await?;
            println!("Signed out");
            None
        }
        Commands::Cache { .. } => None,
    };

    if let Some(kind) = outcome {
        anyhow::bail!("{}", kind);
    }
    Ok(())
}

/// What an edit starts from. Defaults only when nothing was ever saved; any
/// other failure would overwrite the real settings, so refuse.
fn editable_preferences(state: &RequestState<UserPreferences>) -> anyhow::Result<UserPreferences> {
    match state {
        RequestState::Loaded { data, .. } => Ok(data.clone()),
        RequestState::Failed(ErrorKind::NotFound) => Ok(UserPreferences::default()),
        RequestState::Failed(kind) => {
            anyhow::bail!("Could not load current preferences ({}); nothing was saved", kind)
        }
        RequestState::Idle | RequestState::Loading => {
            anyhow::bail!("Current preferences are not loaded; nothing was saved")
        }
    }
}

/// Print every committed transition until the stream goes quiet
async fn print_transitions<T: Clone>(mut events: broadcast::Receiver<Snapshot<T>>, render: fn(&T)) {
    loop {
        match tokio::time::timeout(SETTLE, events.recv()).await {
            Ok(Ok(snapshot)) => print_state(&snapshot, render),
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                tracing::warn!("Missed {} state transitions", missed);
            }
            _ => break,
        }
    }
}

fn print_state<T>(snapshot: &Snapshot<T>, render: fn(&T)) {
    match &snapshot.state {
        RequestState::Idle => {}
        RequestState::Loading => println!("[#{}] loading...", snapshot.seq),
        RequestState::Loaded { data, source, is_stale } => {
            let origin = match source {
                Source::Network => "network",
                Source::Cache => "cache",
            };
            let freshness = if *is_stale { ", may be out of date" } else { "" };
            println!("[#{}] loaded from {}{}", snapshot.seq, origin, freshness);
            render(data);
        }
        RequestState::Failed(kind) => println!("[#{}] failed: {}", snapshot.seq, kind),
    }
}

fn print_feed(feed: &NewsFeed) {
    println!("  page {} ({} of {} articles)", feed.page, feed.items.len(), feed.total);
    for item in &feed.items {
        println!(
            "  {:<12} {:>+.2} {:<8} {}",
            item.id, item.sentiment.compound_score, item.sentiment.category, item.title
        );
    }
}

fn print_article(article: &NewsDetail) {
    println!("  {}", article.title);
    println!("  {} | {} | sentiment {:+.2} ({})",
        article.source, article.published_at, article.sentiment.compound_score, article.sentiment.category);
    if !article.topics.is_empty() {
        println!("  topics: {}", article.topics.join(", "));
    }
    let entities: Vec<&str> = article.entities.iter().map(|e| e.name.as_str()).collect();
    if !entities.is_empty() {
        println!("  entities: {}", entities.join(", "));
    }
    println!();
    println!("{}", if article.summary.is_empty() { &article.content } else { &article.summary });
    if let Some(related) = &article.related_articles {
        for other in related {
            println!("  related: {} {}", other.id, other.title);
        }
    }
}

fn print_plans(plans: &SubscriptionPlans) {
    for plan in &plans.plans {
        println!("  {:<10} {:>8.2}/{:<6} {}", plan.name, plan.price, plan.interval, plan.features.join(", "));
    }
}

fn print_preferences(prefs: &UserPreferences) {
    match serde_json::to_string_pretty(prefs) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Could not render preferences: {}", e),
    }
}
