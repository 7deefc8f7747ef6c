// Retry logic with exponential backoff
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,     // Start with 1 second
            max_delay_ms: 30000,         // Max 30 seconds
            backoff_multiplier: 2.0,     // Double each time
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let mut delay_ms = self.initial_delay_ms;
        for _ in 1..retry {
            delay_ms = ((delay_ms as f64) * self.backoff_multiplier) as u64;
            delay_ms = delay_ms.min(self.max_delay_ms);
        }
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Execute a function with retry logic
///
/// Uses exponential backoff: if a request fails, we wait progressively
/// longer before trying again. This is polite to APIs and helps when
/// there are temporary network issues.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, operation, |_| true).await
}

/// Same as [`with_retry`], but only errors accepted by `should_retry` get another go
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Request succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(err) => {
                attempt += 1;

                if attempt > config.max_retries {
                    warn!("Request failed after {} attempts: {}", attempt, err);
                    return Err(err);
                }

                if !should_retry(&err) {
                    debug!("Not retrying: {}", err);
                    return Err(err);
                }

                let delay = config.delay_for(attempt);
                warn!("Request failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, config.max_retries + 1, err, delay.as_millis());

                sleep(delay).await;
            }
        }
    }
}

/// Check if an HTTP status code is retryable
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    // Retry on:
    // - 5xx server errors (server is having issues)
    // - 429 too many requests (rate limited)
    // - 408 request timeout
    status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
}
