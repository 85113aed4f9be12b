use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Authentication rejected by the API ({0})")]
    Unauthorized(u16),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Rate limit reached, resets at {}", display_reset(.reset))]
    RateLimited { reset: Option<DateTime<Utc>> },
    #[error("Invalid request URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Request timed out")]
    Timeout,
    #[error("Error performing HTTP request: {0}")]
    Request(#[source] reqwest::Error),
    #[error("Response was not successful: {0}\n{1}")]
    BadResponse(u16, String),
    #[error("Unable to deserialize response: {0}")]
    Decode(String),
    #[error("Twitter API v1.1 error: {0}")]
    Legacy(String),
    #[error("This timeline cannot be paged by {0}")]
    UnsupportedCursor(&'static str),
}

impl CrawlError {
    /// Whether repeating the same request later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrawlError::Timeout | CrawlError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CrawlError::Timeout
        } else {
            CrawlError::Request(e)
        }
    }
}

fn display_reset(reset: &Option<DateTime<Utc>>) -> String {
    match reset {
        Some(reset) => reset.to_rfc3339(),
        None => "an unknown time".to_string(),
    }
}
