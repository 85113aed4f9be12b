pub mod v1;
pub mod v2;

use crate::error::CrawlError;
use crate::model::{Cursor, Page};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;

#[derive(Deserialize, Clone)]
#[serde(untagged)]
pub enum Authentication {
    Bearer {
        bearer_token: String,
    },
    OAuth1 {
        consumer_key: String,
        consumer_secret: String,
        access_token: String,
        access_token_secret: String,
    },
}

// Never print secrets, even at trace level
impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::Bearer { .. } => f.write_str("Bearer(<redacted>)"),
            Authentication::OAuth1 { .. } => f.write_str("OAuth1(<redacted>)"),
        }
    }
}

/// Strip whitespace and a leading `@` from `raw`. Returns `None` unless what is left
/// is made of ASCII letters, digits and underscores, the only characters a handle may hold.
pub fn normalize_handle(raw: &str) -> Option<&str> {
    let handle = raw.trim();
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let valid = !handle.is_empty()
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| handle)
}

#[async_trait]
pub trait TwitterClient: Send + Sync {
    async fn get_id_for_username(&self, username: &str) -> Result<u64, CrawlError>;

    /// Fetch one page of the user's timeline, newest first, starting at `cursor`
    /// (or at the most recent post when there is none).
    async fn get_page(
        &self,
        user_id: u64,
        cursor: Option<&Cursor>,
        page_size: u32,
    ) -> Result<Page, CrawlError>;
}
