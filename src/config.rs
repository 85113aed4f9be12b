use crate::twitter::Authentication;
use anyhow::Context;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Knobs for a single timeline crawl.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Stop once this many posts have been collected
    pub max_posts: usize,
    /// Posts requested per call (the client clamps to what its endpoint accepts)
    pub page_size: u32,
    /// Pause between consecutive calls
    pub interval: Duration,
    /// Optional cap on the number of page requests
    pub max_pages: Option<usize>,
    /// Per-call timeout
    pub timeout: Duration,
    /// Consecutive attempts allowed for a timed out or rate limited page
    pub retries: usize,
    pub include_retweets: bool,
    pub include_replies: bool,
}

impl CrawlConfig {
    /// Defaults for the v2 API: 100 per page, one call per second.
    pub fn modern() -> Self {
        Self {
            max_posts: 1000,
            page_size: 100,
            interval: Duration::from_secs(1),
            max_pages: None,
            timeout: Duration::from_secs(10),
            retries: 3,
            include_retweets: false,
            include_replies: false,
        }
    }

    /// Defaults for the v1.1 API: 200 per page, five minutes apart, at most 16 pages.
    pub fn legacy() -> Self {
        Self {
            page_size: 200,
            interval: Duration::from_secs(300),
            max_pages: Some(16),
            ..Self::modern()
        }
    }
}

/// Read credentials once at startup. A bearer token passed on the command line
/// (or via the environment) takes precedence over the auth file.
pub async fn load_auth(
    auth_file: &Path,
    bearer_token: Option<String>,
) -> anyhow::Result<Authentication> {
    if let Some(bearer_token) = bearer_token.filter(|t| !t.trim().is_empty()) {
        log::debug!("Using bearer token from command line / environment");
        return Ok(Authentication::Bearer {
            bearer_token: bearer_token.trim().to_string(),
        });
    }
    let auth = fs::read_to_string(auth_file)
        .await
        .with_context(|| format!("Unable to read auth file {}", auth_file.display()))?;
    let auth =
        serde_json::from_str::<Authentication>(&auth).context("Unable to deserialize auth file")?;
    log::debug!("Loaded credentials {:?} from {}", auth, auth_file.display());
    Ok(auth)
}
