//! Bearer-token client for the v2 timeline API.

use crate::error::CrawlError;
use crate::model::{Cursor, Page, Post};
use crate::twitter::{normalize_handle, Authentication, TwitterClient};
use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use maplit::hashmap;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const API_BASE: &str = "https://api.twitter.com/";
const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";
// Bounds the endpoint accepts for `max_results`
const MIN_PAGE_SIZE: u32 = 5;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct TwitterClientV2 {
    client: Client,
    base: Url,
    exclude: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TwitterResponse<T> {
    Ok(T),
    // Detect the case where the API returns 200, but contains errors
    #[allow(unused)]
    Error {
        errors: serde_json::Value,
    },
}

#[derive(Deserialize)]
struct ByUsernameResponse {
    data: ByUsernameData,
}

#[derive(Deserialize)]
struct ByUsernameData {
    id: String,
}

#[derive(Deserialize)]
struct GetTweetsResponse {
    #[serde(default)]
    data: Vec<GetTweetsTweet>,
    meta: GetTweetsMeta,
}

#[derive(Deserialize)]
struct GetTweetsTweet {
    id: String,
    text: String,
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct GetTweetsMeta {
    next_token: Option<String>,
}

async fn deserialize_response<T: DeserializeOwned>(response: Response) -> Result<T, CrawlError> {
    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await?;
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(CrawlError::Unauthorized(status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            return Err(CrawlError::RateLimited {
                reset: rate_limit_reset(&headers),
            })
        }
        _ if !status.is_success() => return Err(CrawlError::BadResponse(status.as_u16(), text)),
        _ => {}
    }
    let twitter = match serde_json::from_str::<TwitterResponse<T>>(&text) {
        Ok(ok) => ok,
        Err(e) => {
            return Err(CrawlError::Decode(format!("{e}\nContents:\n{text}")));
        }
    };
    match twitter {
        TwitterResponse::Ok(ok) => Ok(ok),
        TwitterResponse::Error { .. } => Err(CrawlError::BadResponse(status.as_u16(), text)),
    }
}

/// When the current rate-limit window closes, per the response headers.
fn rate_limit_reset(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let numeric = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if let Some(epoch) = numeric(RATE_LIMIT_RESET) {
        return Utc.timestamp_opt(epoch, 0).single();
    }
    numeric(RETRY_AFTER.as_str()).map(|secs| Utc::now() + ChronoDuration::seconds(secs))
}

impl TwitterClientV2 {
    pub fn new(
        auth: &Authentication,
        timeout: Duration,
        include_retweets: bool,
        include_replies: bool,
    ) -> anyhow::Result<Self> {
        let bearer_token = match auth {
            Authentication::Bearer { bearer_token } => bearer_token,
            Authentication::OAuth1 { .. } => bail!("Twitter API v2 requires a bearer token"),
        };
        let mut headers = HeaderMap::new();
        let value = format!("Bearer {}", bearer_token);
        let mut value = HeaderValue::from_str(&value)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);

        let exclude = [(!include_retweets, "retweets"), (!include_replies, "replies")]
            .iter()
            .filter(|(excluded, _)| *excluded)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>();

        Ok(Self {
            client: Client::builder()
                .default_headers(headers)
                .timeout(timeout)
                .build()?,
            base: Url::from_str(API_BASE)?,
            exclude: (!exclude.is_empty()).then(|| exclude.join(",")),
        })
    }

    /// Point the client at another host, e.g. a mock server. `base` must end in `/`.
    pub fn with_base_url(mut self, base: Url) -> Self {
        self.base = base;
        self
    }
}

#[async_trait]
impl TwitterClient for TwitterClientV2 {
    async fn get_id_for_username(&self, username: &str) -> Result<u64, CrawlError> {
        let handle = normalize_handle(username)
            .ok_or_else(|| CrawlError::UserNotFound(username.to_string()))?;
        let url = self.base.join("2/users/by/username/")?.join(handle)?;
        let response = self.client.get(url).send().await?;
        let response = match deserialize_response::<ByUsernameResponse>(response).await {
            Ok(response) => response,
            // An unknown handle comes back either as a 404 or as a 200 carrying `errors`
            Err(CrawlError::BadResponse(404 | 200, _)) => {
                return Err(CrawlError::UserNotFound(username.to_string()))
            }
            Err(e) => return Err(e),
        };
        response
            .data
            .id
            .parse()
            .map_err(|e| CrawlError::Decode(format!("Couldn't parse user id: {e}")))
    }

    // https://developer.twitter.com/en/docs/twitter-api/tweets/timelines/api-reference/get-users-id-tweets
    async fn get_page(
        &self,
        user_id: u64,
        cursor: Option<&Cursor>,
        page_size: u32,
    ) -> Result<Page, CrawlError> {
        let url = self.base.join(&format!("2/users/{user_id}/tweets"))?;
        let mut query = hashmap! {
            "max_results" => page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE).to_string(),
            "tweet.fields" => "created_at,text,author_id,id".to_string(),
        };
        if let Some(exclude) = &self.exclude {
            query.insert("exclude", exclude.clone());
        }
        match cursor {
            Some(Cursor::Token(token)) => {
                query.insert("pagination_token", token.clone());
            }
            // Pages here only ever hand back tokens
            Some(Cursor::Before(_)) => return Err(CrawlError::UnsupportedCursor("id watermark")),
            None => {}
        }
        let response = self.client.get(url).query(&query).send().await?;
        let response = deserialize_response::<GetTweetsResponse>(response).await?;
        Ok(Page {
            posts: convert_tweets(response.data)?,
            next: response.meta.next_token.map(Cursor::Token),
        })
    }
}

fn convert_tweets(tweets: Vec<GetTweetsTweet>) -> Result<Vec<Post>, CrawlError> {
    tweets
        .into_iter()
        .map(|tweet| {
            let created_at = tweet
                .created_at
                .map(|c| DateTime::parse_from_rfc3339(&c).map(|dt| dt.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| CrawlError::Decode(format!("Bad created_at on {}: {e}", tweet.id)))?;
            Ok(Post {
                id: u64::from_str(&tweet.id)
                    .map_err(|e| CrawlError::Decode(format!("Bad tweet id {}: {e}", tweet.id)))?,
                text: tweet.text,
                created_at,
            })
        })
        .collect()
}
