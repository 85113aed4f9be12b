use crate::error::CrawlError;
use crate::model::{Cursor, Page, Post};
use crate::twitter::{normalize_handle, Authentication, TwitterClient};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use egg_mode::error::Error as EggError;
use egg_mode::{KeyPair, Token};
use std::future::Future;
use std::time::Duration;

// The user_timeline endpoint caps `count` here
const MAX_PAGE_SIZE: u32 = 200;

// https://developer.twitter.com/en/support/twitter-api/error-troubleshooting
const AUTH_ERROR_CODES: [i32; 4] = [32, 89, 135, 215];
const NOT_FOUND_ERROR_CODES: [i32; 2] = [34, 50];
const RATE_LIMIT_ERROR_CODE: i32 = 88;

pub struct TwitterClientV1 {
    token: Token,
    timeout: Duration,
    include_retweets: bool,
    include_replies: bool,
}

impl TwitterClientV1 {
    pub fn new(
        auth: &Authentication,
        timeout: Duration,
        include_retweets: bool,
        include_replies: bool,
    ) -> Self {
        let token = match auth.clone() {
            Authentication::Bearer { bearer_token } => Token::Bearer(bearer_token),
            Authentication::OAuth1 {
                consumer_key,
                consumer_secret,
                access_token,
                access_token_secret,
            } => Token::Access {
                consumer: KeyPair::new(consumer_key, consumer_secret),
                access: KeyPair::new(access_token, access_token_secret),
            },
        };
        Self {
            token,
            timeout,
            include_retweets,
            include_replies,
        }
    }

    /// egg-mode has no per-request timeout, so bound each call here.
    async fn timed<T, F>(&self, call: F) -> Result<T, CrawlError>
    where
        F: Future<Output = Result<T, EggError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(classify),
            Err(_elapsed) => Err(CrawlError::Timeout),
        }
    }
}

#[async_trait]
impl TwitterClient for TwitterClientV1 {
    async fn get_id_for_username(&self, username: &str) -> Result<u64, CrawlError> {
        let handle = normalize_handle(username)
            .ok_or_else(|| CrawlError::UserNotFound(username.to_string()))?;
        let user = self
            .timed(egg_mode::user::show(handle.to_string(), &self.token))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    CrawlError::UserNotFound(username.to_string())
                } else {
                    e
                }
            })?;
        Ok(user.response.id)
    }

    async fn get_page(
        &self,
        user_id: u64,
        cursor: Option<&Cursor>,
        page_size: u32,
    ) -> Result<Page, CrawlError> {
        let timeline = egg_mode::tweet::user_timeline(
            user_id,
            self.include_replies,
            self.include_retweets,
            &self.token,
        );
        let (size, max_id) = match timeline_window(cursor, page_size)? {
            Some(window) => window,
            None => return Ok(Page::default()),
        };
        let response = self
            .timed(timeline.with_page_size(size).call(None, max_id))
            .await?;
        let posts = response
            .response
            .into_iter()
            .map(Post::from)
            .collect::<Vec<_>>();
        let next = Page::before_oldest(&posts);
        Ok(Page { posts, next })
    }
}

impl From<egg_mode::tweet::Tweet> for Post {
    fn from(tweet: egg_mode::tweet::Tweet) -> Self {
        Post {
            id: tweet.id,
            text: tweet.text,
            created_at: Some(tweet.created_at),
        }
    }
}

/// Page size and `max_id` for the request that follows `cursor`, or `None` when the
/// watermark is already at the bottom of the id space.
fn timeline_window(
    cursor: Option<&Cursor>,
    page_size: u32,
) -> Result<Option<(i32, Option<u64>)>, CrawlError> {
    match cursor {
        // The first page is a lookup of the single most recent post
        None => Ok(Some((1, None))),
        // max_id is inclusive on this endpoint, so step below the watermark
        Some(Cursor::Before(id)) => Ok(id
            .checked_sub(1)
            .map(|max_id| (page_size.clamp(1, MAX_PAGE_SIZE) as i32, Some(max_id)))),
        Some(Cursor::Token(_)) => Err(CrawlError::UnsupportedCursor("continuation token")),
    }
}

fn is_not_found(e: &CrawlError) -> bool {
    match e {
        CrawlError::BadResponse(404, _) => true,
        CrawlError::Legacy(message) => message.starts_with("not found"),
        _ => false,
    }
}

fn classify(e: EggError) -> CrawlError {
    match e {
        EggError::RateLimit(reset) => CrawlError::RateLimited {
            reset: Utc.timestamp_opt(reset as i64, 0).single(),
        },
        EggError::BadStatus(status) => match status.as_u16() {
            code @ (401 | 403) => CrawlError::Unauthorized(code),
            code => CrawlError::BadResponse(code, status.to_string()),
        },
        EggError::TwitterError(_headers, errors) => {
            let codes = errors.errors.iter().map(|e| e.code).collect::<Vec<_>>();
            if codes.iter().any(|c| AUTH_ERROR_CODES.contains(c)) {
                CrawlError::Unauthorized(401)
            } else if codes.contains(&RATE_LIMIT_ERROR_CODE) {
                CrawlError::RateLimited { reset: None }
            } else if codes.iter().any(|c| NOT_FOUND_ERROR_CODES.contains(c)) {
                CrawlError::Legacy(format!("not found: {}", errors))
            } else {
                CrawlError::Legacy(errors.to_string())
            }
        }
        other => CrawlError::Legacy(other.to_string()),
    }
}
