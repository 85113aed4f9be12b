//! The paginated timeline crawl.
//!
//! One request is in flight at a time. Before each request the [`Governor`] is
//! asked for permission; after each page the loop checks, in order: empty page,
//! requested count reached, cursor exhausted or not advancing, page budget spent.
//! Timeouts and rate-limit rejections repeat the same request a bounded number of
//! times, any other failure ends the crawl with whatever was already collected.

use crate::config::CrawlConfig;
use crate::error::CrawlError;
use crate::governor::Governor;
use crate::model::{Cursor, Page, Post};
use crate::twitter::TwitterClient;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// How long to hold off after a 429 that didn't say when the window resets.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum Collection {
    /// The crawl stopped normally
    Complete(Vec<Post>),
    /// Some posts were collected before a request failed
    Partial { posts: Vec<Post>, error: CrawlError },
    /// The very first request failed
    Failed(CrawlError),
}

impl Collection {
    pub fn posts(&self) -> &[Post] {
        match self {
            Collection::Complete(posts) | Collection::Partial { posts, .. } => posts,
            Collection::Failed(_) => &[],
        }
    }
}

/// Look up the numeric id behind `handle`. Failures are logged, never retried.
pub async fn resolve_user(client: &'_ dyn TwitterClient, handle: &str) -> Option<u64> {
    if handle.trim().is_empty() {
        log::error!("Cannot look up an empty username");
        return None;
    }
    match client.get_id_for_username(handle).await {
        Ok(id) => {
            log::debug!("Resolved {} to user id {}", handle, id);
            Some(id)
        }
        Err(e) => {
            log::error!("Error fetching user id for {}: {}", handle, e);
            None
        }
    }
}

/// Resolve `handle` and crawl its timeline. `None` when the handle couldn't be resolved,
/// in which case no timeline request is made.
pub async fn crawl_handle<F>(
    client: &'_ dyn TwitterClient,
    governor: &mut dyn Governor,
    handle: &str,
    config: &CrawlConfig,
    on_page: F,
) -> Option<Collection>
where
    F: FnMut(&[Post]),
{
    let user_id = resolve_user(client, handle).await?;
    Some(collect(client, governor, user_id, config, on_page).await)
}

/// Page through `user_id`'s timeline until `config.max_posts` posts are held or the
/// timeline runs out. `on_page` sees each page's accepted posts as they arrive.
pub async fn collect<F>(
    client: &'_ dyn TwitterClient,
    governor: &mut dyn Governor,
    user_id: u64,
    config: &CrawlConfig,
    mut on_page: F,
) -> Collection
where
    F: FnMut(&[Post]),
{
    let mut posts: Vec<Post> = Vec::new();
    if config.max_posts == 0 {
        return Collection::Complete(posts);
    }

    let mut cursor: Option<Cursor> = None;
    let mut pages = 0usize;
    let mut attempts = 0usize;

    loop {
        let remaining = config.max_posts - posts.len();
        let page_size = config
            .page_size
            .min(u32::try_from(remaining).unwrap_or(u32::MAX));

        governor.ready().await;
        let Page { posts: mut fetched, next } =
            match client.get_page(user_id, cursor.as_ref(), page_size).await {
                Ok(page) => {
                    attempts = 0;
                    page
                }
                Err(e) if e.is_retryable() && attempts < config.retries => {
                    attempts += 1;
                    if let CrawlError::RateLimited { reset } = &e {
                        governor.defer_until(resume_at(*reset));
                    }
                    log::warn!(
                        "{}, retrying page {} (attempt {}/{})",
                        e,
                        pages + 1,
                        attempts,
                        config.retries
                    );
                    continue;
                }
                Err(e) => return stop_with_error(posts, e),
            };
        pages += 1;

        if fetched.is_empty() {
            log::debug!("Page {} was empty, timeline exhausted", pages);
            break;
        }
        fetched.truncate(remaining);
        on_page(&fetched);
        posts.append(&mut fetched);
        log::debug!("Page {} done, {} posts collected", pages, posts.len());

        if posts.len() >= config.max_posts {
            break;
        }
        match next {
            None => break,
            Some(next) if !advances(cursor.as_ref(), &next) => {
                log::warn!("Cursor {:?} did not advance, stopping", next);
                break;
            }
            Some(next) => cursor = Some(next),
        }
        if matches!(config.max_pages, Some(max_pages) if pages >= max_pages) {
            log::info!("Reached the budget of {} pages", pages);
            break;
        }
    }

    Collection::Complete(posts)
}

fn stop_with_error(posts: Vec<Post>, error: CrawlError) -> Collection {
    if posts.is_empty() {
        Collection::Failed(error)
    } else {
        log::warn!("Stopping after {} posts: {}", posts.len(), error);
        Collection::Partial { posts, error }
    }
}

fn advances(current: Option<&Cursor>, next: &Cursor) -> bool {
    match (current, next) {
        (None, _) => true,
        (Some(Cursor::Before(current)), Cursor::Before(next)) => next < current,
        (Some(current), next) => current != next,
    }
}

fn resume_at(reset: Option<DateTime<Utc>>) -> Instant {
    let wait = match reset {
        Some(reset) => (reset - Utc::now()).to_std().unwrap_or(Duration::ZERO),
        None => DEFAULT_RATE_LIMIT_WAIT,
    };
    Instant::now() + wait
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::FixedInterval;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn post(id: u64) -> Post {
        Post {
            id,
            text: format!("post {id}"),
            created_at: Utc.timestamp_opt(1_600_000_000 + id as i64, 0).single(),
        }
    }

    fn page(ids: impl DoubleEndedIterator<Item = u64>, next: Option<&str>) -> Page {
        Page {
            posts: ids.rev().map(post).collect(),
            next: next.map(|t| Cursor::Token(t.to_string())),
        }
    }

    /// Replays canned responses; runs dry with empty pages.
    #[derive(Default)]
    struct Scripted {
        user: Option<Result<u64, CrawlError>>,
        responses: Mutex<VecDeque<Result<Page, CrawlError>>>,
        requests: Mutex<Vec<(Option<Cursor>, u32)>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Page, CrawlError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<(Option<Cursor>, u32)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TwitterClient for Scripted {
        async fn get_id_for_username(&self, username: &str) -> Result<u64, CrawlError> {
            match &self.user {
                Some(Ok(id)) => Ok(*id),
                Some(Err(CrawlError::Unauthorized(code))) => Err(CrawlError::Unauthorized(*code)),
                _ => Err(CrawlError::UserNotFound(username.to_string())),
            }
        }

        async fn get_page(
            &self,
            _user_id: u64,
            cursor: Option<&Cursor>,
            page_size: u32,
        ) -> Result<Page, CrawlError> {
            self.requests
                .lock()
                .unwrap()
                .push((cursor.cloned(), page_size));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::default()))
        }
    }

    /// An id-ordered timeline holding posts `1..=len`, served newest first.
    struct IdTimeline {
        len: u64,
        requests: Mutex<Vec<Option<Cursor>>>,
    }

    #[async_trait]
    impl TwitterClient for IdTimeline {
        async fn get_id_for_username(&self, _username: &str) -> Result<u64, CrawlError> {
            Ok(1)
        }

        async fn get_page(
            &self,
            _user_id: u64,
            cursor: Option<&Cursor>,
            page_size: u32,
        ) -> Result<Page, CrawlError> {
            self.requests.lock().unwrap().push(cursor.cloned());
            let below = match cursor {
                Some(Cursor::Before(id)) => *id,
                _ => self.len + 1,
            };
            let posts = (1..below)
                .rev()
                .take(page_size as usize)
                .map(post)
                .collect::<Vec<_>>();
            let next = Page::before_oldest(&posts);
            Ok(Page { posts, next })
        }
    }

    #[derive(Default)]
    struct CountingGovernor {
        ready: usize,
        deferred: Vec<Instant>,
    }

    #[async_trait]
    impl Governor for CountingGovernor {
        async fn ready(&mut self) {
            self.ready += 1;
        }

        fn defer_until(&mut self, until: Instant) {
            self.deferred.push(until);
        }
    }

    fn config(max_posts: usize) -> CrawlConfig {
        CrawlConfig {
            max_posts,
            interval: Duration::ZERO,
            ..CrawlConfig::modern()
        }
    }

    #[tokio::test]
    async fn two_pages_then_empty_page() {
        let client = Scripted::new(vec![
            Ok(page(11..=20, Some("t1"))),
            Ok(page(1..=10, Some("t2"))),
            Ok(Page::default()),
        ]);
        let mut governor = FixedInterval::new(Duration::ZERO);

        let result = collect(&client, &mut governor, 1, &config(100), |_| {}).await;

        assert!(matches!(result, Collection::Complete(_)));
        assert_eq!(result.posts().len(), 20);
        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].0, None);
        assert_eq!(requests[1].0, Some(Cursor::Token("t1".into())));
        assert_eq!(requests[2].0, Some(Cursor::Token("t2".into())));
    }

    #[tokio::test]
    async fn zero_max_makes_no_calls() {
        let client = Scripted::new(vec![Ok(page(1..=10, None))]);
        let mut governor = CountingGovernor::default();

        let result = collect(&client, &mut governor, 1, &config(0), |_| {}).await;

        assert!(matches!(result, Collection::Complete(ref posts) if posts.is_empty()));
        assert!(client.requests().is_empty());
        assert_eq!(governor.ready, 0);
    }

    #[tokio::test]
    async fn never_exceeds_requested_maximum() {
        for max in [1, 9, 10, 25, 40, 41, 100] {
            let client = IdTimeline {
                len: 40,
                requests: Mutex::default(),
            };
            let config = CrawlConfig {
                page_size: 10,
                ..config(max)
            };
            let mut governor = FixedInterval::new(Duration::ZERO);
            let result = collect(&client, &mut governor, 1, &config, |_| {}).await;
            assert_eq!(result.posts().len(), max.min(40), "max = {max}");
        }
    }

    #[tokio::test]
    async fn page_size_shrinks_to_what_is_still_needed() {
        let client = Scripted::new(vec![Ok(page(6..=15, Some("t1")))]);
        let mut governor = CountingGovernor::default();

        collect(&client, &mut governor, 1, &config(15), |_| {}).await;

        let sizes = client.requests().iter().map(|r| r.1).collect::<Vec<_>>();
        assert_eq!(sizes, vec![15, 5]);
    }

    #[tokio::test]
    async fn id_cursor_is_exclusive_and_strictly_decreasing() {
        let client = IdTimeline {
            len: 95,
            requests: Mutex::default(),
        };
        let config = CrawlConfig {
            page_size: 20,
            ..config(1000)
        };
        let mut governor = FixedInterval::new(Duration::ZERO);

        let result = collect(&client, &mut governor, 1, &config, |_| {}).await;
        let posts = result.posts();

        assert_eq!(posts.len(), 95);
        assert!(posts.windows(2).all(|w| w[0].id > w[1].id));
        assert!(posts
            .windows(2)
            .all(|w| w[0].created_at >= w[1].created_at));

        let cursors = client
            .requests
            .lock()
            .unwrap()
            .iter()
            .skip(1)
            .map(|c| match c {
                Some(Cursor::Before(id)) => *id,
                other => panic!("unexpected cursor {other:?}"),
            })
            .collect::<Vec<_>>();
        assert!(cursors.windows(2).all(|w| w[1] < w[0]));
    }

    #[tokio::test]
    async fn page_budget_stops_early() {
        let client = IdTimeline {
            len: 1000,
            requests: Mutex::default(),
        };
        let config = CrawlConfig {
            page_size: 10,
            max_pages: Some(3),
            ..config(1000)
        };
        let mut governor = FixedInterval::new(Duration::ZERO);

        let result = collect(&client, &mut governor, 1, &config, |_| {}).await;

        assert_eq!(result.posts().len(), 30);
        assert_eq!(client.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failure_mid_crawl_keeps_what_was_collected() {
        let client = Scripted::new(vec![
            Ok(page(11..=20, Some("t1"))),
            Err(CrawlError::BadResponse(500, "boom".into())),
            Ok(page(1..=10, None)),
        ]);
        let mut governor = CountingGovernor::default();

        let result = collect(&client, &mut governor, 1, &config(100), |_| {}).await;

        match result {
            Collection::Partial { posts, error } => {
                assert_eq!(posts.len(), 10);
                assert!(matches!(error, CrawlError::BadResponse(500, _)));
            }
            other => panic!("expected partial result, got {other:?}"),
        }
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn auth_failure_on_first_page_is_a_failure() {
        let client = Scripted::new(vec![Err(CrawlError::Unauthorized(401))]);
        let mut governor = CountingGovernor::default();

        let result = collect(&client, &mut governor, 1, &config(100), |_| {}).await;

        assert!(matches!(result, Collection::Failed(CrawlError::Unauthorized(401))));
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_defers_and_repeats_the_same_cursor() {
        let client = Scripted::new(vec![
            Ok(page(11..=20, Some("t1"))),
            Err(CrawlError::RateLimited { reset: None }),
            Ok(page(1..=10, None)),
        ]);
        let mut governor = CountingGovernor::default();
        let before = Instant::now();

        let result = collect(&client, &mut governor, 1, &config(100), |_| {}).await;

        assert!(matches!(result, Collection::Complete(ref posts) if posts.len() == 20));
        let cursors = client.requests().into_iter().map(|r| r.0).collect::<Vec<_>>();
        assert_eq!(cursors[1], cursors[2]);
        assert_eq!(governor.deferred.len(), 1);
        assert!(governor.deferred[0] >= before + DEFAULT_RATE_LIMIT_WAIT);
        assert_eq!(governor.ready, 3);
    }

    #[tokio::test]
    async fn repeated_timeouts_give_up_after_retry_budget() {
        let client = Scripted::new(vec![
            Err(CrawlError::Timeout),
            Err(CrawlError::Timeout),
            Err(CrawlError::Timeout),
        ]);
        let config = CrawlConfig {
            retries: 2,
            ..config(100)
        };
        let mut governor = CountingGovernor::default();

        let result = collect(&client, &mut governor, 1, &config, |_| {}).await;

        assert!(matches!(result, Collection::Failed(CrawlError::Timeout)));
        assert_eq!(client.requests().len(), 3);
        assert!(governor.deferred.is_empty());
    }

    #[tokio::test]
    async fn stuck_cursor_does_not_spin() {
        let client = Scripted::new(vec![
            Ok(page(21..=30, Some("same"))),
            Ok(page(11..=20, Some("same"))),
            Ok(page(1..=10, Some("same"))),
        ]);
        let mut governor = CountingGovernor::default();

        let result = collect(&client, &mut governor, 1, &config(100), |_| {}).await;

        assert_eq!(result.posts().len(), 20);
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn pages_are_streamed_as_they_arrive() {
        let client = Scripted::new(vec![
            Ok(page(11..=20, Some("t1"))),
            Ok(page(1..=10, None)),
        ]);
        let mut governor = CountingGovernor::default();
        let mut seen = Vec::new();

        collect(&client, &mut governor, 1, &config(15), |p| seen.push(p.len())).await;

        assert_eq!(seen, vec![10, 5]);
    }

    #[tokio::test]
    async fn unresolved_handle_never_starts_a_crawl() {
        let client = Scripted {
            user: Some(Err(CrawlError::Unauthorized(401))),
            ..Scripted::new(vec![Ok(page(1..=10, None))])
        };
        let mut governor = CountingGovernor::default();

        let result = crawl_handle(&client, &mut governor, "jack", &config(100), |_| {}).await;

        assert!(result.is_none());
        assert!(client.requests().is_empty());
        assert_eq!(governor.ready, 0);
    }

    #[tokio::test]
    async fn resolved_handle_is_crawled() {
        let client = Scripted {
            user: Some(Ok(7)),
            ..Scripted::new(vec![Ok(page(1..=10, None))])
        };
        let mut governor = CountingGovernor::default();

        let result = crawl_handle(&client, &mut governor, "jack", &config(100), |_| {})
            .await
            .unwrap();

        assert_eq!(result.posts().len(), 10);
        assert_eq!(resolve_user(&client, "  ").await, None);
    }

    #[tokio::test]
    async fn reset_in_the_past_means_no_wait() {
        let now = Instant::now();
        let resume = resume_at(Some(Utc::now() - chrono::Duration::seconds(30)));
        assert!(resume - now < Duration::from_secs(1));
    }
}
