mod collect;
mod config;
mod error;
mod governor;
mod model;
mod sink;
mod twitter;

use crate::collect::{crawl_handle, Collection};
use crate::config::{load_auth, CrawlConfig};
use crate::error::CrawlError;
use crate::governor::FixedInterval;
use crate::model::Post;
use crate::twitter::v1::TwitterClientV1;
use crate::twitter::v2::TwitterClientV2;
use crate::twitter::{normalize_handle, TwitterClient};
use anyhow::{bail, Context};
use clap::{ArgEnum, Parser};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Path to the authentication details file
    #[clap(short, long, default_value = "./auth.json")]
    auth: PathBuf,
    /// Bearer token, takes precedence over the auth file
    #[clap(long, env = "TWITTER_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,
    /// Username(s) to crawl (comma seperated)
    #[clap(short, long)]
    users: Option<String>,
    /// File containing list of usernames to crawl (one per line)
    #[clap(short, long)]
    list: Option<PathBuf>,
    /// Where to write `<username>.csv` files
    #[clap(short, long, default_value = "./")]
    out: PathBuf,
    /// What to do with collected posts
    #[clap(long, arg_enum, default_value = "csv")]
    sink: Sink,
    /// Replace existing CSV files
    #[clap(long)]
    overwrite: bool,
    /// Use the v1.1 user timeline instead of API v2
    #[clap(long)]
    api_v1: bool,
    /// Maximum number of posts to collect per user
    #[clap(long, default_value_t = 1000)]
    max_posts: usize,
    /// Posts per request [default: 100 for v2, 200 for v1.1]
    #[clap(long)]
    page_size: Option<u32>,
    /// Seconds between requests [default: 1 for v2, 300 for v1.1]
    #[clap(long)]
    interval_secs: Option<u64>,
    /// Stop after this many requests per user [default: unlimited for v2, 16 for v1.1]
    #[clap(long)]
    max_pages: Option<usize>,
    /// Per-request timeout in seconds
    #[clap(long, default_value_t = 10)]
    timeout_secs: u64,
    /// How many times a timed out or rate limited request is repeated
    #[clap(long, default_value_t = 3)]
    retries: usize,
    /// Include retweets
    #[clap(long)]
    include_retweets: bool,
    /// Include replies
    #[clap(long)]
    include_replies: bool,
    /// Continue even if an account fails to crawl
    #[clap(long)]
    continue_on_error: bool,
}

#[derive(ArgEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Sink {
    /// Write a CSV file per user once collection finishes
    Csv,
    /// Print each post's text as it is retrieved
    Console,
}

impl Args {
    fn crawl_config(&self) -> CrawlConfig {
        let defaults = if self.api_v1 {
            CrawlConfig::legacy()
        } else {
            CrawlConfig::modern()
        };
        CrawlConfig {
            max_posts: self.max_posts,
            page_size: self.page_size.unwrap_or(defaults.page_size),
            interval: self
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            max_pages: self.max_pages.or(defaults.max_pages),
            timeout: Duration::from_secs(self.timeout_secs),
            retries: self.retries,
            include_retweets: self.include_retweets,
            include_replies: self.include_replies,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = main2().await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn main2() -> anyhow::Result<()> {
    let args: Args = Args::parse();
    if args.sink == Sink::Csv && !args.out.is_dir() {
        bail!("Destination must be a directory");
    }
    let auth = load_auth(&args.auth, args.bearer_token.clone()).await?;
    let usernames = parse_usernames(&args).await?;
    let config = args.crawl_config();

    let client: Box<dyn TwitterClient> = if args.api_v1 {
        log::info!("Using Twitter API v1.1");
        Box::new(TwitterClientV1::new(
            &auth,
            config.timeout,
            config.include_retweets,
            config.include_replies,
        ))
    } else {
        log::info!("Using Twitter API v2");
        Box::new(TwitterClientV2::new(
            &auth,
            config.timeout,
            config.include_retweets,
            config.include_replies,
        )?)
    };
    drop(auth);

    let mut governor = FixedInterval::new(config.interval);
    for account in usernames {
        if let Err(e) = crawl_account(&account, client.as_ref(), &mut governor, &config, &args).await
        {
            if args.continue_on_error {
                log::warn!("Error crawling {}: {:#}, ignoring...", account, e);
            } else {
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn parse_usernames(args: &Args) -> anyhow::Result<Vec<String>> {
    let mut raw = Vec::new();
    if let Some(users) = &args.users {
        raw.extend(users.split(',').map(str::to_string));
    }
    if let Some(list) = &args.list {
        let list = fs::read_to_string(list)
            .await
            .context("Unable to read users list")?;
        raw.extend(list.lines().map(str::to_string));
    }
    let mut account_names = BTreeSet::new();
    for name in raw.iter().filter(|name| !name.trim().is_empty()) {
        match normalize_handle(name) {
            Some(handle) => {
                account_names.insert(handle.to_string());
            }
            None => log::warn!("Skipping invalid username {:?}", name.trim()),
        }
    }
    if account_names.is_empty() {
        bail!("No usernames provided")
    }
    Ok(account_names.into_iter().collect())
}

async fn crawl_account(
    username: &str,
    twitter: &'_ dyn TwitterClient,
    governor: &mut FixedInterval,
    config: &CrawlConfig,
    args: &Args,
) -> anyhow::Result<()> {
    let console = args.sink == Sink::Console;
    let stdout = std::io::stdout();
    let collection = crawl_handle(twitter, governor, username, config, |page| {
        if console {
            if let Err(e) = sink::print_page(&mut stdout.lock(), page) {
                log::warn!("Unable to print posts: {}", e);
            }
        }
    })
    .await
    .with_context(|| format!("Could not retrieve user id for {}", username))?;
    log::info!("Got {} tweets for {}", collection.posts().len(), username);

    let (posts, fatal) = settle(username, collection)
        .with_context(|| format!("Unable to fetch tweets for {}", username))?;

    if args.sink == Sink::Csv {
        let destination = csv_destination(&args.out, username);
        let written = sink::write_csv(&posts, &destination, args.overwrite)
            .with_context(|| format!("Error saving {}", destination.display()))?;
        log::info!("Saved {} tweets to {}", written, destination.display());
    }
    match fatal {
        Some(e) => Err(e).with_context(|| format!("Crawl of {} was cut short", username)),
        None => Ok(()),
    }
}

/// Split a collection into the posts worth keeping and an error that must still fail
/// the account once they are saved. Rejected credentials are never shrugged off.
fn settle(
    username: &str,
    collection: Collection,
) -> Result<(Vec<Post>, Option<CrawlError>), CrawlError> {
    match collection {
        Collection::Failed(e) => Err(e),
        Collection::Partial { posts, error } => {
            log::warn!(
                "Only got {} tweets for {} before failing: {}",
                posts.len(),
                username,
                error
            );
            let fatal = matches!(error, CrawlError::Unauthorized(_)).then(|| error);
            Ok((posts, fatal))
        }
        Collection::Complete(posts) => Ok((posts, None)),
    }
}

fn csv_destination(out_dir: &Path, username: &str) -> PathBuf {
    out_dir.join(format!("{}.csv", username))
}
