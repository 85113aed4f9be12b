use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: u64,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Where the next page of a timeline starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Only posts with an id strictly below this one
    Before(u64),
    /// Continuation token handed back in the previous response's metadata
    Token(String),
}

#[derive(Debug, Default)]
pub struct Page {
    pub posts: Vec<Post>,
    pub next: Option<Cursor>,
}

impl Page {
    /// Cursor pointing below the oldest post on this page, for id-ordered timelines.
    pub fn before_oldest(posts: &[Post]) -> Option<Cursor> {
        posts.iter().map(|p| p.id).min().map(Cursor::Before)
    }
}
