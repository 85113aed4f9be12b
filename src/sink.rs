use crate::model::Post;
use chrono::SecondsFormat;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const CSV_HEADER: [&str; 3] = ["id", "text", "created_at"];
/// Written in place of a missing timestamp
pub const MISSING: &str = "N/A";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Destination already exists: {0}")]
    DestinationExists(PathBuf),
    #[error("Destination is not a valid file path: {0}")]
    InvalidDestination(PathBuf),
    #[error("Error whilst writing to file: {0}")]
    FileError(#[source] io::Error),
    #[error("Error writing CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Write `posts` to `destination` as CSV and return how many rows were written
/// (excluding the header). The file only appears once it has been fully written.
pub fn write_csv(posts: &[Post], destination: &Path, overwrite: bool) -> Result<usize, SinkError> {
    if !overwrite && destination.exists() {
        return Err(SinkError::DestinationExists(destination.to_path_buf()));
    }
    let parent = match destination.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => return Err(SinkError::InvalidDestination(destination.to_path_buf())),
    };
    let temp = NamedTempFile::new_in(parent).map_err(SinkError::FileError)?;
    let mut writer = csv::Writer::from_writer(temp.reopen().map_err(SinkError::FileError)?);
    writer.write_record(CSV_HEADER)?;
    for post in posts {
        let id = post.id.to_string();
        let created_at = post
            .created_at
            .map(|c| c.to_rfc3339_opts(SecondsFormat::Millis, true));
        writer.write_record([
            id.as_str(),
            post.text.as_str(),
            created_at.as_deref().unwrap_or(MISSING),
        ])?;
    }
    writer.flush().map_err(SinkError::FileError)?;
    drop(writer);
    temp.persist(destination)
        .map_err(|e| SinkError::FileError(e.error))?;
    Ok(posts.len())
}

/// Console sink: one post's text per line, as pages come in.
pub fn print_page<W: Write>(out: &mut W, posts: &[Post]) -> io::Result<()> {
    for post in posts {
        writeln!(out, "{}", post.text)?;
    }
    out.flush()
}
