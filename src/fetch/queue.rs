use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::fetch::{PostId, ResourceRef};

/// Pulls the post ID out of `.../download_image/<digits>-...` URLs.
static DOWNLOAD_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/download_image/(\d+)-").expect("download ID pattern is valid"));

/// Error types for reading the input queue
#[derive(Error, Debug)]
pub(crate) enum QueueError {
    #[error("Queue file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read queue file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Result type for queue operations
pub(crate) type QueueResult<T> = Result<T, QueueError>;

/// One non-blank line of the queue file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueueEntry {
    Resource(ResourceRef),
    /// A line with no recognizable post ID.
    Unusable { line: usize, raw: String },
}

pub(crate) fn extract_post_id(url: &str) -> Option<PostId> {
    DOWNLOAD_ID
        .captures(url)
        .and_then(|caps| caps.get(1))
        .and_then(|id| PostId::parse(id.as_str()))
}

/// Parses queue text: one URL per line, blank lines ignored.
pub(crate) fn parse_queue(content: &str) -> Vec<QueueEntry> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let url = line.trim();
            if url.is_empty() {
                return None;
            }
            Some(match extract_post_id(url) {
                Some(id) => QueueEntry::Resource(ResourceRef {
                    id,
                    url: url.to_string(),
                }),
                None => QueueEntry::Unusable {
                    line: index + 1,
                    raw: url.to_string(),
                },
            })
        })
        .collect()
}

/// Reads the queue file at `path`.
pub(crate) fn read_queue(path: &Path) -> QueueResult<Vec<QueueEntry>> {
    debug!("Reading queue file {}", path.display());
    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            QueueError::NotFound(path.to_path_buf())
        } else {
            QueueError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let entries = parse_queue(&content);
    info!("Read {} URLs from {}", entries.len(), path.display());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_post_id() {
        let url = "https://api.anime-pictures.net/pictures/download_image/888175-5403x7641-original-haruhiruri-single-long+hair.jpg";
        assert_eq!(extract_post_id(url).unwrap().as_str(), "888175");
        assert!(extract_post_id("https://anime-pictures.net/posts/888175").is_none());
        assert!(extract_post_id("https://api.example.net/download_image/abc-1.jpg").is_none());
    }

    #[test]
    fn test_parse_queue_keeps_order_and_flags_unusable() {
        let content = "\nhttps://x/download_image/1-a.jpg\n  \nhttps://x/posts/2\nhttps://x/download_image/3-c.png  \n";
        let entries = parse_queue(content);

        assert_eq!(entries.len(), 3);
        match &entries[0] {
            QueueEntry::Resource(r) => assert_eq!(r.id.as_str(), "1"),
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(
            entries[1],
            QueueEntry::Unusable {
                line: 4,
                raw: "https://x/posts/2".to_string()
            }
        );
        match &entries[2] {
            QueueEntry::Resource(r) => {
                assert_eq!(r.id.as_str(), "3");
                assert_eq!(r.url, "https://x/download_image/3-c.png");
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_read_queue_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = read_queue(&dir.path().join("download_urls.txt")).unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[test]
    fn test_read_queue_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download_urls.txt");
        fs::write(&path, "https://x/download_image/10-a.jpg\nhttps://x/download_image/11-b.jpg\n").unwrap();

        assert_eq!(read_queue(&path).unwrap().len(), 2);
    }
}
