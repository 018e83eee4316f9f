use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::config::ObserverConfig;
use crate::fetch::{CancelToken, Interrupted, PostId, truncate_error};

/// How often a still-waiting observer reports progress.
const PROGRESS_EVERY: Duration = Duration::from_secs(10);

/// Source of directory entry names.
pub(crate) trait DirectoryListing {
    /// Names of the entries currently in `dir`.
    fn list_entries(&self, dir: &Path) -> io::Result<Vec<String>>;
}

/// Lists a real directory on disk.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FsListing;

impl DirectoryListing for FsListing {
    fn list_entries(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

/// Timing for one wait on the download directory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitTiming {
    pub(crate) timeout: Duration,
    pub(crate) poll_interval: Duration,
    /// Delay before the first look, giving the browser time to start writing.
    pub(crate) initial_grace: Duration,
    /// Delay after a match, letting the final bytes reach the disk.
    pub(crate) settle: Duration,
}

impl WaitTiming {
    pub(crate) fn from_config(config: &ObserverConfig) -> Self {
        Self {
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            initial_grace: config.effective_grace(),
            settle: config.settle(),
        }
    }
}

/// True if `name` is a finished file for `id`.
///
/// The ID only has to appear somewhere in the name, since the server decides
/// the rest of it. This means an ID that is a substring of another ID (`5` and
/// `512`) can match the other post's file.
pub(crate) fn is_completion_match(name: &str, id: &PostId, in_progress_suffixes: &[String]) -> bool {
    name.contains(id.as_str())
        && !in_progress_suffixes
            .iter()
            .any(|suffix| name.ends_with(suffix.as_str()))
}

/// Watches a download directory for the finished file of a post.
#[derive(Debug, Clone)]
pub(crate) struct DownloadObserver<L> {
    listing: L,
    in_progress_suffixes: Vec<String>,
    cancel: CancelToken,
}

impl<L: DirectoryListing> DownloadObserver<L> {
    pub(crate) fn new(listing: L, in_progress_suffixes: Vec<String>, cancel: CancelToken) -> Self {
        Self {
            listing,
            in_progress_suffixes,
            cancel,
        }
    }

    #[cfg(test)]
    pub(crate) fn listing(&self) -> &L {
        &self.listing
    }

    /// Polls `dir` until a finished file for `id` shows up or `timing.timeout` passes.
    ///
    /// The directory is always listed at least once after the grace period,
    /// even when the grace period already used up the timeout. Listing
    /// failures are logged and the poll continues; they only end the wait
    /// through the timeout.
    pub(crate) fn await_completion(
        &self,
        dir: &Path,
        id: &PostId,
        timing: &WaitTiming,
    ) -> Result<bool, Interrupted> {
        let started = Instant::now();
        self.cancel.wait(timing.initial_grace)?;
        debug!("Waiting for post {} to finish downloading...", id);

        let mut next_report = PROGRESS_EVERY;
        loop {
            match self.listing.list_entries(dir) {
                Ok(names) => {
                    if let Some(name) = names
                        .iter()
                        .find(|name| is_completion_match(name, id, &self.in_progress_suffixes))
                    {
                        trace!("Found finished file \"{}\" for post {}", name, id);
                        self.cancel.wait(timing.settle)?;
                        return Ok(true);
                    }
                }
                Err(err) => warn!(
                    "Unable to list {} while waiting for post {}: {}",
                    dir.display(),
                    id,
                    truncate_error(&err.to_string())
                ),
            }

            let elapsed = started.elapsed();
            if elapsed >= timing.timeout {
                break;
            }
            if elapsed >= next_report {
                debug!(
                    "Still waiting for post {} ({}s / {}s)",
                    id,
                    elapsed.as_secs(),
                    timing.timeout.as_secs()
                );
                next_report += PROGRESS_EVERY;
            }
            self.cancel.wait(timing.poll_interval)?;
        }

        warn!("Timed out after {}s waiting for post {}", timing.timeout.as_secs(), id);
        Ok(false)
    }
}
