use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::fetch::ledger::CompletionLedger;
use crate::fetch::observer::{DirectoryListing, DownloadObserver, WaitTiming};
use crate::fetch::session::{BrowserSession, SessionRefresher};
use crate::fetch::{CancelToken, Interrupted, PostId, ResourceRef, truncate_error};

/// Terminal state of one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Already in the ledger, nothing fetched.
    Skipped,
    /// The finished file was observed.
    Success,
    /// Every attempt failed.
    GaveUp,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Skipped => write!(f, "skipped"),
            Outcome::Success => write!(f, "success"),
            Outcome::GaveUp => write!(f, "failed"),
        }
    }
}

/// How a single navigate/observe cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Pending,
    Success,
    Timeout,
    Error(String),
}

/// One navigate/observe cycle for a post. Lives only for the cycle.
#[derive(Debug, Clone)]
pub(crate) struct DownloadAttempt {
    pub(crate) resource_id: PostId,
    pub(crate) attempt_number: u32,
    pub(crate) started_at: DateTime<Local>,
    pub(crate) outcome: AttemptOutcome,
}

impl DownloadAttempt {
    fn start(resource_id: &PostId, attempt_number: u32) -> Self {
        Self {
            resource_id: resource_id.clone(),
            attempt_number,
            started_at: Local::now(),
            outcome: AttemptOutcome::Pending,
        }
    }
}

/// Limits of the retry loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    /// Total attempts per post, including the first.
    pub(crate) max_retries: u32,
    /// Fixed pause between attempts.
    pub(crate) backoff: Duration,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff(),
        }
    }
}

/// Drives each post through check, attempts and the final outcome.
pub(crate) struct RetryCoordinator<L> {
    download_dir: PathBuf,
    policy: RetryPolicy,
    timing: WaitTiming,
    observer: DownloadObserver<L>,
    refresher: SessionRefresher,
    cancel: CancelToken,
}

impl<L: DirectoryListing> RetryCoordinator<L> {
    pub(crate) fn new(
        download_dir: PathBuf,
        policy: RetryPolicy,
        timing: WaitTiming,
        observer: DownloadObserver<L>,
        refresher: SessionRefresher,
        cancel: CancelToken,
    ) -> Self {
        Self {
            download_dir,
            policy,
            timing,
            observer,
            refresher,
            cancel,
        }
    }

    pub(crate) fn refresher(&self) -> &SessionRefresher {
        &self.refresher
    }

    /// Processes one post to a terminal [`Outcome`].
    ///
    /// Errors from the session or the observer never leave this function;
    /// they become retries and finally [`Outcome::GaveUp`]. Only an operator
    /// interrupt returns early.
    pub(crate) fn process(
        &self,
        session: &mut dyn BrowserSession,
        ledger: &mut CompletionLedger,
        resource: &ResourceRef,
    ) -> Result<Outcome, Interrupted> {
        if ledger.contains(&resource.id) {
            info!("Skipping post {}: already downloaded", resource.id);
            return Ok(Outcome::Skipped);
        }

        let max_retries = self.policy.max_retries.max(1);
        for attempt_number in 1..=max_retries {
            self.cancel.check()?;
            let attempt = self.attempt(session, resource, attempt_number, max_retries)?;

            match attempt.outcome {
                AttemptOutcome::Success => {
                    info!("Post {} downloaded on attempt {}", resource.id, attempt_number);
                    if let Err(err) = ledger.mark_complete(&resource.id) {
                        error!(
                            "Post {} downloaded but not recorded, it may be fetched again next run: {}",
                            resource.id, err
                        );
                    }
                    return Ok(Outcome::Success);
                }
                AttemptOutcome::Timeout => warn!(
                    "Post {} attempt {}/{} timed out",
                    resource.id, attempt_number, max_retries
                ),
                AttemptOutcome::Error(ref text) => warn!(
                    "Post {} attempt {}/{} failed: {}",
                    resource.id, attempt_number, max_retries, text
                ),
                AttemptOutcome::Pending => {}
            }

            if attempt_number < max_retries {
                info!("Retrying post {}...", resource.id);
                self.cancel.wait(self.policy.backoff)?;
            }
        }

        error!("Giving up on post {} after {} attempts", resource.id, max_retries);
        Ok(Outcome::GaveUp)
    }

    fn attempt(
        &self,
        session: &mut dyn BrowserSession,
        resource: &ResourceRef,
        attempt_number: u32,
        max_retries: u32,
    ) -> Result<DownloadAttempt, Interrupted> {
        let mut attempt = DownloadAttempt::start(&resource.id, attempt_number);
        info!(
            "Downloading post {} (attempt {}/{}): {}",
            resource.id, attempt_number, max_retries, resource.url
        );

        if attempt_number > 1 && !self.refresher.refresh(session)? {
            warn!("Cookie refresh failed, trying the download anyway...");
        }

        attempt.outcome = match session.navigate(&resource.url) {
            Err(err) => AttemptOutcome::Error(truncate_error(&err.to_string())),
            Ok(()) => {
                if self
                    .observer
                    .await_completion(&self.download_dir, &resource.id, &self.timing)?
                {
                    AttemptOutcome::Success
                } else {
                    AttemptOutcome::Timeout
                }
            }
        };

        debug!(
            "Attempt {} for post {} started at {} ended as {:?}",
            attempt.attempt_number,
            attempt.resource_id,
            attempt.started_at.format("%H:%M:%S"),
            attempt.outcome
        );
        Ok(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::fetch::testing::{FakeBrowser, MemoryListing, fast_timing};
    use std::fs;
    use tempfile::TempDir;

    const REFRESH_URL: &str = "https://example.net/posts?page=4";

    fn resource(raw_id: &str) -> ResourceRef {
        ResourceRef {
            id: PostId::parse(raw_id).unwrap(),
            url: format!("https://api.example.net/pictures/download_image/{}-800x600-art.jpg", raw_id),
        }
    }

    fn coordinator(listing: MemoryListing, max_retries: u32) -> RetryCoordinator<MemoryListing> {
        let cancel = CancelToken::new();
        let session_config = SessionConfig {
            refresh_url: REFRESH_URL.to_string(),
            challenge_wait_ms: 0,
            ..SessionConfig::default()
        };
        let suffixes = vec![".crdownload".to_string(), ".tmp".to_string()];
        RetryCoordinator::new(
            PathBuf::from("downloads"),
            RetryPolicy {
                max_retries,
                backoff: Duration::ZERO,
            },
            WaitTiming {
                timeout: Duration::from_millis(30),
                ..fast_timing()
            },
            DownloadObserver::new(listing, suffixes, cancel.clone()),
            SessionRefresher::new(&session_config, cancel.clone()),
            cancel,
        )
    }

    fn ledger(dir: &TempDir) -> CompletionLedger {
        CompletionLedger::open(dir.path().join("downloaded.txt")).unwrap()
    }

    #[test]
    fn test_skips_when_in_ledger() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        ledger.mark_complete(&PostId::parse("2").unwrap()).unwrap();

        let listing = MemoryListing::default();
        let mut browser = FakeBrowser::new();
        let outcome = coordinator(listing, 3)
            .process(&mut browser, &mut ledger, &resource("2"))
            .unwrap();

        assert_eq!(outcome, Outcome::Skipped);
        assert!(browser.visited().is_empty());
    }

    #[test]
    fn test_success_on_first_attempt_records_ledger() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let listing = MemoryListing::default();
        let mut browser = FakeBrowser::new().with_download("/1-", &listing, "ANIME-PICTURES.NET_-_1-art.jpg", 1);

        let outcome = coordinator(listing, 3)
            .process(&mut browser, &mut ledger, &resource("1"))
            .unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert!(ledger.contains(&PostId::parse("1").unwrap()));
        assert_eq!(browser.visited().len(), 1);
        assert_eq!(fs::read_to_string(ledger.path()).unwrap(), "1\n");
    }

    #[test]
    fn test_ledger_write_failure_still_counts_as_success() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("downloaded.txt");
        let mut ledger = CompletionLedger::open(&ledger_path).unwrap();
        // A directory where the ledger file should be makes every append fail.
        fs::create_dir(&ledger_path).unwrap();

        let listing = MemoryListing::default();
        let mut browser = FakeBrowser::new().with_download("/4-", &listing, "ANIME-PICTURES.NET_-_4-art.jpg", 1);
        let coordinator = coordinator(listing, 3);

        let outcome = coordinator.process(&mut browser, &mut ledger, &resource("4")).unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(browser.visits_containing("download_image"), 1);

        // Remembered for the rest of the run even though the file write failed.
        let again = coordinator.process(&mut browser, &mut ledger, &resource("4")).unwrap();
        assert_eq!(again, Outcome::Skipped);
        assert!(ledger_path.is_dir());
    }

    #[test]
    fn test_bounded_retries_when_observer_always_times_out() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let mut browser = FakeBrowser::new();

        let outcome = coordinator(MemoryListing::default(), 3)
            .process(&mut browser, &mut ledger, &resource("3"))
            .unwrap();

        assert_eq!(outcome, Outcome::GaveUp);
        assert_eq!(browser.visits_containing("download_image"), 3);
        // Refresh happens before every attempt except the first.
        assert_eq!(browser.visits_containing(REFRESH_URL), 2);
        assert!(!ledger.contains(&PostId::parse("3").unwrap()));
    }

    #[test]
    fn test_refresh_precedes_each_retry() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let listing = MemoryListing::default();
        let mut browser = FakeBrowser::new().with_download("/8-", &listing, "8-art.jpg", 2);

        let outcome = coordinator(listing, 3)
            .process(&mut browser, &mut ledger, &resource("8"))
            .unwrap();

        assert_eq!(outcome, Outcome::Success);
        let visited = browser.visited();
        assert_eq!(visited.len(), 3);
        assert!(visited[0].contains("download_image/8-"));
        assert_eq!(visited[1], REFRESH_URL);
        assert!(visited[2].contains("download_image/8-"));
    }

    #[test]
    fn test_navigation_errors_are_retried_not_raised() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let mut browser = FakeBrowser::new()
            .failing_navigation_to("download_image")
            .failing_navigation_to(REFRESH_URL);

        let outcome = coordinator(MemoryListing::default(), 2)
            .process(&mut browser, &mut ledger, &resource("4"))
            .unwrap();

        assert_eq!(outcome, Outcome::GaveUp);
        assert_eq!(browser.visits_containing("download_image"), 2);
    }

    #[test]
    fn test_single_attempt_policy() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let mut browser = FakeBrowser::new();

        let outcome = coordinator(MemoryListing::default(), 1)
            .process(&mut browser, &mut ledger, &resource("6"))
            .unwrap();

        assert_eq!(outcome, Outcome::GaveUp);
        assert_eq!(browser.visited().len(), 1);
    }

    #[test]
    fn test_interrupt_is_not_an_outcome() {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let mut browser = FakeBrowser::new();
        let coordinator = coordinator(MemoryListing::default(), 3);
        coordinator.cancel.cancel();

        assert_eq!(
            coordinator.process(&mut browser, &mut ledger, &resource("5")),
            Err(Interrupted)
        );
        assert!(browser.visited().is_empty());
    }
}
