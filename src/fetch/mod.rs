//! Download-completion coordination for browser-mediated post downloads.
//!
//! The pieces here are layered leaf-first:
//! 1. [`ledger`] keeps the durable set of completed post IDs
//! 2. [`observer`] watches the download directory for a finished file
//! 3. [`session`] defines the browser capability and keeps its cookies fresh
//! 4. [`coordinator`] runs the per-post check/attempt/retry state machine
//! 5. [`driver`] sequences the queue and owns the session for the run

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) mod coordinator;
pub(crate) mod driver;
pub(crate) mod http_session;
pub(crate) mod ledger;
pub(crate) mod naming;
pub(crate) mod observer;
pub(crate) mod queue;
pub(crate) mod session;

#[cfg(test)]
pub(crate) mod testing;

/// Longest slice of a raw error message that ends up in a log line.
pub(crate) const MAX_ERROR_TEXT: usize = 240;

/// Longest single sleep while waiting, so an interrupt is noticed quickly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Numeric identifier of a post, kept as the digits it was written with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PostId(String);

impl PostId {
    /// Wraps `raw` if it is a non-empty run of ASCII digits.
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A downloadable post: its ID and the URL that triggers the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResourceRef {
    pub(crate) id: PostId,
    pub(crate) url: String,
}

/// Marker returned by waits that were cut short by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted by operator")
    }
}

/// Shared flag that turns every timed wait into an interruptible one.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails fast if the token has already been tripped.
    pub(crate) fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() { Err(Interrupted) } else { Ok(()) }
    }

    /// Blocks for `duration`, returning early with [`Interrupted`] once cancelled.
    ///
    /// A duration too long to represent as a deadline waits until cancelled.
    pub(crate) fn wait(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now().checked_add(duration);
        loop {
            self.check()?;
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            thread::sleep(slice);
        }
    }
}

/// Shortens raw error text to [`MAX_ERROR_TEXT`] characters for logging.
pub(crate) fn truncate_error(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(MAX_ERROR_TEXT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_id_parse() {
        assert_eq!(PostId::parse(" 888175 ").unwrap().as_str(), "888175");
        assert!(PostId::parse("").is_none());
        assert!(PostId::parse("12a").is_none());
        assert!(PostId::parse("-12").is_none());
    }

    #[test]
    fn test_truncate_error() {
        let short = "connection reset";
        assert_eq!(truncate_error(short), short);

        let long = "x".repeat(MAX_ERROR_TEXT + 50);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.len(), MAX_ERROR_TEXT + 3);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_wait_completes_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert_eq!(token.wait(Duration::from_millis(20)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_unbounded_wait_is_still_interruptible() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        assert_eq!(token.wait(Duration::MAX), Err(Interrupted));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_interrupted_from_another_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let start = Instant::now();
        assert_eq!(token.wait(Duration::from_secs(10)), Err(Interrupted));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
