//! In-memory stand-ins for the browser and the download directory.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::fetch::observer::{DirectoryListing, WaitTiming};
use crate::fetch::session::{BrowserSession, Cookie, SessionError, SessionResult};

/// Near-zero waits with a generous timeout.
pub(crate) fn fast_timing() -> WaitTiming {
    WaitTiming {
        timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(1),
        initial_grace: Duration::from_millis(1),
        settle: Duration::from_millis(1),
    }
}

/// A directory whose entries live in memory and can be shared with a [`FakeBrowser`].
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryListing {
    entries: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryListing {
    pub(crate) fn with_entries<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let listing = Self::default();
        for name in names {
            listing.insert(name);
        }
        listing
    }

    pub(crate) fn insert(&self, name: &str) {
        self.entries.lock().insert(name.to_string());
    }
}

impl DirectoryListing for MemoryListing {
    fn list_entries(&self, _dir: &Path) -> io::Result<Vec<String>> {
        Ok(self.entries.lock().iter().cloned().collect())
    }
}

/// Replays one snapshot per call, repeating the last one once exhausted.
#[derive(Debug, Default)]
pub(crate) struct ScriptedListing {
    failures: usize,
    snapshots: Vec<Vec<String>>,
    calls: Mutex<usize>,
}

impl ScriptedListing {
    pub(crate) fn new(snapshots: Vec<Vec<&str>>) -> Self {
        Self::failing_then(0, snapshots)
    }

    /// Fails the first `failures` calls before replaying `snapshots`.
    pub(crate) fn failing_then(failures: usize, snapshots: Vec<Vec<&str>>) -> Self {
        Self {
            failures,
            snapshots: snapshots
                .into_iter()
                .map(|snapshot| snapshot.into_iter().map(String::from).collect())
                .collect(),
            calls: Mutex::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl DirectoryListing for ScriptedListing {
    fn list_entries(&self, _dir: &Path) -> io::Result<Vec<String>> {
        let mut calls = self.calls.lock();
        let index = *calls;
        *calls += 1;

        if index < self.failures {
            return Err(io::Error::new(io::ErrorKind::Other, "listing unavailable"));
        }
        let index = index - self.failures;
        Ok(self
            .snapshots
            .get(index)
            .or_else(|| self.snapshots.last())
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug)]
struct DownloadRule {
    url_part: String,
    file_name: String,
    appear_on_visit: usize,
    visits: usize,
    listing: MemoryListing,
}

#[derive(Debug, Default)]
struct FakeState {
    visited: Vec<String>,
    page_content: String,
    failing: Vec<String>,
    panicking: Vec<String>,
    statuses: Vec<(String, u16)>,
    downloads: Vec<DownloadRule>,
    quit_calls: usize,
}

/// Scriptable browser. Clones share state, so a test can keep a handle
/// after giving the browser away.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBrowser {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBrowser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_page_content(self, content: &str) -> Self {
        self.state.lock().page_content = content.to_string();
        self
    }

    /// Navigations to URLs containing `url_part` fail with a transport error.
    pub(crate) fn failing_navigation_to(self, url_part: &str) -> Self {
        self.state.lock().failing.push(url_part.to_string());
        self
    }

    /// Navigations to URLs containing `url_part` load the page but report `status`.
    pub(crate) fn status_on_navigation_to(self, url_part: &str, status: u16) -> Self {
        self.state.lock().statuses.push((url_part.to_string(), status));
        self
    }

    /// Navigations to URLs containing `url_part` panic.
    pub(crate) fn panicking_navigation_to(self, url_part: &str) -> Self {
        self.state.lock().panicking.push(url_part.to_string());
        self
    }

    /// The `appear_on_visit`-th visit to a URL containing `url_part` drops
    /// `file_name` into `listing`.
    pub(crate) fn with_download(
        self,
        url_part: &str,
        listing: &MemoryListing,
        file_name: &str,
        appear_on_visit: usize,
    ) -> Self {
        self.state.lock().downloads.push(DownloadRule {
            url_part: url_part.to_string(),
            file_name: file_name.to_string(),
            appear_on_visit,
            visits: 0,
            listing: listing.clone(),
        });
        self
    }

    pub(crate) fn visited(&self) -> Vec<String> {
        self.state.lock().visited.clone()
    }

    pub(crate) fn visits_containing(&self, url_part: &str) -> usize {
        self.state
            .lock()
            .visited
            .iter()
            .filter(|url| url.contains(url_part))
            .count()
    }

    pub(crate) fn quit_calls(&self) -> usize {
        self.state.lock().quit_calls
    }
}

impl BrowserSession for FakeBrowser {
    fn navigate(&mut self, url: &str) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.visited.push(url.to_string());

        if state.panicking.iter().any(|part| url.contains(part.as_str())) {
            drop(state);
            panic!("browser crashed while loading {}", url);
        }
        if state.failing.iter().any(|part| url.contains(part.as_str())) {
            return Err(SessionError::Transport(format!("connection reset while loading {}", url)));
        }

        if let Some((_, status)) = state.statuses.iter().find(|(part, _)| url.contains(part.as_str())) {
            return Err(SessionError::Status {
                status: *status,
                url: url.to_string(),
            });
        }

        for rule in state.downloads.iter_mut().filter(|rule| url.contains(rule.url_part.as_str())) {
            rule.visits += 1;
            if rule.visits == rule.appear_on_visit {
                rule.listing.insert(&rule.file_name);
            }
        }
        Ok(())
    }

    fn current_content(&self) -> SessionResult<String> {
        Ok(self.state.lock().page_content.clone())
    }

    fn cookies(&self) -> Vec<Cookie> {
        vec![Cookie {
            name: "cf_clearance".to_string(),
            value: "token".to_string(),
            domain: "example.net".to_string(),
        }]
    }

    fn quit(&mut self) {
        self.state.lock().quit_calls += 1;
    }
}
