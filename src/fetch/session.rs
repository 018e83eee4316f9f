use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::SessionConfig;
use crate::fetch::{CancelToken, Interrupted, truncate_error};

/// Error types raised by a browser session
#[derive(Error, Debug)]
pub(crate) enum SessionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Failed to save download: {0}")]
    Save(String),

    #[error("Session has been shut down")]
    Closed,
}

/// Result type for browser session operations
pub(crate) type SessionResult<T> = Result<T, SessionError>;

/// A cookie held by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cookie {
    pub(crate) name: String,
    pub(crate) value: String,
    pub(crate) domain: String,
}

/// The browser capability the downloader drives.
///
/// Navigating to a download URL makes the session save the file into its
/// download directory on its own schedule; nothing here reports when that
/// save finishes.
pub(crate) trait BrowserSession {
    fn navigate(&mut self, url: &str) -> SessionResult<()>;

    /// Body of the page the session is currently on.
    fn current_content(&self) -> SessionResult<String>;

    fn cookies(&self) -> Vec<Cookie>;

    /// Releases the session. Calling it more than once is harmless.
    fn quit(&mut self);
}

/// Re-establishes a usable session by visiting a page known to load.
#[derive(Debug, Clone)]
pub(crate) struct SessionRefresher {
    known_good_url: String,
    challenge_markers: Vec<String>,
    challenge_wait: Duration,
    challenge_wait_multiplier: u32,
    cancel: CancelToken,
}

impl SessionRefresher {
    pub(crate) fn new(config: &SessionConfig, cancel: CancelToken) -> Self {
        Self {
            known_good_url: config.refresh_url.clone(),
            challenge_markers: config.challenge_markers.clone(),
            challenge_wait: config.challenge_wait(),
            challenge_wait_multiplier: config.challenge_wait_multiplier,
            cancel,
        }
    }

    /// True if `content` still shows an anti-bot challenge.
    pub(crate) fn is_challenge_page(&self, content: &str) -> bool {
        self.challenge_markers
            .iter()
            .any(|marker| !marker.is_empty() && content.contains(marker.as_str()))
    }

    /// Navigates to the known-good page and waits out any challenge.
    ///
    /// Returns `Ok(false)` only if the page could not be loaded at all; the
    /// cause is logged. An error status still loads a page (challenge pages
    /// are usually served as 403 or 503), so it is inspected like any other.
    /// Nothing else ends a refresh early except an operator interrupt.
    pub(crate) fn refresh(&self, session: &mut dyn BrowserSession) -> Result<bool, Interrupted> {
        info!("Refreshing session cookies via {}", self.known_good_url);
        match session.navigate(&self.known_good_url) {
            Ok(()) => {}
            Err(SessionError::Status { status, .. }) => {
                debug!("Refresh page answered with status {}, checking for a challenge", status);
            }
            Err(err) => {
                warn!("Session refresh failed: {}", truncate_error(&err.to_string()));
                return Ok(false);
            }
        }
        self.cancel.wait(self.challenge_wait)?;

        match session.current_content() {
            Ok(content) if self.is_challenge_page(&content) => {
                info!("Challenge page detected, waiting for it to clear...");
                self.cancel
                    .wait(self.challenge_wait.saturating_mul(self.challenge_wait_multiplier))?;
            }
            Ok(_) => {}
            Err(err) => debug!(
                "Could not inspect page after refresh: {}",
                truncate_error(&err.to_string())
            ),
        }

        debug!("Session holds {} cookies after refresh", session.cookies().len());
        Ok(true)
    }
}
