use std::fmt;

use indicatif::ProgressBar;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::fetch::coordinator::{Outcome, RetryCoordinator};
use crate::fetch::ledger::CompletionLedger;
use crate::fetch::observer::DirectoryListing;
use crate::fetch::queue::QueueEntry;
use crate::fetch::session::BrowserSession;
use crate::fetch::{CancelToken, Interrupted};
use crate::tui::queue_progress_bar;

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunStats {
    pub(crate) success: usize,
    pub(crate) skipped: usize,
    pub(crate) failed: usize,
    /// Queue lines without a recognizable post ID.
    pub(crate) unusable: usize,
    pub(crate) total: usize,
}

impl RunStats {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::GaveUp => self.failed += 1,
        }
    }

    /// Entries not reached, which is only non-zero after an interrupt.
    pub(crate) fn pending(&self) -> usize {
        self.total
            .saturating_sub(self.success + self.skipped + self.failed + self.unusable)
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Success:  {}", self.success)?;
        writeln!(f, "Skipped:  {}", self.skipped)?;
        writeln!(f, "Failed:   {}", self.failed)?;
        writeln!(f, "Unusable: {}", self.unusable)?;
        if self.pending() > 0 {
            writeln!(f, "Pending:  {}", self.pending())?;
        }
        write!(f, "Total:    {}", self.total)
    }
}

/// What a run produced.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunReport {
    pub(crate) run_id: Uuid,
    pub(crate) stats: RunStats,
    pub(crate) interrupted: bool,
}

/// Owns the browser session for a run and shuts it down exactly once.
///
/// Shutdown happens on [`SessionGuard::shutdown`] or, failing that, on drop,
/// which also covers unwinding out of the run.
pub(crate) struct SessionGuard<S: BrowserSession> {
    session: S,
    closed: bool,
}

impl<S: BrowserSession> SessionGuard<S> {
    pub(crate) fn new(session: S) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    pub(crate) fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub(crate) fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            info!("Cleaning up browser session...");
            self.session.quit();
        }
    }
}

impl<S: BrowserSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sequences the whole queue through the coordinator.
pub(crate) struct RunDriver<L> {
    coordinator: RetryCoordinator<L>,
    cancel: CancelToken,
    show_progress: bool,
}

impl<L: DirectoryListing> RunDriver<L> {
    pub(crate) fn new(coordinator: RetryCoordinator<L>, cancel: CancelToken, show_progress: bool) -> Self {
        Self {
            coordinator,
            cancel,
            show_progress,
        }
    }

    /// Runs every queue entry in order against `session`, then shuts it down.
    pub(crate) fn run<S: BrowserSession>(
        &self,
        session: S,
        ledger: &mut CompletionLedger,
        queue: &[QueueEntry],
    ) -> RunReport {
        let mut guard = SessionGuard::new(session);
        let run_id = Uuid::new_v4();
        let mut stats = RunStats::new(queue.len());
        info!("Starting run {} with {} queued URLs", run_id, queue.len());

        let interrupted = match self.drive(guard.session_mut(), ledger, queue, &mut stats) {
            Ok(()) => false,
            Err(Interrupted) => {
                warn!("Run {} interrupted, {} URLs left for the next run", run_id, stats.pending());
                true
            }
        };
        guard.shutdown();

        RunReport {
            run_id,
            stats,
            interrupted,
        }
    }

    fn drive(
        &self,
        session: &mut dyn BrowserSession,
        ledger: &mut CompletionLedger,
        queue: &[QueueEntry],
        stats: &mut RunStats,
    ) -> Result<(), Interrupted> {
        info!("Visiting the listing page to pass the anti-bot check...");
        if self.coordinator.refresher().refresh(session)? {
            let names: Vec<String> = session
                .cookies()
                .into_iter()
                .map(|c| format!("{}@{}", c.name, c.domain))
                .collect();
            debug!("Session cookies: {}", names.join(", "));
        } else {
            error!("Initial session setup failed, downloads will refresh before retrying");
        }

        let progress = if self.show_progress {
            queue_progress_bar(queue.len() as u64)
        } else {
            ProgressBar::hidden()
        };

        let total = queue.len();
        for (index, entry) in queue.iter().enumerate() {
            self.cancel.check()?;
            match entry {
                QueueEntry::Unusable { line, raw } => {
                    warn!(
                        "Skipping line {} ({}/{}): no post ID in \"{}\"",
                        line,
                        index + 1,
                        total,
                        crate::fetch::truncate_error(raw)
                    );
                    stats.unusable += 1;
                }
                QueueEntry::Resource(resource) => {
                    progress.set_message(format!("post {}", resource.id));
                    let outcome = self.coordinator.process(session, ledger, resource)?;
                    info!("[{}/{}] post {}: {}", index + 1, total, resource.id, outcome);
                    stats.record(outcome);
                }
            }
            progress.inc(1);
        }

        progress.finish_with_message("done");
        Ok(())
    }
}
