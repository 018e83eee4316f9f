use std::env::current_dir;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use clap::{Parser, Subcommand};
use console::Term;
use dialoguer::Confirm;
use log::{error, info, trace, warn};

use crate::config::{AppConfig, CONFIG_NAME, ConfigSource};
use crate::fetch::CancelToken;
use crate::fetch::coordinator::{RetryCoordinator, RetryPolicy};
use crate::fetch::driver::RunDriver;
use crate::fetch::http_session::HttpSession;
use crate::fetch::ledger::CompletionLedger;
use crate::fetch::naming::rebuild_ledger;
use crate::fetch::observer::{DownloadObserver, FsListing, WaitTiming};
use crate::fetch::queue::{QueueEntry, read_queue};
use crate::fetch::session::SessionRefresher;

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

#[derive(Parser, Debug)]
#[command(author, version, about = "Downloads queued posts through a browser session, one at a time", long_about = None)]
pub(crate) struct Cli {
    /// Configuration file, created with defaults if missing.
    #[arg(short, long, default_value = CONFIG_NAME, global = true)]
    pub(crate) config: PathBuf,

    /// Queue file with one download URL per line.
    #[arg(short, long, global = true)]
    queue: Option<PathBuf>,

    /// Directory the browser saves downloads into.
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    /// Attempts per post, including the first.
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Seconds to wait for a download to appear.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Download every queued post not yet recorded (the default).
    Run,
    /// Show how much of the queue is already downloaded.
    Status,
    /// Record IDs of images already present on disk.
    RebuildLedger {
        /// Directory to scan, defaults to the download directory.
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

impl Cli {
    /// Applies command line values on top of the file configuration.
    pub(crate) fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(queue) = &self.queue {
            config.paths.queue_file = queue.to_string_lossy().into_owned();
        }
        if let Some(dir) = &self.dir {
            config.paths.download_directory = dir.to_string_lossy().into_owned();
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(timeout) = self.timeout {
            config.observer.timeout_secs = timeout;
        }
    }
}

/// How the queue stands against the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct QueueStatus {
    complete: usize,
    pending: usize,
    unusable: usize,
}

fn queue_status(queue: &[QueueEntry], ledger: &CompletionLedger) -> QueueStatus {
    queue.iter().fold(QueueStatus::default(), |mut status, entry| {
        match entry {
            QueueEntry::Resource(resource) if ledger.contains(&resource.id) => status.complete += 1,
            QueueEntry::Resource(_) => status.pending += 1,
            QueueEntry::Unusable { .. } => status.unusable += 1,
        }
        status
    })
}

/// A program class that handles the flow of the downloader and its steps of execution.
pub(crate) struct Program {
    command: Command,
    config_path: PathBuf,
    config: AppConfig,
    config_source: ConfigSource,
    cancel: CancelToken,
}

impl Program {
    pub(crate) fn new(cli: Cli, config: AppConfig, config_source: ConfigSource, cancel: CancelToken) -> Self {
        Self {
            command: cli.command.clone().unwrap_or(Command::Run),
            config_path: cli.config,
            config,
            config_source,
            cancel,
        }
    }

    /// Runs the selected command.
    pub(crate) fn run(&self) -> Result<(), Error> {
        Term::stdout().set_title("post downloader");
        trace!("Starting post downloader...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        let working_dir = current_dir().context("Unable to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());

        match &self.config_source {
            ConfigSource::Loaded => trace!("Loaded config from {}", self.config_path.display()),
            ConfigSource::Created => {
                info!("Created config file {} with default values.", self.config_path.display());
                if self.confirm_exit_to_edit() {
                    info!("Exiting so you can edit the config file before the first run.");
                    return Ok(());
                }
            }
            ConfigSource::Recovered { backup, reason } => {
                error!("Failed to parse {}: {}", self.config_path.display(), reason);
                warn!(
                    "Old config moved to {}, continuing with default values",
                    backup.display()
                );
            }
        }

        self.config.validate().context("Configuration rejected")?;

        match &self.command {
            Command::Run => self.download_queue(),
            Command::Status => self.print_status(),
            Command::RebuildLedger { root } => self.rebuild(root.as_deref()),
        }
    }

    /// Asks on an interactive terminal whether to stop and edit the fresh config.
    fn confirm_exit_to_edit(&self) -> bool {
        if !Term::stdout().is_term() {
            return false;
        }
        match Confirm::new()
            .with_prompt("Would you like to exit the application to edit the config file before continuing?")
            .default(true)
            .interact()
        {
            Ok(answer) => answer,
            Err(err) => {
                warn!("Failed to get user input: {}", err);
                false
            }
        }
    }

    fn download_queue(&self) -> Result<(), Error> {
        let config = &self.config;
        let download_dir = PathBuf::from(&config.paths.download_directory);
        fs::create_dir_all(&download_dir)
            .with_context(|| format!("Failed to create download directory {}", download_dir.display()))?;

        let queue = read_queue(Path::new(&config.paths.queue_file)).context("Unable to load the download queue")?;
        let mut ledger = CompletionLedger::open(config.paths.ledger_path()).context("Unable to load the ledger")?;
        info!(
            "{} posts already recorded in {}",
            ledger.len(),
            ledger.path().display()
        );

        let session = HttpSession::new(&config.session, download_dir.clone(), config.observer.temp_suffix())
            .context("Unable to start the browser session")?;

        let observer = DownloadObserver::new(
            FsListing,
            config.observer.in_progress_suffixes.clone(),
            self.cancel.clone(),
        );
        let coordinator = RetryCoordinator::new(
            download_dir,
            RetryPolicy::from_config(&config.retry),
            WaitTiming::from_config(&config.observer),
            observer,
            SessionRefresher::new(&config.session, self.cancel.clone()),
            self.cancel.clone(),
        );
        let driver = RunDriver::new(coordinator, self.cancel.clone(), true);

        let report = driver.run(session, &mut ledger, &queue);

        info!("Run {} finished{}", report.run_id, if report.interrupted { " early" } else { "" });
        for line in report.stats.to_string().lines() {
            info!("{}", line);
        }
        Ok(())
    }

    fn print_status(&self) -> Result<(), Error> {
        let queue = read_queue(Path::new(&self.config.paths.queue_file))
            .context("Unable to load the download queue")?;
        let ledger = CompletionLedger::open(self.config.paths.ledger_path()).context("Unable to load the ledger")?;

        let status = queue_status(&queue, &ledger);
        info!("Queue:    {}", queue.len());
        info!("Complete: {}", status.complete);
        info!("Pending:  {}", status.pending);
        info!("Unusable: {}", status.unusable);
        info!("Ledger holds {} IDs in total", ledger.len());
        Ok(())
    }

    fn rebuild(&self, root: Option<&Path>) -> Result<(), Error> {
        let root = root
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.config.paths.download_directory));
        let mut ledger = CompletionLedger::open(self.config.paths.ledger_path()).context("Unable to load the ledger")?;

        let summary = rebuild_ledger(&root, &mut ledger).context("Ledger rebuild failed")?;
        info!(
            "Scanned {} files, found {} post IDs, added {} new IDs to {}",
            summary.files_scanned,
            summary.ids_found,
            summary.ids_added,
            ledger.path().display()
        );
        Ok(())
    }
}
