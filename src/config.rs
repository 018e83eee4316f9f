use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file looked up in the working directory.
pub(crate) const CONFIG_NAME: &str = "config.toml";

/// Ledger file name used when `paths.ledger_file` is not set.
pub(crate) const LEDGER_NAME: &str = "downloaded.txt";

/// Upper bound for any single configured wait.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound for `session.challenge_wait_multiplier`.
const MAX_CHALLENGE_MULTIPLIER: u32 = 100;

/// Error types for config loading
#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for config operations
pub(crate) type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct PathsConfig {
    pub(crate) download_directory: String,
    pub(crate) queue_file: String,
    /// Defaults to `downloaded.txt` inside the download directory.
    pub(crate) ledger_file: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            download_directory: "./downloads".to_string(),
            queue_file: "download_urls.txt".to_string(),
            ledger_file: None,
        }
    }
}

impl PathsConfig {
    pub(crate) fn ledger_path(&self) -> PathBuf {
        match &self.ledger_file {
            Some(file) => PathBuf::from(file),
            None => Path::new(&self.download_directory).join(LEDGER_NAME),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct SessionConfig {
    /// Listing page visited to obtain fresh anti-bot cookies.
    pub(crate) refresh_url: String,
    pub(crate) challenge_markers: Vec<String>,
    pub(crate) challenge_wait_ms: u64,
    /// Extra wait, as a multiple of `challenge_wait_ms`, when a challenge is detected.
    pub(crate) challenge_wait_multiplier: u32,
    pub(crate) user_agent: String,
    /// Whole-request limit, body included.
    pub(crate) request_timeout_secs: u64,
    /// Limit for establishing a connection, also bounds how long an
    /// interrupt can wait on an unreachable host.
    pub(crate) connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_url: "https://anime-pictures.net/posts?page=4&search_tag=girl&order_by=rating&ldate=4&lang=zh-cn"
                .to_string(),
            challenge_markers: vec!["Just a moment".to_string(), "Checking your browser".to_string()],
            challenge_wait_ms: 5_000,
            challenge_wait_multiplier: 2,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            request_timeout_secs: 120,
            connect_timeout_secs: 15,
        }
    }
}

impl SessionConfig {
    pub(crate) fn challenge_wait(&self) -> Duration {
        Duration::from_millis(self.challenge_wait_ms)
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct ObserverConfig {
    pub(crate) timeout_secs: u64,
    pub(crate) poll_interval_ms: u64,
    pub(crate) initial_grace_ms: u64,
    pub(crate) settle_ms: u64,
    /// File suffixes that mark a download still being written.
    pub(crate) in_progress_suffixes: Vec<String>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            poll_interval_ms: 1_000,
            initial_grace_ms: 2_000,
            settle_ms: 1_000,
            in_progress_suffixes: vec![".crdownload".to_string(), ".tmp".to_string(), ".partial".to_string()],
        }
    }
}

impl ObserverConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn initial_grace(&self) -> Duration {
        Duration::from_millis(self.initial_grace_ms)
    }

    pub(crate) fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Grace period actually used: never shorter than one poll interval.
    pub(crate) fn effective_grace(&self) -> Duration {
        self.initial_grace().max(self.poll_interval())
    }

    /// Suffix the HTTP session writes partial files under.
    pub(crate) fn temp_suffix(&self) -> String {
        self.in_progress_suffixes
            .first()
            .cloned()
            .unwrap_or_else(|| ".crdownload".to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct RetryConfig {
    /// Total attempts per post, including the first one.
    pub(crate) max_retries: u32,
    pub(crate) backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub(crate) fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct LoggingConfig {
    /// Terminal level; the log file always records everything.
    pub(crate) log_level: String,
    pub(crate) log_to_file: bool,
    pub(crate) log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: true,
            log_file: "post_downloader.log".to_string(),
        }
    }
}

impl LoggingConfig {
    pub(crate) fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or(LevelFilter::Info)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) paths: PathsConfig,
    pub(crate) session: SessionConfig,
    pub(crate) observer: ObserverConfig,
    pub(crate) retry: RetryConfig,
    pub(crate) logging: LoggingConfig,
}

/// How [`AppConfig::load_or_create`] came up with its result.
///
/// Loading happens before the logger exists, so the caller reports this.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConfigSource {
    Loaded,
    /// No file existed; defaults were written.
    Created,
    /// The file did not parse; it was moved to `backup` and defaults were written.
    Recovered { backup: PathBuf, reason: String },
}

impl AppConfig {
    /// Reads `path`, writing a default file when it is missing or unparsable.
    pub(crate) fn load_or_create(path: &Path) -> ConfigResult<(Self, ConfigSource)> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok((config, ConfigSource::Created));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match toml::from_str::<Self>(&content) {
            Ok(config) => Ok((config, ConfigSource::Loaded)),
            Err(err) => {
                let backup = path.with_extension("toml.backup");
                fs::rename(path, &backup).map_err(|source| ConfigError::Io {
                    path: backup.clone(),
                    source,
                })?;

                let config = Self::default();
                config.save(path)?;
                Ok((
                    config,
                    ConfigSource::Recovered {
                        backup,
                        reason: err.to_string(),
                    },
                ))
            }
        }
    }

    pub(crate) fn save(&self, path: &Path) -> ConfigResult<()> {
        let toml_string = toml::to_string_pretty(self).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(path, toml_string).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rejects settings the run cannot work with.
    pub(crate) fn validate(&self) -> ConfigResult<()> {
        if self.retry.max_retries < 1 {
            return Err(ConfigError::Invalid("retry.max_retries must be at least 1".to_string()));
        }
        if self.observer.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("observer.poll_interval_ms must be greater than 0".to_string()));
        }
        if self.observer.timeout_secs == 0 {
            return Err(ConfigError::Invalid("observer.timeout_secs must be greater than 0".to_string()));
        }
        if self.observer.timeout() <= self.observer.effective_grace() {
            return Err(ConfigError::Invalid(format!(
                "observer.timeout_secs ({}s) must be longer than the initial grace period ({}ms)",
                self.observer.timeout_secs,
                self.observer.effective_grace().as_millis()
            )));
        }
        if self.session.connect_timeout_secs == 0
            || self.session.connect_timeout_secs > self.session.request_timeout_secs
        {
            return Err(ConfigError::Invalid(
                "session.connect_timeout_secs must be between 1 and session.request_timeout_secs".to_string(),
            ));
        }
        if self.session.challenge_wait_multiplier > MAX_CHALLENGE_MULTIPLIER {
            return Err(ConfigError::Invalid(format!(
                "session.challenge_wait_multiplier must be at most {}",
                MAX_CHALLENGE_MULTIPLIER
            )));
        }
        let waits = [
            ("session.challenge_wait_ms", self.session.challenge_wait()),
            ("session.request_timeout_secs", self.session.request_timeout()),
            ("observer.timeout_secs", self.observer.timeout()),
            ("observer.poll_interval_ms", self.observer.poll_interval()),
            ("observer.initial_grace_ms", self.observer.initial_grace()),
            ("observer.settle_ms", self.observer.settle()),
            ("retry.backoff_ms", self.retry.backoff()),
        ];
        if let Some((name, _)) = waits.iter().find(|(_, wait)| *wait > MAX_WAIT) {
            return Err(ConfigError::Invalid(format!(
                "{} must not exceed {} hours",
                name,
                MAX_WAIT.as_secs() / 3600
            )));
        }
        if self.observer.in_progress_suffixes.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "observer.in_progress_suffixes must name at least one suffix".to_string(),
            ));
        }
        if LevelFilter::from_str(&self.logging.log_level).is_err() {
            return Err(ConfigError::Invalid(format!(
                "logging.log_level \"{}\" is not a log level",
                self.logging.log_level
            )));
        }
        Ok(())
    }
}
