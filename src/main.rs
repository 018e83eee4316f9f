#[macro_use]
extern crate log;

use std::env::consts::{ARCH, FAMILY, OS};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Error};
use clap::Parser;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use log::LevelFilter;

use crate::config::{AppConfig, LoggingConfig};
use crate::fetch::CancelToken;
use crate::program::{Cli, Program};

mod config;
mod fetch;
mod program;
mod tui;

/// Log target of everything this crate emits.
const LOG_TARGET: &str = "post_downloader";

/// A buffered append-mode log file that flushes every few lines.
struct BufferedFileWriter {
    inner: Arc<Mutex<BufWriter<std::fs::File>>>,
    line_count: Arc<Mutex<usize>>,
}

impl BufferedFileWriter {
    fn new(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BufWriter::with_capacity(64 * 1024, file))),
            line_count: Arc::new(Mutex::new(0)),
        })
    }
}

impl Write for BufferedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "Failed to acquire lock"))?;

        let size = writer.write(buf)?;

        // Flush every 20 lines; a crash loses at most that much.
        if let Ok(mut count) = self.line_count.lock() {
            let lines = buf.iter().filter(|&&b| b == b'\n').count();
            if lines > 0 {
                let before = *count / 20;
                *count += lines;
                if *count / 20 != before {
                    writer.flush()?;
                }
            }
        }

        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut writer = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "Failed to acquire lock"))?;
        writer.flush()
    }
}

impl Drop for BufferedFileWriter {
    fn drop(&mut self) {
        if let Ok(mut writer) = self.inner.lock() {
            let _ = writer.flush();
        }
    }
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let (mut config, config_source) =
        AppConfig::load_or_create(&cli.config).with_context(|| format!("Unable to load {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);

    initialize_logger(&config.logging);
    log_system_information();

    let cancel = CancelToken::new();
    spawn_interrupt_listener(cancel.clone());

    let program = Program::new(cli, config, config_source, cancel);
    program.run()
}

/// Initializes the terminal logger and, if enabled, the file logger.
///
/// Both only record this crate's own log target. Logger failures never stop
/// the program; it falls back to terminal-only output.
fn initialize_logger(logging: &LoggingConfig) {
    let mut config = ConfigBuilder::new();
    config.add_filter_allow_str(LOG_TARGET);
    let config = config.build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        logging.level_filter(),
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    if logging.log_to_file {
        match BufferedFileWriter::new(&logging.log_file) {
            Ok(writer) => loggers.push(WriteLogger::new(LevelFilter::max(), config, writer)),
            Err(e) => eprintln!(
                "Failed to open log file {}: {}. Logging will only output to terminal.",
                logging.log_file, e
            ),
        }
    }

    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("Failed to initialize combined logger: {}. Falling back to terminal-only logging.", e);
        let _ = TermLogger::init(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        );
    }
}

/// Trips `cancel` on the first Ctrl-C.
///
/// The listener gets its own small runtime on a background thread, so the
/// rest of the program stays synchronous.
fn spawn_interrupt_listener(cancel: CancelToken) {
    let spawned = thread::Builder::new()
        .name("interrupt-listener".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!("Unable to listen for Ctrl-C: {}", err);
                    return;
                }
            };
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Interrupt received, stopping once the current request or wait ends...");
                        cancel.cancel();
                    }
                    Err(err) => warn!("Unable to listen for Ctrl-C: {}", err),
                }
            });
        });

    if let Err(err) = spawned {
        warn!("Unable to start the interrupt listener: {}", err);
    }
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
