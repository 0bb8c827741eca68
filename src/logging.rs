//! Logging setup.
//!
//! A small `log` backend writing timestamped lines to stderr and,
//! optionally, an append-only log file so connection problems in the field
//! can be diagnosed after the fact. Also installs the process-wide panic
//! hook that captures context before the default handler takes over.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

static LOGGER: OnceLock<BridgeLogger> = OnceLock::new();

pub struct BridgeLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl BridgeLogger {
    /// Installs the logger. `log_file` failures are reported on stderr but
    /// never fatal — losing file logging must not take the bridge down.
    pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<(), SetLoggerError> {
        let file = log_file.and_then(|path| {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(e) => {
                    eprintln!("Failed to open log file {path:?}: {e}");
                    None
                }
            }
        });

        let logger = LOGGER.get_or_init(|| BridgeLogger { level, file });
        log::set_logger(logger).map(|()| log::set_max_level(level))
    }
}

impl log::Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "[{}] [{}] {}: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        eprintln!("{line}");

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// Logs uncaught panics with thread and backtrace context, then delegates
/// to the previous hook so the process still dies the normal way.
pub fn install_panic_hook() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "???".to_string());

        log::error!(
            "Uncaught panic in thread {}",
            thread.name().unwrap_or("unnamed")
        );
        log::error!("Message: {payload}");
        if let Some(location) = info.location() {
            log::error!("Location: {location}");
        }
        log::error!(
            "Stack trace: {}",
            std::backtrace::Backtrace::force_capture()
        );

        default_hook(info);
    }));
}
