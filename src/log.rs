//! File-backed logging for pipeline runs.
//!
//! Messages land in ~/.rigpipe/rigpipe.log, truncated at startup. Three
//! levels:
//! - WARN: Unexpected but recoverable conditions (stale locks, count
//!   mismatches within tolerance, task failures)
//! - INFO: Run, task and lock lifecycle events
//! - DEBUG: Per-task detail (cache hits, skip decisions)
//!
//! Debug output is enabled with the `--debug` flag or `RIGPIPE_DEBUG=1`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Warn = 0,
    Info = 1,
    Debug = 2,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// Initialize logging to ~/.rigpipe/rigpipe.log with explicit debug
/// mode setting.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("RIGPIPE_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let level = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".rigpipe")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("rigpipe.log");
        // Truncate file on startup
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, msg: &str) {
    let current_level = LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed));
    if level > current_level {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

/// Log a message at INFO level (default, always logged).
pub fn log(msg: &str) {
    log_at(LogLevel::Info, msg);
}

/// Log a message at WARN level.
pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

/// Log a message at DEBUG level (only in debug mode).
pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

/// Log macro for INFO level (convenience).
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::log(&format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}
