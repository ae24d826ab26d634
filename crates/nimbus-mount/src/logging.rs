//! Leveled diagnostics.
//!
//! The item cache only emits `tracing` events; this module decides where
//! they go. [`subscriber`] builds a formatter for an explicit level, which
//! callers may install for a scope with `tracing::subscriber::with_default`
//! or process-wide with [`init`]. Each line carries the level, the emitting
//! thread and the source location.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Diagnostic verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Trace,
}

impl LogLevel {
    /// Parses a level name case-insensitively.
    ///
    /// Unknown names log an error and fall back to [`LogLevel::Trace`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "fatal" => LogLevel::Fatal,
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "trace" | "debug" => LogLevel::Trace,
            other => {
                tracing::error!(level = other, "Unrecognised log level, defaulting to trace");
                LogLevel::Trace
            }
        }
    }

    /// The `tracing` filter for this level. Fatal messages are emitted at
    /// error level, so both share a filter.
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Fatal | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(LogLevel::parse(s))
    }
}

impl From<String> for LogLevel {
    fn from(s: String) -> Self {
        LogLevel::parse(&s)
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

/// Builds a formatting subscriber for `level`.
pub fn subscriber(level: LogLevel) -> impl tracing::Subscriber + Send + Sync {
    build(EnvFilter::default().add_directive(level.filter().into()))
}

fn build(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .finish()
}

/// Installs the process-wide subscriber.
///
/// `RUST_LOG`, when set, overrides `level`.
pub fn init(level: LogLevel) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.filter().into()));
    build(filter).try_init()
}

/// Logs an unrecoverable error and exits with status 1.
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    tracing::error!(fatal = true, "{args}");
    std::process::exit(1)
}

/// Formats a message, logs it as fatal and terminates the process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::logging::fatal(format_args!($($arg)*))
    };
}
