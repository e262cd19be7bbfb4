//! Log output for the counting loop
//!
//! Everything goes to stderr so that command output on stdout stays
//! parseable. The supervisor task runs inside a `supervisor` span carrying
//! the channel, each state-machine step inside a `step` span carrying the
//! phase, and each send inside a `send` span carrying the identity and value.
//! Text output prints those span fields as a prefix; JSON output attaches
//! them to every line.
//!
//! `RUST_LOG` overrides the filter entirely. Otherwise only this workspace's
//! crates log, at `info` (or `debug` with `verbose`), so HTTP client noise
//! stays out of the way.
//!
//! # Examples
//!
//! ```no_run
//! use libautocount::logging::{LogFormat, LogSettings};
//!
//! LogSettings::new(LogFormat::Json).verbose(true).init();
//! ```

use std::str::FromStr;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when neither `RUST_LOG` nor `AUTOCOUNT_LOG_LEVEL` is set
pub const DEFAULT_DIRECTIVES: &str = "libautocount=info,autocount=info";

const VERBOSE_DIRECTIVES: &str = "libautocount=debug,autocount=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One line per event with span fields as a prefix
    Text,
    /// One JSON object per event, span fields included
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("unknown log format '{}' (expected text or json)", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    format: LogFormat,
    level: Option<String>,
    verbose: bool,
}

impl LogSettings {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            level: None,
            verbose: false,
        }
    }

    /// Level applied to this workspace's crates, e.g. `warn` or `trace`
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    /// Log at debug level and report how long each send span took
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Read `AUTOCOUNT_LOG_FORMAT` and `AUTOCOUNT_LOG_LEVEL`
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var("AUTOCOUNT_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let mut settings = Self::new(format).verbose(verbose);
        settings.level = std::env::var("AUTOCOUNT_LOG_LEVEL").ok();
        settings
    }

    /// Filter directives these settings stand for, ignoring `RUST_LOG`
    pub fn directives(&self) -> String {
        match &self.level {
            Some(level) if !self.verbose => format!("libautocount={0},autocount={0}", level.trim()),
            _ if self.verbose => VERBOSE_DIRECTIVES.to_string(),
            _ => DEFAULT_DIRECTIVES.to_string(),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.directives()))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
    }

    /// Install the global subscriber
    ///
    /// A second call in the same process is ignored.
    pub fn init(&self) {
        let span_events = if self.verbose {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(self.filter())
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_current_span(true)
                        .with_span_list(true)
                        .flatten_event(true)
                        .with_span_events(span_events),
                )
                .try_init(),
            LogFormat::Text => tracing_subscriber::registry()
                .with(self.filter())
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false)
                        .with_span_events(span_events),
                )
                .try_init(),
        };
        if result.is_err() {
            tracing::debug!("logging already initialized");
        }
    }
}

/// Initialize logging from the environment
pub fn init_default(verbose: bool) {
    LogSettings::from_env(verbose).init();
}
