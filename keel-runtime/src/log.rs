//! Logging Infrastructure
//!
//! Handle lifecycle events are emitted through [`tracing`]: registration and
//! release at `trace`, value teardown and block free at `debug`, cross-thread
//! use at `warn`, double frees at `error`. Nothing is printed until a
//! subscriber is installed, either by the host application or by [`init`].
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_runtime::config::{LogConfig, LogFormat, LogLevel};
//!
//! keel_runtime::log::init(&LogConfig {
//!     level: LogLevel::Debug,
//!     format: LogFormat::Json,
//! });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat, LogLevel};

/// Whether [`init`] has already installed a subscriber.
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Build the filter for `config`. `RUST_LOG` directives, when present,
/// refine the configured default level.
fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .from_env_lossy()
}

/// Install a global `fmt` subscriber for `config`.
///
/// Returns `true` if this call installed the subscriber. Later calls, or a
/// subscriber already installed by the host, leave the existing one in place
/// and return `false`.
pub fn init(config: &LogConfig) -> bool {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return false;
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .with_thread_ids(true);

    let result = match config.format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(LevelFilter::from(LogLevel::Off), LevelFilter::OFF);
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default();
        let _ = init(&config);
        // The second call never replaces the installed subscriber.
        assert!(!init(&config));
        tracing::warn!(target: "keel_runtime::log", "logging initialized");
    }
}
