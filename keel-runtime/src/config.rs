//! Runtime Configuration
//!
//! Knobs for allocation tracking, heap limits, thread-affinity checks and
//! logging. Configuration can be built programmatically or loaded from
//! environment variables, then applied with
//! [`init_with_runtime_config`](crate::init_with_runtime_config).
//!
//! # Environment Variables
//!
//! All environment variables use the `KEEL_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `KEEL_TRACK_ALLOCATIONS` | Record blocks in the allocation registry | true |
//! | `KEEL_CAPTURE_CALLERS` | Store allocation sites in registry tags | true |
//! | `KEEL_MAX_HEAP_SIZE` | Heap limit in bytes (0 = unlimited) | 0 |
//! | `KEEL_CHECK_THREAD_AFFINITY` | Check owner thread on `RcCell` operations | true |
//! | `KEEL_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//! | `KEEL_LOG_FORMAT` | Log output format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .max_heap_size(64 * 1024 * 1024)
//!     .capture_callers(false)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

/// Smallest non-zero heap limit accepted by validation.
pub const MIN_HEAP_LIMIT: usize = 4096;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors (default).
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Allocation registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Record blocks in the registry.
    /// Default: true.
    pub track_allocations: bool,

    /// Store the allocating call site in each entry's tag.
    /// Default: true.
    pub capture_callers: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            track_allocations: true,
            capture_callers: true,
        }
    }
}

/// Memory configuration.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Maximum bytes held by live blocks.
    /// 0 means unlimited (default).
    pub max_heap_size: usize,
}

/// Ownership checking configuration.
#[derive(Debug, Clone)]
pub struct OwnershipConfig {
    /// Compare the current thread with the owner on every `RcCell`/`WeakRc`
    /// operation.
    /// Default: true.
    pub check_thread_affinity: bool,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            check_thread_affinity: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Minimum level emitted.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for defaults, `RuntimeConfig::builder()`
/// for programmatic configuration, or `RuntimeConfig::from_env()` to load
/// from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Registry configuration.
    pub registry: RegistryConfig,

    /// Memory configuration.
    pub memory: MemoryConfig,

    /// Ownership checks.
    pub ownership: OwnershipConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("KEEL_TRACK_ALLOCATIONS") {
            config.registry.track_allocations = val;
        }

        if let Some(val) = parse_env_bool("KEEL_CAPTURE_CALLERS") {
            config.registry.capture_callers = val;
        }

        if let Some(val) = parse_env_usize("KEEL_MAX_HEAP_SIZE") {
            config.memory.max_heap_size = val;
        }

        if let Some(val) = parse_env_bool("KEEL_CHECK_THREAD_AFFINITY") {
            config.ownership.check_thread_affinity = val;
        }

        if let Ok(val) = env::var("KEEL_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("KEEL_LOG_FORMAT") {
            if let Some(format) = LogFormat::from_str(&val) {
                config.log.format = format;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limit = self.memory.max_heap_size;
        if limit != 0 && limit < MIN_HEAP_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_heap_size".into(),
                message: format!("must be 0 (unlimited) or at least {MIN_HEAP_LIMIT} bytes"),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable registry tracking.
    pub fn track_allocations(mut self, enabled: bool) -> Self {
        self.config.registry.track_allocations = enabled;
        self
    }

    /// Enable or disable allocation-site capture.
    pub fn capture_callers(mut self, enabled: bool) -> Self {
        self.config.registry.capture_callers = enabled;
        self
    }

    /// Set the heap limit in bytes (0 = unlimited).
    pub fn max_heap_size(mut self, size: usize) -> Self {
        self.config.memory.max_heap_size = size;
        self
    }

    /// Enable or disable thread-affinity checks.
    pub fn check_thread_affinity(mut self, enabled: bool) -> Self {
        self.config.ownership.check_thread_affinity = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}
