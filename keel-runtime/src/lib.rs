//! # Keel Runtime Library
//!
//! Ownership-checked smart pointers with a process-wide allocation registry.
//!
//! - **Unique ownership**: [`UniqueBox`] owns exactly one value; moving out
//!   leaves an empty source that reports [`OwnershipError::MovedHandle`].
//! - **Shared ownership**: [`RcCell`]/[`WeakRc`] for one thread and
//!   [`ArcCell`]/[`WeakArc`] across threads, with weak references that
//!   upgrade only while the value is alive.
//! - **Exclusion**: [`MutexGuardedValue`] hands out [`ScopedGuard`]s that
//!   unlock on every exit path.
//! - **Interop**: [`RawPointer`] exposes an unchecked address.
//! - **Diagnostics**: every block is recorded in the [`registry()`] so tests
//!   can assert that nothing leaked.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         KEEL RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  UniqueBox   │  │ RcCell/WeakRc│  │ArcCell/WeakArc│          │
//! │  │ (unique.rs)  │  │   (rc.rs)    │  │   (arc.rs)   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │ Heap budget  │  │   Registry   │  │   Mutex      │           │
//! │  │  (heap.rs)   │  │(registry.rs) │  │  (sync.rs)   │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use keel_runtime::{ArcCell, MutexGuardedValue, RcCell};
//!
//! let shared = RcCell::new(5).unwrap();
//! let weak = RcCell::downgrade(&shared).unwrap();
//! assert_eq!(*weak.upgrade().unwrap(), 5);
//! drop(shared);
//! assert!(weak.upgrade().is_none());
//!
//! let counter = ArcCell::new(MutexGuardedValue::new(0)).unwrap();
//! *counter.lock() += 1;
//! assert_eq!(*counter.lock(), 1);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arc;
pub mod config;
pub mod error;
pub mod heap;
pub mod log;
pub mod raw;
pub mod rc;
pub mod registry;
pub mod sync;
pub mod unique;

// Re-exports
pub use arc::{ArcCell, WeakArc};
pub use config::{ConfigError, LogFormat, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use error::{OwnershipError, Result};
pub use heap::{heap_used, max_heap_size, set_max_heap_size};
pub use raw::{AsRawPointer, RawPointer};
pub use rc::{set_thread_affinity_checks, thread_affinity_checks, RcCell, WeakRc};
pub use registry::{
    registry, AllocationEntry, AllocationRegistry, AllocationTag, BlockId, BlockKind, Release,
};
pub use sync::{MutexGuardedValue, ScopedGuard};
pub use unique::{UniqueBox, UniqueHandle};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the runtime with default configuration.
pub fn init() -> std::result::Result<(), ConfigError> {
    init_with_runtime_config(RuntimeConfig::default())
}

/// Initialize the runtime with full runtime configuration.
///
/// Applies registry tracking, caller capture, the heap limit, thread-affinity
/// checks and logging. The first successfully applied configuration is kept
/// for [`runtime_config`]; later calls still apply their knobs.
///
/// # Example
///
/// ```rust,ignore
/// use keel_runtime::{init_with_runtime_config, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .max_heap_size(64 * 1024 * 1024)
///     .build()?;
///
/// init_with_runtime_config(config)?;
/// ```
pub fn init_with_runtime_config(config: RuntimeConfig) -> std::result::Result<(), ConfigError> {
    config.validate()?;

    let registry = registry();
    registry.set_tracking(config.registry.track_allocations);
    registry.set_capture_callers(config.registry.capture_callers);

    heap::set_max_heap_size(config.memory.max_heap_size);
    rc::set_thread_affinity_checks(config.ownership.check_thread_affinity);

    log::init(&config.log);

    tracing::debug!(
        track_allocations = config.registry.track_allocations,
        capture_callers = config.registry.capture_callers,
        max_heap_size = config.memory.max_heap_size,
        check_thread_affinity = config.ownership.check_thread_affinity,
        "runtime configured"
    );

    // Store the runtime config globally for other components to access
    let _ = RUNTIME_CONFIG.set(config);
    Ok(())
}

/// Initialize the runtime from environment variables.
///
/// Reads configuration from `KEEL_*` environment variables.
/// See `RuntimeConfig::from_env()` for the full list of supported variables.
pub fn init_from_env() -> std::result::Result<(), ConfigError> {
    init_with_runtime_config(RuntimeConfig::from_env())
}

/// Global runtime configuration.
static RUNTIME_CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Get the current runtime configuration.
///
/// Returns `None` if the runtime was not initialized with `init`,
/// `init_with_runtime_config` or `init_from_env`.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        // Validation fails before any global knob is touched.
        let config = RuntimeConfig::builder().max_heap_size(1).build_unchecked();
        assert!(init_with_runtime_config(config).is_err());
    }
}
