//! # Mutex-Guarded Values
//!
//! [`MutexGuardedValue`] wraps a value with a mutual-exclusion lock.
//! [`MutexGuardedValue::lock`] blocks until access is granted and returns a
//! [`ScopedGuard`]; the lock is released when the guard goes out of scope,
//! including during unwinding. A panic while holding the guard does not
//! poison the value.
//!
//! ## Hazard: no reentrancy
//!
//! Calling `lock()` again on the same thread while a guard from that thread
//! is still alive **deadlocks**. Nothing detects this. Use
//! [`MutexGuardedValue::try_lock`] when the caller may already hold the lock.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{OwnershipError, Result};

/// A value protected by a mutex.
pub struct MutexGuardedValue<T> {
    /// Unique id for diagnostics.
    id: u64,
    /// Inner lock.
    inner: parking_lot::Mutex<T>,
    /// Whether a guard is currently alive.
    held: AtomicBool,
}

impl<T> MutexGuardedValue<T> {
    /// Wrap `value` in an unlocked mutex.
    pub fn new(value: T) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            inner: parking_lot::Mutex::new(value),
            held: AtomicBool::new(false),
        }
    }

    /// Diagnostic id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a guard is currently alive.
    ///
    /// Advisory only: the flag is cleared just before the underlying lock is
    /// released, so a `false` here does not guarantee that `try_lock` will
    /// succeed. Use it for diagnostics, never for synchronization.
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Block until exclusive access is granted.
    ///
    /// Deadlocks if the calling thread already holds a guard.
    pub fn lock(&self) -> ScopedGuard<'_, T> {
        let guard = self.inner.lock();
        self.held.store(true, Ordering::Release);
        ScopedGuard {
            inner: guard,
            held: &self.held,
        }
    }

    /// Acquire without blocking, or fail with
    /// [`OwnershipError::WouldBlock`].
    pub fn try_lock(&self) -> Result<ScopedGuard<'_, T>> {
        match self.inner.try_lock() {
            Some(guard) => {
                self.held.store(true, Ordering::Release);
                Ok(ScopedGuard {
                    inner: guard,
                    held: &self.held,
                })
            }
            None => Err(OwnershipError::WouldBlock),
        }
    }

    /// Mutable access without locking; `&mut self` already proves
    /// exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the wrapper and return the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for MutexGuardedValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexGuardedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(guard) => f
                .debug_struct("MutexGuardedValue")
                .field("id", &self.id)
                .field("data", &&*guard)
                .finish(),
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                f.debug_struct("MutexGuardedValue")
                    .field("id", &self.id)
                    .field("data", &LockedPlaceholder)
                    .finish()
            }
        }
    }
}

/// Scoped access to a [`MutexGuardedValue`]; unlocks on drop.
pub struct ScopedGuard<'a, T> {
    inner: parking_lot::MutexGuard<'a, T>,
    held: &'a AtomicBool,
}

impl<T> Deref for ScopedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for ScopedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for ScopedGuard<'_, T> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for ScopedGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for ScopedGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
