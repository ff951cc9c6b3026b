//! Typed heap allocation for handle storage.
//!
//! All blocks owned by the handles in this crate come from [`allocate`] and go
//! back through [`deallocate`]. Allocation can fail in two ways, both reported
//! as [`OwnershipError::AllocationFailure`]:
//!
//! - the global allocator returns null, or
//! - the block would push usage past the configured heap limit
//!   (see [`set_max_heap_size`]; `0` means unlimited).
//!
//! Zero-sized types never touch the allocator or the budget.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{OwnershipError, Result};

/// Byte budget shared by every allocation in the process.
#[derive(Debug)]
pub struct HeapBudget {
    /// Bytes currently handed out.
    used: AtomicUsize,
    /// Upper bound on `used`; `0` disables the check.
    limit: AtomicUsize,
}

impl HeapBudget {
    /// Create an unlimited budget.
    pub const fn new() -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
        }
    }

    /// Set the limit in bytes (`0` = unlimited).
    pub fn set_limit(&self, bytes: usize) {
        self.limit.store(bytes, Ordering::Release);
    }

    /// Current limit in bytes.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Reserve `size` bytes, failing if the limit would be exceeded.
    pub fn reserve(&self, size: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(size)
                .ok_or(OwnershipError::AllocationFailure { size })?;
            let limit = self.limit();
            if limit != 0 && next > limit {
                return Err(OwnershipError::AllocationFailure { size });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `size` previously reserved bytes.
    pub fn unreserve(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }
}

impl Default for HeapBudget {
    fn default() -> Self {
        Self::new()
    }
}

static HEAP: HeapBudget = HeapBudget::new();

/// Set the process-wide heap limit in bytes (`0` = unlimited).
pub fn set_max_heap_size(bytes: usize) {
    HEAP.set_limit(bytes);
}

/// Current process-wide heap limit in bytes.
pub fn max_heap_size() -> usize {
    HEAP.limit()
}

/// Bytes currently held by live blocks.
pub fn heap_used() -> usize {
    HEAP.used()
}

/// Move `value` into a fresh heap block.
///
/// On failure the value is dropped.
pub(crate) fn allocate<T>(value: T) -> Result<NonNull<T>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        let ptr = NonNull::<T>::dangling();
        // Safety: writes of zero-sized values through an aligned dangling
        // pointer are valid.
        unsafe { ptr.as_ptr().write(value) };
        return Ok(ptr);
    }

    HEAP.reserve(layout.size())?;
    // Safety: layout has non-zero size.
    let raw = unsafe { alloc::alloc(layout) }.cast::<T>();
    match NonNull::new(raw) {
        Some(ptr) => {
            // Safety: freshly allocated with T's layout.
            unsafe { ptr.as_ptr().write(value) };
            Ok(ptr)
        }
        None => {
            HEAP.unreserve(layout.size());
            Err(OwnershipError::AllocationFailure { size: layout.size() })
        }
    }
}

/// Free a block obtained from [`allocate`] without dropping its contents.
///
/// # Safety
///
/// `ptr` must come from `allocate::<T>`, must not have been freed already,
/// and the caller must have moved out or dropped the contents beforehand.
pub(crate) unsafe fn deallocate<T>(ptr: NonNull<T>) {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return;
    }
    alloc::dealloc(ptr.as_ptr().cast::<u8>(), layout);
    HEAP.unreserve(layout.size());
}
