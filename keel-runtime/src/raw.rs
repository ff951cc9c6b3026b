//! Raw, non-owning pointers into handle storage.
//!
//! [`RawPointer`] is the escape hatch for interop code. Taking one never
//! touches a reference count, and nothing tracks whether the block it points
//! into is still alive. Dereferencing a raw pointer after its block was freed
//! is undefined behavior: it is not detected and not reported as
//! [`UseAfterFree`](crate::OwnershipError::UseAfterFree). Use
//! [`registry().is_live(ptr.block_id())`](crate::registry::AllocationRegistry::is_live)
//! as a diagnostic before dereferencing in tests.
//!
//! None of the safe handle types use this module internally.

use std::fmt;

use crate::registry::BlockId;

/// Handles that can expose their value address.
pub trait AsRawPointer<T> {
    /// Value address (null when the handle owns nothing) and block id.
    fn raw_parts(&self) -> (*const T, BlockId);
}

/// Unchecked pointer to a handle's value.
pub struct RawPointer<T> {
    ptr: *const T,
    block: BlockId,
}

impl<T> RawPointer<T> {
    /// Capture the value address of `handle` without affecting its counts.
    pub fn from_handle<H: AsRawPointer<T>>(handle: &H) -> Self {
        let (ptr, block) = handle.raw_parts();
        Self { ptr, block }
    }

    /// Whether the handle owned nothing when the pointer was taken.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// The raw address.
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    /// Registry id of the block the pointer was taken from.
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    /// Dereference without any check.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and the block it was taken from must
    /// still hold a live value for the whole lifetime `'a`. Nothing in this
    /// crate verifies either condition.
    pub unsafe fn deref_unchecked<'a>(&self) -> &'a T {
        &*self.ptr
    }
}

impl<T> Clone for RawPointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawPointer<T> {}

impl<T> PartialEq for RawPointer<T> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.ptr, other.ptr) && self.block == other.block
    }
}

impl<T> Eq for RawPointer<T> {}

impl<T> fmt::Debug for RawPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPointer")
            .field("address", &self.ptr)
            .field("block", &self.block)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArcCell, RcCell, UniqueBox};

    #[test]
    fn test_from_unique_box() {
        let mut boxed = UniqueBox::new(11).unwrap();
        let raw = RawPointer::from_handle(&boxed);
        assert!(!raw.is_null());
        assert_eq!(raw.block_id(), boxed.block_id());
        assert_eq!(unsafe { *raw.deref_unchecked() }, 11);

        let _moved = boxed.move_from().unwrap();
        assert!(RawPointer::from_handle(&boxed).is_null());
    }

    #[test]
    fn test_does_not_touch_counts() {
        let rc = RcCell::new(String::from("shared")).unwrap();
        let raw = RawPointer::from_handle(&rc);
        assert_eq!(RcCell::strong_count(&rc), 1);
        assert_eq!(unsafe { raw.deref_unchecked() }, "shared");
        assert_eq!(raw.as_ptr(), rc.get().unwrap() as *const String);

        let arc = ArcCell::new(3u64).unwrap();
        let raw = RawPointer::from_handle(&arc);
        assert_eq!(ArcCell::strong_count(&arc), 1);
        assert_eq!(unsafe { *raw.deref_unchecked() }, 3);
    }

    #[test]
    fn test_pointer_equality() {
        let rc = RcCell::new(1).unwrap();
        let other = rc.clone();
        assert_eq!(RawPointer::from_handle(&rc), RawPointer::from_handle(&other));
    }
}
