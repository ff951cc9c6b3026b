//! Error taxonomy for ownership misuse.
//!
//! Every failure is returned at the point of detection as an
//! [`OwnershipError`]. The only exception is the raw-pointer path
//! ([`crate::raw`]), where dereferencing freed memory is undefined
//! behavior and cannot be caught.

use std::thread::ThreadId;

use thiserror::Error;

use crate::registry::BlockId;

/// Result alias used throughout the crate.
pub type Result<T, E = OwnershipError> = std::result::Result<T, E>;

/// Errors reported by the ownership handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OwnershipError {
    /// The underlying allocation failed or would exceed the heap limit.
    #[error("allocation of {size} bytes failed")]
    AllocationFailure {
        /// Requested size in bytes.
        size: usize,
    },

    /// A handle tried to reach a value that was already torn down.
    #[error("use after free of block {block}")]
    UseAfterFree {
        /// Block the handle referred to.
        block: BlockId,
    },

    /// A unique handle was used after its ownership moved elsewhere.
    #[error("handle for block {block} was moved out")]
    MovedHandle {
        /// Block the handle used to own.
        block: BlockId,
    },

    /// A block was destroyed twice.
    #[error("double free of block {block}")]
    DoubleFree {
        /// Block that was already released.
        block: BlockId,
    },

    /// A single-threaded handle was touched from a thread other than its owner.
    #[error("single-threaded handle owned by {owner:?} used from {current:?}")]
    CrossThreadUse {
        /// Thread that created the control block.
        owner: ThreadId,
        /// Thread that attempted the operation.
        current: ThreadId,
    },

    /// A weak handle could not be upgraded because its value is gone.
    #[error("weak reference expired")]
    WeakExpired,

    /// `try_lock` found the mutex held.
    #[error("lock is held elsewhere")]
    WouldBlock,
}

impl OwnershipError {
    /// Returns `true` for errors that indicate a caller bug rather than an
    /// expected outcome.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            OwnershipError::UseAfterFree { .. }
                | OwnershipError::MovedHandle { .. }
                | OwnershipError::DoubleFree { .. }
                | OwnershipError::CrossThreadUse { .. }
        )
    }
}
