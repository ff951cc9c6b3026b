//! # Unique Ownership
//!
//! [`UniqueBox`] owns exactly one heap value. Ownership can be handed to a new
//! handle with [`UniqueBox::move_from`], which leaves the source empty; any
//! later use of the source fails with [`OwnershipError::MovedHandle`].
//!
//! A handle moves through three states:
//!
//! ```text
//!            move_from / into_inner
//!   Live ─────────────────────────────▶ Moved
//!     │
//!     │ destroy / scope exit
//!     ▼
//!   Destroyed ── destroy again ──▶ DoubleFree
//! ```
//!
//! Native Rust moves (`let b = a;`) remain the zero-cost way to transfer a
//! box; `move_from` is the runtime-checked form for code that needs to keep
//! the source binding around.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic::Location;
use std::ptr::NonNull;

use crate::error::{OwnershipError, Result};
use crate::heap;
use crate::raw::AsRawPointer;
use crate::registry::{registry, BlockId, BlockKind, Release};

/// Alias matching the handle terminology used in the registry docs.
pub type UniqueHandle<T> = UniqueBox<T>;

/// Teardown routine run instead of the default drop.
pub type UniqueReclaimer<T> = Box<dyn FnOnce(T)>;

enum Slot<T> {
    Live(NonNull<T>),
    Moved,
    Destroyed,
}

/// Sole-ownership heap container.
///
/// Not `Send`: a unique box is confined to the thread that created it.
pub struct UniqueBox<T> {
    slot: Slot<T>,
    block: BlockId,
    reclaimer: Option<UniqueReclaimer<T>>,
    _owns: PhantomData<T>,
}

impl<T> UniqueBox<T> {
    /// Allocate `value` and return the handle that owns it.
    #[track_caller]
    pub fn new(value: T) -> Result<Self> {
        Self::allocate(value, None, Location::caller())
    }

    /// Allocate `value` with a custom teardown routine.
    ///
    /// `reclaim` receives the value when the box is destroyed (explicitly or
    /// at scope exit). It is not called by [`UniqueBox::into_inner`], which
    /// hands the value to the caller instead.
    #[track_caller]
    pub fn new_with_reclaimer<F>(value: T, reclaim: F) -> Result<Self>
    where
        F: FnOnce(T) + 'static,
    {
        Self::allocate(value, Some(Box::new(reclaim)), Location::caller())
    }

    fn allocate(
        value: T,
        reclaimer: Option<UniqueReclaimer<T>>,
        caller: &'static Location<'static>,
    ) -> Result<Self> {
        let ptr = heap::allocate(value)?;
        let registry = registry();
        let block = registry.register(
            mem::size_of::<T>(),
            BlockKind::Unique,
            registry.tag_for::<T>(caller),
        );
        Ok(Self {
            slot: Slot::Live(ptr),
            block,
            reclaimer,
            _owns: PhantomData,
        })
    }

    /// Shared access to the value.
    pub fn get(&self) -> Result<&T> {
        match &self.slot {
            // Safety: a live slot points at an initialized value we own.
            Slot::Live(ptr) => Ok(unsafe { ptr.as_ref() }),
            Slot::Moved => Err(OwnershipError::MovedHandle { block: self.block }),
            Slot::Destroyed => Err(OwnershipError::UseAfterFree { block: self.block }),
        }
    }

    /// Exclusive access to the value.
    pub fn get_mut(&mut self) -> Result<&mut T> {
        match &mut self.slot {
            // Safety: as in `get`, and `&mut self` guarantees exclusivity.
            Slot::Live(ptr) => Ok(unsafe { ptr.as_mut() }),
            Slot::Moved => Err(OwnershipError::MovedHandle { block: self.block }),
            Slot::Destroyed => Err(OwnershipError::UseAfterFree { block: self.block }),
        }
    }

    /// Transfer ownership to a new handle, leaving `self` empty.
    ///
    /// The reclaimer, if any, travels with the value.
    pub fn move_from(&mut self) -> Result<UniqueBox<T>> {
        match mem::replace(&mut self.slot, Slot::Moved) {
            Slot::Live(ptr) => Ok(UniqueBox {
                slot: Slot::Live(ptr),
                block: self.block,
                reclaimer: self.reclaimer.take(),
                _owns: PhantomData,
            }),
            other => {
                self.slot = other;
                Err(self.unusable())
            }
        }
    }

    /// Consume the handle and return the value.
    ///
    /// The registry entry is released as [`Release::MovedOut`].
    pub fn into_inner(mut self) -> Result<T> {
        match mem::replace(&mut self.slot, Slot::Moved) {
            Slot::Live(ptr) => {
                // Safety: the slot was live, so the value is initialized and
                // nobody else can read it after the slot went to `Moved`.
                let value = unsafe {
                    let value = ptr.as_ptr().read();
                    heap::deallocate(ptr);
                    value
                };
                registry().release(self.block, Release::MovedOut)?;
                Ok(value)
            }
            other => {
                self.slot = other;
                Err(self.unusable())
            }
        }
    }

    /// Destroy the value now.
    ///
    /// Runs the reclaimer if one was supplied, otherwise drops the value.
    /// Destroying twice fails with [`OwnershipError::DoubleFree`]; destroying
    /// a moved-from handle fails with [`OwnershipError::MovedHandle`].
    pub fn destroy(&mut self) -> Result<()> {
        match mem::replace(&mut self.slot, Slot::Destroyed) {
            Slot::Live(ptr) => {
                // Safety: as in `into_inner`.
                let value = unsafe {
                    let value = ptr.as_ptr().read();
                    heap::deallocate(ptr);
                    value
                };
                let reclaimer = self.reclaimer.take();
                let how = if reclaimer.is_some() {
                    Release::Reclaimed
                } else {
                    Release::Dropped
                };
                let released = registry().release(self.block, how);
                match reclaimer {
                    Some(reclaim) => reclaim(value),
                    None => drop(value),
                }
                released
            }
            Slot::Moved => {
                self.slot = Slot::Moved;
                Err(OwnershipError::MovedHandle { block: self.block })
            }
            Slot::Destroyed => Err(registry().report_double_free(self.block)),
        }
    }

    /// Whether the handle no longer owns a value.
    pub fn is_empty(&self) -> bool {
        !matches!(self.slot, Slot::Live(_))
    }

    /// Registry id of the owned block.
    pub fn block_id(&self) -> BlockId {
        self.block
    }

    fn unusable(&self) -> OwnershipError {
        match self.slot {
            Slot::Destroyed => OwnershipError::UseAfterFree { block: self.block },
            _ => OwnershipError::MovedHandle { block: self.block },
        }
    }
}

impl<T> Drop for UniqueBox<T> {
    fn drop(&mut self) {
        if let Slot::Live(_) = self.slot {
            if let Err(err) = self.destroy() {
                tracing::error!(block = %self.block, error = %err, "unique box teardown failed");
            }
        }
    }
}

impl<T> AsRawPointer<T> for UniqueBox<T> {
    fn raw_parts(&self) -> (*const T, BlockId) {
        let ptr = match &self.slot {
            Slot::Live(ptr) => ptr.as_ptr() as *const T,
            _ => std::ptr::null(),
        };
        (ptr, self.block)
    }
}

impl<T: fmt::Debug> fmt::Debug for UniqueBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("UniqueBox");
        s.field("block", &self.block);
        match self.get() {
            Ok(value) => s.field("value", value),
            Err(OwnershipError::MovedHandle { .. }) => s.field("state", &"moved"),
            Err(_) => s.field("state", &"destroyed"),
        };
        s.finish()
    }
}
