//! # Thread-Safe Shared Ownership
//!
//! [`ArcCell`] and [`WeakArc`] mirror [`RcCell`](crate::RcCell) and
//! [`WeakRc`](crate::WeakRc) with atomic counters, so handles can be cloned,
//! sent and dropped from any thread.
//!
//! ## Memory ordering
//!
//! - Increments use `Relaxed`: a new handle can only be made from an existing
//!   one, which already keeps the block alive.
//! - Decrements use `Release`. The decrement that observes the count reaching
//!   zero issues an `Acquire` fence before teardown, so every access made
//!   through other handles happens-before the value is destroyed.
//! - [`WeakArc::upgrade`] is a compare-and-swap loop that never increments a
//!   zero count, so an upgrade cannot resurrect a value whose final drop is
//!   already under way.
//!
//! As with the single-threaded variant, strong handles collectively hold one
//! implicit weak reference and the block is freed when `weak` reaches zero.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::Deref;
use std::panic::Location;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::error::{OwnershipError, Result};
use crate::heap;
use crate::raw::AsRawPointer;
use crate::registry::{registry, BlockId, BlockKind, Release};

/// Teardown routine run instead of the default drop.
pub type ArcReclaimer<T> = Box<dyn FnOnce(T) + Send>;

/// Counts above this abort the process, as in `std::sync::Arc`.
const MAX_REFCOUNT: usize = isize::MAX as usize;

fn encode_release(how: Release) -> u8 {
    match how {
        Release::Dropped => 0,
        Release::Reclaimed => 1,
        Release::MovedOut => 2,
    }
}

fn decode_release(raw: u8) -> Release {
    match raw {
        1 => Release::Reclaimed,
        2 => Release::MovedOut,
        _ => Release::Dropped,
    }
}

struct ArcInner<T> {
    strong: AtomicUsize,
    weak: AtomicUsize,
    tombstone: AtomicBool,
    release: AtomicU8,
    block: BlockId,
    /// Only touched by the thread that dropped the last strong handle.
    reclaimer: UnsafeCell<Option<ArcReclaimer<T>>>,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T> ArcInner<T> {
    /// Take the value out and mark the block.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the thread whose decrement took
    /// `strong` to zero, after the acquire fence.
    unsafe fn take_value(&self) -> T {
        self.tombstone.store(true, Ordering::Release);
        ManuallyDrop::take(&mut *self.value.get())
    }

    /// Drop (or reclaim) the value in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`ArcInner::take_value`].
    unsafe fn teardown(&self) {
        let value = self.take_value();
        match (*self.reclaimer.get()).take() {
            Some(reclaim) => {
                self.release
                    .store(encode_release(Release::Reclaimed), Ordering::Relaxed);
                reclaim(value);
            }
            None => drop(value),
        }
        tracing::debug!(block = %self.block, "arc value torn down");
    }

    fn user_weak_count(&self) -> usize {
        let weak = self.weak.load(Ordering::Acquire);
        if self.strong.load(Ordering::Acquire) > 0 {
            weak.saturating_sub(1)
        } else {
            weak
        }
    }

    /// Give up one weak reference, freeing the block when none remain.
    ///
    /// # Safety
    ///
    /// The caller must own the weak reference being released, and `ptr` must
    /// not be used afterwards.
    unsafe fn release_weak(ptr: NonNull<Self>) {
        if ptr.as_ref().weak.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        let inner = ptr.as_ref();
        let block = inner.block;
        let how = decode_release(inner.release.load(Ordering::Relaxed));
        ptr::drop_in_place(ptr.as_ptr());
        heap::deallocate(ptr);
        // A double free here was already logged by the registry.
        let _ = registry().release(block, how);
        tracing::debug!(block = %block, "arc control block freed");
    }
}

/// Thread-safe strong handle.
pub struct ArcCell<T> {
    ptr: NonNull<ArcInner<T>>,
    _marker: PhantomData<ArcInner<T>>,
}

/// Thread-safe weak handle.
pub struct WeakArc<T> {
    ptr: NonNull<ArcInner<T>>,
    _marker: PhantomData<ArcInner<T>>,
}

// Safety: counts are atomic; the value is shared immutably across threads
// and dropped on whichever thread releases the last strong handle.
unsafe impl<T: Send + Sync> Send for ArcCell<T> {}
unsafe impl<T: Send + Sync> Sync for ArcCell<T> {}
unsafe impl<T: Send + Sync> Send for WeakArc<T> {}
unsafe impl<T: Send + Sync> Sync for WeakArc<T> {}

impl<T> ArcCell<T> {
    /// Allocate a control block holding `value`.
    #[track_caller]
    pub fn new(value: T) -> Result<Self> {
        Self::allocate(value, None, Location::caller())
    }

    /// Allocate with a custom teardown routine, run on whichever thread drops
    /// the last strong handle.
    #[track_caller]
    pub fn new_with_reclaimer<F>(value: T, reclaim: F) -> Result<Self>
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self::allocate(value, Some(Box::new(reclaim)), Location::caller())
    }

    fn allocate(
        value: T,
        reclaimer: Option<ArcReclaimer<T>>,
        caller: &'static Location<'static>,
    ) -> Result<Self> {
        let ptr = heap::allocate(ArcInner {
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
            tombstone: AtomicBool::new(false),
            release: AtomicU8::new(encode_release(Release::Dropped)),
            block: BlockId::from_raw(0),
            reclaimer: UnsafeCell::new(reclaimer),
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        })?;

        let registry = registry();
        let block = registry.register(
            mem::size_of::<ArcInner<T>>(),
            BlockKind::Arc,
            registry.tag_for::<T>(caller),
        );
        // Safety: the block is not shared with anyone yet.
        unsafe { (*ptr.as_ptr()).block = block };

        Ok(Self {
            ptr,
            _marker: PhantomData,
        })
    }

    fn inner(&self) -> &ArcInner<T> {
        // Safety: a strong handle keeps the control block allocated.
        unsafe { self.ptr.as_ref() }
    }

    /// Shared access to the value.
    pub fn get(&self) -> Result<&T> {
        let inner = self.inner();
        if inner.tombstone.load(Ordering::Acquire) {
            return Err(OwnershipError::UseAfterFree { block: inner.block });
        }
        // Safety: the value is live while this strong handle exists.
        Ok(unsafe { &**inner.value.get() })
    }

    /// New weak handle to the same value.
    pub fn downgrade(this: &Self) -> WeakArc<T> {
        let old = this.inner().weak.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        WeakArc {
            ptr: this.ptr,
            _marker: PhantomData,
        }
    }

    /// Take the value out if this is the last strong handle.
    ///
    /// Returns `None` (and drops this handle) otherwise. The reclaimer is not
    /// run; the registry records the block as [`Release::MovedOut`].
    pub fn into_inner(this: Self) -> Option<T> {
        let this = ManuallyDrop::new(this);
        let inner = this.inner();
        if inner.strong.fetch_sub(1, Ordering::Release) != 1 {
            return None;
        }
        fence(Ordering::Acquire);

        // Safety: we performed the final decrement.
        let value = unsafe {
            inner
                .release
                .store(encode_release(Release::MovedOut), Ordering::Relaxed);
            let value = inner.take_value();
            drop((*inner.reclaimer.get()).take());
            ArcInner::release_weak(this.ptr);
            value
        };
        Some(value)
    }

    /// Number of strong handles.
    pub fn strong_count(this: &Self) -> usize {
        this.inner().strong.load(Ordering::Acquire)
    }

    /// Number of weak handles.
    pub fn weak_count(this: &Self) -> usize {
        this.inner().user_weak_count()
    }

    /// Whether two handles share a control block.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Registry id of the control block.
    pub fn block_id(&self) -> BlockId {
        self.inner().block
    }
}

impl<T> Clone for ArcCell<T> {
    fn clone(&self) -> Self {
        let old = self.inner().strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for ArcCell<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T> Drop for ArcCell<T> {
    fn drop(&mut self) {
        if self.inner().strong.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // Safety: this thread performed the final decrement; the implicit
        // weak reference is released right after teardown.
        unsafe {
            self.inner().teardown();
            ArcInner::release_weak(self.ptr);
        }
    }
}

impl<T> AsRawPointer<T> for ArcCell<T> {
    fn raw_parts(&self) -> (*const T, BlockId) {
        let inner = self.inner();
        (inner.value.get() as *const T, inner.block)
    }
}

impl<T: fmt::Debug> fmt::Debug for ArcCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        let mut s = f.debug_struct("ArcCell");
        s.field("block", &inner.block)
            .field("strong", &inner.strong.load(Ordering::Relaxed))
            .field("weak", &inner.user_weak_count());
        if let Ok(value) = self.get() {
            s.field("value", value);
        }
        s.finish()
    }
}

impl<T> WeakArc<T> {
    fn inner(&self) -> &ArcInner<T> {
        // Safety: a weak handle keeps the control block allocated.
        unsafe { self.ptr.as_ref() }
    }

    /// Strong handle to the value, or `None` once it has been torn down.
    pub fn upgrade(&self) -> Option<ArcCell<T>> {
        self.try_upgrade().ok()
    }

    /// Like [`WeakArc::upgrade`], but reports expiry as
    /// [`OwnershipError::WeakExpired`].
    pub fn try_upgrade(&self) -> Result<ArcCell<T>> {
        let strong = &self.inner().strong;
        let mut current = strong.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(OwnershipError::WeakExpired);
            }
            if current > MAX_REFCOUNT {
                std::process::abort();
            }
            match strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(ArcCell {
                        ptr: self.ptr,
                        _marker: PhantomData,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether the value has been torn down (or is being torn down).
    pub fn is_expired(&self) -> bool {
        self.inner().strong.load(Ordering::Acquire) == 0
    }

    /// Number of strong handles.
    pub fn strong_count(&self) -> usize {
        self.inner().strong.load(Ordering::Acquire)
    }

    /// Number of weak handles, including this one.
    pub fn weak_count(&self) -> usize {
        self.inner().user_weak_count()
    }

    /// Whether two weak handles share a control block.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    /// Registry id of the control block.
    pub fn block_id(&self) -> BlockId {
        self.inner().block
    }
}

impl<T> Clone for WeakArc<T> {
    fn clone(&self) -> Self {
        let old = self.inner().weak.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for WeakArc<T> {
    fn drop(&mut self) {
        // Safety: we own this weak reference and never touch `ptr` again.
        unsafe { ArcInner::release_weak(self.ptr) };
    }
}

impl<T> fmt::Debug for WeakArc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakArc")
            .field("block", &self.inner().block)
            .field("expired", &self.is_expired())
            .finish()
    }
}
