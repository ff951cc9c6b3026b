//! # Single-Threaded Shared Ownership
//!
//! [`RcCell`] is a reference-counted handle with plain (non-atomic) counters;
//! [`WeakRc`] is its non-owning companion.
//!
//! ## Control block
//!
//! ```text
//! RcBox<T>
//! ├── strong     handles keeping the value alive
//! ├── weak       weak handles + 1 while any strong handle exists
//! ├── tombstone  set once the value has been torn down
//! ├── owner      thread that allocated the block
//! └── value
//! ```
//!
//! Strong handles collectively hold one implicit weak reference. The value is
//! torn down when `strong` reaches zero; the block is freed when `weak`
//! reaches zero, which can only happen after the last strong handle is gone.
//!
//! ## Thread affinity
//!
//! `RcCell` and `WeakRc` are neither `Send` nor `Sync`. Sharing one across
//! threads is a programming error; if unsafe code does it anyway, every
//! operation compares the current thread with the block's owner and fails
//! with [`OwnershipError::CrossThreadUse`]. Operations that cannot return a
//! `Result` (`Clone`, `Deref`, [`WeakRc::upgrade`], [`RcCell::get_mut`]) panic
//! with that error instead. A drop on a foreign thread leaks the handle's
//! count instead of touching it. The check can be switched off with
//! [`set_thread_affinity_checks`].
//!
//! The count and identity reads (`strong_count`, `weak_count`, `ptr_eq`,
//! `is_expired`, `block_id`) are exempt from the check; they are diagnostics
//! and never modify the control block.
//!
//! ## Cycles
//!
//! Reference cycles are not detected. Two values holding strong handles to
//! each other are never torn down; hold a [`WeakRc`] on one side instead.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::Deref;
use std::panic::Location;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use crate::error::{OwnershipError, Result};
use crate::heap;
use crate::raw::AsRawPointer;
use crate::registry::{registry, BlockId, BlockKind, Release};

/// Teardown routine run instead of the default drop.
pub type RcReclaimer<T> = Box<dyn FnOnce(T)>;

static CHECK_AFFINITY: AtomicBool = AtomicBool::new(true);

/// Enable or disable thread-affinity checks on `RcCell`/`WeakRc` operations.
pub fn set_thread_affinity_checks(enabled: bool) {
    CHECK_AFFINITY.store(enabled, Ordering::Release);
}

/// Whether thread-affinity checks are enabled.
pub fn thread_affinity_checks() -> bool {
    CHECK_AFFINITY.load(Ordering::Acquire)
}

struct RcBox<T> {
    strong: Cell<usize>,
    weak: Cell<usize>,
    tombstone: Cell<bool>,
    release: Cell<Release>,
    owner: ThreadId,
    block: BlockId,
    reclaimer: Cell<Option<RcReclaimer<T>>>,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T> RcBox<T> {
    fn check_thread(&self) -> Result<()> {
        if !thread_affinity_checks() {
            return Ok(());
        }
        let current = thread::current().id();
        if current == self.owner {
            Ok(())
        } else {
            tracing::warn!(block = %self.block, owner = ?self.owner, current = ?current, "rc handle used across threads");
            Err(OwnershipError::CrossThreadUse {
                owner: self.owner,
                current,
            })
        }
    }

    fn inc_strong(&self) {
        let count = self
            .strong
            .get()
            .checked_add(1)
            .unwrap_or_else(|| std::process::abort());
        self.strong.set(count);
    }

    fn inc_weak(&self) {
        let count = self
            .weak
            .get()
            .checked_add(1)
            .unwrap_or_else(|| std::process::abort());
        self.weak.set(count);
    }

    fn user_weak_count(&self) -> usize {
        if self.strong.get() > 0 {
            self.weak.get() - 1
        } else {
            self.weak.get()
        }
    }

    /// Drop the value in place and mark the block.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, right after `strong` reached zero.
    unsafe fn teardown(&self) {
        self.tombstone.set(true);
        let value = ManuallyDrop::take(&mut *self.value.get());
        match self.reclaimer.take() {
            Some(reclaim) => {
                self.release.set(Release::Reclaimed);
                reclaim(value);
            }
            None => drop(value),
        }
        tracing::debug!(block = %self.block, "rc value torn down");
    }

    /// Give up one weak reference, freeing the block when none remain.
    ///
    /// # Safety
    ///
    /// The caller must own the weak reference being released, and `ptr` must
    /// not be used afterwards.
    unsafe fn release_weak(ptr: NonNull<Self>) {
        let inner = ptr.as_ref();
        let weak = inner.weak.get() - 1;
        inner.weak.set(weak);
        if weak == 0 {
            let block = inner.block;
            let how = inner.release.get();
            ptr::drop_in_place(ptr.as_ptr());
            heap::deallocate(ptr);
            // A double free here was already logged by the registry.
            let _ = registry().release(block, how);
            tracing::debug!(block = %block, "rc control block freed");
        }
    }
}

/// Single-threaded strong handle.
pub struct RcCell<T> {
    ptr: NonNull<RcBox<T>>,
    _marker: PhantomData<RcBox<T>>,
}

/// Single-threaded weak handle.
pub struct WeakRc<T> {
    ptr: NonNull<RcBox<T>>,
    _marker: PhantomData<RcBox<T>>,
}

impl<T> RcCell<T> {
    /// Allocate a control block holding `value`.
    #[track_caller]
    pub fn new(value: T) -> Result<Self> {
        Self::allocate(value, None, Location::caller())
    }

    /// Allocate with a custom teardown routine run when the last strong
    /// handle goes away.
    #[track_caller]
    pub fn new_with_reclaimer<F>(value: T, reclaim: F) -> Result<Self>
    where
        F: FnOnce(T) + 'static,
    {
        Self::allocate(value, Some(Box::new(reclaim)), Location::caller())
    }

    fn allocate(
        value: T,
        reclaimer: Option<RcReclaimer<T>>,
        caller: &'static Location<'static>,
    ) -> Result<Self> {
        let ptr = heap::allocate(RcBox {
            strong: Cell::new(1),
            weak: Cell::new(1),
            tombstone: Cell::new(false),
            release: Cell::new(Release::Dropped),
            owner: thread::current().id(),
            block: BlockId::from_raw(0),
            reclaimer: Cell::new(reclaimer),
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        })?;

        let registry = registry();
        let block = registry.register(
            mem::size_of::<RcBox<T>>(),
            BlockKind::Rc,
            registry.tag_for::<T>(caller),
        );
        // Safety: the block is not shared with anyone yet.
        unsafe { (*ptr.as_ptr()).block = block };

        Ok(Self {
            ptr,
            _marker: PhantomData,
        })
    }

    fn inner(&self) -> &RcBox<T> {
        // Safety: a strong handle keeps the control block allocated.
        unsafe { self.ptr.as_ref() }
    }

    /// Shared access to the value.
    pub fn get(&self) -> Result<&T> {
        let inner = self.inner();
        inner.check_thread()?;
        if inner.tombstone.get() {
            return Err(OwnershipError::UseAfterFree { block: inner.block });
        }
        // Safety: value is live while strong > 0 and only shared refs exist.
        Ok(unsafe { &**inner.value.get() })
    }

    /// Exclusive access when this is the only handle of any kind.
    ///
    /// # Panics
    ///
    /// Panics with `CrossThreadUse` when called off the owning thread.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let inner = this.inner();
        if let Err(err) = inner.check_thread() {
            panic!("{err}");
        }
        if inner.strong.get() != 1 || inner.weak.get() != 1 {
            return None;
        }
        // Safety: no other handle can observe the value.
        Some(unsafe { &mut **this.ptr.as_ref().value.get() })
    }

    /// New strong handle to the same value.
    pub fn try_clone(&self) -> Result<Self> {
        let inner = self.inner();
        inner.check_thread()?;
        inner.inc_strong();
        Ok(Self {
            ptr: self.ptr,
            _marker: PhantomData,
        })
    }

    /// New weak handle to the same value.
    pub fn downgrade(this: &Self) -> Result<WeakRc<T>> {
        let inner = this.inner();
        inner.check_thread()?;
        inner.inc_weak();
        Ok(WeakRc {
            ptr: this.ptr,
            _marker: PhantomData,
        })
    }

    /// Drop the handle, reporting misuse instead of logging it.
    ///
    /// On a foreign thread the handle is leaked and `CrossThreadUse` returned.
    pub fn release(self) -> Result<()> {
        if let Err(err) = self.inner().check_thread() {
            mem::forget(self);
            return Err(err);
        }
        drop(self);
        Ok(())
    }

    /// Number of strong handles.
    pub fn strong_count(this: &Self) -> usize {
        this.inner().strong.get()
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

impl<T> Clone for RcCell<T> {
    /// # Panics
    ///
    /// Panics with `CrossThreadUse` when called off the owning thread.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(handle) => handle,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T> Deref for RcCell<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T> Drop for RcCell<T> {
    fn drop(&mut self) {
        let inner = self.inner();
        if let Err(err) = inner.check_thread() {
            tracing::error!(block = %inner.block, error = %err, "leaking rc handle dropped on foreign thread");
            return;
        }

        let strong = inner.strong.get() - 1;
        inner.strong.set(strong);
        if strong == 0 {
            // Safety: this was the last strong handle; the implicit weak
            // reference it shared is released right after teardown.
            unsafe {
                inner.teardown();
                RcBox::release_weak(self.ptr);
            }
        }
    }
}

impl<T> AsRawPointer<T> for RcCell<T> {
    fn raw_parts(&self) -> (*const T, BlockId) {
        let inner = self.inner();
        (inner.value.get() as *const T, inner.block)
    }
}

impl<T: fmt::Debug> fmt::Debug for RcCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        let mut s = f.debug_struct("RcCell");
        s.field("block", &inner.block)
            .field("strong", &inner.strong.get())
            .field("weak", &inner.user_weak_count());
        if let Ok(value) = self.get() {
            s.field("value", value);
        }
        s.finish()
    }
}

impl<T> WeakRc<T> {
    fn inner(&self) -> &RcBox<T> {
        // Safety: a weak handle keeps the control block allocated.
        unsafe { self.ptr.as_ref() }
    }

    /// Strong handle to the value, or `None` once it has been torn down.
    ///
    /// # Panics
    ///
    /// Panics with `CrossThreadUse` when called off the owning thread, so
    /// misuse is never mistaken for expiry. Use [`WeakRc::try_upgrade`] to
    /// get the error as a value.
    pub fn upgrade(&self) -> Option<RcCell<T>> {
        match self.try_upgrade() {
            Ok(handle) => Some(handle),
            Err(OwnershipError::WeakExpired) => None,
            Err(err) => panic!("{err}"),
        }
    }

    /// Like [`WeakRc::upgrade`], but reports why the upgrade failed.
    pub fn try_upgrade(&self) -> Result<RcCell<T>> {
        let inner = self.inner();
        inner.check_thread()?;
        if inner.strong.get() == 0 {
            return Err(OwnershipError::WeakExpired);
        }
        inner.inc_strong();
        Ok(RcCell {
            ptr: self.ptr,
            _marker: PhantomData,
        })
    }

    /// Whether the value has been torn down.
    pub fn is_expired(&self) -> bool {
        self.inner().strong.get() == 0
    }

    /// Number of strong handles.
    pub fn strong_count(&self) -> usize {
        self.inner().strong.get()
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

impl<T> Clone for WeakRc<T> {
    /// # Panics
    ///
    /// Panics with `CrossThreadUse` when called off the owning thread.
    fn clone(&self) -> Self {
        let inner = self.inner();
        if let Err(err) = inner.check_thread() {
            panic!("{err}");
        }
        inner.inc_weak();
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for WeakRc<T> {
    fn drop(&mut self) {
        if let Err(err) = self.inner().check_thread() {
            tracing::error!(block = %self.inner().block, error = %err, "leaking weak rc handle dropped on foreign thread");
            return;
        }
        // Safety: we own this weak reference and never touch `ptr` again.
        unsafe { RcBox::release_weak(self.ptr) };
    }
}

impl<T> fmt::Debug for WeakRc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRc")
            .field("block", &self.inner().block)
            .field("expired", &self.is_expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_new_counts() {
        let rc = RcCell::new(5).unwrap();
        assert_eq!(RcCell::strong_count(&rc), 1);
        assert_eq!(RcCell::weak_count(&rc), 0);
        assert_eq!(*rc.get().unwrap(), 5);
        assert_eq!(*rc, 5);
        assert_eq!(registry().entry(rc.block_id()).unwrap().kind, BlockKind::Rc);
    }

    #[test]
    fn test_clone_and_drop_counts() {
        let a = RcCell::new(String::from("x")).unwrap();
        let b = a.clone();
        let c = a.try_clone().unwrap();
        assert_eq!(RcCell::strong_count(&a), 3);
        assert!(RcCell::ptr_eq(&a, &c));

        let block = a.block_id();
        drop(b);
        assert_eq!(RcCell::strong_count(&a), 2);
        drop(c);
        assert!(registry().is_live(block));
        drop(a);
        assert!(!registry().is_live(block));
    }

    #[test]
    fn test_teardown_happens_once_after_last_drop() {
        let drops = Rc::new(Cell::new(0));
        let first = RcCell::new(DropCounter(drops.clone())).unwrap();
        let clones: Vec<_> = (0..10).map(|_| first.clone()).collect();
        drop(first);
        for (i, handle) in clones.into_iter().enumerate() {
            assert_eq!(drops.get(), 0, "torn down early at drop {i}");
            drop(handle);
        }
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_weak_upgrade() {
        let strong = RcCell::new(10).unwrap();
        let weak = RcCell::downgrade(&strong).unwrap();
        assert_eq!(RcCell::weak_count(&strong), 1);
        assert_eq!(weak.strong_count(), 1);

        let upgraded = weak.upgrade().unwrap();
        assert_eq!(*upgraded, 10);
        assert_eq!(RcCell::strong_count(&strong), 2);
        drop(upgraded);
        drop(strong);

        assert!(weak.is_expired());
        assert!(weak.upgrade().is_none());
        assert_eq!(weak.try_upgrade().unwrap_err(), OwnershipError::WeakExpired);
    }

    #[test]
    fn test_weak_outlives_value() {
        let drops = Rc::new(Cell::new(0));
        let strong = RcCell::new(DropCounter(drops.clone())).unwrap();
        let block = strong.block_id();
        let weak = RcCell::downgrade(&strong).unwrap();
        let weak2 = weak.clone();
        assert_eq!(weak.weak_count(), 2);

        drop(strong);
        // Value gone, control block still held by weak handles.
        assert_eq!(drops.get(), 1);
        assert!(registry().is_live(block));
        assert_eq!(weak.weak_count(), 2);

        drop(weak);
        assert!(registry().is_live(block));
        drop(weak2);
        assert!(!registry().is_live(block));
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_get_mut_requires_uniqueness() {
        let mut rc = RcCell::new(vec![1]).unwrap();
        RcCell::get_mut(&mut rc).unwrap().push(2);
        assert_eq!(*rc, vec![1, 2]);

        let other = rc.clone();
        assert!(RcCell::get_mut(&mut rc).is_none());
        drop(other);

        let weak = RcCell::downgrade(&rc).unwrap();
        assert!(RcCell::get_mut(&mut rc).is_none());
        drop(weak);
        assert!(RcCell::get_mut(&mut rc).is_some());
    }

    #[test]
    fn test_reclaimer() {
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let rc = RcCell::new_with_reclaimer(77, move |v| *sink.borrow_mut() = Some(v)).unwrap();
        let block = rc.block_id();
        let other = rc.clone();
        drop(rc);
        assert!(seen.borrow().is_none());
        drop(other);
        assert_eq!(*seen.borrow(), Some(77));
        assert_eq!(registry().entry(block).unwrap().release, Some(Release::Reclaimed));
    }

    #[test]
    fn test_upgrade_during_teardown_fails() {
        struct Observer {
            weak: RefCell<Option<WeakRc<Observer>>>,
            upgraded: Rc<Cell<bool>>,
        }

        impl Drop for Observer {
            fn drop(&mut self) {
                if let Some(weak) = self.weak.borrow().as_ref() {
                    self.upgraded.set(weak.upgrade().is_some());
                }
            }
        }

        let upgraded = Rc::new(Cell::new(true));
        let rc = RcCell::new(Observer {
            weak: RefCell::new(None),
            upgraded: upgraded.clone(),
        })
        .unwrap();
        *rc.weak.borrow_mut() = Some(RcCell::downgrade(&rc).unwrap());
        let block = rc.block_id();
        drop(rc);

        assert!(!upgraded.get());
        assert!(!registry().is_live(block));
    }

    #[test]
    fn test_release() {
        let rc = RcCell::new(1).unwrap();
        let block = rc.block_id();
        rc.release().unwrap();
        assert!(!registry().is_live(block));
    }

    #[test]
    fn test_debug_output() {
        let rc = RcCell::new(3).unwrap();
        let weak = RcCell::downgrade(&rc).unwrap();
        let text = format!("{:?}", rc);
        assert!(text.contains("strong: 1"));
        assert!(text.contains("weak: 1"));
        assert!(format!("{:?}", weak).contains("expired: false"));
    }
}
