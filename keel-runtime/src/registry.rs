//! # Allocation Registry
//!
//! Process-wide bookkeeping of heap blocks handed out by the ownership
//! handles. Every block gets a [`BlockId`] when it is allocated and an
//! [`AllocationEntry`] that records its size, kind and origin. The entry's
//! `live` flag is cleared when the block is released; the entry itself stays
//! in the registry until [`AllocationRegistry::reset`] so tests can inspect
//! what happened after the fact.
//!
//! ## Leak and double-free detection
//!
//! - [`AllocationRegistry::outstanding_count`] counts entries still live.
//!   A test that builds and drops an acyclic graph of handles expects zero.
//! - Releasing a block whose entry is already released reports
//!   [`OwnershipError::DoubleFree`] and bumps [`RegistryStats::double_frees`].
//!
//! The registry is shared by every thread. All mutation goes through an
//! internal `RwLock`; counters are atomics.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::error::OwnershipError;

/// Identifier of a tracked block.
///
/// Ids are handed out in increasing order and never reused within a process,
/// so a snapshot ordered by id is ordered by allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u64);

impl BlockId {
    /// Build an id from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which handle family owns a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Storage behind a `UniqueBox`.
    Unique,
    /// Control block of an `RcCell`.
    Rc,
    /// Control block of an `ArcCell`.
    Arc,
}

impl BlockKind {
    /// Short lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Unique => "unique",
            BlockKind::Rc => "rc",
            BlockKind::Arc => "arc",
        }
    }
}

/// How a block left the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Release {
    /// The value was dropped in place.
    Dropped,
    /// A caller-supplied reclaimer consumed the value.
    Reclaimed,
    /// The value was moved out to the caller (`into_inner`).
    MovedOut,
}

/// Where a block came from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AllocationTag {
    /// Rust type name of the stored value.
    pub type_name: &'static str,
    /// Source location of the allocating call, when caller capture is on.
    pub location: Option<&'static Location<'static>>,
}

impl AllocationTag {
    /// Tag for a value of type `T`.
    pub fn of<T>(location: Option<&'static Location<'static>>) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            location,
        }
    }
}

impl fmt::Debug for AllocationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for AllocationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) => write!(f, "{} @ {}:{}", self.type_name, loc.file(), loc.line()),
            None => f.write_str(self.type_name),
        }
    }
}

/// A registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEntry {
    /// Block id.
    pub id: BlockId,
    /// Size of the block in bytes.
    pub size: usize,
    /// Owning handle family.
    pub kind: BlockKind,
    /// Origin of the allocation.
    pub tag: AllocationTag,
    /// Whether the block is still allocated.
    pub live: bool,
    /// How the block was released, once it has been.
    pub release: Option<Release>,
}

/// Counters maintained by the registry.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Blocks registered since the last reset.
    pub registered: AtomicU64,
    /// Blocks released since the last reset.
    pub released: AtomicU64,
    /// Double-free attempts observed since the last reset.
    pub double_frees: AtomicU64,
}

impl RegistryStats {
    fn clear(&self) {
        self.registered.store(0, Ordering::Relaxed);
        self.released.store(0, Ordering::Relaxed);
        self.double_frees.store(0, Ordering::Relaxed);
    }
}

/// Bookkeeping of allocated blocks.
pub struct AllocationRegistry {
    /// Entries keyed by id; `BTreeMap` keeps snapshots in allocation order.
    entries: RwLock<BTreeMap<BlockId, AllocationEntry>>,
    /// Next id to hand out.
    next_id: AtomicU64,
    /// Whether entries are recorded at all.
    tracking: AtomicBool,
    /// Whether allocation sites are stored in tags.
    capture_callers: AtomicBool,
    /// Counters.
    stats: RegistryStats,
}

impl AllocationRegistry {
    /// Create an empty registry with tracking and caller capture enabled.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            tracking: AtomicBool::new(true),
            capture_callers: AtomicBool::new(true),
            stats: RegistryStats::default(),
        }
    }

    /// Enable or disable recording of new entries.
    ///
    /// Ids are still handed out while tracking is off; releasing an
    /// untracked block is a no-op.
    pub fn set_tracking(&self, enabled: bool) {
        self.tracking.store(enabled, Ordering::Release);
    }

    /// Whether new entries are recorded.
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    /// Enable or disable storing allocation sites in tags.
    pub fn set_capture_callers(&self, enabled: bool) {
        self.capture_callers.store(enabled, Ordering::Release);
    }

    /// Whether allocation sites are stored in tags.
    pub fn captures_callers(&self) -> bool {
        self.capture_callers.load(Ordering::Acquire)
    }

    /// Build the tag for a `T` allocated at `caller`, honoring caller capture.
    pub fn tag_for<T>(&self, caller: &'static Location<'static>) -> AllocationTag {
        let location = self.captures_callers().then_some(caller);
        AllocationTag::of::<T>(location)
    }

    /// Register a new block and return its id.
    pub fn register(&self, size: usize, kind: BlockKind, tag: AllocationTag) -> BlockId {
        let id = BlockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if !self.is_tracking() {
            return id;
        }

        self.entries.write().insert(
            id,
            AllocationEntry {
                id,
                size,
                kind,
                tag,
                live: true,
                release: None,
            },
        );
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(block = %id, size, kind = kind.as_str(), tag = %tag, "registered block");
        id
    }

    /// Mark a block as released.
    ///
    /// Fails with [`OwnershipError::DoubleFree`] if the entry was already
    /// released. Unknown ids (untracked, or dropped by a reset) are accepted.
    pub fn release(&self, id: BlockId, how: Release) -> Result<(), OwnershipError> {
        let outcome = {
            let mut entries = self.entries.write();
            match entries.get_mut(&id) {
                Some(entry) if entry.live => {
                    entry.live = false;
                    entry.release = Some(how);
                    Ok(())
                }
                Some(_) => Err(()),
                None => return Ok(()),
            }
        };

        match outcome {
            Ok(()) => {
                self.stats.released.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(block = %id, release = ?how, "released block");
                Ok(())
            }
            Err(()) => Err(self.report_double_free(id)),
        }
    }

    /// Record a double-free attempt on `id` and return the matching error.
    pub fn report_double_free(&self, id: BlockId) -> OwnershipError {
        self.stats.double_frees.fetch_add(1, Ordering::Relaxed);
        tracing::error!(block = %id, "double free detected");
        OwnershipError::DoubleFree { block: id }
    }

    /// Look up an entry.
    pub fn entry(&self, id: BlockId) -> Option<AllocationEntry> {
        self.entries.read().get(&id).copied()
    }

    /// Whether a tracked block is still live.
    pub fn is_live(&self, id: BlockId) -> bool {
        self.entries.read().get(&id).map(|e| e.live).unwrap_or(false)
    }

    /// All entries, ordered by block id.
    pub fn snapshot(&self) -> Vec<AllocationEntry> {
        self.entries.read().values().copied().collect()
    }

    /// Number of entries whose block is still live.
    pub fn outstanding_count(&self) -> usize {
        self.entries.read().values().filter(|e| e.live).count()
    }

    /// Total size of live blocks in bytes.
    pub fn live_bytes(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.live)
            .map(|e| e.size)
            .sum()
    }

    /// Drop every entry and zero the counters.
    ///
    /// Meant for use between test cases. Handles that outlive a reset keep
    /// working; their later release is treated as untracked.
    pub fn reset(&self) {
        self.entries.write().clear();
        self.stats.clear();
    }

    /// Registry counters.
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Number of entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for AllocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("AllocationRegistry")
            .field("entries", &entries.len())
            .field("outstanding", &entries.values().filter(|e| e.live).count())
            .field("tracking", &self.is_tracking())
            .finish()
    }
}

/// Global registry instance.
static REGISTRY: OnceLock<AllocationRegistry> = OnceLock::new();

/// Get the process-wide allocation registry.
pub fn registry() -> &'static AllocationRegistry {
    REGISTRY.get_or_init(AllocationRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> AllocationTag {
        AllocationTag::of::<u64>(None)
    }

    #[test]
    fn test_register_assigns_increasing_ids() {
        let registry = AllocationRegistry::new();
        let a = registry.register(8, BlockKind::Unique, tag());
        let b = registry.register(16, BlockKind::Rc, tag());
        assert!(b > a);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.outstanding_count(), 2);
        assert_eq!(registry.live_bytes(), 24);
    }

    #[test]
    fn test_release_clears_live_flag() {
        let registry = AllocationRegistry::new();
        let id = registry.register(32, BlockKind::Arc, tag());
        assert!(registry.is_live(id));

        registry.release(id, Release::Dropped).unwrap();
        assert!(!registry.is_live(id));
        assert_eq!(registry.outstanding_count(), 0);

        // The entry is retained for inspection.
        let entry = registry.entry(id).unwrap();
        assert!(!entry.live);
        assert_eq!(entry.release, Some(Release::Dropped));
        assert_eq!(entry.size, 32);
    }

    #[test]
    fn test_double_release_is_reported() {
        let registry = AllocationRegistry::new();
        let id = registry.register(8, BlockKind::Unique, tag());
        registry.release(id, Release::MovedOut).unwrap();

        let err = registry.release(id, Release::Dropped).unwrap_err();
        assert_eq!(err, OwnershipError::DoubleFree { block: id });
        assert_eq!(registry.stats().double_frees.load(Ordering::Relaxed), 1);
        // First release wins.
        assert_eq!(registry.entry(id).unwrap().release, Some(Release::MovedOut));
    }

    #[test]
    fn test_unknown_release_is_ignored() {
        let registry = AllocationRegistry::new();
        assert!(registry.release(BlockId::from_raw(999), Release::Dropped).is_ok());
        assert_eq!(registry.stats().released.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let registry = AllocationRegistry::new();
        let ids: Vec<_> = (0..5)
            .map(|i| registry.register(i, BlockKind::Rc, tag()))
            .collect();
        let snapshot: Vec<_> = registry.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(snapshot, ids);
    }

    #[test]
    fn test_reset() {
        let registry = AllocationRegistry::new();
        let id = registry.register(8, BlockKind::Rc, tag());
        registry.reset();
        assert!(registry.is_empty());
        assert_eq!(registry.outstanding_count(), 0);
        assert_eq!(registry.stats().registered.load(Ordering::Relaxed), 0);

        // Releasing a block registered before the reset is harmless.
        assert!(registry.release(id, Release::Dropped).is_ok());
    }

    #[test]
    fn test_tracking_disabled() {
        let registry = AllocationRegistry::new();
        registry.set_tracking(false);
        let id = registry.register(8, BlockKind::Unique, tag());
        assert!(registry.entry(id).is_none());
        assert!(registry.release(id, Release::Dropped).is_ok());

        registry.set_tracking(true);
        let tracked = registry.register(8, BlockKind::Unique, tag());
        assert!(tracked > id);
        assert!(registry.is_live(tracked));
    }

    #[test]
    fn test_tag_capture() {
        let registry = AllocationRegistry::new();
        let here = Location::caller();

        let captured = registry.tag_for::<String>(here);
        assert_eq!(captured.location, Some(here));
        assert!(captured.to_string().contains("String"));
        assert!(captured.to_string().contains("registry.rs"));

        registry.set_capture_callers(false);
        let bare = registry.tag_for::<String>(here);
        assert!(bare.location.is_none());
        assert_eq!(bare.to_string(), std::any::type_name::<String>());
    }

    #[test]
    fn test_concurrent_register_release() {
        let registry = std::sync::Arc::new(AllocationRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let id = registry.register(4, BlockKind::Arc, AllocationTag::of::<u32>(None));
                        registry.release(id, Release::Dropped).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
        assert_eq!(registry.outstanding_count(), 0);
        assert_eq!(registry.stats().released.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn test_block_id_display() {
        assert_eq!(BlockId::from_raw(7).to_string(), "#7");
        assert_eq!(BlockId::from_raw(7).as_u64(), 7);
    }
}
