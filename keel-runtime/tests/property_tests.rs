//! Property-based tests for the keel runtime.
//!
//! Uses proptest to drive handles through random operation sequences and
//! check the ownership invariants after every step. Assertions only look at
//! the blocks each case allocated, so cases can run alongside each other.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use keel_runtime::{registry, ArcCell, OwnershipError, RcCell, UniqueBox, WeakRc};
use proptest::prelude::*;

/// Counts how many times values sharing the counter were dropped.
struct Counted(Rc<Cell<usize>>);

impl Drop for Counted {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

#[derive(Debug, Clone)]
enum RcOp {
    Clone(usize),
    Drop(usize),
    Downgrade(usize),
    DropWeak(usize),
    Upgrade(usize),
}

/// Strategy for generating shared-handle operations
fn rc_op() -> impl Strategy<Value = RcOp> {
    prop_oneof![
        3 => any::<usize>().prop_map(RcOp::Clone),
        3 => any::<usize>().prop_map(RcOp::Drop),
        2 => any::<usize>().prop_map(RcOp::Downgrade),
        1 => any::<usize>().prop_map(RcOp::DropWeak),
        2 => any::<usize>().prop_map(RcOp::Upgrade),
    ]
}

#[derive(Default)]
struct Node {
    children: RefCell<Vec<RcCell<Node>>>,
    parent: RefCell<Option<WeakRc<Node>>>,
}

/// Strategy for generating tree shapes: entry `i` picks the parent of node
/// `i + 1` among the nodes created before it.
fn tree_shape() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(any::<usize>(), 0..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Counts track live handles and the value is torn down exactly once,
    /// right after the last strong handle goes away
    #[test]
    fn rc_counts_follow_handles(ops in prop::collection::vec(rc_op(), 0..60)) {
        let drops = Rc::new(Cell::new(0));
        let first = RcCell::new(Counted(drops.clone())).unwrap();
        let block = first.block_id();
        let mut strong = vec![first];
        let mut weak: Vec<WeakRc<Counted>> = Vec::new();

        for op in ops {
            match op {
                RcOp::Clone(i) if !strong.is_empty() => {
                    let handle = strong[i % strong.len()].clone();
                    strong.push(handle);
                }
                RcOp::Drop(i) if !strong.is_empty() => {
                    let index = i % strong.len();
                    drop(strong.swap_remove(index));
                }
                RcOp::Downgrade(i) if !strong.is_empty() => {
                    weak.push(RcCell::downgrade(&strong[i % strong.len()]).unwrap());
                }
                RcOp::DropWeak(i) if !weak.is_empty() => {
                    let index = i % weak.len();
                    drop(weak.swap_remove(index));
                }
                RcOp::Upgrade(i) if !weak.is_empty() => {
                    let upgraded = weak[i % weak.len()].upgrade();
                    prop_assert_eq!(upgraded.is_some(), !strong.is_empty());
                    strong.extend(upgraded);
                }
                _ => {}
            }

            if let Some(handle) = strong.first() {
                prop_assert_eq!(RcCell::strong_count(handle), strong.len());
                prop_assert_eq!(RcCell::weak_count(handle), weak.len());
                prop_assert_eq!(drops.get(), 0);
            } else {
                prop_assert_eq!(drops.get(), 1);
                prop_assert!(weak.iter().all(WeakRc::is_expired));
            }
            prop_assert_eq!(registry().is_live(block), !strong.is_empty() || !weak.is_empty());
        }

        drop(strong);
        drop(weak);
        prop_assert_eq!(drops.get(), 1);
        prop_assert!(!registry().is_live(block));
    }

    /// Exactly one handle owns the value however often it is moved
    #[test]
    fn unique_has_single_owner(moves in prop::collection::vec(any::<usize>(), 0..30)) {
        let drops = Rc::new(Cell::new(0));
        let first = UniqueBox::new(Counted(drops.clone())).unwrap();
        let block = first.block_id();
        let mut slots = vec![first];

        for pick in moves {
            let index = pick % slots.len();
            match slots[index].move_from() {
                Ok(moved) => slots.push(moved),
                Err(err) => prop_assert_eq!(err, OwnershipError::MovedHandle { block }),
            }

            let live: Vec<_> = slots.iter().filter(|s| !s.is_empty()).collect();
            prop_assert_eq!(live.len(), 1);
            prop_assert!(live[0].get().is_ok());
            prop_assert_eq!(drops.get(), 0);
        }

        prop_assert!(registry().is_live(block));
        drop(slots);
        prop_assert_eq!(drops.get(), 1);
        prop_assert!(!registry().is_live(block));
    }

    /// Dropping the root of an acyclic graph releases every block in it
    #[test]
    fn acyclic_graph_is_released(shape in tree_shape()) {
        let root = RcCell::new(Node::default()).unwrap();
        let mut nodes = vec![root.clone()];
        for (i, pick) in shape.into_iter().enumerate() {
            let parent = nodes[pick % (i + 1)].clone();
            let child = RcCell::new(Node::default()).unwrap();
            *child.parent.borrow_mut() = Some(RcCell::downgrade(&parent).unwrap());
            parent.children.borrow_mut().push(child.clone());
            nodes.push(child);
        }

        let blocks: Vec<_> = nodes.iter().map(RcCell::block_id).collect();
        drop(nodes);
        prop_assert!(blocks.iter().all(|&b| registry().is_live(b)));

        drop(root);
        prop_assert!(blocks.iter().all(|&b| !registry().is_live(b)));
    }

    /// Arc teardown happens once no matter which thread drops last
    #[test]
    fn arc_teardown_once_across_threads(clones in 1usize..16) {
        struct Shared(Arc<AtomicUsize>);

        impl Drop for Shared {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let first = ArcCell::new(Shared(drops.clone())).unwrap();
        let block = first.block_id();
        let handles: Vec<_> = (0..clones)
            .map(|_| {
                let handle = first.clone();
                thread::spawn(move || drop(handle))
            })
            .collect();
        drop(first);
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert_eq!(drops.load(Ordering::SeqCst), 1);
        prop_assert!(!registry().is_live(block));
    }
}
