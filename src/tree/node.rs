//! # Inner Node Codec
//!
//! A B+-tree inner node is an ordinary `has_refs` array with the
//! `is_inner_bptree_node` flag set and a fixed slot discipline:
//!
//! ```text
//! slot 0       header value: odd  -> compact form, elems_per_child = v / 2
//!                            even -> general form, ref to the offsets array
//! slots 1..=N  child refs (N >= 1)
//! slot N+1     2 * total_elems_in_subtree + 1 (odd, preserving the tagging
//!              discipline)
//! ```
//!
//! In compact form every child except the last holds exactly
//! `elems_per_child` elements, so locating an element is a division. In
//! general form the offsets array holds the element count preceding each
//! child after the first, and locating an element is a binary search.
//!
//! A compact node that gains non-uniform children (any insert or erase that
//! is not at the very end of its subtree) is converted to general form
//! first. Conversions run top-down during descent, which maintains the rule
//! that a general node never hangs below a compact one.
//!
//! The trailing total slot is maintained on every mutation for format
//! compatibility, but traversals are written to work without it.

use eyre::Result;

use crate::alloc::{ref_to_slot, Ref, SlabAlloc};
use crate::array::{Array, NodeKind};

/// Decoded slot 0 of an inner node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InnerForm {
    /// Uniform fan-out: every child except the last holds exactly this many
    /// elements.
    Compact(usize),
    /// Explicit boundaries: ref of the offsets array.
    General(Ref),
}

pub(crate) fn inner_form(node: &Array, alloc: &SlabAlloc) -> InnerForm {
    let v = node.get(alloc, 0);
    if v % 2 != 0 {
        InnerForm::Compact((v / 2) as usize)
    } else {
        debug_assert_ne!(v, 0, "general-form inner node without offsets");
        InnerForm::General(v as Ref)
    }
}

/// Number of children of an inner node.
pub(crate) fn child_count(node: &Array) -> usize {
    debug_assert!(node.len() >= 3, "inner node must have a child");
    node.len() - 2
}

/// Element count of the subtree, from the trailing total slot.
pub(crate) fn total_elems(node: &Array, alloc: &SlabAlloc) -> usize {
    let v = node.get(alloc, node.len() - 1);
    debug_assert_eq!(v % 2, 1, "total slot must be odd");
    (v as usize - 1) / 2
}

pub(crate) fn set_total_elems(node: &mut Array, alloc: &mut SlabAlloc, n: usize) -> Result<()> {
    let last = node.len() - 1;
    node.set(alloc, last, (2 * n + 1) as i64)
}

/// Adds `delta` elements to the trailing total slot (the stored value moves
/// by `2 * delta`).
pub(crate) fn bump_total(node: &mut Array, alloc: &mut SlabAlloc, delta: i64) -> Result<()> {
    let last = node.len() - 1;
    let v = node.get(alloc, last);
    node.set(alloc, last, v + 2 * delta)
}

/// Maps a subtree-relative element index to `(child_ndx, ndx_in_child)`.
pub(crate) fn find_child(node: &Array, alloc: &SlabAlloc, elem_ndx: usize) -> (usize, usize) {
    match inner_form(node, alloc) {
        InnerForm::Compact(epc) => (elem_ndx / epc, elem_ndx % epc),
        InnerForm::General(offsets_ref) => {
            let offsets = Array::from_ref(alloc, offsets_ref);
            let child_ndx = offsets.upper_bound(alloc, elem_ndx as i64);
            let preceding = if child_ndx == 0 {
                0
            } else {
                offsets.get(alloc, child_ndx - 1) as usize
            };
            (child_ndx, elem_ndx - preceding)
        }
    }
}

/// Number of elements in children `0..child_ndx`.
pub(crate) fn elems_before_child(node: &Array, alloc: &SlabAlloc, child_ndx: usize) -> usize {
    match inner_form(node, alloc) {
        InnerForm::Compact(epc) => child_ndx * epc,
        InnerForm::General(offsets_ref) => {
            if child_ndx == 0 {
                return 0;
            }
            Array::from_ref(alloc, offsets_ref).get(alloc, child_ndx - 1) as usize
        }
    }
}

/// Returns the node's offsets array as a writable accessor, converting a
/// compact node to general form first.
///
/// The node itself must already be writable. Slot 0 is rewritten whenever
/// the offsets array's ref changes, so later offset decrements cannot
/// themselves allocate.
pub(crate) fn ensure_writable_offsets(node: &mut Array, alloc: &mut SlabAlloc) -> Result<Array> {
    match inner_form(node, &*alloc) {
        InnerForm::General(offsets_ref) => {
            let mut offsets = Array::from_ref(alloc, offsets_ref);
            offsets.copy_on_write(alloc)?;
            if offsets.node_ref() != offsets_ref {
                node.set(alloc, 0, ref_to_slot(offsets.node_ref()))?;
            }
            Ok(offsets)
        }
        InnerForm::Compact(epc) => {
            let nchildren = child_count(node);
            let mut offsets = Array::create(alloc, NodeKind::Normal, false)?;
            for i in 1..nchildren {
                if let Err(e) = offsets.add(alloc, (i * epc) as i64) {
                    offsets.destroy_deep(alloc);
                    return Err(e);
                }
            }
            if let Err(e) = node.set(alloc, 0, ref_to_slot(offsets.node_ref())) {
                offsets.destroy_deep(alloc);
                return Err(e);
            }
            Ok(offsets)
        }
    }
}

/// Adds `delta` to every offsets entry at index `from` and later.
pub(crate) fn adjust_offsets_from(
    offsets: &mut Array,
    alloc: &mut SlabAlloc,
    from: usize,
    delta: i64,
) -> Result<()> {
    for i in from..offsets.len() {
        let v = offsets.get(alloc, i);
        offsets.set(alloc, i, v + delta)?;
    }
    Ok(())
}

/// Descends from `root` to the leaf holding global element `elem_ndx`.
pub fn find_leaf(alloc: &SlabAlloc, root: Ref, mut elem_ndx: usize) -> (Ref, usize) {
    let mut node_ref = root;
    loop {
        let node = Array::from_ref(alloc, node_ref);
        if !node.is_inner_bptree_node() {
            return (node_ref, elem_ndx);
        }
        let (child_ndx, rem) = find_child(&node, alloc, elem_ndx);
        node_ref = node.get_as_ref(alloc, 1 + child_ndx);
        elem_ndx = rem;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::int_to_tagged;

    /// Builds a compact inner node over the given leaves.
    fn build_compact(
        alloc: &mut SlabAlloc,
        epc: usize,
        leaf_sizes: &[usize],
        total: usize,
    ) -> Array {
        let mut node = Array::create(alloc, NodeKind::InnerBptree, false).unwrap();
        node.add(alloc, (2 * epc + 1) as i64).unwrap();
        for &size in leaf_sizes {
            let mut leaf = Array::create(alloc, NodeKind::Normal, false).unwrap();
            for i in 0..size {
                leaf.add(alloc, i as i64).unwrap();
            }
            node.add(alloc, ref_to_slot(leaf.node_ref())).unwrap();
        }
        node.add(alloc, (2 * total + 1) as i64).unwrap();
        node
    }

    #[test]
    fn compact_form_decodes_elems_per_child() {
        let mut alloc = SlabAlloc::new();
        let node = build_compact(&mut alloc, 4, &[4, 2], 6);

        assert_eq!(inner_form(&node, &alloc), InnerForm::Compact(4));
        assert_eq!(child_count(&node), 2);
        assert_eq!(total_elems(&node, &alloc), 6);
    }

    #[test]
    fn find_child_compact_divides() {
        let mut alloc = SlabAlloc::new();
        let node = build_compact(&mut alloc, 4, &[4, 3], 7);

        assert_eq!(find_child(&node, &alloc, 0), (0, 0));
        assert_eq!(find_child(&node, &alloc, 3), (0, 3));
        assert_eq!(find_child(&node, &alloc, 4), (1, 0));
        assert_eq!(find_child(&node, &alloc, 6), (1, 2));
    }

    #[test]
    fn conversion_to_general_preserves_boundaries() {
        let mut alloc = SlabAlloc::new();
        let mut node = build_compact(&mut alloc, 4, &[4, 4, 2], 10);

        let offsets = ensure_writable_offsets(&mut node, &mut alloc).unwrap();

        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets.get(&alloc, 0), 4);
        assert_eq!(offsets.get(&alloc, 1), 8);
        assert!(matches!(inner_form(&node, &alloc), InnerForm::General(_)));

        for k in 0..10 {
            let expected = (k / 4, k % 4);
            assert_eq!(find_child(&node, &alloc, k), expected, "element {}", k);
        }
    }

    #[test]
    fn bump_total_moves_by_two() {
        let mut alloc = SlabAlloc::new();
        let mut node = build_compact(&mut alloc, 4, &[4, 1], 5);

        bump_total(&mut node, &mut alloc, 1).unwrap();
        assert_eq!(total_elems(&node, &alloc), 6);

        bump_total(&mut node, &mut alloc, -1).unwrap();
        assert_eq!(total_elems(&node, &alloc), 5);

        set_total_elems(&mut node, &mut alloc, 0).unwrap();
        assert_eq!(node.get(&alloc, node.len() - 1), 1);
    }

    #[test]
    fn find_leaf_descends_to_the_right_leaf() {
        let mut alloc = SlabAlloc::new();
        let node = build_compact(&mut alloc, 4, &[4, 3], 7);

        let (leaf_ref, ndx) = find_leaf(&alloc, node.node_ref(), 5);

        assert_eq!(leaf_ref, node.get_as_ref(&alloc, 2));
        assert_eq!(ndx, 1);

        let leaf = Array::from_ref(&alloc, leaf_ref);
        assert_eq!(leaf.get(&alloc, ndx), 1);
    }

    #[test]
    fn find_leaf_on_leaf_root_is_identity() {
        let mut alloc = SlabAlloc::new();
        let mut leaf = Array::create(&mut alloc, NodeKind::Normal, false).unwrap();
        leaf.add(&mut alloc, 9).unwrap();

        assert_eq!(find_leaf(&alloc, leaf.node_ref(), 0), (leaf.node_ref(), 0));
    }

    #[test]
    fn total_slot_stays_odd() {
        // The total slot shares the tagging discipline with embedded
        // integers: stored value 2n+1 is always odd.
        assert_eq!(int_to_tagged(5), 11);
        let mut alloc = SlabAlloc::new();
        let node = build_compact(&mut alloc, 4, &[4, 1], 5);
        assert_eq!(node.get(&alloc, node.len() - 1) % 2, 1);
    }
}
