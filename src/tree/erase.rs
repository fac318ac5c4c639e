//! # Erasure
//!
//! Erasing a global element index descends to the leaf, removes the element
//! through the leaf handler, and unwinds: every inner node on the path
//! decrements its offsets tail and total slot, and a child whose subtree
//! became empty loses its slot entirely. When the cascade empties the root's
//! last child the tree collapses back to an empty leaf, and a root left with
//! a single child is replaced by its sole descendant (best effort; a
//! completed erase is never rolled back by cleanup trouble).
//!
//! ## Write Discipline
//!
//! Nodes on the descent path are copied on write going down, and a node
//! still in compact form is converted to general form before recursing into
//! any position that is not the end of its subtree. The offsets array is
//! made writable before the child recursion, so the unwind's decrements are
//! plain in-place writes that cannot allocate and cannot fail.

use eyre::Result;

use super::node::{
    adjust_offsets_from, bump_total, child_count, ensure_writable_offsets, find_child, inner_form,
    total_elems, InnerForm,
};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;

/// Per-leaf erase logic supplied by the layer that owns the leaves.
///
/// The engine's own integer leaves use [`IntLeafEraser`]; column layers with
/// richer leaf encodings implement this to keep tree geometry out of their
/// code.
pub trait EraseLeafHandler {
    /// Erases element `ndx` from the leaf, reporting the leaf's possibly
    /// changed ref and whether it is now empty.
    fn erase_leaf_elem(
        &mut self,
        alloc: &mut SlabAlloc,
        leaf_ref: Ref,
        ndx: usize,
    ) -> Result<(Ref, bool)>;

    /// Frees a leaf whose last element was just erased.
    fn destroy_leaf(&mut self, alloc: &mut SlabAlloc, leaf_ref: Ref);
}

/// Erase handler for plain integer leaves.
#[derive(Debug, Default)]
pub struct IntLeafEraser;

impl EraseLeafHandler for IntLeafEraser {
    fn erase_leaf_elem(
        &mut self,
        alloc: &mut SlabAlloc,
        leaf_ref: Ref,
        ndx: usize,
    ) -> Result<(Ref, bool)> {
        let mut leaf = Array::from_ref(alloc, leaf_ref);
        leaf.erase(alloc, ndx)?;
        Ok((leaf.node_ref(), leaf.is_empty()))
    }

    fn destroy_leaf(&mut self, alloc: &mut SlabAlloc, leaf_ref: Ref) {
        Array::destroy_deep_ref(alloc, leaf_ref);
    }
}

/// Recursive erase. Returns the node's (possibly changed) ref and whether
/// its subtree is now empty.
pub(crate) fn erase_recurse(
    alloc: &mut SlabAlloc,
    node_ref: Ref,
    elem_ndx: usize,
    handler: &mut dyn EraseLeafHandler,
) -> Result<(Ref, bool)> {
    let node = Array::from_ref(alloc, node_ref);
    if !node.is_inner_bptree_node() {
        return handler.erase_leaf_elem(alloc, node_ref, elem_ndx);
    }
    let mut node = node;

    node.copy_on_write(alloc)?;

    // Erasing anywhere but the end of this subtree breaks compact
    // uniformity; convert before recursing.
    if elem_ndx + 1 != total_elems(&node, alloc) {
        if let InnerForm::Compact(_) = inner_form(&node, alloc) {
            ensure_writable_offsets(&mut node, alloc)?;
        }
    }

    let (child_ndx, ndx_in_child) = find_child(&node, alloc, elem_ndx);

    // Make the offsets writable before descending: the unwind below only
    // performs in-place decrements, which must not be able to fail.
    let general = matches!(inner_form(&node, alloc), InnerForm::General(_));
    if general {
        ensure_writable_offsets(&mut node, alloc)?;
    }

    let child_ref = node.get_as_ref(alloc, 1 + child_ndx);
    let child_is_leaf = !Array::from_ref(alloc, child_ref).is_inner_bptree_node();
    let (new_child_ref, child_empty) = erase_recurse(alloc, child_ref, ndx_in_child, handler)?;

    if child_empty {
        if child_is_leaf {
            handler.destroy_leaf(alloc, new_child_ref);
        } else {
            Array::destroy_deep_ref(alloc, new_child_ref);
        }
        node.erase(alloc, 1 + child_ndx)?;

        if general {
            let mut offsets = ensure_writable_offsets(&mut node, alloc)?;
            if child_ndx < offsets.len() {
                offsets.erase(alloc, child_ndx)?;
                adjust_offsets_from(&mut offsets, alloc, child_ndx, -1)?;
            } else if child_ndx > 0 {
                // The last child carries no boundary entry of its own; the
                // one preceding it goes instead, and there is no tail left
                // to decrement.
                offsets.erase(alloc, child_ndx - 1)?;
            }
        }
    } else {
        if new_child_ref != child_ref {
            node.set_as_ref(alloc, 1 + child_ndx, new_child_ref)?;
        }
        if general {
            let mut offsets = ensure_writable_offsets(&mut node, alloc)?;
            adjust_offsets_from(&mut offsets, alloc, child_ndx, -1)?;
        }
    }

    bump_total(&mut node, alloc, -1)?;

    // Slot 0 and the total slot remain even when every child is gone.
    let empty = node.len() <= 2;
    Ok((node.node_ref(), empty))
}

/// Replaces a single-child root with its sole descendant chain: either the
/// first node with two or more children, or the leaf at the bottom.
///
/// Bypassed inner nodes (and their offsets arrays) are freed; the surviving
/// subtree is untouched. Must only be called when cleanup failure is
/// acceptable: the erase that preceded it is already complete.
pub(crate) fn eliminate_superfluous_root(alloc: &mut SlabAlloc, root: Ref) -> Result<Ref> {
    let mut current = root;
    loop {
        let node = Array::from_ref(alloc, current);
        if !node.is_inner_bptree_node() {
            return Ok(current);
        }
        if child_count(&node) >= 2 {
            return Ok(current);
        }

        let child = node.get_as_ref(alloc, 1);
        if let InnerForm::General(offsets_ref) = inner_form(&node, alloc) {
            Array::destroy_deep_ref(alloc, offsets_ref);
        }
        node.destroy(alloc);
        current = child;
    }
}
