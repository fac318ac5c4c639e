//! # Leaf Traversal
//!
//! Depth-first traversal primitives that hand each leaf to a caller-supplied
//! handler without exposing tree geometry. Column layers use these to
//! implement scans, bulk reads and in-place element updates over their own
//! leaf encodings.
//!
//! `foreach_leaf` computes each leaf's global element offset from the inner
//! nodes' compact fan-out or offsets arrays and can skip whole subtrees that
//! end before the requested start offset. It never consults the trailing
//! total slot, so it keeps working if that field is dropped from the format.
//! `simplified_foreach_leaf` skips the offset bookkeeping entirely (and with
//! it the ability to start mid-sequence).

use eyre::Result;

use super::node::{child_count, elems_before_child, find_child};
use crate::alloc::{Ref, SlabAlloc};
use crate::array::Array;

/// One leaf as seen during traversal.
#[derive(Debug, Clone, Copy)]
pub struct LeafInfo {
    pub leaf_ref: Ref,
    /// Ref of the parent inner node, or 0 when the leaf is the root.
    pub parent_ref: Ref,
    /// Slot index within the parent, or 0 when the leaf is the root.
    pub ndx_in_parent: usize,
    /// Global index of the leaf's first element. Zero in simplified
    /// traversals.
    pub offset: usize,
    pub size: usize,
}

/// Receives leaves during traversal; returning `false` stops the walk.
pub trait LeafVisitor {
    fn visit(&mut self, alloc: &SlabAlloc, leaf: &LeafInfo) -> Result<bool>;
}

impl<F: FnMut(&SlabAlloc, &LeafInfo) -> Result<bool>> LeafVisitor for F {
    fn visit(&mut self, alloc: &SlabAlloc, leaf: &LeafInfo) -> Result<bool> {
        self(alloc, leaf)
    }
}

/// Depth-first walk over every leaf whose element range ends at or after
/// `start_offset`. Returns whether the walk ran to completion.
pub fn foreach_leaf(
    alloc: &SlabAlloc,
    root: Ref,
    start_offset: usize,
    visitor: &mut dyn LeafVisitor,
) -> Result<bool> {
    let (keep_going, _) = walk(alloc, root, 0, 0, 0, start_offset, visitor)?;
    Ok(keep_going)
}

fn walk(
    alloc: &SlabAlloc,
    node_ref: Ref,
    parent_ref: Ref,
    ndx_in_parent: usize,
    node_offset: usize,
    start_offset: usize,
    visitor: &mut dyn LeafVisitor,
) -> Result<(bool, usize)> {
    let node = Array::from_ref(alloc, node_ref);

    if !node.is_inner_bptree_node() {
        let size = node.len();
        if node_offset + size <= start_offset {
            return Ok((true, size));
        }
        let info = LeafInfo {
            leaf_ref: node_ref,
            parent_ref,
            ndx_in_parent,
            offset: node_offset,
            size,
        };
        return Ok((visitor.visit(alloc, &info)?, size));
    }

    let nchildren = child_count(&node);
    let mut child_offset = node_offset;
    let mut subtree_size = 0;

    for i in 0..nchildren {
        // All but the last child have a span known from the node itself;
        // skip whole subtrees that end before the start offset. The last
        // child's span would require the total slot, so it recurses and its
        // leaves are skipped individually.
        if i + 1 < nchildren {
            let span =
                elems_before_child(&node, alloc, i + 1) - elems_before_child(&node, alloc, i);
            if child_offset + span <= start_offset {
                child_offset += span;
                subtree_size += span;
                continue;
            }
        }

        let child_ref = node.get_as_ref(alloc, 1 + i);
        let (keep_going, child_size) = walk(
            alloc,
            child_ref,
            node_ref,
            1 + i,
            child_offset,
            start_offset,
            visitor,
        )?;
        child_offset += child_size;
        subtree_size += child_size;
        if !keep_going {
            return Ok((false, subtree_size));
        }
    }

    Ok((true, subtree_size))
}

/// Depth-first walk over every leaf, without offset bookkeeping.
///
/// Leaves are reported with `offset` 0; offsets arrays are never consulted.
/// Returns whether the walk ran to completion.
pub fn simplified_foreach_leaf(
    alloc: &SlabAlloc,
    root: Ref,
    visitor: &mut dyn LeafVisitor,
) -> Result<bool> {
    walk_simple(alloc, root, 0, 0, visitor)
}

fn walk_simple(
    alloc: &SlabAlloc,
    node_ref: Ref,
    parent_ref: Ref,
    ndx_in_parent: usize,
    visitor: &mut dyn LeafVisitor,
) -> Result<bool> {
    let node = Array::from_ref(alloc, node_ref);

    if !node.is_inner_bptree_node() {
        let info = LeafInfo {
            leaf_ref: node_ref,
            parent_ref,
            ndx_in_parent,
            offset: 0,
            size: node.len(),
        };
        return visitor.visit(alloc, &info);
    }

    for i in 0..child_count(&node) {
        let child_ref = node.get_as_ref(alloc, 1 + i);
        if !walk_simple(alloc, child_ref, node_ref, 1 + i, visitor)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Mutates a single leaf element in place.
///
/// Receives the leaf holding the element and the element's index within it;
/// returns the leaf's possibly changed ref so the path can be rewritten.
pub trait UpdateHandler {
    fn update(&mut self, alloc: &mut SlabAlloc, leaf_ref: Ref, ndx_in_leaf: usize) -> Result<Ref>;
}

impl<F: FnMut(&mut SlabAlloc, Ref, usize) -> Result<Ref>> UpdateHandler for F {
    fn update(&mut self, alloc: &mut SlabAlloc, leaf_ref: Ref, ndx_in_leaf: usize) -> Result<Ref> {
        self(alloc, leaf_ref, ndx_in_leaf)
    }
}

/// Descends to the leaf holding global element `elem_ndx` and applies
/// `handler`, copy-on-writing the path and rewriting child slots on the way
/// back up. Returns the root's possibly changed ref.
pub fn update_elem(
    alloc: &mut SlabAlloc,
    root: Ref,
    elem_ndx: usize,
    handler: &mut dyn UpdateHandler,
) -> Result<Ref> {
    let mut node = Array::from_ref(alloc, root);

    if !node.is_inner_bptree_node() {
        return handler.update(alloc, root, elem_ndx);
    }

    node.copy_on_write(alloc)?;
    let (child_ndx, ndx_in_child) = find_child(&node, alloc, elem_ndx);
    let child_ref = node.get_as_ref(alloc, 1 + child_ndx);

    let new_child_ref = update_elem(alloc, child_ref, ndx_in_child, handler)?;
    if new_child_ref != child_ref {
        node.set_as_ref(alloc, 1 + child_ndx, new_child_ref)?;
    }
    Ok(node.node_ref())
}
