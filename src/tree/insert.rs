//! # Insertion With Splits
//!
//! Insertion descends to the target leaf; a full leaf splits off a sibling
//! and the `(split_offset, split_size, sibling_ref)` triple climbs back up
//! the recursion, where each inner node integrates the new child slot,
//! possibly splitting itself. A split that reaches the root grows the tree
//! by one level.
//!
//! ## Split Shapes
//!
//! Appending at the very end of a full leaf puts only the new value in the
//! sibling, so sequential loads leave behind completely full leaves and a
//! compact-form tree. A split anywhere else moves the tail `[ndx..)` into
//! the sibling and appends the new value to the original. The same pattern
//! repeats one level up for child slots.
//!
//! ## Form Discipline
//!
//! Only end-of-subtree appends preserve compact form. Any other descent
//! converts the node to general form on the way down, so a general node
//! never ends up below a compact one.

use eyre::Result;

use super::node::{
    adjust_offsets_from, bump_total, child_count, elems_before_child, ensure_writable_offsets,
    find_child, inner_form, set_total_elems, total_elems, InnerForm,
};
use crate::alloc::{ref_to_slot, Ref, SlabAlloc};
use crate::array::{Array, NodeKind};

/// Split description handed from a split child to its parent: the child
/// retained `split_offset` elements and its subtree now holds `split_size`
/// elements in total (sibling included).
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeInsert {
    pub split_offset: usize,
    pub split_size: usize,
}

/// Inserts into a leaf, splitting when it is at `max_leaf` elements.
/// Returns the new sibling's ref on a split.
pub(crate) fn leaf_insert(
    alloc: &mut SlabAlloc,
    leaf: &mut Array,
    elem_ndx: Option<usize>,
    value: i64,
    max_leaf: usize,
    state: &mut TreeInsert,
) -> Result<Option<Ref>> {
    let leaf_size = leaf.len();
    let ndx = elem_ndx.unwrap_or(leaf_size).min(leaf_size);

    if leaf_size < max_leaf {
        leaf.insert(alloc, ndx, value)?;
        return Ok(None);
    }

    let mut sibling = Array::create(alloc, leaf.kind(), leaf.context_flag())?;
    if let Err(e) = fill_split_leaf(alloc, leaf, &mut sibling, ndx, leaf_size, value, state) {
        sibling.destroy_deep(alloc);
        return Err(e);
    }
    state.split_size = leaf_size + 1;
    Ok(Some(sibling.node_ref()))
}

fn fill_split_leaf(
    alloc: &mut SlabAlloc,
    leaf: &mut Array,
    sibling: &mut Array,
    ndx: usize,
    leaf_size: usize,
    value: i64,
    state: &mut TreeInsert,
) -> Result<()> {
    if ndx == leaf_size {
        // Appending: the sibling receives only the new value.
        sibling.add(alloc, value)?;
        state.split_offset = ndx;
    } else {
        for i in ndx..leaf_size {
            let v = leaf.get(alloc, i);
            sibling.add(alloc, v)?;
        }
        leaf.truncate(alloc, ndx)?;
        leaf.add(alloc, value)?;
        state.split_offset = ndx + 1;
    }
    Ok(())
}

/// Recursive descent for insertion.
///
/// Returns the node's (possibly changed) ref and, when the node split, the
/// new sibling's ref with `state` describing the split. The caller owns the
/// slot pointing at this node and rewrites it from the returned ref.
pub(crate) fn insert_recurse(
    alloc: &mut SlabAlloc,
    node_ref: Ref,
    elem_ndx: Option<usize>,
    value: i64,
    max_leaf: usize,
    state: &mut TreeInsert,
) -> Result<(Ref, Option<Ref>)> {
    let mut node = Array::from_ref(alloc, node_ref);

    if !node.is_inner_bptree_node() {
        let sibling = leaf_insert(alloc, &mut node, elem_ndx, value, max_leaf, state)?;
        return Ok((node.node_ref(), sibling));
    }

    node.copy_on_write(alloc)?;
    let nchildren = child_count(&node);

    let (child_ndx, child_elem_ndx) = match elem_ndx {
        None => (nchildren - 1, None),
        Some(k) => {
            if k == total_elems(&node, alloc) {
                (nchildren - 1, None)
            } else {
                let (c, rem) = find_child(&node, alloc, k);
                (c, Some(rem))
            }
        }
    };

    // Any descent that is not an end-of-subtree append breaks compact
    // uniformity somewhere below; convert on the way down so general nodes
    // never hang under compact ones.
    if child_elem_ndx.is_some() {
        if let InnerForm::Compact(_) = inner_form(&node, alloc) {
            ensure_writable_offsets(&mut node, alloc)?;
        }
    }

    let child_ref = node.get_as_ref(alloc, 1 + child_ndx);
    let (new_child_ref, child_sibling) =
        insert_recurse(alloc, child_ref, child_elem_ndx, value, max_leaf, state)?;
    if new_child_ref != child_ref {
        node.set_as_ref(alloc, 1 + child_ndx, new_child_ref)?;
    }

    let Some(sibling_ref) = child_sibling else {
        if let InnerForm::General(_) = inner_form(&node, alloc) {
            let mut offsets = ensure_writable_offsets(&mut node, alloc)?;
            adjust_offsets_from(&mut offsets, alloc, child_ndx, 1)?;
        }
        bump_total(&mut node, alloc, 1)?;
        return Ok((node.node_ref(), None));
    };

    let node_sibling = insert_child(alloc, &mut node, child_ndx, sibling_ref, max_leaf, state)?;
    Ok((node.node_ref(), node_sibling))
}

/// Integrates a freshly split-off child into `node` right after
/// `orig_child_ndx`, splitting `node` itself when it is full.
fn insert_child(
    alloc: &mut SlabAlloc,
    node: &mut Array,
    orig_child_ndx: usize,
    new_sibling_ref: Ref,
    max_leaf: usize,
    state: &mut TreeInsert,
) -> Result<Option<Ref>> {
    let insert_ndx = orig_child_ndx + 1;
    let nchildren = child_count(node);
    let child_split_offset = state.split_offset;
    let child_split_size = state.split_size;

    // Compact form survives only the uniform append pattern: sibling goes
    // last and the split child retained a full complement.
    let compact_ok = match inner_form(node, &*alloc) {
        InnerForm::Compact(epc) => insert_ndx == nchildren && child_split_offset == epc,
        InnerForm::General(_) => true,
    };
    if !compact_ok {
        ensure_writable_offsets(node, alloc)?;
    }

    if nchildren < max_leaf {
        let boundary = elems_before_child(node, &*alloc, orig_child_ndx) + child_split_offset;

        if let InnerForm::General(_) = inner_form(node, &*alloc) {
            let mut offsets = ensure_writable_offsets(node, alloc)?;
            adjust_offsets_from(&mut offsets, alloc, orig_child_ndx, 1)?;
            offsets.insert(alloc, orig_child_ndx, boundary as i64)?;
        }

        node.insert(alloc, 1 + insert_ndx, ref_to_slot(new_sibling_ref))?;
        bump_total(node, alloc, 1)?;
        return Ok(None);
    }

    // Node is full: split it.
    let total_before = total_elems(node, alloc);
    let total_after = total_before + 1;
    let left_elems = elems_before_child(node, &*alloc, orig_child_ndx) + child_split_offset;
    let right_elems = total_after - left_elems;

    if insert_ndx == nchildren {
        // Appending: the sibling node receives only the new child, in the
        // same form as this node.
        let sibling = match inner_form(node, &*alloc) {
            InnerForm::Compact(epc) => {
                new_inner_node(alloc, Slot0::Compact(epc), new_sibling_ref, right_elems)?
            }
            InnerForm::General(_) => {
                new_inner_node(alloc, Slot0::EmptyOffsets, new_sibling_ref, right_elems)?
            }
        };
        set_total_elems(node, alloc, left_elems)?;
        state.split_offset = left_elems;
        state.split_size = total_after;
        return Ok(Some(sibling));
    }

    // Interior split: the node is in general form (converted during the
    // descent). The sibling node takes the new child plus every child after
    // the split position.
    let offsets = ensure_writable_offsets(node, alloc)?;

    let child_size = |alloc: &SlabAlloc, offsets: &Array, j: usize| -> usize {
        let before = if j == 0 { 0 } else { offsets.get(alloc, j - 1) as usize };
        let after = if j + 1 == nchildren {
            total_before
        } else {
            offsets.get(alloc, j) as usize
        };
        after - before
    };

    let mut right_children = vec![new_sibling_ref];
    let mut right_sizes = vec![child_split_size - child_split_offset];
    for j in insert_ndx..nchildren {
        right_children.push(node.get_as_ref(&*alloc, 1 + j));
        right_sizes.push(child_size(&*alloc, &offsets, j));
    }

    let sibling_ref = build_general_node(alloc, &right_children, &right_sizes, right_elems)?;

    // Shrink this node down to children [0, insert_ndx).
    let mut offsets = ensure_writable_offsets(node, alloc)?;
    offsets.truncate(alloc, insert_ndx - 1)?;
    for _ in insert_ndx..nchildren {
        node.erase(alloc, 1 + insert_ndx)?;
    }
    set_total_elems(node, alloc, left_elems)?;

    state.split_offset = left_elems;
    state.split_size = total_after;
    Ok(Some(sibling_ref))
}

enum Slot0 {
    Compact(usize),
    EmptyOffsets,
}

/// Builds a one-child inner node.
fn new_inner_node(
    alloc: &mut SlabAlloc,
    slot0: Slot0,
    child_ref: Ref,
    total: usize,
) -> Result<Ref> {
    let mut node = Array::create(alloc, NodeKind::InnerBptree, false)?;
    let mut offsets_ref = 0;

    let result = (|| -> Result<()> {
        match slot0 {
            Slot0::Compact(epc) => node.add(alloc, (2 * epc + 1) as i64)?,
            Slot0::EmptyOffsets => {
                let offsets = Array::create(alloc, NodeKind::Normal, false)?;
                offsets_ref = offsets.node_ref();
                node.add(alloc, ref_to_slot(offsets_ref))?;
            }
        }
        node.add(alloc, ref_to_slot(child_ref))?;
        node.add(alloc, (2 * total + 1) as i64)?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(node.node_ref()),
        Err(e) => {
            // The child is owned by the caller; free only what was built
            // here.
            if offsets_ref != 0 {
                Array::destroy_deep_ref(alloc, offsets_ref);
            }
            node.destroy(alloc);
            Err(e)
        }
    }
}

/// Builds a general-form inner node over existing children with the given
/// subtree sizes.
fn build_general_node(
    alloc: &mut SlabAlloc,
    children: &[Ref],
    sizes: &[usize],
    total: usize,
) -> Result<Ref> {
    debug_assert_eq!(children.len(), sizes.len());

    let mut node = Array::create(alloc, NodeKind::InnerBptree, false)?;
    let mut offsets = match Array::create(alloc, NodeKind::Normal, false) {
        Ok(o) => o,
        Err(e) => {
            node.destroy(alloc);
            return Err(e);
        }
    };

    let result = (|| -> Result<()> {
        let mut prefix = 0;
        for &size in &sizes[..sizes.len() - 1] {
            prefix += size;
            offsets.add(alloc, prefix as i64)?;
        }
        node.add(alloc, ref_to_slot(offsets.node_ref()))?;
        for &child in children {
            node.add(alloc, ref_to_slot(child))?;
        }
        node.add(alloc, (2 * total + 1) as i64)?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(node.node_ref()),
        Err(e) => {
            // Children stay with the original tree; free the scaffolding.
            offsets.destroy_deep(alloc);
            node.destroy(alloc);
            Err(e)
        }
    }
}

/// Installs a new root above a split root, growing the tree by one level.
///
/// The new root is compact only when the split was an append and the old
/// root was itself a leaf or compact; otherwise its children's subtrees are
/// not uniform and it gets an offsets array with the single boundary.
pub(crate) fn introduce_new_root(
    alloc: &mut SlabAlloc,
    old_root_ref: Ref,
    sibling_ref: Ref,
    state: &TreeInsert,
    is_append: bool,
) -> Result<Ref> {
    let old_root = Array::from_ref(alloc, old_root_ref);
    let compact_form =
        is_append && (!old_root.is_inner_bptree_node() || old_root.get(alloc, 0) % 2 != 0);

    let mut new_root = Array::create(alloc, NodeKind::InnerBptree, false)?;
    let mut offsets_ref = 0;

    let result = (|| -> Result<()> {
        if compact_form {
            new_root.add(alloc, (2 * state.split_offset + 1) as i64)?;
        } else {
            let mut offsets = Array::create(alloc, NodeKind::Normal, false)?;
            offsets_ref = offsets.node_ref();
            offsets.add(alloc, state.split_offset as i64)?;
            new_root.add(alloc, ref_to_slot(offsets_ref))?;
        }
        new_root.add(alloc, ref_to_slot(old_root_ref))?;
        new_root.add(alloc, ref_to_slot(sibling_ref))?;
        new_root.add(alloc, (2 * state.split_size + 1) as i64)?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(new_root.node_ref()),
        Err(e) => {
            if offsets_ref != 0 {
                Array::destroy_deep_ref(alloc, offsets_ref);
            }
            new_root.destroy(alloc);
            Err(e)
        }
    }
}
