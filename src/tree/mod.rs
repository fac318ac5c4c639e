//! # B+-Tree Protocol
//!
//! This module layers a B+-tree over array nodes: a client-visible sequence
//! of elements, addressed by global index, stored in leaves of bounded size
//! under a balanced hierarchy of inner nodes.
//!
//! ## Structure
//!
//! ```text
//!                [inner: slot0 | c0 c1 c2 | total]
//!               /            |             \
//!        [leaf 0..k)   [leaf k..2k)   [leaf 2k..n)
//! ```
//!
//! Inner nodes come in two encodings. *Compact* nodes store a single
//! elems-per-child figure in slot 0 (descent is a division) and exist as
//! long as every child except the last is full, which is exactly what
//! sequential appends produce. *General* nodes store a ref to an offsets
//! array holding explicit boundaries, and descent is a binary search. Compact
//! nodes convert to general the first time uniformity would break, and the
//! conversion runs top-down so a general node never sits below a compact
//! one.
//!
//! ## Structural Invariants
//!
//! - every inner node has at least one child
//! - every non-root leaf holds at least one element
//! - all leaves sit at the same depth
//! - a compact inner node's parent is compact
//!
//! [`BpTree::verify`] walks the tree and checks all of these plus the
//! consistency of offsets arrays and total slots; tests lean on it after
//! every mutation.
//!
//! ## Leaf Hooks
//!
//! Higher layers own their leaf encodings. The traversal primitives
//! ([`foreach_leaf`], [`simplified_foreach_leaf`], [`update_elem`]) and the
//! erase protocol accept handler traits so column code supplies per-leaf
//! logic without knowing tree geometry; the engine's own integer leaves are
//! the built-in implementation.
//!
//! ## Module Organization
//!
//! - `node`: inner-node codec, descent math, form conversion
//! - `insert`: leaf insert with split, split propagation, root growth
//! - `erase`: erase protocol, empty-child removal, root collapse
//! - `traverse`: leaf visitors and single-element update

mod erase;
mod insert;
mod node;
mod traverse;

pub use erase::{EraseLeafHandler, IntLeafEraser};
pub use insert::TreeInsert;
pub use node::find_leaf;
pub use traverse::{
    foreach_leaf, simplified_foreach_leaf, update_elem, LeafInfo, LeafVisitor, UpdateHandler,
};

use eyre::{ensure, Result};

use crate::alloc::{Ref, SlabAlloc};
use crate::array::{Array, NodeKind};
use erase::{eliminate_superfluous_root, erase_recurse};
use insert::{insert_recurse, introduce_new_root};
use node::{child_count, elems_before_child, inner_form, total_elems, InnerForm};

/// Default leaf capacity.
pub const DEFAULT_MAX_LEAF: usize = 1000;

/// A B+-tree of integer elements rooted at a single ref.
///
/// Borrows the allocator for its lifetime; the root ref is the only state,
/// so a client that holds a root across transactions reattaches with
/// [`BpTree::from_root`].
#[derive(Debug)]
pub struct BpTree<'a> {
    alloc: &'a mut SlabAlloc,
    root: Ref,
    max_leaf: usize,
}

impl<'a> BpTree<'a> {
    /// Creates an empty tree: a single empty leaf.
    pub fn create(alloc: &'a mut SlabAlloc, max_leaf: usize) -> Result<BpTree<'a>> {
        ensure!(max_leaf >= 2, "leaf capacity must be at least 2");
        let root = Array::create(alloc, NodeKind::Normal, false)?;
        let root_ref = root.node_ref();
        Ok(BpTree {
            alloc,
            root: root_ref,
            max_leaf,
        })
    }

    /// Attaches to an existing tree.
    pub fn from_root(alloc: &'a mut SlabAlloc, root: Ref, max_leaf: usize) -> BpTree<'a> {
        BpTree {
            alloc,
            root,
            max_leaf,
        }
    }

    /// The current root ref. Changes across mutations; a client owning the
    /// tree re-reads it after every call.
    pub fn root(&self) -> Ref {
        self.root
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        let root = Array::from_ref(self.alloc, self.root);
        if root.is_inner_bptree_node() {
            total_elems(&root, self.alloc)
        } else {
            root.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elem_count() == 0
    }

    /// Number of inner-node levels above the leaves.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut ref_ = self.root;
        loop {
            let node = Array::from_ref(self.alloc, ref_);
            if !node.is_inner_bptree_node() {
                return depth;
            }
            depth += 1;
            ref_ = node.get_as_ref(self.alloc, 1);
        }
    }

    /// Reads the element at global index `ndx`.
    pub fn get(&self, ndx: usize) -> Result<i64> {
        ensure!(
            ndx < self.elem_count(),
            "index {} out of bounds (count {})",
            ndx,
            self.elem_count()
        );
        let (leaf_ref, ndx_in_leaf) = find_leaf(self.alloc, self.root, ndx);
        let leaf = Array::from_ref(self.alloc, leaf_ref);
        Ok(leaf.get(self.alloc, ndx_in_leaf))
    }

    /// Inserts `value` before global index `ndx` (`ndx == count` appends).
    pub fn insert(&mut self, ndx: usize, value: i64) -> Result<()> {
        let count = self.elem_count();
        ensure!(ndx <= count, "index {} out of bounds (count {})", ndx, count);

        let elem_ndx = if ndx == count { None } else { Some(ndx) };
        let is_append = elem_ndx.is_none();
        let mut state = TreeInsert::default();

        let (new_root, sibling) = insert_recurse(
            self.alloc,
            self.root,
            elem_ndx,
            value,
            self.max_leaf,
            &mut state,
        )?;
        self.root = new_root;

        if let Some(sibling_ref) = sibling {
            self.root =
                introduce_new_root(self.alloc, new_root, sibling_ref, &state, is_append)?;
        }
        Ok(())
    }

    /// Appends `value`.
    pub fn push(&mut self, value: i64) -> Result<()> {
        let count = self.elem_count();
        self.insert(count, value)
    }

    /// Overwrites the element at global index `ndx`.
    pub fn set(&mut self, ndx: usize, value: i64) -> Result<()> {
        ensure!(
            ndx < self.elem_count(),
            "index {} out of bounds (count {})",
            ndx,
            self.elem_count()
        );
        let mut handler = |alloc: &mut SlabAlloc, leaf_ref: Ref, i: usize| -> Result<Ref> {
            let mut leaf = Array::from_ref(alloc, leaf_ref);
            leaf.set(alloc, i, value)?;
            Ok(leaf.node_ref())
        };
        self.root = update_elem(self.alloc, self.root, ndx, &mut handler)?;
        Ok(())
    }

    /// Erases the element at global index `ndx` using the integer-leaf
    /// handler.
    pub fn erase(&mut self, ndx: usize) -> Result<()> {
        self.erase_with(ndx, &mut IntLeafEraser)
    }

    /// Erases the element at global index `ndx` with a caller-supplied leaf
    /// handler.
    pub fn erase_with(&mut self, ndx: usize, handler: &mut dyn EraseLeafHandler) -> Result<()> {
        ensure!(
            ndx < self.elem_count(),
            "index {} out of bounds (count {})",
            ndx,
            self.elem_count()
        );

        let root = Array::from_ref(self.alloc, self.root);
        if !root.is_inner_bptree_node() {
            // A root leaf may become empty; it simply stays the root.
            let (new_ref, _) = handler.erase_leaf_elem(self.alloc, self.root, ndx)?;
            self.root = new_ref;
            return Ok(());
        }

        let (new_root, root_empty) = erase_recurse(self.alloc, self.root, ndx, handler)?;
        self.root = new_root;

        if root_empty {
            Array::destroy_deep_ref(self.alloc, self.root);
            let leaf = Array::create(self.alloc, NodeKind::Normal, false)?;
            self.root = leaf.node_ref();
            return Ok(());
        }

        // Cleanup only: the erase has succeeded and stays succeeded.
        if let Ok(collapsed) = eliminate_superfluous_root(self.alloc, self.root) {
            self.root = collapsed;
        }
        Ok(())
    }

    /// Visits every leaf whose range ends at or after `start_offset`;
    /// returns whether the walk ran to completion.
    pub fn visit_leaves(
        &self,
        start_offset: usize,
        visitor: &mut dyn LeafVisitor,
    ) -> Result<bool> {
        foreach_leaf(self.alloc, self.root, start_offset, visitor)
    }

    /// Frees the whole tree.
    pub fn destroy(self) {
        Array::destroy_deep_ref(self.alloc, self.root);
    }

    /// Checks every structural invariant of the tree.
    ///
    /// Verifies leaf capacity, non-empty leaves and inner nodes, uniform
    /// leaf depth, the compact/general form rule, offsets-array boundaries
    /// and total slots. Intended for tests and debug assertions.
    pub fn verify(&self) -> Result<()> {
        let root = Array::from_ref(self.alloc, self.root);
        if !root.is_inner_bptree_node() {
            ensure!(
                root.len() <= self.max_leaf,
                "root leaf exceeds leaf capacity"
            );
            return Ok(());
        }
        verify_node(self.alloc, self.root, true, None, self.max_leaf)?;
        Ok(())
    }
}

/// Recursive invariant check; returns (leaf depth, element count).
fn verify_node(
    alloc: &SlabAlloc,
    node_ref: Ref,
    is_root: bool,
    parent_form: Option<InnerForm>,
    max_leaf: usize,
) -> Result<(usize, usize)> {
    let node = Array::from_ref(alloc, node_ref);

    if !node.is_inner_bptree_node() {
        ensure!(node.len() <= max_leaf, "leaf exceeds capacity");
        ensure!(is_root || !node.is_empty(), "non-root leaf is empty");
        return Ok((0, node.len()));
    }

    ensure!(node.len() >= 3, "inner node without children");
    let nchildren = child_count(&node);
    let form = inner_form(&node, alloc);

    if let (InnerForm::General(_), Some(InnerForm::Compact(_))) = (form, parent_form) {
        eyre::bail!("general inner node below a compact parent");
    }

    if let InnerForm::General(offsets_ref) = form {
        ensure!(
            Array::from_ref(alloc, offsets_ref).len() == nchildren - 1,
            "offsets length disagrees with child count"
        );
    }

    let mut depth = None;
    let mut counted = 0;
    for i in 0..nchildren {
        let child_ref = node.get_as_ref(alloc, 1 + i);
        ensure!(child_ref != 0, "inner node child slot is not a ref");
        let (child_depth, child_elems) =
            verify_node(alloc, child_ref, false, Some(form), max_leaf)?;

        match depth {
            None => depth = Some(child_depth),
            Some(d) => ensure!(d == child_depth, "leaves at unequal depths"),
        }

        match form {
            InnerForm::Compact(epc) => {
                if i + 1 < nchildren {
                    ensure!(
                        child_elems == epc,
                        "compact child {} holds {} elements, expected {}",
                        i,
                        child_elems,
                        epc
                    );
                } else {
                    ensure!(child_elems <= epc, "compact last child overflows");
                }
            }
            InnerForm::General(_) => {
                ensure!(
                    elems_before_child(&node, alloc, i) == counted,
                    "offsets entry for child {} does not match child sizes",
                    i
                );
            }
        }
        counted += child_elems;
    }

    ensure!(
        total_elems(&node, alloc) == counted,
        "total slot disagrees with child sizes"
    );
    Ok((depth.unwrap_or(0) + 1, counted))
}
