//! # packdb - Bit-Packed Embedded Storage Engine Core
//!
//! packdb implements the on-disk storage core of an embedded database: a
//! bit-packed variable-width array node, a copy-on-write slab allocator over
//! a single memory-mapped file, and a B+-tree protocol layered on top. Every
//! higher-level structure (integer columns, string columns, indices) is
//! materialized as a tree of these nodes inside one reference space.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Column facades (external clients)  │
//! ├─────────────────────────────────────┤
//! │  B+-tree protocol (tree)            │
//! ├─────────────────────────────────────┤
//! │  Array node (array)                 │
//! │  8 bit widths, copy-on-write        │
//! ├─────────────────────────────────────┤
//! │  Slab allocator (alloc)             │
//! │  mapped file + growable slab chain  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Reference space
//!
//! A `Ref` is an 8-byte-aligned offset into a single logical address space:
//! refs below the *baseline* resolve into the read-only mapped file, refs at
//! or above it resolve into writer-private heap slabs. Mutation of mapped
//! data is copy-on-write into a slab; a commit appends the slabs to the file
//! and atomically publishes the new root by flipping a one-byte selector
//! between two top-ref slots. An abrupt process death at any point leaves
//! the previously committed state intact.
//!
//! ## Compact storage
//!
//! Array elements are packed at one of eight bit widths (0, 1, 2, 4, 8, 16,
//! 32, 64) chosen to fit the current value range and promoted on demand.
//! Arrays flagged `has_refs` store child refs and embedded integers in the
//! same slots, disambiguated by the low bit: refs are even, integers are
//! shifted left once and tagged with bit 0.
//!
//! ## Module Overview
//!
//! - [`alloc`]: reference space, slab allocator, file header, commit path
//! - [`array`]: bit-packed array node with width-specialized operations
//! - [`tree`]: B+-tree descent, insert-with-split, erase, leaf traversal
//!
//! ## Concurrency Model
//!
//! Single writer, multiple readers. Readers map any committed file state;
//! the writer never mutates bytes below the baseline, so a reader observes
//! either the old root and everything reachable from it, or the new root and
//! everything reachable from that. The core itself performs no locking;
//! cross-process coordination belongs to the transaction layer above.

pub mod alloc;
pub mod array;
pub mod tree;

pub use alloc::{
    FileHeader, FreeSpaceInvalid, InvalidDatabase, OutOfMemory, Ref, RefOrTagged, SizeOverflow,
    SlabAlloc, FILE_FORMAT_VERSION, FILE_HEADER_SIZE, FILE_MAGIC,
};
pub use array::{Array, NodeKind, NodeParent, WidthType, HEADER_SIZE, MAX_PAYLOAD};
pub use tree::{BpTree, LeafInfo, LeafVisitor, TreeInsert, DEFAULT_MAX_LEAF};
