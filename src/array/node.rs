//! # Array Node Accessor
//!
//! `Array` is a transient, cached view of one node in the reference space.
//! It caches the parsed header (size, width, flags, capacity) and the value
//! bounds of the current width; the bytes themselves are translated through
//! the allocator on every operation, so an accessor never outlives a remap.
//!
//! ## Copy-On-Write
//!
//! Every mutating operation first ensures the node is writable. A node below
//! the allocator baseline is copied into a slab (with a little growth slack),
//! the copy's capacity field is set, and the original ref is freed so the
//! space can be reclaimed at the next commit. The accessor then points at the
//! new ref; whoever holds the old ref in a slot must be updated, which inner
//! operations do on their own stack frame and root owners do through the
//! [`NodeParent`] capability.
//!
//! ## Width Promotion
//!
//! A value outside the current width's bounds promotes the node to the
//! smallest width that holds it. Promotion re-encodes every element in
//! place, reading through the old width while writing through the new one,
//! back to front. Width never shrinks except on `truncate` to zero.
//!
//! ## Ownership
//!
//! A `has_refs` array owns the subtrees behind its even, nonzero slots.
//! `destroy_deep`, `truncate_and_destroy_children` and `clone_deep` walk
//! those slots recursively; zero slots (absent subtrees) and odd slots
//! (tagged integers) are skipped.

use eyre::{ensure, Result};
use smallvec::SmallVec;

use super::direct::{
    bit_width, dispatch_width, fill_direct, get_any, get_chunk, get_direct, lbound_for_width,
    set_any, set_direct, ubound_for_width,
};
use super::header::{self, WidthType, HEADER_SIZE, MAX_PAYLOAD};
use crate::alloc::{int_to_tagged, ref_to_slot, Ref, RefOrTagged, SizeOverflow, SlabAlloc};

/// First allocation for a fresh node, header included.
const INITIAL_CAPACITY: usize = 128;

/// Extra room added on copy-on-write so the copy can absorb a few more
/// elements before the next reallocation.
const COW_SLACK: usize = 64;

/// The three node types, encoded in two header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Plain element payload.
    Normal,
    /// Slots may hold child refs or tagged integers.
    HasRefs,
    /// A B+-tree inner node; implies `HasRefs`.
    InnerBptree,
}

impl NodeKind {
    fn flags(self) -> (bool, bool) {
        match self {
            NodeKind::Normal => (false, false),
            NodeKind::HasRefs => (false, true),
            NodeKind::InnerBptree => (true, true),
        }
    }
}

/// Capability a parent exposes so a child accessor can publish a ref change.
///
/// Implemented by root owners (column facades, tree handles). Structural
/// ownership lives only in the persisted slot; this trait is a notification
/// channel, not a lifetime edge.
pub trait NodeParent {
    fn get_child_ref(&self, ndx_in_parent: usize) -> Ref;
    fn update_child_ref(&mut self, ndx_in_parent: usize, new_ref: Ref) -> Result<()>;
}

/// A cached accessor for one array node.
#[derive(Debug, Clone)]
pub struct Array {
    ref_: Ref,
    size: usize,
    /// Item capacity of the current backing block. Read-only nodes report
    /// their size: any mutation must copy first.
    capacity: usize,
    width: u8,
    lbound: i64,
    ubound: i64,
    is_inner_bptree: bool,
    has_refs: bool,
    context_flag: bool,
}

impl Array {
    /// Attaches an accessor to an existing node.
    pub fn from_ref(alloc: &SlabAlloc, ref_: Ref) -> Array {
        debug_assert_ne!(ref_, 0, "cannot attach to the null ref");
        let block = alloc.block(ref_);
        let h = &block[..HEADER_SIZE];

        let width = header::width_from_header(h);
        let size = header::size_from_header(h);
        let capacity = if alloc.is_read_only(ref_) {
            size
        } else {
            calc_item_count(header::capacity_from_header(h), width)
        };

        Array {
            ref_,
            size,
            capacity,
            width,
            lbound: lbound_for_width(width),
            ubound: ubound_for_width(width),
            is_inner_bptree: header::is_inner_bptree_from_header(h),
            has_refs: header::has_refs_from_header(h),
            context_flag: header::context_flag_from_header(h),
        }
    }

    /// Creates an empty node of the given kind.
    pub fn create(alloc: &mut SlabAlloc, kind: NodeKind, context_flag: bool) -> Result<Array> {
        Self::create_with(alloc, kind, context_flag, WidthType::Bits, 0, 0)
    }

    /// Creates a node preformatted with `size` copies of `value`.
    pub fn create_with(
        alloc: &mut SlabAlloc,
        kind: NodeKind,
        context_flag: bool,
        wtype: WidthType,
        size: usize,
        value: i64,
    ) -> Result<Array> {
        ensure!(
            value == 0 || wtype == WidthType::Bits,
            "fill values require the bit-packed width scheme"
        );
        ensure!(
            size == 0 || wtype != WidthType::Ignore,
            "opaque nodes cannot be preformatted with elements"
        );

        let (is_inner, has_refs) = kind.flags();
        let width = if value == 0 { 0 } else { bit_width(value) };
        let needed = if value == 0 {
            HEADER_SIZE
        } else {
            calc_aligned_byte_size(size, width)?
        };
        let byte_size = needed.max(INITIAL_CAPACITY);

        let ref_ = alloc.alloc(byte_size)?;
        let block = alloc.block_mut(ref_);
        header::init_header(
            &mut block[..HEADER_SIZE],
            is_inner,
            has_refs,
            context_flag,
            wtype,
            width,
            size,
            byte_size,
        );
        if value != 0 {
            let data = &mut block[HEADER_SIZE..];
            dispatch_width!(width as usize, fill_direct(data, 0, size, value));
        }

        Ok(Array {
            ref_,
            size,
            capacity: calc_item_count(byte_size, width),
            width,
            lbound: lbound_for_width(width),
            ubound: ubound_for_width(width),
            is_inner_bptree: is_inner,
            has_refs,
            context_flag,
        })
    }

    pub fn node_ref(&self) -> Ref {
        self.ref_
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    pub fn is_inner_bptree_node(&self) -> bool {
        self.is_inner_bptree
    }

    pub fn context_flag(&self) -> bool {
        self.context_flag
    }

    pub fn kind(&self) -> NodeKind {
        if self.is_inner_bptree {
            NodeKind::InnerBptree
        } else if self.has_refs {
            NodeKind::HasRefs
        } else {
            NodeKind::Normal
        }
    }

    pub fn is_read_only(&self, alloc: &SlabAlloc) -> bool {
        alloc.is_read_only(self.ref_)
    }

    /// Total byte size (header plus payload) as encoded in the header.
    pub fn byte_size(&self, alloc: &SlabAlloc) -> usize {
        header::byte_size_from_header(&alloc.block(self.ref_)[..HEADER_SIZE])
    }

    pub(crate) fn payload<'a>(&self, alloc: &'a SlabAlloc) -> &'a [u8] {
        &alloc.block(self.ref_)[HEADER_SIZE..]
    }

    fn payload_mut<'a>(&self, alloc: &'a mut SlabAlloc) -> &'a mut [u8] {
        &mut alloc.block_mut(self.ref_)[HEADER_SIZE..]
    }

    /// Reads element `ndx`. The index must be in bounds.
    #[inline]
    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> i64 {
        debug_assert!(ndx < self.size, "index {} out of bounds (size {})", ndx, self.size);
        get_any(self.width, self.payload(alloc), ndx)
    }

    /// Decodes slot `ndx` of a `has_refs` array.
    #[inline]
    pub fn ref_or_tagged(&self, alloc: &SlabAlloc, ndx: usize) -> RefOrTagged {
        RefOrTagged::from_slot(self.get(alloc, ndx))
    }

    /// Reads slot `ndx` as a child ref; zero for absent or tagged slots.
    pub fn get_as_ref(&self, alloc: &SlabAlloc, ndx: usize) -> Ref {
        self.ref_or_tagged(alloc, ndx).as_ref().unwrap_or(0)
    }

    /// Reads up to 8 consecutive elements; slots past the end read zero.
    pub fn get_chunk(&self, alloc: &SlabAlloc, ndx: usize, res: &mut [i64; 8]) {
        let data = self.payload(alloc);
        let size = self.size;
        dispatch_width!(self.width as usize, get_chunk(data, size, ndx, res));
    }

    /// Writes element `ndx`, promoting width and copying on write as needed.
    /// A write of the current value is a no-op.
    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        ensure!(ndx < self.size, "index {} out of bounds (size {})", ndx, self.size);

        if self.get(alloc, ndx) == value {
            return Ok(());
        }

        self.copy_on_write(alloc)?;
        self.ensure_minimum_width(alloc, value)?;

        let width = self.width;
        set_any(width, self.payload_mut(alloc), ndx, value);
        Ok(())
    }

    /// Writes a child ref into slot `ndx` using the even encoding.
    pub fn set_as_ref(&mut self, alloc: &mut SlabAlloc, ndx: usize, ref_: Ref) -> Result<()> {
        self.set(alloc, ndx, ref_to_slot(ref_))
    }

    /// Writes a tagged integer into slot `ndx`.
    pub fn set_tagged(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        self.set(alloc, ndx, int_to_tagged(value))
    }

    /// Inserts `value` at `ndx`, shifting the tail up by one.
    ///
    /// When the value forces a width promotion, the tail shift re-reads
    /// through the old width while writing through the new one, and the
    /// prefix is re-encoded afterwards, back to front. Without promotion at
    /// byte-sized widths the shift is a single memmove.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> Result<()> {
        ensure!(ndx <= self.size, "index {} out of bounds (size {})", ndx, self.size);

        let old_width = self.width;
        let do_expand = value < self.lbound || value > self.ubound;
        let new_width = if do_expand { bit_width(value) } else { old_width };

        self.alloc_node(alloc, self.size + 1, new_width)?;
        self.set_width(new_width);

        let size = self.size;
        let data = self.payload_mut(alloc);

        if do_expand || new_width < 8 {
            let mut i = size;
            while i > ndx {
                i -= 1;
                let v = get_any(old_width, data, i);
                set_any(new_width, data, i + 1, v);
            }
        } else if ndx != size {
            let w = new_width as usize / 8;
            data.copy_within(ndx * w..size * w, (ndx + 1) * w);
        }

        set_any(new_width, data, ndx, value);

        if do_expand {
            let mut i = ndx;
            while i != 0 {
                i -= 1;
                let v = get_any(old_width, data, i);
                set_any(new_width, data, i, v);
            }
        }

        self.size += 1;
        Ok(())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        self.insert(alloc, self.size, value)
    }

    /// Removes element `ndx`, shifting the tail down. Width never shrinks.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> Result<()> {
        ensure!(ndx < self.size, "index {} out of bounds (size {})", ndx, self.size);

        self.copy_on_write(alloc)?;

        let width = self.width;
        let size = self.size;
        let data = self.payload_mut(alloc);

        if width < 8 {
            for i in ndx..size - 1 {
                let v = get_any(width, data, i + 1);
                set_any(width, data, i, v);
            }
        } else {
            let w = width as usize / 8;
            data.copy_within((ndx + 1) * w..size * w, ndx * w);
        }

        self.size -= 1;
        let block = alloc.block_mut(self.ref_);
        header::set_size_in_header(&mut block[..HEADER_SIZE], self.size);
        Ok(())
    }

    /// Shrinks the node to `new_size` elements. Shrinking to zero resets the
    /// width to 0.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> Result<()> {
        ensure!(
            new_size <= self.size,
            "truncate target {} exceeds size {}",
            new_size,
            self.size
        );
        if new_size == self.size {
            return Ok(());
        }

        self.copy_on_write(alloc)?;

        self.size = new_size;
        let block = alloc.block_mut(self.ref_);
        header::set_size_in_header(&mut block[..HEADER_SIZE], new_size);

        if new_size == 0 {
            header::set_width_in_header(&mut block[..HEADER_SIZE], 0);
            let byte_capacity = header::capacity_from_header(&block[..HEADER_SIZE]);
            self.capacity = calc_item_count(byte_capacity, 0);
            self.set_width(0);
        }
        Ok(())
    }

    /// Like [`truncate`](Array::truncate), but first deep-destroys the child
    /// subtrees behind the dropped slots.
    pub fn truncate_and_destroy_children(
        &mut self,
        alloc: &mut SlabAlloc,
        new_size: usize,
    ) -> Result<()> {
        ensure!(
            new_size <= self.size,
            "truncate target {} exceeds size {}",
            new_size,
            self.size
        );
        if new_size == self.size {
            return Ok(());
        }

        self.copy_on_write(alloc)?;

        if self.has_refs {
            self.destroy_children(alloc, new_size);
        }

        self.size = new_size;
        let block = alloc.block_mut(self.ref_);
        header::set_size_in_header(&mut block[..HEADER_SIZE], new_size);

        if new_size == 0 {
            header::set_width_in_header(&mut block[..HEADER_SIZE], 0);
            let byte_capacity = header::capacity_from_header(&block[..HEADER_SIZE]);
            self.capacity = calc_item_count(byte_capacity, 0);
            self.set_width(0);
        }
        Ok(())
    }

    fn destroy_children(&self, alloc: &mut SlabAlloc, offset: usize) {
        for i in offset..self.size {
            // Zero slots are absent subtrees, odd slots are tagged integers.
            if let RefOrTagged::Ref(child) = self.ref_or_tagged(alloc, i) {
                Self::destroy_deep_ref(alloc, child);
            }
        }
    }

    /// Frees this node only.
    pub fn destroy(self, alloc: &mut SlabAlloc) {
        alloc.free(self.ref_);
    }

    /// Frees this node and every subtree it owns.
    pub fn destroy_deep(self, alloc: &mut SlabAlloc) {
        if self.has_refs {
            self.destroy_children(alloc, 0);
        }
        alloc.free(self.ref_);
    }

    /// Frees the subtree rooted at `ref_`.
    pub fn destroy_deep_ref(alloc: &mut SlabAlloc, ref_: Ref) {
        let arr = Array::from_ref(alloc, ref_);
        arr.destroy_deep(alloc);
    }

    /// Copies the node into a slab if it currently lives below the baseline.
    pub fn copy_on_write(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        if !alloc.is_read_only(self.ref_) {
            return Ok(());
        }
        self.do_copy_on_write(alloc, 0)
    }

    fn do_copy_on_write(&mut self, alloc: &mut SlabAlloc, minimum_size: usize) -> Result<()> {
        let byte_size = self.byte_size(alloc);
        let mut new_size = byte_size.max(minimum_size);
        new_size = (new_size + 7) & !7;
        if new_size < MAX_PAYLOAD - COW_SLACK {
            new_size += COW_SLACK;
        }

        let new_ref = alloc.alloc(new_size)?;

        let old_ref = self.ref_;
        let content: Vec<u8> = alloc.block(old_ref)[..byte_size].to_vec();
        let block = alloc.block_mut(new_ref);
        block[..byte_size].copy_from_slice(&content);
        header::set_capacity_in_header(&mut block[..HEADER_SIZE], new_size);

        self.ref_ = new_ref;
        self.capacity = calc_item_count(new_size, self.width);

        // The original becomes reclaimable at the next commit.
        alloc.free(old_ref);
        Ok(())
    }

    /// Ensures capacity for `init_size` elements at `width`, reallocating and
    /// copying on write as needed, and records the new size in the header.
    ///
    /// Capacity grows by doubling, clamped to the maximum payload; when
    /// doubling is insufficient the allocation is sized to fit exactly.
    fn alloc_node(&mut self, alloc: &mut SlabAlloc, init_size: usize, width: u8) -> Result<()> {
        let needed_bytes = calc_byte_len(init_size, width)?;

        if alloc.is_read_only(self.ref_) {
            self.do_copy_on_write(alloc, needed_bytes)?;
        }

        if self.capacity < init_size || width != self.width {
            let block = alloc.block(self.ref_);
            let orig_capacity_bytes = header::capacity_from_header(&block[..HEADER_SIZE]);
            let capacity_bytes = orig_capacity_bytes;

            if capacity_bytes < needed_bytes {
                let mut capacity_bytes = capacity_bytes.saturating_mul(2).min(MAX_PAYLOAD);
                if capacity_bytes < needed_bytes {
                    capacity_bytes = (needed_bytes + 7) & !7;
                }

                let new_ref = alloc.realloc(self.ref_, orig_capacity_bytes, capacity_bytes)?;
                self.ref_ = new_ref;

                let block = alloc.block_mut(new_ref);
                let h = &mut block[..HEADER_SIZE];
                header::set_width_in_header(h, width);
                header::set_size_in_header(h, init_size);
                header::set_capacity_in_header(h, capacity_bytes);
                self.capacity = calc_item_count(capacity_bytes, width);
                return Ok(());
            }

            self.capacity = calc_item_count(capacity_bytes, width);
            let block = alloc.block_mut(self.ref_);
            header::set_width_in_header(&mut block[..HEADER_SIZE], width);
        }

        let block = alloc.block_mut(self.ref_);
        header::set_size_in_header(&mut block[..HEADER_SIZE], init_size);
        Ok(())
    }

    fn set_width(&mut self, width: u8) {
        self.width = width;
        self.lbound = lbound_for_width(width);
        self.ubound = ubound_for_width(width);
    }

    /// Promotes the node so `value` becomes storable. No-op when the value
    /// already fits the current width.
    pub fn ensure_minimum_width(&mut self, alloc: &mut SlabAlloc, value: i64) -> Result<()> {
        if value >= self.lbound && value <= self.ubound {
            return Ok(());
        }

        let old_width = self.width;
        let new_width = bit_width(value);
        debug_assert!(new_width > old_width);

        self.alloc_node(alloc, self.size, new_width)?;
        self.set_width(new_width);

        // Re-encode in place, back to front so old encodings are consumed
        // before their bytes are overwritten.
        let size = self.size;
        let data = self.payload_mut(alloc);
        let mut i = size;
        while i != 0 {
            i -= 1;
            let v = get_any(old_width, data, i);
            set_any(new_width, data, i, v);
        }
        Ok(())
    }

    /// For each element `>= limit`, adds `diff`.
    ///
    /// When an adjusted value forces a width promotion mid-scan, the scan
    /// restarts its width-specialized loop at the triggering index; already
    /// adjusted elements stay adjusted.
    pub fn adjust_ge(&mut self, alloc: &mut SlabAlloc, limit: i64, diff: i64) -> Result<()> {
        if diff == 0 {
            return Ok(());
        }
        let n = self.size;
        let mut i = 0;
        while i != n {
            i = dispatch_width!(self.width as usize, self.adjust_ge_span(alloc, i, n, limit, diff))?;
        }
        Ok(())
    }

    fn adjust_ge_span<const W: usize>(
        &mut self,
        alloc: &mut SlabAlloc,
        start: usize,
        end: usize,
        limit: i64,
        diff: i64,
    ) -> Result<usize> {
        for i in start..end {
            let v = get_direct::<W>(self.payload(alloc), i);
            if v >= limit {
                let shifted = v + diff;
                self.ensure_minimum_width(alloc, shifted)?;
                self.copy_on_write(alloc)?;
                if self.width as usize != W {
                    // Promoted: the caller re-dispatches at the new width
                    // from this index; the element is still unadjusted.
                    return Ok(i);
                }
                set_direct::<W>(self.payload_mut(alloc), i, shifted);
            }
        }
        Ok(end)
    }

    /// Copies elements `[begin, end)` to `dest_begin`. The destination range
    /// must not overlap the source from the left (forward copy order).
    pub fn move_range(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        end: usize,
        dest_begin: usize,
    ) -> Result<()> {
        ensure!(begin <= end && end <= self.size, "invalid source range");
        ensure!(dest_begin <= self.size, "destination out of bounds");
        ensure!(end - begin <= self.size - dest_begin, "destination overflows");
        ensure!(
            !(dest_begin >= begin && dest_begin < end),
            "destination must not alias the unread source"
        );

        self.copy_on_write(alloc)?;

        let bits = self.bits_per_element(alloc);
        let width = self.width;
        let data = self.payload_mut(alloc);

        if bits < 8 {
            let mut dst = dest_begin;
            for i in begin..end {
                let v = get_any(width, data, i);
                set_any(width, data, dst, v);
                dst += 1;
            }
            return Ok(());
        }

        let w = bits / 8;
        data.copy_within(begin * w..end * w, dest_begin * w);
        Ok(())
    }

    /// Copies elements `[begin, end)` so the last lands just before
    /// `dest_end`, iterating backwards.
    pub fn move_backward(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        end: usize,
        dest_end: usize,
    ) -> Result<()> {
        ensure!(begin <= end && end <= self.size, "invalid source range");
        ensure!(dest_end <= self.size, "destination out of bounds");
        ensure!(end - begin <= dest_end, "destination underflows");
        ensure!(
            !(dest_end > begin && dest_end <= end),
            "destination must not alias the unread source"
        );

        self.copy_on_write(alloc)?;

        let bits = self.bits_per_element(alloc);
        let width = self.width;
        let data = self.payload_mut(alloc);

        if bits < 8 {
            let mut dst = dest_end;
            let mut i = end;
            while i != begin {
                i -= 1;
                dst -= 1;
                let v = get_any(width, data, i);
                set_any(width, data, dst, v);
            }
            return Ok(());
        }

        let w = bits / 8;
        data.copy_within(begin * w..end * w, (dest_end - (end - begin)) * w);
        Ok(())
    }

    /// Moves `num_elems` elements from `from` to `to`, rotating the elements
    /// in between.
    pub fn move_rotate(
        &mut self,
        alloc: &mut SlabAlloc,
        from: usize,
        to: usize,
        num_elems: usize,
    ) -> Result<()> {
        ensure!(
            from + num_elems <= self.size && to + num_elems <= self.size,
            "rotate range out of bounds"
        );
        if from == to {
            return Ok(());
        }

        self.copy_on_write(alloc)?;

        let bits = self.bits_per_element(alloc);

        if bits < 8 {
            let mut save: SmallVec<[i64; 32]> = SmallVec::with_capacity(num_elems);
            for i in 0..num_elems {
                save.push(self.get(alloc, from + i));
            }

            if from < to {
                self.move_range(alloc, from + num_elems, to + num_elems, from)?;
            } else {
                self.move_backward(alloc, to, from, from + num_elems)?;
            }

            for (i, v) in save.iter().enumerate() {
                self.set(alloc, to + i, *v)?;
            }
            return Ok(());
        }

        let w = bits / 8;
        let data = self.payload_mut(alloc);
        if from < to {
            data[from * w..(to + num_elems) * w].rotate_left(num_elems * w);
        } else {
            data[to * w..(from + num_elems) * w].rotate_right(num_elems * w);
        }
        Ok(())
    }

    fn bits_per_element(&self, alloc: &SlabAlloc) -> usize {
        let h = &alloc.block(self.ref_)[..HEADER_SIZE];
        let mut bits = self.width as usize;
        if header::width_type_from_header(h) == WidthType::Multiply {
            bits *= 8;
        }
        bits
    }

    /// Reformats the node to `count` zero elements at `width`, destroying any
    /// owned children first.
    pub fn preset(&mut self, alloc: &mut SlabAlloc, width: u8, count: usize) -> Result<()> {
        self.truncate_and_destroy_children(alloc, 0)?;
        self.alloc_node(alloc, count, width)?;
        self.set_width(width);
        self.size = count;
        let data = self.payload_mut(alloc);
        dispatch_width!(width as usize, fill_direct(data, 0, count, 0));
        Ok(())
    }

    /// Reformats to `count` zero elements at the width that holds both
    /// bounds.
    pub fn preset_range(
        &mut self,
        alloc: &mut SlabAlloc,
        min: i64,
        max: i64,
        count: usize,
    ) -> Result<()> {
        let width = bit_width(min).max(bit_width(max));
        self.preset(alloc, width, count)
    }

    /// Deep-copies element range `[offset, offset + count)` into
    /// `target_alloc` without following child refs.
    pub fn slice(
        &self,
        alloc: &SlabAlloc,
        offset: usize,
        count: usize,
        target_alloc: &mut SlabAlloc,
    ) -> Result<Ref> {
        ensure!(offset + count <= self.size, "slice range out of bounds");

        let mut out = Array::create(target_alloc, self.kind(), self.context_flag)?;
        for i in offset..offset + count {
            let value = self.get(alloc, i);
            if let Err(e) = out.add(target_alloc, value) {
                out.destroy_deep(target_alloc);
                return Err(e);
            }
        }
        Ok(out.ref_)
    }

    /// Deep-copies element range `[offset, offset + count)` into
    /// `target_alloc`, recursively cloning child subtrees.
    pub fn slice_and_clone_children(
        &self,
        alloc: &SlabAlloc,
        offset: usize,
        count: usize,
        target_alloc: &mut SlabAlloc,
    ) -> Result<Ref> {
        if !self.has_refs {
            return self.slice(alloc, offset, count, target_alloc);
        }
        ensure!(offset + count <= self.size, "slice range out of bounds");

        let mut out = Array::create(target_alloc, self.kind(), self.context_flag)?;
        for i in offset..offset + count {
            let value = self.get(alloc, i);
            let result = match RefOrTagged::from_slot(value) {
                RefOrTagged::Null | RefOrTagged::Tagged(_) => out.add(target_alloc, value),
                RefOrTagged::Ref(child) => Self::clone_deep(alloc, child, target_alloc)
                    .and_then(|cloned| match out.add(target_alloc, ref_to_slot(cloned)) {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            Self::destroy_deep_ref(target_alloc, cloned);
                            Err(e)
                        }
                    }),
            };
            if let Err(e) = result {
                out.destroy_deep(target_alloc);
                return Err(e);
            }
        }
        Ok(out.ref_)
    }

    /// Structurally copies the subtree at `src_ref` into `target_alloc`.
    ///
    /// Nodes without child refs are copied byte for byte; ref-bearing nodes
    /// are rebuilt so child slots point at their clones.
    pub fn clone_deep(
        alloc: &SlabAlloc,
        src_ref: Ref,
        target_alloc: &mut SlabAlloc,
    ) -> Result<Ref> {
        let h = &alloc.block(src_ref)[..HEADER_SIZE];
        if !header::has_refs_from_header(h) {
            let byte_size = header::byte_size_from_header(h);
            let aligned = (byte_size + 7) & !7;

            let new_ref = target_alloc.alloc(aligned.max(HEADER_SIZE))?;
            let content: Vec<u8> = alloc.block(src_ref)[..byte_size].to_vec();
            let block = target_alloc.block_mut(new_ref);
            block[..byte_size].copy_from_slice(&content);
            header::set_capacity_in_header(&mut block[..HEADER_SIZE], aligned.max(HEADER_SIZE));
            return Ok(new_ref);
        }

        let src = Array::from_ref(alloc, src_ref);
        let mut out = Array::create(target_alloc, src.kind(), src.context_flag)?;
        for i in 0..src.size {
            let value = src.get(alloc, i);
            let result = match RefOrTagged::from_slot(value) {
                RefOrTagged::Null | RefOrTagged::Tagged(_) => out.add(target_alloc, value),
                RefOrTagged::Ref(child) => Self::clone_deep(alloc, child, target_alloc)
                    .and_then(|cloned| match out.add(target_alloc, ref_to_slot(cloned)) {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            Self::destroy_deep_ref(target_alloc, cloned);
                            Err(e)
                        }
                    }),
            };
            if let Err(e) = result {
                out.destroy_deep(target_alloc);
                return Err(e);
            }
        }
        Ok(out.ref_)
    }

    /// Refreshes the accessor after a commit may have moved the node.
    ///
    /// Nodes below the previous baseline are never rewritten by a commit, so
    /// an unchanged ref below `old_baseline` means the node is unchanged.
    /// Returns whether the accessor was re-attached.
    pub fn update_from_parent(
        &mut self,
        alloc: &SlabAlloc,
        parent: &dyn NodeParent,
        ndx_in_parent: usize,
        old_baseline: usize,
    ) -> bool {
        let new_ref = parent.get_child_ref(ndx_in_parent);
        if new_ref == self.ref_ && new_ref < old_baseline {
            return false;
        }
        *self = Array::from_ref(alloc, new_ref);
        true
    }
}

/// Item capacity of a block of `byte_capacity` bytes at `width`.
fn calc_item_count(byte_capacity: usize, width: u8) -> usize {
    if width == 0 {
        return usize::MAX;
    }
    (byte_capacity - HEADER_SIZE) * 8 / width as usize
}

/// Unaligned byte size (header included) of `count` elements at `width`.
fn calc_byte_len(count: usize, width: u8) -> Result<usize> {
    let bits = count
        .checked_mul(width as usize)
        .ok_or(SizeOverflow)?;
    let total = HEADER_SIZE + (bits + 7) / 8;
    if total > MAX_PAYLOAD {
        return Err(SizeOverflow.into());
    }
    Ok(total)
}

/// 8-byte-aligned byte size of `count` elements at `width`.
fn calc_aligned_byte_size(count: usize, width: u8) -> Result<usize> {
    let byte_len = calc_byte_len(count, width)?;
    Ok((byte_len + 7) & !7)
}
