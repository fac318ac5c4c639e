//! # Slab Allocator
//!
//! `SlabAlloc` combines a read-only memory-mapped file region and a growable
//! chain of writer-private heap slabs into one reference space.
//!
//! ## Design Overview
//!
//! The mapped region `[0, baseline)` holds committed data and is never
//! written through. All mutation happens in slabs, which extend the
//! reference space past the baseline:
//!
//! ```text
//! ref:     0 ......... baseline ...... slab0.ref_end ...... slab1.ref_end
//! memory:  [ mmap                ][ heap block        ][ heap block      ]
//! ```
//!
//! Each slab records only its exclusive upper bound in reference space
//! (`ref_end`); its start is the previous slab's bound, or the baseline for
//! the first slab. Translation of a slab ref is a binary search over these
//! bounds.
//!
//! ## Allocation Strategy
//!
//! `alloc` reuses freed slab space first: the free list is ordered by ref
//! and scanned first-fit, so equal-size requests deterministically reuse the
//! lowest suitable hole. When nothing fits, a new slab is appended, sized at
//! least 256 bytes rounded up and at least twice the span of the previous
//! slab, so the slab count stays logarithmic in the total allocation volume.
//!
//! ## Failure Semantics
//!
//! `free` must not fail: if maintaining the free list fails, the allocator
//! latches `FreeSpaceInvalid` and drops the record. Committed data never
//! depends on the free list; the latch only blocks further allocation until
//! `free_all` (or a commit) rebuilds the lists from the slab table.
//!
//! ## Commit Path
//!
//! A commit appends all slab bytes to the file at their ref-space positions,
//! stages the new top-ref into the non-selected header slot, and publishes
//! it by flipping the one-byte selector. The file then covers the old
//! committed region plus everything the writer built, the mapping is grown
//! over it, and the slabs are rebased past the new baseline as scratch for
//! the next transaction. A crash before the selector flip leaves the old
//! root in effect; a crash after it leaves the new root in effect.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use zerocopy::IntoBytes;

use super::header::{FileHeader, FILE_FORMAT_VERSION};
use super::{FreeSpaceInvalid, InvalidDatabase, OutOfMemory, Ref};
use crate::array::header as node_header;

/// Size a fresh database file is preallocated to.
pub const INITIAL_FILE_SIZE: usize = 1024 * 1024;

/// Baseline of an unattached scratch allocator. Keeps `Ref` 0 reserved.
const SCRATCH_BASELINE: usize = 8;

#[derive(Debug)]
struct Slab {
    /// Exclusive upper bound of this slab in reference space.
    ref_end: usize,
    mem: Box<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    ref_: Ref,
    size: usize,
}

#[derive(Debug)]
enum Backing {
    None,
    Map(Mmap),
    Buffer(Box<[u8]>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::None => &[],
            Backing::Map(map) => map,
            Backing::Buffer(buf) => buf,
        }
    }
}

#[derive(Debug)]
pub struct SlabAlloc {
    file: Option<File>,
    data: Backing,
    baseline: usize,
    slabs: Vec<Slab>,
    /// Reclaimable ranges inside slabs, ordered by ref.
    free_space: Vec<FreeBlock>,
    /// Ranges below the baseline freed since the last commit. Kept apart so
    /// commit math never mixes committed and scratch space.
    free_read_only: Vec<FreeBlock>,
    free_space_invalid: bool,
    select: u8,
}

impl SlabAlloc {
    /// Creates an unattached scratch allocator.
    ///
    /// There is no read-only region; every ref lives in a slab. Used as the
    /// target allocator for `slice`/`clone` and in tests.
    pub fn new() -> Self {
        Self {
            file: None,
            data: Backing::None,
            baseline: SCRATCH_BASELINE,
            slabs: Vec::new(),
            free_space: Vec::new(),
            free_read_only: Vec::new(),
            free_space_invalid: false,
            select: 0,
        }
    }

    /// Opens (or creates) a database file and maps it read-only.
    ///
    /// An empty writable file is initialized with the default 24-byte header
    /// and preallocated to [`INITIAL_FILE_SIZE`]. Anything that fails header
    /// validation is reported as [`InvalidDatabase`].
    pub fn attach_file<P: AsRef<Path>>(path: P, create: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let mut size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len() as usize;

        if size == 0 {
            if !create {
                return Err(InvalidDatabase)
                    .wrap_err_with(|| format!("database file '{}' is empty", path.display()));
            }
            let header = FileHeader::new();
            (&file)
                .write_all(header.as_bytes())
                .wrap_err("failed to write initial file header")?;
            file.set_len(INITIAL_FILE_SIZE as u64)
                .wrap_err("failed to preallocate initial file space")?;
            file.sync_all().wrap_err("failed to sync new database file")?;
            size = INITIAL_FILE_SIZE;
        }

        // SAFETY: Mmap::map is unsafe because the file could be modified
        // externally while mapped. This is safe because:
        // 1. Database files have a single writer; readers never mutate
        // 2. The writer only ever appends past the mapped length and flips
        //    the header selector, never rewrites mapped node bytes
        // 3. The map's lifetime is tied to SlabAlloc, preventing
        //    use-after-unmap
        let map = unsafe {
            Mmap::map(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let select = {
            let header = FileHeader::validate(&map[..size])
                .wrap_err_with(|| format!("validation failed for '{}'", path.display()))?;
            header.selected_slot() as u8
        };

        Ok(Self {
            file: Some(file),
            data: Backing::Map(map),
            baseline: size,
            slabs: Vec::new(),
            free_space: Vec::new(),
            free_read_only: Vec::new(),
            free_space_invalid: false,
            select,
        })
    }

    /// Attaches an in-memory buffer as the read-only region.
    ///
    /// The buffer must pass the same validation as a file. Commit is not
    /// available without a file.
    pub fn attach_buffer(buffer: Vec<u8>) -> Result<Self> {
        let select = FileHeader::validate(&buffer)
            .wrap_err("buffer validation failed")?
            .selected_slot() as u8;
        let baseline = buffer.len();

        Ok(Self {
            file: None,
            data: Backing::Buffer(buffer.into_boxed_slice()),
            baseline,
            slabs: Vec::new(),
            free_space: Vec::new(),
            free_read_only: Vec::new(),
            free_space_invalid: false,
            select,
        })
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self.data, Backing::None)
    }

    pub fn baseline(&self) -> usize {
        self.baseline
    }

    pub fn is_read_only(&self, ref_: Ref) -> bool {
        ref_ < self.baseline
    }

    /// The currently published root ref, from the selected header slot.
    pub fn top_ref(&self) -> Ref {
        match &self.data {
            Backing::None => 0,
            backing => FileHeader::from_bytes(backing.bytes())
                .map(|h| h.top_ref())
                .unwrap_or(0),
        }
    }

    /// One past the highest ref in the reference space.
    pub fn total_size(&self) -> usize {
        self.slabs.last().map_or(self.baseline, |s| s.ref_end)
    }

    pub fn free_space_invalid(&self) -> bool {
        self.free_space_invalid
    }

    /// Number of tracked free ranges inside slabs.
    pub fn free_block_count(&self) -> usize {
        self.free_space.len()
    }

    /// Number of freed ranges below the baseline since the last commit.
    pub fn free_read_only_count(&self) -> usize {
        self.free_read_only.len()
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Translates a ref to its backing bytes, from the ref to the end of the
    /// containing region.
    ///
    /// Infallible for any ref produced by this allocator and not yet freed;
    /// an unknown ref is a caller bug.
    pub fn block(&self, ref_: Ref) -> &[u8] {
        if ref_ < self.baseline {
            let data = self.data.bytes();
            assert!(
                ref_ < data.len(),
                "ref {} below baseline but outside the mapped region",
                ref_
            );
            return &data[ref_..self.baseline];
        }

        let ndx = self.slab_index(ref_);
        let start = self.slab_start(ndx);
        &self.slabs[ndx].mem[ref_ - start..]
    }

    /// Mutable translation. Refs below the baseline are read-only and
    /// rejected; the array layer must copy-on-write first.
    pub fn block_mut(&mut self, ref_: Ref) -> &mut [u8] {
        assert!(
            ref_ >= self.baseline,
            "ref {} is in the read-only region (baseline {})",
            ref_,
            self.baseline
        );

        let ndx = self.slab_index(ref_);
        let start = self.slab_start(ndx);
        &mut self.slabs[ndx].mem[ref_ - start..]
    }

    fn slab_index(&self, ref_: Ref) -> usize {
        let ndx = self.slabs.partition_point(|s| s.ref_end <= ref_);
        assert!(ndx < self.slabs.len(), "ref {} outside reference space", ref_);
        ndx
    }

    fn slab_start(&self, ndx: usize) -> usize {
        if ndx == 0 {
            self.baseline
        } else {
            self.slabs[ndx - 1].ref_end
        }
    }

    fn is_slab_boundary(&self, ref_: Ref) -> bool {
        ref_ == self.baseline || self.slabs.binary_search_by_key(&ref_, |s| s.ref_end).is_ok()
    }

    /// Allocates `size` bytes (a positive multiple of 8) and returns its ref.
    ///
    /// Free-list reuse is first-fit over refs in ascending order, so the
    /// result is deterministic. Fails fast with [`FreeSpaceInvalid`] when the
    /// latch is set and with [`OutOfMemory`] when the backing store cannot
    /// grow.
    pub fn alloc(&mut self, size: usize) -> Result<Ref> {
        ensure!(size > 0, "allocation size must be positive");
        ensure!(size % 8 == 0, "allocation size {} is not a multiple of 8", size);

        if self.free_space_invalid {
            return Err(FreeSpaceInvalid.into());
        }

        // First fit over the ref-ordered free list.
        for i in 0..self.free_space.len() {
            if self.free_space[i].size >= size {
                let ref_ = self.free_space[i].ref_;
                if self.free_space[i].size == size {
                    self.free_space.remove(i);
                } else {
                    self.free_space[i].ref_ += size;
                    self.free_space[i].size -= size;
                }
                self.block_mut(ref_)[..size].fill(0);
                return Ok(ref_);
            }
        }

        // No reusable hole; append a new slab. Grow it to at least twice the
        // previous slab's span so the slab table stays small.
        let curr_ref_end = self.total_size();
        let mut new_size = ((size - 1) | 255) + 1;
        if let Some(last) = self.slabs.last() {
            let prev_start = if self.slabs.len() == 1 {
                self.baseline
            } else {
                self.slabs[self.slabs.len() - 2].ref_end
            };
            let min_size = 2 * (last.ref_end - prev_start);
            if new_size < min_size {
                new_size = min_size;
            }
        }

        let mut mem = Vec::new();
        if mem.try_reserve_exact(new_size).is_err() {
            return Err(OutOfMemory.into());
        }
        mem.resize(new_size, 0);

        self.slabs.push(Slab {
            ref_end: curr_ref_end + new_size,
            mem: mem.into_boxed_slice(),
        });

        let unused = new_size - size;
        if unused > 0 {
            // Highest ref so far; appending keeps the list ordered.
            self.free_space.push(FreeBlock {
                ref_: curr_ref_end + size,
                size: unused,
            });
        }

        Ok(curr_ref_end)
    }

    /// Returns a node's backing space to the allocator.
    ///
    /// The block size is read from the node header: committed nodes report
    /// their byte size, slab nodes their capacity. Never fails; a failure
    /// while maintaining the free list sets the sticky latch instead.
    pub fn free(&mut self, ref_: Ref) {
        debug_assert_eq!(ref_ % 8, 0, "refs are 8-byte aligned");

        let read_only = self.is_read_only(ref_);
        let header = &self.block(ref_)[..node_header::HEADER_SIZE];
        let size = if read_only {
            (node_header::byte_size_from_header(header) + 7) & !7
        } else {
            node_header::capacity_from_header(header)
        };

        if self.free_space_invalid {
            return;
        }

        if self.free_insert(ref_, size, read_only).is_err() {
            self.free_space_invalid = true;
        }
    }

    fn free_insert(
        &mut self,
        ref_: Ref,
        size: usize,
        read_only: bool,
    ) -> Result<(), std::collections::TryReserveError> {
        if read_only {
            self.free_read_only.try_reserve(1)?;
            let pos = self.free_read_only.partition_point(|b| b.ref_ < ref_);
            self.free_read_only.insert(pos, FreeBlock { ref_, size });
            return Ok(());
        }

        let ref_end = ref_ + size;
        let pos = self.free_space.partition_point(|b| b.ref_ < ref_);

        // Merge with the neighbors where adjacent, but never across a slab
        // boundary: slabs are separate heap blocks.
        let merge_next = pos < self.free_space.len()
            && self.free_space[pos].ref_ == ref_end
            && !self.is_slab_boundary(ref_end);
        let merge_prev = pos > 0
            && self.free_space[pos - 1].ref_ + self.free_space[pos - 1].size == ref_
            && !self.is_slab_boundary(ref_);

        match (merge_prev, merge_next) {
            (true, true) => {
                let next_size = self.free_space[pos].size;
                self.free_space[pos - 1].size += size + next_size;
                self.free_space.remove(pos);
            }
            (true, false) => {
                self.free_space[pos - 1].size += size;
            }
            (false, true) => {
                self.free_space[pos].ref_ = ref_;
                self.free_space[pos].size += size;
            }
            (false, false) => {
                self.free_space.try_reserve(1)?;
                self.free_space.insert(pos, FreeBlock { ref_, size });
            }
        }
        Ok(())
    }

    /// Moves a block to a new allocation of `new_size` bytes, copying
    /// `old_size` bytes of content. No in-place growth is attempted.
    pub fn realloc(&mut self, ref_: Ref, old_size: usize, new_size: usize) -> Result<Ref> {
        ensure!(new_size > 0, "reallocation size must be positive");
        ensure!(
            new_size % 8 == 0,
            "reallocation size {} is not a multiple of 8",
            new_size
        );

        let new_ref = self.alloc(new_size)?;

        let copied: Vec<u8> = self.block(ref_)[..old_size.min(new_size)].to_vec();
        self.block_mut(new_ref)[..copied.len()].copy_from_slice(&copied);

        self.free(ref_);
        Ok(new_ref)
    }

    /// Clears both free lists, rebuilds the slab list's free space to cover
    /// every slab in full, and clears the invalid latch.
    pub fn free_all(&mut self) {
        self.free_read_only.clear();
        self.free_space.clear();

        let mut ref_ = self.baseline;
        for slab in &self.slabs {
            self.free_space.push(FreeBlock {
                ref_,
                size: slab.ref_end - ref_,
            });
            ref_ = slab.ref_end;
        }

        self.free_space_invalid = false;
    }

    /// Writes every slab's bytes to the file at its ref-space position.
    ///
    /// Appended data lies entirely past the committed region, so a crash
    /// during or after this call cannot corrupt the published state.
    pub fn persist_slabs(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or_else(|| {
            eyre::eyre!("cannot persist without an attached file")
        })?;

        let mut offset = self.baseline as u64;
        for slab in &self.slabs {
            (&*file)
                .seek(SeekFrom::Start(offset))
                .wrap_err("failed to seek to slab position")?;
            (&*file)
                .write_all(&slab.mem)
                .wrap_err("failed to append slab data")?;
            offset = slab.ref_end as u64;
        }

        file.sync_data().wrap_err("failed to sync appended slab data")?;
        Ok(())
    }

    /// Writes `new_top_ref` into the non-selected top-ref slot and syncs.
    ///
    /// The published root is unchanged until [`publish_top_ref`] flips the
    /// selector; a crash in between leaves the previous root in effect.
    ///
    /// [`publish_top_ref`]: SlabAlloc::publish_top_ref
    pub fn stage_top_ref(&mut self, new_top_ref: Ref) -> Result<()> {
        ensure!(
            new_top_ref % 8 == 0,
            "top ref {} is not 8-byte aligned",
            new_top_ref
        );
        ensure!(
            new_top_ref < self.total_size(),
            "top ref {} outside reference space",
            new_top_ref
        );
        let file = self.file.as_ref().ok_or_else(|| {
            eyre::eyre!("cannot stage a top ref without an attached file")
        })?;

        let alt = 1 - (self.select & 1) as usize;

        (&*file)
            .seek(SeekFrom::Start(8 * alt as u64))
            .wrap_err("failed to seek to top-ref slot")?;
        (&*file)
            .write_all(&(new_top_ref as u64).to_le_bytes())
            .wrap_err("failed to write staged top ref")?;

        (&*file)
            .seek(SeekFrom::Start(20 + alt as u64))
            .wrap_err("failed to seek to version byte")?;
        (&*file)
            .write_all(&[FILE_FORMAT_VERSION])
            .wrap_err("failed to write version byte")?;

        file.sync_data().wrap_err("failed to sync staged top ref")?;
        Ok(())
    }

    /// Flips the selector byte, atomically publishing the staged top ref.
    pub fn publish_top_ref(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or_else(|| {
            eyre::eyre!("cannot publish a top ref without an attached file")
        })?;

        let flipped = self.select ^ 1;
        (&*file)
            .seek(SeekFrom::Start(23))
            .wrap_err("failed to seek to selector byte")?;
        (&*file)
            .write_all(&[flipped])
            .wrap_err("failed to write selector byte")?;
        file.sync_data().wrap_err("failed to sync selector byte")?;

        self.select = flipped;
        Ok(())
    }

    /// Grows the mapping to `new_size` bytes and rebases the slabs past the
    /// new baseline. Returns whether the base address changed.
    pub fn remap(&mut self, new_size: usize) -> Result<bool> {
        ensure!(new_size >= self.baseline, "mapping can only grow");
        ensure!(new_size % 8 == 0, "mapped size must be 8-byte aligned");
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| eyre::eyre!("cannot remap without an attached file"))?;

        let old_ptr = self.data.bytes().as_ptr();

        // SAFETY: same single-writer argument as in attach_file; the file has
        // been extended to at least new_size before this call.
        let map = unsafe { Mmap::map(file).wrap_err("failed to remap database file")? };
        ensure!(
            map.len() >= new_size,
            "file shorter than requested mapping size"
        );

        let addr_changed = map.as_ptr() != old_ptr;
        self.data = Backing::Map(map);
        self.baseline = new_size;

        let mut ref_ = new_size;
        for slab in &mut self.slabs {
            ref_ += slab.mem.len();
            slab.ref_end = ref_;
        }

        Ok(addr_changed)
    }

    /// Persists all slabs, publishes `new_top_ref`, grows the mapping over
    /// the appended data and resets free-space tracking.
    ///
    /// After a successful commit every previously allocated slab ref is
    /// stale: the committed copy of that data now lives below the baseline
    /// and is reachable through the new top ref.
    pub fn commit(&mut self, new_top_ref: Ref) -> Result<()> {
        let total = self.total_size();

        self.persist_slabs()?;
        self.stage_top_ref(new_top_ref)?;
        self.publish_top_ref()?;
        self.remap(total)?;
        self.free_all();
        Ok(())
    }
}

impl Default for SlabAlloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::header::{self, WidthType};

    fn write_node_header(alloc: &mut SlabAlloc, ref_: Ref, capacity: usize) {
        let block = alloc.block_mut(ref_);
        header::init_header(
            &mut block[..header::HEADER_SIZE],
            false,
            false,
            false,
            WidthType::Bits,
            0,
            0,
            capacity,
        );
    }

    #[test]
    fn scratch_allocator_reserves_ref_zero() {
        let mut alloc = SlabAlloc::new();

        let ref_ = alloc.alloc(64).unwrap();

        assert_ne!(ref_, 0);
        assert_eq!(ref_ % 8, 0);
    }

    #[test]
    fn alloc_rejects_unaligned_size() {
        let mut alloc = SlabAlloc::new();

        assert!(alloc.alloc(12).is_err());
        assert!(alloc.alloc(0).is_err());
    }

    #[test]
    fn alloc_returns_distinct_refs() {
        let mut alloc = SlabAlloc::new();

        let a = alloc.alloc(64).unwrap();
        let b = alloc.alloc(64).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn new_slab_doubles_previous_span() {
        let mut alloc = SlabAlloc::new();

        alloc.alloc(256).unwrap();
        assert_eq!(alloc.slab_count(), 1);

        // 256-byte slab is exhausted; the next slab spans at least 512.
        alloc.alloc(8).unwrap();
        assert_eq!(alloc.slab_count(), 2);
        assert_eq!(alloc.total_size() - alloc.baseline(), 256 + 512);
    }

    #[test]
    fn freed_block_is_reused_first_fit() {
        let mut alloc = SlabAlloc::new();

        let a = alloc.alloc(1024).unwrap();
        let b = alloc.alloc(2048).unwrap();
        let c = alloc.alloc(1024).unwrap();
        write_node_header(&mut alloc, b, 2048);

        alloc.free(b);
        let reused = alloc.alloc(2048).unwrap();

        assert_eq!(reused, b);
        assert_ne!(reused, a);
        assert_ne!(reused, c);
    }

    #[test]
    fn free_coalesces_adjacent_blocks() {
        let mut alloc = SlabAlloc::new();

        let a = alloc.alloc(512).unwrap();
        let b = alloc.alloc(512).unwrap();
        let _guard = alloc.alloc(512).unwrap();
        write_node_header(&mut alloc, a, 512);
        write_node_header(&mut alloc, b, 512);

        alloc.free(a);
        alloc.free(b);

        // One merged 1024-byte block, reusable as a whole.
        let reused = alloc.alloc(1024).unwrap();
        assert_eq!(reused, a);
    }

    #[test]
    fn free_does_not_merge_across_slab_boundary() {
        let mut alloc = SlabAlloc::new();

        // First slab exactly 256 bytes, fully occupied.
        let a = alloc.alloc(256).unwrap();
        // Second slab starts at the boundary.
        let b = alloc.alloc(256).unwrap();
        write_node_header(&mut alloc, a, 256);
        write_node_header(&mut alloc, b, 256);

        alloc.free(a);
        alloc.free(b);

        assert_eq!(alloc.free_block_count(), 2);
    }

    #[test]
    fn free_all_covers_every_slab() {
        let mut alloc = SlabAlloc::new();

        alloc.alloc(256).unwrap();
        alloc.alloc(512).unwrap();

        alloc.free_all();

        assert_eq!(alloc.free_block_count(), alloc.slab_count());
        let reused = alloc.alloc(256).unwrap();
        assert_eq!(reused, alloc.baseline());
    }

    #[test]
    fn realloc_preserves_content() {
        let mut alloc = SlabAlloc::new();

        let ref_ = alloc.alloc(64).unwrap();
        write_node_header(&mut alloc, ref_, 64);
        alloc.block_mut(ref_)[8..16].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let new_ref = alloc.realloc(ref_, 64, 128).unwrap();

        assert_eq!(&alloc.block(new_ref)[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn attach_file_creates_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pdb");

        let alloc = SlabAlloc::attach_file(&path, true).unwrap();

        assert!(alloc.is_attached());
        assert_eq!(alloc.baseline(), INITIAL_FILE_SIZE);
        assert_eq!(alloc.top_ref(), 0);
    }

    #[test]
    fn attach_file_rejects_missing_file_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.pdb");

        assert!(SlabAlloc::attach_file(&path, false).is_err());
    }

    #[test]
    fn attach_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pdb");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let result = SlabAlloc::attach_file(&path, false);

        assert!(result.is_err());
    }

    #[test]
    fn attach_buffer_round_trip() {
        let header = FileHeader::new();
        let mut buffer = header.as_bytes().to_vec();
        buffer.resize(1024, 0);

        let alloc = SlabAlloc::attach_buffer(buffer).unwrap();

        assert_eq!(alloc.baseline(), 1024);
        assert_eq!(alloc.top_ref(), 0);
    }

    #[test]
    fn slab_refs_start_at_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pdb");
        let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();

        let ref_ = alloc.alloc(64).unwrap();

        assert_eq!(ref_, INITIAL_FILE_SIZE);
        assert!(!alloc.is_read_only(ref_));
        assert!(alloc.is_read_only(ref_ - 8));
    }

    #[test]
    fn latch_blocks_alloc_until_free_all() {
        let mut alloc = SlabAlloc::new();
        alloc.alloc(64).unwrap();
        alloc.free_space_invalid = true;

        let err = alloc.alloc(64).unwrap_err();
        assert!(err.downcast_ref::<FreeSpaceInvalid>().is_some());

        alloc.free_all();
        assert!(alloc.alloc(64).is_ok());
    }

    #[test]
    fn read_only_frees_are_tracked_separately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pdb");
        let mut alloc = SlabAlloc::attach_file(&path, true).unwrap();

        // Build a node in a slab, commit it below the baseline, then free it.
        let ref_ = alloc.alloc(64).unwrap();
        write_node_header(&mut alloc, ref_, 64);
        alloc.commit(ref_).unwrap();

        let committed = alloc.top_ref();
        assert!(alloc.is_read_only(committed));
        alloc.free(committed);

        assert_eq!(alloc.free_read_only_count(), 1);
        assert_eq!(alloc.free_block_count(), alloc.slab_count());
    }
}
