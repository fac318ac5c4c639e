//! # File Header
//!
//! Every packdb file starts with a 24-byte header of three 64-bit words:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -------------------------------------------
//! 0       8     top-ref slot A (little-endian)
//! 8       8     top-ref slot B
//! 16      4     magic "T-DB"
//! 20      1     format version for slot A
//! 21      1     format version for slot B
//! 22      1     reserved
//! 23      1     bit 0 selects slot A (0) or B (1)
//! ```
//!
//! Only one top-ref slot is current at a time. A commit writes the new root
//! into the non-selected slot, syncs, then flips the select bit: a one-byte
//! write that atomically publishes the new root. A reader (or a crashed
//! writer reattaching) always finds a fully written root behind the selected
//! slot.
//!
//! The struct uses zerocopy traits so the header can be read in place from a
//! mapped buffer without alignment assumptions.

use eyre::Result;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{InvalidDatabase, Ref};

pub const FILE_HEADER_SIZE: usize = 24;
pub const FILE_MAGIC: &[u8; 4] = b"T-DB";
pub const FILE_FORMAT_VERSION: u8 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    top_refs: [U64; 2],
    magic: [u8; 4],
    versions: [u8; 2],
    reserved: u8,
    select: u8,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new() -> Self {
        Self {
            top_refs: [U64::new(0); 2],
            magic: *FILE_MAGIC,
            versions: [FILE_FORMAT_VERSION; 2],
            reserved: 0,
            select: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self, InvalidDatabase> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(InvalidDatabase);
        }
        Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE]).map_err(|_| InvalidDatabase)
    }

    /// Index of the currently selected top-ref slot (0 or 1).
    pub fn selected_slot(&self) -> usize {
        (self.select & 1) as usize
    }

    /// The currently published root ref. Zero means an empty database.
    pub fn top_ref(&self) -> Ref {
        self.top_refs[self.selected_slot()].get() as Ref
    }

    /// The format version of the currently selected slot.
    pub fn version(&self) -> u8 {
        self.versions[self.selected_slot()]
    }

    pub fn set_slot(&mut self, slot: usize, top_ref: Ref, version: u8) {
        self.top_refs[slot] = U64::new(top_ref as u64);
        self.versions[slot] = version;
    }

    pub fn flip_select(&mut self) {
        self.select ^= 1;
    }

    /// Validates a mapped buffer as a database image.
    ///
    /// Checks length and alignment, the magic, the selected slot's format
    /// version, and that the selected top-ref lies within the buffer.
    pub fn validate(buffer: &[u8]) -> Result<&Self, InvalidDatabase> {
        if buffer.len() < FILE_HEADER_SIZE || buffer.len() % 8 != 0 {
            return Err(InvalidDatabase);
        }
        let header = Self::from_bytes(buffer)?;
        if &header.magic != FILE_MAGIC {
            return Err(InvalidDatabase);
        }
        if header.version() != FILE_FORMAT_VERSION {
            return Err(InvalidDatabase);
        }
        if header.top_ref() >= buffer.len() {
            return Err(InvalidDatabase);
        }
        Ok(header)
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}
