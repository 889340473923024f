//! Data types for the TecnicoFS block layout.
//!
//! The file system keeps all state in memory, laid out as it would be on a
//! small disk:
//!
//! | region        | # of entries       | content                  | type                 |
//! |---------------|--------------------|--------------------------|----------------------|
//! | inode table   | `INODE_TABLE_SIZE` | file/directory metadata  | engine-internal      |
//! | block pool    | `DATA_BLOCKS`      | `BLOCK_SIZE`-byte blocks | `[u8; BLOCK_SIZE]`   |
//!
//! A block is interpreted in context: raw file bytes, an array of directory
//! entries ([`DirEntryBlock`]), or an array of block references
//! ([`IndirectBlock`]). Reference slots inside blocks are `i32`, with `-1`
//! marking an empty slot; the typed accessors translate to and from
//! `Option<BlockNo>` / `Option<Inumber>` at that boundary.

use core::fmt;

use bitflags::bitflags;
use dataview::Pod;

/// Block size in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Number of blocks in the data-block pool.
pub const DATA_BLOCKS: usize = 1024;

/// Number of slots in the inode table.
pub const INODE_TABLE_SIZE: usize = 50;

/// Open files per engine.
pub const MAX_OPEN_FILES: usize = 20;

/// Maximum file name length in bytes, including the null terminator.
pub const MAX_FILENAME: usize = 40;

/// Number of blocks directly referenced by an inode.
pub const NUM_DIRECT_REFS: usize = 10;

/// Number of blocks referenced through the single indirect block.
pub const NUM_INDIRECT_REFS: usize = BLOCK_SIZE / size_of::<i32>();

/// Maximum number of blocks a single file can span.
pub const MAX_FILE_BLOCKS: usize = NUM_DIRECT_REFS + NUM_INDIRECT_REFS;

/// Maximum file size in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_BLOCKS * BLOCK_SIZE;

/// Empty reference slot sentinel inside pointer and directory blocks.
const EMPTY_SLOT: i32 = -1;

/// Index of a block in the data-block pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BlockNo(u32);

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

/// Inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Inumber(u32);

impl fmt::Display for Inumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Inumber {
    /// The root directory's inumber.
    pub const ROOT: Self = Self::new(0);

    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

/// Handle into the open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RawHandle(u32);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RawHandle {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(&self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

bitflags! {
    /// Flags accepted by `open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct OpenFlags: u32 {
        /// Create the file if the name does not exist.
        const CREATE = 0x1;
        /// Release all data blocks of an existing file before use.
        const TRUNC = 0x2;
        /// Start at the current end of the file instead of offset 0.
        const APPEND = 0x4;
    }
}

/// One directory entry: a child inumber and a null-padded name.
#[repr(C)]
#[derive(Debug, Pod)]
pub struct DirEntry {
    ino: i32,
    name: [u8; MAX_FILENAME],
}

impl DirEntry {
    #[must_use]
    pub fn ino(&self) -> Option<Inumber> {
        u32::try_from(self.ino).ok().map(Inumber::new)
    }

    pub fn set_ino(&mut self, ino: Option<Inumber>) {
        self.ino = ino.map_or(EMPTY_SLOT, |ino| i32::try_from(ino.value()).unwrap());
    }

    /// The stored name, up to the first null byte.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    #[must_use]
    pub fn is_same_name(&self, name: &[u8]) -> bool {
        let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
        self.name() == &name[..len]
    }

    /// Stores `name`, truncated to `MAX_FILENAME - 1` bytes and null-padded.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = usize::min(name.len(), MAX_FILENAME - 1);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len..].fill(0);
    }
}

/// Directory entries per block.
pub const DIR_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<DirEntry>();

/// The entry array at the front of a directory's data block.
#[derive(Pod)]
#[repr(transparent)]
pub struct DirEntryBlock([DirEntry; DIR_ENTRIES_PER_BLOCK]);
const _: () = const { assert!(size_of::<DirEntryBlock>() <= BLOCK_SIZE) };

impl DirEntryBlock {
    #[must_use]
    pub fn entry(&self, i: usize) -> &DirEntry {
        &self.0[i]
    }

    #[must_use]
    pub fn entry_mut(&mut self, i: usize) -> &mut DirEntry {
        &mut self.0[i]
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.0.iter()
    }

    /// Marks every entry free.
    pub fn clear(&mut self) {
        for de in &mut self.0 {
            de.set_ino(None);
        }
    }
}

/// The reference array filling an indirect block.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([i32; NUM_INDIRECT_REFS]);
const _: () = const { assert!(size_of::<IndirectBlock>() == BLOCK_SIZE) };

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<BlockNo> {
        u32::try_from(self.0[i]).ok().map(BlockNo::new)
    }

    pub fn set(&mut self, i: usize, n: Option<BlockNo>) {
        self.0[i] = n.map_or(EMPTY_SLOT, |n| i32::try_from(n.value()).unwrap());
    }

    /// Marks every slot empty.
    pub fn clear(&mut self) {
        self.0.fill(EMPTY_SLOT);
    }

    /// Takes every referenced block out of the table.
    pub fn drain(&mut self) -> impl Iterator<Item = Option<BlockNo>> + '_ {
        self.0.iter_mut().map(|n| {
            let n = core::mem::replace(n, EMPTY_SLOT);
            u32::try_from(n).ok().map(BlockNo::new)
        })
    }
}

#[cfg(test)]
mod tests {
    use dataview::PodMethods as _;

    use super::*;

    #[test]
    fn dir_entry_name_is_truncated_and_null_padded() {
        let mut de = DirEntry::zeroed();
        de.set_ino(Some(Inumber::new(3)));
        de.set_name(&[b'x'; 64]);
        assert_eq!(de.name().len(), MAX_FILENAME - 1);
        assert_eq!(de.ino(), Some(Inumber::new(3)));
        assert!(de.is_same_name(&[b'x'; MAX_FILENAME - 1]));
        assert!(!de.is_same_name(&[b'x'; MAX_FILENAME]));
    }

    #[test]
    fn dir_entry_name_comparison_stops_at_null() {
        let mut de = DirEntry::zeroed();
        de.set_name(b"f1");
        assert!(de.is_same_name(b"f1\0garbage"));
        assert!(!de.is_same_name(b"f12"));
    }

    #[test]
    fn indirect_block_round_trips_the_empty_sentinel() {
        let mut ind = IndirectBlock::zeroed();
        ind.clear();
        assert!((0..NUM_INDIRECT_REFS).all(|i| ind.get(i).is_none()));

        ind.set(0, Some(BlockNo::new(0)));
        ind.set(7, Some(BlockNo::new(42)));
        assert_eq!(ind.get(0), Some(BlockNo::new(0)));
        assert_eq!(ind.get(7), Some(BlockNo::new(42)));

        let taken: Vec<_> = ind.drain().flatten().collect();
        assert_eq!(taken, [BlockNo::new(0), BlockNo::new(42)]);
        assert!(ind.get(7).is_none());
    }

    #[test]
    fn directory_block_fits_in_a_data_block() {
        assert_eq!(DIR_ENTRIES_PER_BLOCK, 23);
        assert!(size_of::<DirEntryBlock>() <= BLOCK_SIZE);
    }
}
