//! Directory entry operations.
//!
//! A directory holds exactly one block of entries, scanned linearly. Both
//! operations run against an already-locked inode; the caller decides whether
//! the surrounding namespace operation needs the reader or the writer lock.

use tfs_fs_types::{
    BlockNo, DIR_ENTRIES_PER_BLOCK, DirEntry, DirEntryBlock, INODE_TABLE_SIZE, Inumber,
};

use crate::{
    block::{BlockPool, storage_delay},
    error::Error,
    inode::{Inode, InodeKind},
};

/// Looks a name up in the directory. Byte-wise comparison, first match.
pub(crate) fn lookup_in(
    dir: &Inode,
    pool: &BlockPool,
    name: &[u8],
) -> Result<Option<Inumber>, Error> {
    storage_delay();
    let bn = entries_block(dir)?;
    let block = pool.block(bn)?;
    let guard = block.lock().unwrap();
    Ok(guard
        .data::<DirEntryBlock>()
        .entries()
        .filter(|de| de.ino().is_some())
        .find(|de| de.is_same_name(name))
        .and_then(DirEntry::ino))
}

/// Stores `(child, name)` in the first free entry. Uniqueness is the
/// caller's job: check with [`lookup_in`] first, under the same lock.
pub(crate) fn insert_into(
    dir: &Inode,
    pool: &BlockPool,
    child: Inumber,
    name: &[u8],
) -> Result<(), Error> {
    if child.as_index() >= INODE_TABLE_SIZE {
        return Err(Error::BadInumber(child));
    }
    if name.is_empty() || name[0] == 0 {
        return Err(Error::EmptyName);
    }

    storage_delay();
    let bn = entries_block(dir)?;
    let block = pool.block(bn)?;
    let mut guard = block.lock().unwrap();
    let entries = guard.data_mut::<DirEntryBlock>();
    for i in 0..DIR_ENTRIES_PER_BLOCK {
        let de = entries.entry_mut(i);
        if de.ino().is_none() {
            de.set_ino(Some(child));
            de.set_name(name);
            return Ok(());
        }
    }
    Err(Error::DirectoryFull)
}

fn entries_block(dir: &Inode) -> Result<BlockNo, Error> {
    if dir.kind != InodeKind::Directory {
        return Err(Error::NotADirectory);
    }
    dir.indirect.ok_or(Error::NotADirectory)
}
