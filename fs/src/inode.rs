//! The fixed inode table.
//!
//! Slots are claimed first-fit from a free-map guarded by one mutex; each
//! slot carries its own reader/writer lock, which is the lock file
//! operations take around size and block-reference updates. Inumbers are
//! indices into the table and never outlive a `delete`.

use std::sync::{Mutex, RwLock};

use tfs_fs_types::{
    BLOCK_SIZE, BlockNo, DirEntryBlock, INODE_TABLE_SIZE, IndirectBlock, Inumber, NUM_DIRECT_REFS,
};

use crate::{
    block::{AllocState, BlockPool, storage_delay},
    error::Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

#[derive(Debug)]
pub(crate) struct Inode {
    pub(crate) kind: InodeKind,
    pub(crate) size: usize,
    pub(crate) direct: [Option<BlockNo>; NUM_DIRECT_REFS],
    pub(crate) indirect: Option<BlockNo>,
}

impl Inode {
    fn new_file() -> Self {
        Self {
            kind: InodeKind::File,
            size: 0,
            direct: [None; NUM_DIRECT_REFS],
            indirect: None,
        }
    }

    /// A directory's entry array lives in the block referenced by the
    /// `indirect` slot; the direct slots stay unused.
    fn new_directory(entries_block: BlockNo) -> Self {
        Self {
            kind: InodeKind::Directory,
            size: BLOCK_SIZE,
            direct: [None; NUM_DIRECT_REFS],
            indirect: Some(entries_block),
        }
    }
}

pub(crate) struct InodeTable {
    free: Mutex<[AllocState; INODE_TABLE_SIZE]>,
    slots: Box<[RwLock<Option<Inode>>]>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new([AllocState::Free; INODE_TABLE_SIZE]),
            slots: (0..INODE_TABLE_SIZE).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Creates a new inode, first-fit. A directory gets its entry block
    /// allocated and cleared here; if the pool is exhausted the claimed slot
    /// is returned to the free-map and creation fails.
    pub(crate) fn create(&self, kind: InodeKind, pool: &BlockPool) -> Result<Inumber, Error> {
        storage_delay();
        let i = {
            let mut free = self.free.lock().unwrap();
            let Some(i) = free.iter().position(|state| *state == AllocState::Free) else {
                return Err(Error::OutOfInodes);
            };
            free[i] = AllocState::Taken;
            i
        };

        storage_delay();
        let inode = match kind {
            InodeKind::File => Inode::new_file(),
            InodeKind::Directory => match Self::init_directory(pool) {
                Ok(inode) => inode,
                Err(err) => {
                    self.free.lock().unwrap()[i] = AllocState::Free;
                    return Err(err);
                }
            },
        };

        *self.slots[i].write().unwrap() = Some(inode);
        Ok(Inumber::new(u32::try_from(i).unwrap()))
    }

    fn init_directory(pool: &BlockPool) -> Result<Inode, Error> {
        let bn = pool.alloc()?;
        pool.block(bn)?
            .lock()
            .unwrap()
            .data_mut::<DirEntryBlock>()
            .clear();
        Ok(Inode::new_directory(bn))
    }

    /// Deletes an inode, releasing every block it owns. Deleting a non-empty
    /// directory is rejected.
    pub(crate) fn delete(&self, ino: Inumber, pool: &BlockPool) -> Result<(), Error> {
        storage_delay();
        storage_delay();
        self.with_inode(ino, |inode| -> Result<(), Error> {
            if inode.kind == InodeKind::Directory
                && let Some(bn) = inode.indirect
            {
                let entries = pool.block(bn)?;
                let block = entries.lock().unwrap();
                if block
                    .data::<DirEntryBlock>()
                    .entries()
                    .any(|de| de.ino().is_some())
                {
                    return Err(Error::DirectoryNotEmpty);
                }
            }
            Ok(())
        })??;

        self.truncate_data(ino, pool)?;
        *self.slot(ino)?.write().unwrap() = None;
        self.free.lock().unwrap()[ino.as_index()] = AllocState::Free;
        Ok(())
    }

    /// Frees every block the inode owns: the direct blocks, the blocks
    /// referenced from the indirect table, and the indirect block itself.
    /// Size and references are reset separately by [`Self::reset_metadata`].
    pub(crate) fn truncate_data(&self, ino: Inumber, pool: &BlockPool) -> Result<(), Error> {
        self.with_inode_mut(ino, |inode| -> Result<(), Error> {
            for slot in &mut inode.direct {
                if let Some(bn) = slot.take() {
                    pool.free(bn)?;
                }
            }
            if let Some(bn) = inode.indirect.take() {
                if inode.kind == InodeKind::File {
                    let block = pool.block(bn)?;
                    let mut guard = block.lock().unwrap();
                    for target in guard.data_mut::<IndirectBlock>().drain().flatten() {
                        pool.free(target)?;
                    }
                }
                pool.free(bn)?;
            }
            Ok(())
        })?
    }

    /// Resets size and block references to their initial values.
    pub(crate) fn reset_metadata(&self, ino: Inumber) -> Result<(), Error> {
        self.with_inode_mut(ino, |inode| {
            inode.direct = [None; NUM_DIRECT_REFS];
            inode.indirect = None;
            inode.size = 0;
        })
    }

    /// Runs `f` under the inode's reader lock.
    pub(crate) fn with_inode<R>(
        &self,
        ino: Inumber,
        f: impl FnOnce(&Inode) -> R,
    ) -> Result<R, Error> {
        storage_delay();
        let guard = self.slot(ino)?.read().unwrap();
        let inode = guard.as_ref().ok_or(Error::BadInumber(ino))?;
        Ok(f(inode))
    }

    /// Runs `f` under the inode's writer lock.
    pub(crate) fn with_inode_mut<R>(
        &self,
        ino: Inumber,
        f: impl FnOnce(&mut Inode) -> R,
    ) -> Result<R, Error> {
        storage_delay();
        let mut guard = self.slot(ino)?.write().unwrap();
        let inode = guard.as_mut().ok_or(Error::BadInumber(ino))?;
        Ok(f(inode))
    }

    /// Number of currently free inode slots.
    pub(crate) fn free_count(&self) -> usize {
        self.free
            .lock()
            .unwrap()
            .iter()
            .filter(|state| **state == AllocState::Free)
            .count()
    }

    fn slot(&self, ino: Inumber) -> Result<&RwLock<Option<Inode>>, Error> {
        self.slots.get(ino.as_index()).ok_or(Error::BadInumber(ino))
    }
}

#[cfg(test)]
mod tests {
    use tfs_fs_types::DATA_BLOCKS;

    use super::*;

    #[test]
    fn new_file_inodes_are_empty() {
        let pool = BlockPool::new();
        let table = InodeTable::new();

        let ino = table.create(InodeKind::File, &pool).unwrap();
        assert_eq!(ino, Inumber::new(0));
        table
            .with_inode(ino, |inode| {
                assert_eq!(inode.kind, InodeKind::File);
                assert_eq!(inode.size, 0);
                assert!(inode.direct.iter().all(Option::is_none));
                assert!(inode.indirect.is_none());
            })
            .unwrap();
        assert_eq!(pool.free_count(), DATA_BLOCKS);
    }

    #[test]
    fn new_directories_own_one_cleared_block() {
        let pool = BlockPool::new();
        let table = InodeTable::new();

        let ino = table.create(InodeKind::Directory, &pool).unwrap();
        assert_eq!(pool.free_count(), DATA_BLOCKS - 1);
        table
            .with_inode(ino, |inode| {
                assert_eq!(inode.kind, InodeKind::Directory);
                assert_eq!(inode.size, BLOCK_SIZE);
                let bn = inode.indirect.unwrap();
                let block = pool.block(bn).unwrap();
                let guard = block.lock().unwrap();
                assert!(
                    guard
                        .data::<DirEntryBlock>()
                        .entries()
                        .all(|de| de.ino().is_none())
                );
            })
            .unwrap();
    }

    #[test]
    fn directory_creation_rolls_back_on_block_exhaustion() {
        let pool = BlockPool::new();
        let table = InodeTable::new();
        for _ in 0..DATA_BLOCKS {
            pool.alloc().unwrap();
        }

        assert!(matches!(
            table.create(InodeKind::Directory, &pool),
            Err(Error::OutOfBlocks)
        ));
        // The claimed slot went back to the free-map.
        assert_eq!(table.create(InodeKind::File, &pool).unwrap(), Inumber::new(0));
    }

    #[test]
    fn delete_releases_owned_blocks() {
        let pool = BlockPool::new();
        let table = InodeTable::new();

        let ino = table.create(InodeKind::File, &pool).unwrap();
        table
            .with_inode_mut(ino, |inode| {
                inode.direct[0] = Some(pool.alloc().unwrap());
                inode.direct[1] = Some(pool.alloc().unwrap());
                inode.size = 2 * BLOCK_SIZE;
            })
            .unwrap();
        assert_eq!(pool.free_count(), DATA_BLOCKS - 2);

        table.delete(ino, &pool).unwrap();
        assert_eq!(pool.free_count(), DATA_BLOCKS);
        assert!(matches!(
            table.with_inode(ino, |_| ()),
            Err(Error::BadInumber(_))
        ));
    }

    #[test]
    fn truncate_walks_the_indirect_table() {
        let pool = BlockPool::new();
        let table = InodeTable::new();

        let ino = table.create(InodeKind::File, &pool).unwrap();
        table
            .with_inode_mut(ino, |inode| -> Result<(), Error> {
                for slot in &mut inode.direct {
                    *slot = Some(pool.alloc()?);
                }
                let ind = pool.alloc_pointer_block()?;
                {
                    let block = pool.block(ind)?;
                    let mut guard = block.lock().unwrap();
                    let refs = guard.data_mut::<IndirectBlock>();
                    for i in 0..3 {
                        refs.set(i, Some(pool.alloc()?));
                    }
                }
                inode.indirect = Some(ind);
                Ok(())
            })
            .unwrap()
            .unwrap();
        // 10 direct + 1 pointer + 3 indirect targets.
        assert_eq!(pool.free_count(), DATA_BLOCKS - 14);

        table.truncate_data(ino, &pool).unwrap();
        table.reset_metadata(ino).unwrap();
        assert_eq!(pool.free_count(), DATA_BLOCKS);
        table
            .with_inode(ino, |inode| {
                assert_eq!(inode.size, 0);
                assert!(inode.indirect.is_none());
            })
            .unwrap();
    }

    #[test]
    fn non_empty_directories_cannot_be_deleted() {
        let pool = BlockPool::new();
        let table = InodeTable::new();

        let dir = table.create(InodeKind::Directory, &pool).unwrap();
        let child = table.create(InodeKind::File, &pool).unwrap();
        table
            .with_inode(dir, |inode| {
                let block = pool.block(inode.indirect.unwrap()).unwrap();
                let mut guard = block.lock().unwrap();
                let de = guard.data_mut::<DirEntryBlock>().entry_mut(0);
                de.set_ino(Some(child));
                de.set_name(b"child");
            })
            .unwrap();

        assert!(matches!(
            table.delete(dir, &pool),
            Err(Error::DirectoryNotEmpty)
        ));
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let pool = BlockPool::new();
        let table = InodeTable::new();
        for _ in 0..INODE_TABLE_SIZE {
            table.create(InodeKind::File, &pool).unwrap();
        }
        assert!(matches!(
            table.create(InodeKind::File, &pool),
            Err(Error::OutOfInodes)
        ));
        assert_eq!(table.free_count(), 0);
    }
}
