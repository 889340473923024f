//! The fixed pool of data blocks.
//!
//! Blocks are allocated first-fit from a free-map guarded by one mutex; the
//! bytes of each block sit behind their own mutex. Multi-block consistency is
//! the caller's job, coordinated through the owning inode's lock.

use std::sync::Mutex;

use dataview::{Pod, PodMethods as _};
use tfs_fs_types::{BLOCK_SIZE, BlockNo, DATA_BLOCKS, IndirectBlock};

use crate::error::Error;

/// Spin iterations emulating one access to secondary storage.
const STORAGE_DELAY: usize = 5000;

/// Burns a short, bounded amount of time, as if the touched state lived on a
/// real storage device. Correctness never depends on it.
pub(crate) fn storage_delay() {
    for _ in 0..STORAGE_DELAY {
        std::hint::spin_loop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocState {
    Free,
    Taken,
}

/// One data block's bytes. The alignment guarantees that the typed views
/// (directory entries, block references) land on aligned addresses.
#[repr(C, align(8))]
pub(crate) struct Block {
    bytes: [u8; BLOCK_SIZE],
}

impl Block {
    const fn new() -> Self {
        Self {
            bytes: [0; BLOCK_SIZE],
        }
    }

    pub(crate) fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.bytes
    }

    /// Returns a reference to the block content as POD.
    pub(crate) fn data<T: Pod>(&self) -> &T {
        self.bytes.as_data_view().get(0)
    }

    /// Returns a mutable reference to the block content as POD.
    pub(crate) fn data_mut<T: Pod>(&mut self) -> &mut T {
        self.bytes.as_data_view_mut().get_mut(0)
    }
}

pub(crate) struct BlockPool {
    free: Mutex<[AllocState; DATA_BLOCKS]>,
    blocks: Box<[Mutex<Block>]>,
}

impl BlockPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new([AllocState::Free; DATA_BLOCKS]),
            blocks: (0..DATA_BLOCKS).map(|_| Mutex::new(Block::new())).collect(),
        }
    }

    /// Allocates the first free block. Contents are not zeroed.
    pub(crate) fn alloc(&self) -> Result<BlockNo, Error> {
        storage_delay();
        let mut free = self.free.lock().unwrap();
        let i = free
            .iter()
            .position(|state| *state == AllocState::Free)
            .ok_or(Error::OutOfBlocks)?;
        free[i] = AllocState::Taken;
        Ok(BlockNo::new(u32::try_from(i).unwrap()))
    }

    /// Allocates a block and fills it with empty reference slots.
    pub(crate) fn alloc_pointer_block(&self) -> Result<BlockNo, Error> {
        let bn = self.alloc()?;
        let mut block = self.block(bn)?.lock().unwrap();
        block.data_mut::<IndirectBlock>().clear();
        Ok(bn)
    }

    pub(crate) fn free(&self, bn: BlockNo) -> Result<(), Error> {
        if bn.as_index() >= DATA_BLOCKS {
            return Err(Error::BadBlockNo(bn));
        }
        storage_delay();
        self.free.lock().unwrap()[bn.as_index()] = AllocState::Free;
        Ok(())
    }

    /// Bounds-checked access to a block's byte mutex.
    pub(crate) fn block(&self, bn: BlockNo) -> Result<&Mutex<Block>, Error> {
        storage_delay();
        self.blocks.get(bn.as_index()).ok_or(Error::BadBlockNo(bn))
    }

    /// Number of currently free blocks.
    pub(crate) fn free_count(&self) -> usize {
        self.free
            .lock()
            .unwrap()
            .iter()
            .filter(|state| **state == AllocState::Free)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use tfs_fs_types::NUM_INDIRECT_REFS;

    use super::*;

    #[test]
    fn alloc_is_first_fit() {
        let pool = BlockPool::new();
        assert_eq!(pool.alloc().unwrap(), BlockNo::new(0));
        assert_eq!(pool.alloc().unwrap(), BlockNo::new(1));
        assert_eq!(pool.alloc().unwrap(), BlockNo::new(2));

        pool.free(BlockNo::new(1)).unwrap();
        assert_eq!(pool.alloc().unwrap(), BlockNo::new(1));
        assert_eq!(pool.alloc().unwrap(), BlockNo::new(3));
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let pool = BlockPool::new();
        for _ in 0..DATA_BLOCKS {
            pool.alloc().unwrap();
        }
        assert!(matches!(pool.alloc(), Err(Error::OutOfBlocks)));
        assert_eq!(pool.free_count(), 0);

        pool.free(BlockNo::new(7)).unwrap();
        assert_eq!(pool.alloc().unwrap(), BlockNo::new(7));
    }

    #[test]
    fn out_of_range_blocks_are_rejected() {
        let pool = BlockPool::new();
        let bad = BlockNo::new(u32::try_from(DATA_BLOCKS).unwrap());
        assert!(pool.free(bad).is_err());
        assert!(pool.block(bad).is_err());
    }

    #[test]
    fn pointer_blocks_start_empty() {
        let pool = BlockPool::new();
        // Dirty the first block, then recycle it as a pointer block.
        let bn = pool.alloc().unwrap();
        pool.block(bn).unwrap().lock().unwrap().bytes_mut().fill(0xff);
        pool.free(bn).unwrap();

        let bn = pool.alloc_pointer_block().unwrap();
        let block = pool.block(bn).unwrap().lock().unwrap();
        let table = block.data::<IndirectBlock>();
        assert!((0..NUM_INDIRECT_REFS).all(|i| table.get(i).is_none()));
    }
}
