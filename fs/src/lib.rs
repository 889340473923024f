//! TecnicoFS: an in-memory, single-root file system.
//!
//! The engine is a value: every table it needs (block pool, inode table,
//! open-file table) lives inside [`TecnicoFs`], so embedding programs and
//! tests can hold several independent instances. All operations take `&self`
//! and are safe to call from multiple threads; the locking discipline is,
//! outermost first: open-file entry mutex, per-inode reader/writer lock,
//! per-block byte mutex, with the allocation free-maps as leaves.
//!
//! Files are addressed through `NUM_DIRECT_REFS` direct block references
//! plus one single-indirect block, giving a maximum file size of
//! [`MAX_FILE_SIZE`](tfs_fs_types::MAX_FILE_SIZE) bytes. The namespace is a
//! single flat root directory.

use std::{cmp, fs::File, io::Write as _, path::Path};

use tfs_fs_types::{BLOCK_SIZE, BlockNo, IndirectBlock, MAX_FILE_BLOCKS, NUM_DIRECT_REFS};

mod block;
mod dir;
mod error;
mod inode;
mod open_file;

pub use error::Error;
pub use tfs_fs_types::{Inumber, OpenFlags, RawHandle};

use self::{
    block::BlockPool,
    inode::{InodeKind, InodeTable},
    open_file::{OpenFile, OpenFileTable},
};

pub struct TecnicoFs {
    blocks: BlockPool,
    inodes: InodeTable,
    open_files: OpenFileTable,
}

impl TecnicoFs {
    /// Creates a fresh file system with the root directory at
    /// [`Inumber::ROOT`].
    pub fn new() -> Result<Self, Error> {
        let fs = Self {
            blocks: BlockPool::new(),
            inodes: InodeTable::new(),
            open_files: OpenFileTable::new(),
        };
        let root = fs.inodes.create(InodeKind::Directory, &fs.blocks)?;
        if root != Inumber::ROOT {
            return Err(Error::BadRoot(root));
        }
        Ok(fs)
    }

    /// Blocks until every open file has been closed.
    pub fn destroy_after_all_closed(&self) {
        self.open_files.wait_all_closed();
    }

    /// Resolves a path in the root directory.
    pub fn lookup(&self, path: &str) -> Result<Inumber, Error> {
        let name = file_name(path)?;
        self.inodes
            .with_inode(Inumber::ROOT, |root| {
                dir::lookup_in(root, &self.blocks, name)
            })??
            .ok_or(Error::EntryNotFound)
    }

    /// Opens a file, creating or truncating it according to `flags`, and
    /// returns a handle into the open-file table.
    ///
    /// When `CREATE` succeeds but the open-file table is full, the file
    /// stays created even though no handle is returned.
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<RawHandle, Error> {
        let name = file_name(path)?;
        let existing = self.inodes.with_inode(Inumber::ROOT, |root| {
            dir::lookup_in(root, &self.blocks, name)
        })??;

        let (ino, offset) = match existing {
            Some(ino) => self.prepare_existing(ino, flags)?,
            None if flags.contains(OpenFlags::CREATE) => {
                let (ino, created) = self.create_at_root(name)?;
                if created {
                    (ino, 0)
                } else {
                    self.prepare_existing(ino, flags)?
                }
            }
            None => return Err(Error::EntryNotFound),
        };

        self.open_files.open_entry(ino, offset)
    }

    /// Truncates if requested and computes the initial offset.
    fn prepare_existing(&self, ino: Inumber, flags: OpenFlags) -> Result<(Inumber, usize), Error> {
        if flags.contains(OpenFlags::TRUNC) {
            self.inodes.truncate_data(ino, &self.blocks)?;
            self.inodes.reset_metadata(ino)?;
        }
        let offset = if flags.contains(OpenFlags::APPEND) {
            self.inodes.with_inode(ino, |inode| inode.size)?
        } else {
            0
        };
        Ok((ino, offset))
    }

    /// Creates `name` in the root directory. Runs under the root's writer
    /// lock so concurrent creates of one name agree on a single inode; the
    /// second caller gets `(ino, false)`.
    fn create_at_root(&self, name: &[u8]) -> Result<(Inumber, bool), Error> {
        self.inodes
            .with_inode_mut(Inumber::ROOT, |root| -> Result<(Inumber, bool), Error> {
                if let Some(ino) = dir::lookup_in(root, &self.blocks, name)? {
                    return Ok((ino, false));
                }
                let ino = self.inodes.create(InodeKind::File, &self.blocks)?;
                if let Err(err) = dir::insert_into(root, &self.blocks, ino, name) {
                    self.inodes.delete(ino, &self.blocks)?;
                    return Err(err);
                }
                Ok((ino, true))
            })?
    }

    /// Releases the open-file entry. Errors only on an invalid handle.
    pub fn close(&self, handle: RawHandle) -> Result<(), Error> {
        self.open_files.close_entry(handle)
    }

    /// Writes `buf` at the handle's position, block by block, growing the
    /// file as needed. Returns the number of bytes written, which falls
    /// short of `buf.len()` only at the maximum file size.
    pub fn write(&self, handle: RawHandle, buf: &[u8]) -> Result<usize, Error> {
        let entry = self.open_files.entry(handle)?;
        let mut entry = entry.lock().unwrap();
        let file = entry.as_mut().ok_or(Error::BadHandle(handle))?;

        let mut written = 0;
        while written < buf.len() {
            if file.block_offset >= MAX_FILE_BLOCKS {
                break;
            }
            let room = BLOCK_SIZE - file.byte_offset;
            let n = cmp::min(room, buf.len() - written);
            let bn = self.ensure_block(file)?;
            {
                let block = self.blocks.block(bn)?;
                let mut guard = block.lock().unwrap();
                guard.bytes_mut()[file.byte_offset..file.byte_offset + n]
                    .copy_from_slice(&buf[written..written + n]);
            }
            self.inodes
                .with_inode_mut(file.inumber, |inode| inode.size += n)?;
            file.advance(n);
            written += n;
        }
        Ok(written)
    }

    /// Reads up to `buf.len()` bytes at the handle's position, bounded by
    /// the bytes available before end of file.
    pub fn read(&self, handle: RawHandle, buf: &mut [u8]) -> Result<usize, Error> {
        let entry = self.open_files.entry(handle)?;
        let mut entry = entry.lock().unwrap();
        let file = entry.as_mut().ok_or(Error::BadHandle(handle))?;

        let size = self.inodes.with_inode(file.inumber, |inode| inode.size)?;
        let available = size.saturating_sub(file.position());
        let to_read = cmp::min(buf.len(), available);

        let mut read = 0;
        while read < to_read {
            let room = BLOCK_SIZE - file.byte_offset;
            let n = cmp::min(room, to_read - read);
            let bn = self.locate_block(file)?;
            {
                let block = self.blocks.block(bn)?;
                let guard = block.lock().unwrap();
                buf[read..read + n]
                    .copy_from_slice(&guard.bytes()[file.byte_offset..file.byte_offset + n]);
            }
            file.advance(n);
            read += n;
        }
        Ok(read)
    }

    /// Copies a file out to the host file system with standard file I/O.
    pub fn copy_to_external(&self, src: &str, dst: impl AsRef<Path>) -> Result<(), Error> {
        let handle = self.open(src, OpenFlags::empty())?;
        let result = self.copy_out(handle, dst.as_ref());
        self.close(handle)?;
        result
    }

    fn copy_out(&self, handle: RawHandle, dst: &Path) -> Result<(), Error> {
        let size = {
            let entry = self.open_files.entry(handle)?;
            let guard = entry.lock().unwrap();
            let file = guard.as_ref().ok_or(Error::BadHandle(handle))?;
            self.inodes.with_inode(file.inumber, |inode| inode.size)?
        };

        let mut buf = vec![0; size];
        let n = self.read(handle, &mut buf)?;
        let mut dest = File::create(dst)?;
        dest.write_all(&buf[..n])?;
        Ok(())
    }

    /// Number of free blocks in the pool.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.blocks.free_count()
    }

    /// Number of free inode slots.
    #[must_use]
    pub fn free_inode_count(&self) -> usize {
        self.inodes.free_count()
    }

    /// Returns the block backing the handle's current position, allocating
    /// it and every block below it that is still missing. The eager prefix
    /// keeps every byte before the position backed.
    fn ensure_block(&self, file: &OpenFile) -> Result<BlockNo, Error> {
        let k = file.block_offset;
        self.inodes
            .with_inode_mut(file.inumber, |inode| -> Result<BlockNo, Error> {
                if k < NUM_DIRECT_REFS {
                    for slot in &mut inode.direct[..=k] {
                        if slot.is_none() {
                            *slot = Some(self.blocks.alloc()?);
                        }
                    }
                    Ok(inode.direct[k].unwrap())
                } else {
                    let ind = match inode.indirect {
                        Some(bn) => bn,
                        None => {
                            let bn = self.blocks.alloc_pointer_block()?;
                            inode.indirect = Some(bn);
                            bn
                        }
                    };
                    let j = k - NUM_DIRECT_REFS;
                    let block = self.blocks.block(ind)?;
                    let mut guard = block.lock().unwrap();
                    let refs = guard.data_mut::<IndirectBlock>();
                    for i in 0..=j {
                        if refs.get(i).is_none() {
                            refs.set(i, Some(self.blocks.alloc()?));
                        }
                    }
                    Ok(refs.get(j).unwrap())
                }
            })?
    }

    /// Returns the block backing the handle's current position, which must
    /// already be allocated.
    fn locate_block(&self, file: &OpenFile) -> Result<BlockNo, Error> {
        let k = file.block_offset;
        self.inodes
            .with_inode(file.inumber, |inode| -> Result<BlockNo, Error> {
                let bn = if k < NUM_DIRECT_REFS {
                    inode.direct[k]
                } else {
                    let Some(ind) = inode.indirect else {
                        return Err(Error::UnbackedBlock(k));
                    };
                    let j = k - NUM_DIRECT_REFS;
                    let block = self.blocks.block(ind)?;
                    let guard = block.lock().unwrap();
                    guard.data::<IndirectBlock>().get(j)
                };
                bn.ok_or(Error::UnbackedBlock(k))
            })?
    }
}

/// Validates a path: `/` followed by at least one byte, all of it the name
/// of an entry in the root directory.
fn file_name(path: &str) -> Result<&[u8], Error> {
    let name = path.strip_prefix('/').ok_or(Error::InvalidPath)?;
    if name.is_empty() {
        return Err(Error::InvalidPath);
    }
    Ok(name.as_bytes())
}
