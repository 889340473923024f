use std::io;

use tfs_fs_types::{BlockNo, Inumber, RawHandle};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid path name")]
    InvalidPath,
    #[error("invalid inumber: {0}")]
    BadInumber(Inumber),
    #[error("invalid block number: {0}")]
    BadBlockNo(BlockNo),
    #[error("invalid file handle: {0}")]
    BadHandle(RawHandle),
    #[error("empty entry name")]
    EmptyName,
    #[error("not a directory")]
    NotADirectory,
    #[error("file system entry not found")]
    EntryNotFound,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("directory is full")]
    DirectoryFull,
    #[error("out of data blocks")]
    OutOfBlocks,
    #[error("out of inodes")]
    OutOfInodes,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("file block {0} is not allocated")]
    UnbackedBlock(usize),
    #[error("root directory created at inumber {0}")]
    BadRoot(Inumber),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}
