//! The open-file table.
//!
//! A handle maps to one entry holding the target inumber and the current
//! position, kept normalised as `(block_offset, byte_offset)` with
//! `byte_offset < BLOCK_SIZE`. Each entry has its own mutex; holding it for
//! the duration of an operation makes operations on one handle linearisable.
//! The table also counts open entries so the engine can wait for the last
//! close before tearing down.

use std::sync::{Condvar, Mutex};

use tfs_fs_types::{BLOCK_SIZE, Inumber, MAX_OPEN_FILES, RawHandle};

use crate::{block::AllocState, error::Error};

#[derive(Debug)]
pub(crate) struct OpenFile {
    pub(crate) inumber: Inumber,
    pub(crate) block_offset: usize,
    pub(crate) byte_offset: usize,
}

impl OpenFile {
    fn new(inumber: Inumber, offset: usize) -> Self {
        Self {
            inumber,
            block_offset: offset / BLOCK_SIZE,
            byte_offset: offset % BLOCK_SIZE,
        }
    }

    /// Logical position in the file.
    pub(crate) fn position(&self) -> usize {
        self.block_offset * BLOCK_SIZE + self.byte_offset
    }

    /// Advances the position by `n` bytes, carrying into `block_offset`.
    /// `n` never exceeds the room left in the current block.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= BLOCK_SIZE - self.byte_offset);
        self.byte_offset += n;
        if self.byte_offset >= BLOCK_SIZE {
            self.byte_offset -= BLOCK_SIZE;
            self.block_offset += 1;
        }
    }
}

struct FreeMap {
    slots: [AllocState; MAX_OPEN_FILES],
    open: usize,
}

pub(crate) struct OpenFileTable {
    free: Mutex<FreeMap>,
    all_closed: Condvar,
    entries: Box<[Mutex<Option<OpenFile>>]>,
}

impl OpenFileTable {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(FreeMap {
                slots: [AllocState::Free; MAX_OPEN_FILES],
                open: 0,
            }),
            all_closed: Condvar::new(),
            entries: (0..MAX_OPEN_FILES).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Claims a free slot for `inumber`, positioned at `offset`.
    pub(crate) fn open_entry(&self, inumber: Inumber, offset: usize) -> Result<RawHandle, Error> {
        let i = {
            let mut free = self.free.lock().unwrap();
            let Some(i) = free
                .slots
                .iter()
                .position(|state| *state == AllocState::Free)
            else {
                return Err(Error::TooManyOpenFiles);
            };
            free.slots[i] = AllocState::Taken;
            free.open += 1;
            i
        };

        *self.entries[i].lock().unwrap() = Some(OpenFile::new(inumber, offset));
        Ok(RawHandle::new(u32::try_from(i).unwrap()))
    }

    /// Releases a slot. Rejects handles that are out of range or already
    /// closed.
    pub(crate) fn close_entry(&self, handle: RawHandle) -> Result<(), Error> {
        let entry = self.entry(handle)?;
        entry
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::BadHandle(handle))?;

        let mut free = self.free.lock().unwrap();
        free.slots[handle.as_index()] = AllocState::Free;
        free.open -= 1;
        if free.open == 0 {
            self.all_closed.notify_all();
        }
        Ok(())
    }

    /// Bounds-checked access to an entry's mutex.
    pub(crate) fn entry(&self, handle: RawHandle) -> Result<&Mutex<Option<OpenFile>>, Error> {
        self.entries
            .get(handle.as_index())
            .ok_or(Error::BadHandle(handle))
    }

    /// Blocks until every entry is closed.
    pub(crate) fn wait_all_closed(&self) {
        let mut free = self.free.lock().unwrap();
        while free.open > 0 {
            free = self.all_closed.wait(free).unwrap();
        }
    }
}
