//! Per-session command slots.
//!
//! The producer parses one request at a time and hands it to the session's
//! slot; the session's worker consumes it under the slot mutex. A slot holds
//! at most one command, which is enough because a client waits for each
//! reply before sending its next request.

use std::{
    path::PathBuf,
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tfs_proto::MAX_SESSIONS;

/// A parsed request, buffered for the session's worker.
#[derive(Debug)]
pub(crate) enum Command {
    Mount { reply_path: PathBuf },
    Unmount,
    Open { name: Vec<u8>, flags: i32 },
    Close { handle: i32 },
    Write { handle: i32, data: Vec<u8> },
    Read { handle: i32, len: usize },
    Shutdown,
}

#[derive(Default)]
struct Slot {
    active: bool,
    command: Option<Command>,
}

struct Session {
    state: Mutex<Slot>,
    cond: Condvar,
}

pub(crate) struct SessionTable {
    sessions: Vec<Session>,
    running: AtomicBool,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            sessions: (0..MAX_SESSIONS)
                .map(|_| Session {
                    state: Mutex::new(Slot::default()),
                    cond: Condvar::new(),
                })
                .collect(),
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claims the first free slot for a new session and wakes exactly that
    /// session's worker. Returns `None` when the pool is full.
    pub(crate) fn claim_free(&self, cmd: Command) -> Option<usize> {
        for (sid, session) in self.sessions.iter().enumerate() {
            let mut slot = session.state.lock().unwrap();
            if !slot.active {
                slot.active = true;
                slot.command = Some(cmd);
                session.cond.notify_one();
                return Some(sid);
            }
        }
        None
    }

    /// Hands a command to an active session and wakes its worker. Returns
    /// `false` for out-of-range or unmounted sessions.
    pub(crate) fn deliver(&self, sid: usize, cmd: Command) -> bool {
        let Some(session) = self.sessions.get(sid) else {
            return false;
        };
        let mut slot = session.state.lock().unwrap();
        if !slot.active {
            return false;
        }
        slot.command = Some(cmd);
        session.cond.notify_one();
        true
    }

    /// Marks the slot free for the next mount.
    pub(crate) fn release(&self, sid: usize) {
        let mut slot = self.sessions[sid].state.lock().unwrap();
        slot.active = false;
        slot.command = None;
    }

    /// Blocks until a command arrives for `sid`; `None` once the server has
    /// shut down.
    pub(crate) fn next_command(&self, sid: usize) -> Option<Command> {
        let session = &self.sessions[sid];
        let mut slot = session.state.lock().unwrap();
        loop {
            if let Some(cmd) = slot.command.take() {
                return Some(cmd);
            }
            if !self.is_running() {
                return None;
            }
            slot = session.cond.wait(slot).unwrap();
        }
    }

    /// Flips the status off and wakes every worker so idle sessions exit
    /// promptly.
    pub(crate) fn shut_down(&self) {
        self.running.store(false, Ordering::Release);
        for session in &self.sessions {
            let _guard = session.state.lock().unwrap();
            session.cond.notify_all();
        }
    }
}
