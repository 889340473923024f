//! The TecnicoFS server.
//!
//! One producer thread reads framed requests from the rendezvous FIFO and
//! demultiplexes them into per-session slots; one worker thread per session
//! executes the commands against the shared engine and replies on the FIFO
//! the client named at mount time. Shutdown is cooperative: the `shutdown`
//! handler waits for every open file to close, flips the global status off,
//! and wakes the idle threads.

use std::{
    ffi::OsStr,
    fs::File,
    io::{self, Read as _, Write as _},
    os::unix::ffi::OsStrExt as _,
    path::{Path, PathBuf},
    process, str, thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use tfs_fs::{OpenFlags, RawHandle, TecnicoFs};
use tfs_proto::{
    ClosePayload, MountPayload, OpCode, OpenPayload, ReadPayload, SessionPayload, WritePayload,
    decode_path, read_payload, write_count, write_status,
};

pub mod fifo;
mod session;

use self::session::{Command, SessionTable};

pub struct Server {
    engine: TecnicoFs,
    sessions: SessionTable,
    rendezvous: PathBuf,
}

impl Server {
    /// Creates the rendezvous FIFO and a fresh engine.
    pub fn new(rendezvous: PathBuf) -> io::Result<Self> {
        fifo::create(&rendezvous)?;
        let engine = TecnicoFs::new().map_err(io::Error::other)?;
        Ok(Self {
            engine,
            sessions: SessionTable::new(),
            rendezvous,
        })
    }

    #[must_use]
    pub fn rendezvous(&self) -> &Path {
        &self.rendezvous
    }

    /// Serves requests until a client sends `shutdown`. Returns once every
    /// worker has drained.
    pub fn run(&self) -> io::Result<()> {
        thread::scope(|scope| {
            for sid in 0..tfs_proto::MAX_SESSIONS {
                scope.spawn(move || self.worker(sid));
            }
            let result = self.produce();
            // Unblock the workers if the producer failed.
            self.sessions.shut_down();
            result
        })
    }

    fn produce(&self) -> io::Result<()> {
        while self.sessions.is_running() {
            let mut pipe = fifo::open_read(&self.rendezvous)?;
            info!("listening on {}", self.rendezvous.display());
            self.demux(&mut pipe)?;
            // All writers left; reopen unless a shutdown happened meanwhile.
        }
        Ok(())
    }

    /// Reads frames until end of stream or shutdown.
    fn demux(&self, pipe: &mut File) -> io::Result<()> {
        while self.sessions.is_running() {
            let op = match tfs_proto::read_op_code(pipe) {
                Ok(Ok(op)) => op,
                Ok(Err(err)) => {
                    debug!("skipping frame: {err}");
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err),
            };
            match self.route(op, pipe) {
                Ok(()) => {}
                // A writer died mid-frame; drop the partial frame and
                // listen again.
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Reads the payload for `op` and hands it to the right session.
    fn route(&self, op: OpCode, pipe: &mut File) -> io::Result<()> {
        match op {
            OpCode::Mount => {
                let payload: MountPayload = read_payload(pipe)?;
                let reply_path = PathBuf::from(OsStr::from_bytes(decode_path(&payload.reply_path)));
                let claimed = self.sessions.claim_free(Command::Mount {
                    reply_path: reply_path.clone(),
                });
                match claimed {
                    Some(sid) => debug!("session {sid} mounting {}", reply_path.display()),
                    None => {
                        warn!("session pool full, refusing {}", reply_path.display());
                        self.refuse_mount(&reply_path);
                    }
                }
            }
            OpCode::Unmount => {
                let payload: SessionPayload = read_payload(pipe)?;
                self.dispatch(payload.session_id, Command::Unmount);
            }
            OpCode::Open => {
                let payload: OpenPayload = read_payload(pipe)?;
                self.dispatch(
                    payload.session_id,
                    Command::Open {
                        name: decode_path(&payload.name).to_vec(),
                        flags: payload.flags,
                    },
                );
            }
            OpCode::Close => {
                let payload: ClosePayload = read_payload(pipe)?;
                self.dispatch(
                    payload.session_id,
                    Command::Close {
                        handle: payload.handle,
                    },
                );
            }
            OpCode::Write => {
                let payload: WritePayload = read_payload(pipe)?;
                let mut data = vec![0; payload.len];
                pipe.read_exact(&mut data)?;
                self.dispatch(
                    payload.session_id,
                    Command::Write {
                        handle: payload.handle,
                        data,
                    },
                );
            }
            OpCode::Read => {
                let payload: ReadPayload = read_payload(pipe)?;
                self.dispatch(
                    payload.session_id,
                    Command::Read {
                        handle: payload.handle,
                        len: payload.len,
                    },
                );
            }
            OpCode::Shutdown => {
                let payload: SessionPayload = read_payload(pipe)?;
                self.dispatch(payload.session_id, Command::Shutdown);
            }
        }
        Ok(())
    }

    fn dispatch(&self, sid: i32, cmd: Command) {
        let delivered =
            usize::try_from(sid).is_ok_and(|sid| self.sessions.deliver(sid, cmd));
        if !delivered {
            warn!("dropping command for unknown session {sid}");
        }
    }

    /// Tells a client there is no free session. The producer itself opens
    /// and closes the reply channel.
    fn refuse_mount(&self, reply_path: &Path) {
        match fifo::open_write(reply_path) {
            Ok(mut pipe) => {
                if let Err(err) = write_status(&mut pipe, -1) {
                    warn!("cannot refuse mount on {}: {err}", reply_path.display());
                }
            }
            Err(err) => warn!("cannot refuse mount on {}: {err}", reply_path.display()),
        }
    }

    fn worker(&self, sid: usize) {
        let mut reply: Option<File> = None;
        while let Some(cmd) = self.sessions.next_command(sid) {
            match self.handle(sid, cmd, &mut reply) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) if recoverable(&err) => {
                    warn!("session {sid}: client gone: {err}");
                    reply = None;
                    self.sessions.release(sid);
                }
                Err(err) => {
                    error!("session {sid}: reply channel failed: {err}");
                    process::exit(1);
                }
            }
        }
    }

    /// Executes one command. `Ok(false)` ends this worker's loop.
    fn handle(&self, sid: usize, cmd: Command, reply: &mut Option<File>) -> io::Result<bool> {
        match cmd {
            Command::Mount { reply_path } => {
                let mut pipe = fifo::open_write(&reply_path)?;
                write_status(&mut pipe, i32::try_from(sid).unwrap())?;
                *reply = Some(pipe);
                info!("session {sid} mounted");
            }
            Command::Unmount => {
                if let Some(pipe) = reply.as_mut() {
                    write_status(pipe, 0)?;
                }
                *reply = None;
                self.sessions.release(sid);
                info!("session {sid} unmounted");
            }
            Command::Open { name, flags } => {
                let status = self.do_open(&name, flags);
                if let Some(pipe) = reply.as_mut() {
                    write_status(pipe, status)?;
                }
            }
            Command::Close { handle } => {
                let status = self.do_close(handle);
                if let Some(pipe) = reply.as_mut() {
                    write_status(pipe, status)?;
                }
            }
            Command::Write { handle, data } => {
                let count = self.do_write(handle, &data);
                if let Some(pipe) = reply.as_mut() {
                    write_count(pipe, count)?;
                }
            }
            Command::Read { handle, len } => {
                let mut data = vec![0; len];
                let count = self.do_read(handle, &mut data);
                if let Some(pipe) = reply.as_mut() {
                    write_count(pipe, count)?;
                    if let Ok(count) = usize::try_from(count) {
                        pipe.write_all(&data[..count])?;
                    }
                }
            }
            Command::Shutdown => {
                self.engine.destroy_after_all_closed();
                if let Some(pipe) = reply.as_mut() {
                    write_status(pipe, 0)?;
                }
                *reply = None;
                self.sessions.release(sid);
                self.sessions.shut_down();
                self.wake_producer();
                info!("session {sid} requested shutdown");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn do_open(&self, name: &[u8], flags: i32) -> i32 {
        let Ok(name) = str::from_utf8(name) else {
            return -1;
        };
        let flags = OpenFlags::from_bits_truncate(flags as u32);
        match self.engine.open(name, flags) {
            Ok(handle) => i32::try_from(handle.value()).unwrap_or(-1),
            Err(err) => {
                debug!("open {name:?}: {err}");
                -1
            }
        }
    }

    fn do_close(&self, handle: i32) -> i32 {
        let Some(handle) = wire_handle(handle) else {
            return -1;
        };
        match self.engine.close(handle) {
            Ok(()) => 0,
            Err(err) => {
                debug!("close {handle}: {err}");
                -1
            }
        }
    }

    fn do_write(&self, handle: i32, data: &[u8]) -> isize {
        let Some(handle) = wire_handle(handle) else {
            return -1;
        };
        match self.engine.write(handle, data) {
            Ok(n) => isize::try_from(n).unwrap_or(-1),
            Err(err) => {
                debug!("write {handle}: {err}");
                -1
            }
        }
    }

    fn do_read(&self, handle: i32, data: &mut [u8]) -> isize {
        let Some(handle) = wire_handle(handle) else {
            return -1;
        };
        match self.engine.read(handle, data) {
            Ok(n) => isize::try_from(n).unwrap_or(-1),
            Err(err) => {
                debug!("read {handle}: {err}");
                -1
            }
        }
    }

    /// Wakes the producer after shutdown with a sentinel byte, in case it is
    /// blocked on an idle rendezvous FIFO. Best effort: when no reader has
    /// the FIFO open the producer has already exited, except for a short
    /// window while it is still entering `open`, covered by the retries.
    fn wake_producer(&self) {
        for _ in 0..5 {
            match fifo::try_open_write(&self.rendezvous) {
                Ok(mut pipe) => {
                    let _ = pipe.write_all(&[0]);
                    return;
                }
                Err(err) => debug!("producer wakeup pending: {err}"),
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn recoverable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotFound | io::ErrorKind::UnexpectedEof
    )
}

fn wire_handle(handle: i32) -> Option<RawHandle> {
    u32::try_from(handle).ok().map(RawHandle::new)
}
