//! Named-pipe plumbing for the rendezvous and reply channels.

use std::{
    ffi::CString,
    fs::{self, File, OpenOptions},
    io,
    os::unix::ffi::OsStrExt as _,
    path::Path,
};

/// Ignores `SIGPIPE` so a dead reply channel surfaces as a write error
/// instead of terminating the process.
pub fn ignore_sigpipe() {
    // SAFETY: SIG_IGN installs no handler code.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Creates a fresh FIFO at `path`, replacing a stale one.
pub fn create(path: &Path) -> io::Result<()> {
    remove(path)?;
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: cpath is a valid NUL-terminated string.
    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o777) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Removes the FIFO; a path that is already gone is fine.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Opens the FIFO for reading, blocking until a writer appears.
pub fn open_read(path: &Path) -> io::Result<File> {
    retry_interrupted(|| File::open(path))
}

/// Opens the FIFO for writing, blocking until a reader appears.
pub fn open_write(path: &Path) -> io::Result<File> {
    retry_interrupted(|| OpenOptions::new().write(true).open(path))
}

/// Opens the FIFO for writing without blocking; fails with `ENXIO` when no
/// reader has the FIFO open.
pub fn try_open_write(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt as _;
    retry_interrupted(|| {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
    })
}

fn retry_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            result => return result,
        }
    }
}
