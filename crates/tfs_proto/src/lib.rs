//! Wire protocol between TecnicoFS clients and the server.
//!
//! Requests travel over the server's rendezvous channel as concatenated
//! frames with no delimiters: a one-byte op code followed by a fixed-layout
//! payload. Op codes are the ASCII digits `'1'`-`'7'`. Integer fields use the
//! host's native encoding; path and name fields are null-padded fixed-length
//! strings of [`PATH_LEN`] bytes. The server reads exactly the payload length
//! for each op code and must not assume any client-side padding.
//!
//! Replies travel on the per-session channel the client names at mount time:
//! a single native-endian integer, followed by the read bytes for a
//! successful `read`.

use std::io::{self, Read, Write};

use dataview::{Pod, PodMethods as _};
use strum::FromRepr;

/// Maximum number of concurrently mounted sessions.
pub const MAX_SESSIONS: usize = 10;

/// Width of the fixed path and name fields in request frames.
pub const PATH_LEN: usize = tfs_fs_types::MAX_FILENAME;

/// The one-byte operation code leading every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum OpCode {
    Mount = b'1',
    Unmount = b'2',
    Open = b'3',
    Close = b'4',
    Write = b'5',
    Read = b'6',
    Shutdown = b'7',
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown op code {0:#04x}")]
    UnknownOpCode(u8),
    #[error("path of {0} bytes does not fit a {PATH_LEN}-byte field")]
    PathTooLong(usize),
}

/// Payload of `mount`: the client's reply channel path.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct MountPayload {
    pub reply_path: [u8; PATH_LEN],
}

/// Payload of `unmount` and `shutdown`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct SessionPayload {
    pub session_id: i32,
}

/// Payload of `open`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct OpenPayload {
    pub session_id: i32,
    pub name: [u8; PATH_LEN],
    pub flags: i32,
}

/// Payload of `close`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct ClosePayload {
    pub session_id: i32,
    pub handle: i32,
}

/// Fixed-width prefix of `write`; `len` content bytes follow it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct WritePayload {
    pub session_id: i32,
    pub handle: i32,
    pub len: usize,
}

/// Payload of `read`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
pub struct ReadPayload {
    pub session_id: i32,
    pub handle: i32,
    pub len: usize,
}

/// Reads one op-code byte.
pub fn read_op_code(r: &mut impl Read) -> io::Result<Result<OpCode, FrameError>> {
    let mut op = [0u8; 1];
    r.read_exact(&mut op)?;
    Ok(OpCode::from_repr(op[0]).ok_or(FrameError::UnknownOpCode(op[0])))
}

/// Reads a fixed-layout payload, exactly `size_of::<T>()` bytes.
pub fn read_payload<T: Pod>(r: &mut impl Read) -> io::Result<T> {
    let mut payload = T::zeroed();
    r.read_exact(payload.as_bytes_mut())?;
    Ok(payload)
}

/// Writes one request frame: the op code followed by its payload bytes.
pub fn write_frame<T: Pod>(w: &mut impl Write, op: OpCode, payload: &T) -> io::Result<()> {
    w.write_all(&[op as u8])?;
    w.write_all(payload.as_bytes())
}

/// Encodes a path into a null-padded fixed-length field.
pub fn encode_path(path: &str) -> Result<[u8; PATH_LEN], FrameError> {
    let bytes = path.as_bytes();
    // Room for the null terminator.
    if bytes.len() >= PATH_LEN {
        return Err(FrameError::PathTooLong(bytes.len()));
    }
    let mut field = [0u8; PATH_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// The stored bytes of a path field, up to the first null.
#[must_use]
pub fn decode_path(field: &[u8; PATH_LEN]) -> &[u8] {
    let len = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    &field[..len]
}

/// Writes an `i32` reply status.
pub fn write_status(w: &mut impl Write, status: i32) -> io::Result<()> {
    w.write_all(&status.to_ne_bytes())
}

/// Writes an `isize` reply count.
pub fn write_count(w: &mut impl Write, count: isize) -> io::Result<()> {
    w.write_all(&count.to_ne_bytes())
}

/// Reads an `i32` reply status.
pub fn read_status(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; size_of::<i32>()];
    r.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

/// Reads an `isize` reply count.
pub fn read_count(r: &mut impl Read) -> io::Result<isize> {
    let mut buf = [0u8; size_of::<isize>()];
    r.read_exact(&mut buf)?;
    Ok(isize::from_ne_bytes(buf))
}
