//! Client/server round trips over real FIFOs, with the server hosted on a
//! test thread and the client side speaking the wire protocol directly.

use std::{
    env,
    fs::File,
    io::{Read as _, Write as _},
    path::{Path, PathBuf},
    process, thread,
};

use anyhow::Result;
use tfs_proto::{
    ClosePayload, MountPayload, OpCode, OpenPayload, ReadPayload, SessionPayload, WritePayload,
    encode_path, read_count, read_status, write_frame,
};
use tfs_server::{Server, fifo};

fn unique_path(tag: &str) -> PathBuf {
    env::temp_dir().join(format!("tfs_{}_{tag}", process::id()))
}

/// A minimal client: one mounted session over a dedicated reply FIFO.
struct Client {
    server: File,
    reply: File,
    reply_path: PathBuf,
    session_id: i32,
}

impl Client {
    fn mount(server_path: &Path, tag: &str) -> Result<Self> {
        let reply_path = unique_path(tag);
        fifo::create(&reply_path)?;

        let mut server = fifo::open_write(server_path)?;
        let payload = MountPayload {
            reply_path: encode_path(reply_path.to_str().unwrap())?,
        };
        write_frame(&mut server, OpCode::Mount, &payload)?;

        let mut reply = fifo::open_read(&reply_path)?;
        let session_id = read_status(&mut reply)?;
        Ok(Self {
            server,
            reply,
            reply_path,
            session_id,
        })
    }

    fn open(&mut self, name: &str, flags: i32) -> Result<i32> {
        let payload = OpenPayload {
            session_id: self.session_id,
            name: encode_path(name)?,
            flags,
        };
        write_frame(&mut self.server, OpCode::Open, &payload)?;
        Ok(read_status(&mut self.reply)?)
    }

    fn close(&mut self, handle: i32) -> Result<i32> {
        let payload = ClosePayload {
            session_id: self.session_id,
            handle,
        };
        write_frame(&mut self.server, OpCode::Close, &payload)?;
        Ok(read_status(&mut self.reply)?)
    }

    fn write(&mut self, handle: i32, data: &[u8]) -> Result<isize> {
        let payload = WritePayload {
            session_id: self.session_id,
            handle,
            len: data.len(),
        };
        write_frame(&mut self.server, OpCode::Write, &payload)?;
        self.server.write_all(data)?;
        Ok(read_count(&mut self.reply)?)
    }

    fn read(&mut self, handle: i32, len: usize) -> Result<(isize, Vec<u8>)> {
        let payload = ReadPayload {
            session_id: self.session_id,
            handle,
            len,
        };
        write_frame(&mut self.server, OpCode::Read, &payload)?;
        let count = read_count(&mut self.reply)?;
        let mut data = vec![0; usize::try_from(count).unwrap_or(0)];
        self.reply.read_exact(&mut data)?;
        Ok((count, data))
    }

    fn unmount(mut self) -> Result<i32> {
        let payload = SessionPayload {
            session_id: self.session_id,
        };
        write_frame(&mut self.server, OpCode::Unmount, &payload)?;
        let status = read_status(&mut self.reply)?;
        fifo::remove(&self.reply_path)?;
        Ok(status)
    }

    fn shutdown(mut self) -> Result<i32> {
        let payload = SessionPayload {
            session_id: self.session_id,
        };
        write_frame(&mut self.server, OpCode::Shutdown, &payload)?;
        let status = read_status(&mut self.reply)?;
        fifo::remove(&self.reply_path)?;
        Ok(status)
    }
}

#[test]
fn wire_round_trip() -> Result<()> {
    let server_path = unique_path("rv_roundtrip");
    let server = Server::new(server_path.clone())?;

    thread::scope(|scope| -> Result<()> {
        let serving = scope.spawn(|| server.run());

        let mut client = Client::mount(&server_path, "c_roundtrip")?;
        assert!(client.session_id >= 0);

        let f = client.open("/f1", 0x1)?;
        assert_eq!(f, 0);
        assert_eq!(client.write(f, b"AAA!")?, 4);
        assert_eq!(client.close(f)?, 0);

        let f = client.open("/f1", 0)?;
        assert_eq!(f, 0);
        let (count, data) = client.read(f, 39)?;
        assert_eq!(count, 4);
        assert_eq!(&data, b"AAA!");
        assert_eq!(client.close(f)?, 0);
        assert_eq!(client.unmount()?, 0);

        let client = Client::mount(&server_path, "c_shutdown")?;
        assert_eq!(client.shutdown()?, 0);

        serving.join().unwrap()?;
        Ok(())
    })?;

    fifo::remove(&server_path)?;
    Ok(())
}

#[test]
fn invalid_requests_get_minus_one() -> Result<()> {
    let server_path = unique_path("rv_invalid");
    let server = Server::new(server_path.clone())?;

    thread::scope(|scope| -> Result<()> {
        let serving = scope.spawn(|| server.run());

        let mut client = Client::mount(&server_path, "c_invalid")?;
        assert!(client.session_id >= 0);

        // Open without CREATE on a missing name, then misuse handles.
        assert_eq!(client.open("/missing", 0)?, -1);
        assert_eq!(client.close(17)?, -1);
        assert_eq!(client.write(-1, b"x")?, -1);
        assert_eq!(client.read(99, 4)?.0, -1);

        assert_eq!(client.shutdown()?, 0);
        serving.join().unwrap()?;
        Ok(())
    })?;

    fifo::remove(&server_path)?;
    Ok(())
}

#[test]
fn a_full_session_pool_refuses_the_next_mount() -> Result<()> {
    let server_path = unique_path("rv_full");
    let server = Server::new(server_path.clone())?;

    thread::scope(|scope| -> Result<()> {
        let serving = scope.spawn(|| server.run());

        let mut mounted = Vec::new();
        for i in 0..tfs_proto::MAX_SESSIONS {
            let client = Client::mount(&server_path, &format!("c_full_{i}"))?;
            assert!(client.session_id >= 0);
            mounted.push(client);
        }

        let refused = Client::mount(&server_path, "c_full_extra")?;
        assert_eq!(refused.session_id, -1);
        fifo::remove(&refused.reply_path)?;

        // Freeing one slot makes mounting work again.
        assert_eq!(mounted.pop().unwrap().unmount()?, 0);
        let replacement = Client::mount(&server_path, "c_full_replacement")?;
        assert!(replacement.session_id >= 0);

        assert_eq!(replacement.shutdown()?, 0);
        for client in mounted {
            fifo::remove(&client.reply_path)?;
        }
        serving.join().unwrap()?;
        Ok(())
    })?;

    fifo::remove(&server_path)?;
    Ok(())
}
