//! This module declares messages that are exchanged between the harness and the fork server.
//!
//! This is used only for inter-process communication between copies of the same binary and thus
//! doesn't need to care about versioning or compatibility.

use std::{
    io::{Read as _, Write as _},
    marker::PhantomData,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
};

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::codec::{Decoder as _, Encoder as _, LengthDelimitedCodec};

/// What a forked child should run.
///
/// Built by the parent when the process object is created, so everything the child needs is
/// decided before crossing the process boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// The name of a registered entry point.
    pub entry: String,
    /// The argument vector the child parses its flags from before running the entry.
    pub args: Vec<String>,
}

/// How a child process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// The child called exit with this code.
    Exited(i32),
    /// The child was terminated by this signal.
    Signaled(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match *self {
            ExitStatus::Exited(code) => Some(code),
            ExitStatus::Signaled(_) => None,
        }
    }
}

/// The maximum size of an envelope, in the serialized form.
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// A wrapper around a message that adds a request number.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The request number. The response has the same request number as the request that caused
    /// it.
    pub reqno: u64,
    /// The message itself.
    pub message: T,
}

/// Messages sent from the harness to the fork server.
#[derive(Debug, Serialize, Deserialize)]
pub enum ToForkServer {
    /// Fork a new child running the given target.
    Spawn(Target),
    /// Report the status of the given child if it has exited. Never blocks.
    Wait(i32),
    /// Stop serving. The fork server acknowledges and exits.
    Shutdown,
}

/// Messages sent from the fork server to the harness.
#[derive(Debug, Serialize, Deserialize)]
pub enum FromForkServer {
    /// A child was forked with this pid.
    Spawned(i32),
    /// The waited-for child has exited.
    Exited(ExitStatus),
    /// The waited-for child is still running. Ask again later.
    Running,
    /// A generic acknowledgment message.
    Ack,
    /// The request could not be carried out.
    Error(String),
}

/// A blocking, framed, bincode-encoded channel over a unix stream.
///
/// Frames are prefixed with an 8-byte length.
pub struct Channel<Rx, Tx> {
    stream: UnixStream,
    codec: LengthDelimitedCodec,
    rd_buf: BytesMut,
    _marker: PhantomData<fn(Tx) -> Rx>,
}

impl<Rx: DeserializeOwned, Tx: Serialize> Channel<Rx, Tx> {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            codec: LengthDelimitedCodec::builder()
                .length_field_length(8)
                .max_frame_length(MAX_ENVELOPE_SIZE)
                .new_codec(),
            rd_buf: BytesMut::new(),
            _marker: PhantomData,
        }
    }

    pub fn send(&mut self, envelope: &Envelope<Tx>) -> Result<()> {
        let payload = bincode::serialize(envelope)?;
        let mut frame = BytesMut::with_capacity(payload.len() + 8);
        self.codec.encode(Bytes::from(payload), &mut frame)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Receives the next envelope. Returns `None` on a clean EOF.
    pub fn recv(&mut self) -> Result<Option<Envelope<Rx>>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.codec.decode(&mut self.rd_buf)? {
                return Ok(Some(bincode::deserialize(&frame)?));
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                if self.rd_buf.is_empty() {
                    return Ok(None);
                }
                bail!("EOF in the middle of a frame");
            }
            self.rd_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<Rx, Tx> AsRawFd for Channel<Rx, Tx> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn frames_arrive_in_order_then_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx: Channel<FromForkServer, ToForkServer> = Channel::new(a);
        let mut rx: Channel<ToForkServer, FromForkServer> = Channel::new(b);

        let target = Target {
            entry: "worker".to_string(),
            args: vec!["prog".to_string(), "--exact".to_string()],
        };
        tx.send(&Envelope {
            reqno: 7,
            message: ToForkServer::Spawn(target.clone()),
        })
        .unwrap();
        tx.send(&Envelope {
            reqno: 8,
            message: ToForkServer::Wait(42),
        })
        .unwrap();
        drop(tx);

        let first = rx.recv().unwrap().unwrap();
        assert_eq!(first.reqno, 7);
        assert!(matches!(first.message, ToForkServer::Spawn(t) if t == target));
        let second = rx.recv().unwrap().unwrap();
        assert_eq!(second.reqno, 8);
        assert!(matches!(second.message, ToForkServer::Wait(42)));
        assert!(rx.recv().unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut rx: Channel<ToForkServer, FromForkServer> = Channel::new(b);
        a.write_all(&[0, 0, 0, 0, 0, 0, 0, 16, 1, 2]).unwrap();
        drop(a);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn exit_status() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert_eq!(ExitStatus::Signaled(9).code(), None);
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
    }
}
