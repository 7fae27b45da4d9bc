//! Exact-count framed I/O over one stream
//!
//! A [`Connection`] owns its stream for its whole lifetime and is never shared
//! between threads. Reads and writes loop until the requested byte count is
//! satisfied; a zero-byte read or write means the peer is gone and surfaces as
//! [`BridgeError::Disconnected`]. There are no timeouts here.

use crate::daemon::protocol::{decode_header, encode, Message, MessageType, HEADER_LEN};
use crate::error::{BridgeError, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

/// Largest step by which a read buffer grows
pub const READ_CHUNK: usize = 64 * 1024;

pub struct Connection<S: Read + Write> {
    stream: S,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Read exactly `n` bytes, however the stream chunks them
    ///
    /// The buffer grows by at most [`READ_CHUNK`] ahead of the bytes actually
    /// received, so an announced length alone never reserves memory.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(n.min(READ_CHUNK));
        let mut filled = 0;

        while filled < n {
            let want = (n - filled).min(READ_CHUNK);
            buffer.resize(filled + want, 0);

            match self.stream.read(&mut buffer[filled..]) {
                Ok(0) => return Err(BridgeError::Disconnected),
                Ok(read) => filled += read,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(BridgeError::from_stream_io(e)),
            }
            buffer.truncate(filled);
        }

        Ok(buffer)
    }

    /// Write every byte, then flush
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut sent = 0;

        while sent < bytes.len() {
            match self.stream.write(&bytes[sent..]) {
                Ok(0) => return Err(BridgeError::Disconnected),
                Ok(written) => sent += written,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(BridgeError::from_stream_io(e)),
            }
        }

        self.stream.flush().map_err(BridgeError::from_stream_io)
    }

    /// Read one complete frame
    pub fn read_message(&mut self) -> Result<Message> {
        let header = self.read_exact(HEADER_LEN)?;
        let header: [u8; HEADER_LEN] = header
            .try_into()
            .map_err(|_| BridgeError::Protocol("truncated header".to_string()))?;
        let (kind, len) = decode_header(&header)?;

        let payload = self.read_exact(len as usize)?;
        Ok(Message { kind, payload })
    }

    /// Write one complete frame
    pub fn write_message(&mut self, kind: MessageType, payload: &[u8]) -> Result<()> {
        let frame = encode(kind, payload)?;
        self.write_all(&frame)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl Connection<TcpStream> {
    /// Human-readable peer address for logging
    pub fn peer(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}
