//! Growable byte buffers for socket I/O.
//!
//! One `Buffer` backs one direction of a connection. The edge-triggered
//! reactor requires draining a readable socket until it reports
//! WouldBlock, and writable sockets may accept only part of the buffer;
//! both disciplines live here so connection code stays declarative.

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Chunk size for draining a socket.
const READ_CHUNK: usize = 4096;

/// Outcome of draining a socket into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes appended to the buffer.
    pub bytes: usize,
    /// True if the peer's end of stream was observed.
    pub closed: bool,
}

/// A growable, front-consumable byte region.
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes copied from `src`.
    pub fn extend_from_slice(&mut self, src: &[u8]) {
        self.data.extend_from_slice(src);
    }

    /// Discard the leading `n` bytes.
    pub fn truncate_front(&mut self, n: usize) {
        self.data.advance(n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Take the entire contents as a frozen segment, leaving the buffer
    /// empty. O(1); the segment stays valid however the buffer is reused.
    pub fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    /// Drain `stream` into the buffer until it reports WouldBlock.
    ///
    /// A zero-length read marks the peer's end of stream; any bytes read
    /// before it are kept.
    pub fn read_from<S: Read>(&mut self, stream: &mut S) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Ok(ReadOutcome {
                        bytes: total,
                        closed: true,
                    });
                }
                Ok(n) => {
                    self.data.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome {
                        bytes: total,
                        closed: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of the buffer as `stream` accepts, discarding what
    /// was written. Bytes that would block stay at the front for the next
    /// writable event.
    pub fn write_to<S: Write>(&mut self, stream: &mut S) -> io::Result<usize> {
        let mut total = 0;
        while !self.data.is_empty() {
            match stream.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.data.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}
