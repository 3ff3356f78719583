//! Client connection state.

use crate::buffer::Buffer;
use mio::net::TcpStream;
use std::net::SocketAddr;

/// A client connection.
///
/// Request bytes accumulate in `recv_buf` until the upstream flush
/// promotes them into a coalesced batch; replies for this client are
/// staged in `send_buf` until its socket drains them. The stream is
/// exclusively owned here: dropping the `Client` closes the fd.
pub struct Client {
    pub stream: TcpStream,

    /// Remote address.
    pub addr: SocketAddr,

    /// Partially received request bytes, not yet forwarded upstream.
    pub recv_buf: Buffer,

    /// Replies queued for this client.
    pub send_buf: Buffer,
}

impl Client {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            recv_buf: Buffer::new(),
            send_buf: Buffer::new(),
        }
    }

    /// Queue a reply to send.
    pub fn queue_reply(&mut self, data: &[u8]) {
        self.send_buf.extend_from_slice(data);
    }

    /// Check if there is reply data waiting for the socket.
    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }
}
