//! The shared upstream connection.
//!
//! All clients funnel into one pipelined stream. The upstream preserves
//! request/response order, so the queue bookkeeping here is the whole
//! correctness story: `pending` holds clients whose requests are still in
//! their own buffers, `ready` holds clients whose requests have been
//! written and whose replies are owed, aligned by position with the
//! forthcoming reply frames.

use crate::buffer::Buffer;
use bytes::Bytes;
use mio::net::TcpStream;
use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;

/// A coalesced request batch in flight to the upstream.
///
/// Segments are frozen at promotion time, so a client disconnecting while
/// the batch is partially written cannot invalidate the remaining bytes.
#[derive(Debug)]
struct Batch {
    segments: Vec<Bytes>,
    /// Bytes of the batch already accepted by the socket.
    written: usize,
}

impl Batch {
    /// Slices covering the unwritten tail, for one vectored write.
    fn unwritten_slices(&self) -> Vec<IoSlice<'_>> {
        let mut skip = self.written;
        let mut slices = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            slices.push(IoSlice::new(&segment[skip..]));
            skip = 0;
        }
        slices
    }
}

/// The shared upstream connection.
pub struct Backend {
    pub stream: TcpStream,

    /// Upstream address.
    pub addr: SocketAddr,

    /// Reply bytes accumulated from the upstream; a partial trailing
    /// frame survives here between reads.
    pub recv_buf: Buffer,

    /// Clients with buffered requests awaiting the next coalescing
    /// window, in arrival order.
    pending: Vec<usize>,

    /// Clients awaiting replies, aligned 1:1 with forthcoming frames.
    /// `None` is a tombstone: the client disconnected after its request
    /// was forwarded, and the slot still consumes its reply.
    ready: Vec<Option<usize>>,

    /// Coalesced batch retained across WouldBlock on the upstream socket.
    batch: Option<Batch>,
}

impl Backend {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr,
            recv_buf: Buffer::new(),
            pending: Vec::new(),
            ready: Vec::new(),
            batch: None,
        }
    }

    /// Enqueue a client for the next coalescing window.
    ///
    /// Idempotent: a client already waiting keeps its position, since its
    /// buffered bytes travel as one segment regardless of how many reads
    /// accumulated them.
    pub fn push_pending(&mut self, key: usize) {
        if !self.pending.contains(&key) {
            self.pending.push(key);
        }
    }

    /// True when a new batch may be promoted: no batch is in flight,
    /// requests are waiting, and every reply from the previous batch has
    /// been dispatched. The empty-`ready` gate is what keeps slot i of
    /// the next batch aligned with reply i.
    pub fn can_promote(&self) -> bool {
        self.batch.is_none() && !self.pending.is_empty() && self.ready.is_empty()
    }

    /// Drain the pending queue, preserving order.
    pub fn take_pending(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.pending)
    }

    /// Stage a promoted batch: each entry pairs a client with its frozen
    /// request segment, in the order the replies will come back.
    pub fn begin_batch(&mut self, entries: Vec<(usize, Bytes)>) {
        let mut segments = Vec::with_capacity(entries.len());
        for (key, segment) in entries {
            self.ready.push(Some(key));
            segments.push(segment);
        }
        self.batch = Some(Batch {
            segments,
            written: 0,
        });
    }

    /// True while a promoted batch has unwritten bytes.
    pub fn has_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// Write the in-flight batch with vectored writes until it completes
    /// or the socket would block. Returns true when fully flushed.
    pub fn write_batch(&mut self) -> io::Result<bool> {
        let Some(batch) = self.batch.as_mut() else {
            return Ok(true);
        };
        loop {
            let slices = batch.unwritten_slices();
            if slices.is_empty() {
                break;
            }
            match self.stream.write_vectored(&slices) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => batch.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.batch = None;
        Ok(true)
    }

    /// Number of replies still owed by the upstream.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// The client owed reply `i`, or `None` for a tombstone.
    pub fn ready_slot(&self, i: usize) -> Option<usize> {
        self.ready.get(i).copied().flatten()
    }

    /// Drop the first `n` slots after their replies were dispatched.
    pub fn drain_ready(&mut self, n: usize) {
        self.ready.drain(..n);
    }

    /// Take the whole ready queue (for teardown).
    pub fn take_ready(&mut self) -> Vec<Option<usize>> {
        std::mem::take(&mut self.ready)
    }

    /// Remove a departing client from both queues.
    ///
    /// `pending` compacts freely (no reply is owed yet). `ready` must
    /// keep its positions, so the client's slots become tombstones that
    /// will consume and discard their replies.
    pub fn pop_client(&mut self, key: usize) {
        self.pending.retain(|&k| k != key);
        for slot in self.ready.iter_mut() {
            if *slot == Some(key) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    /// A connected (mio, std) stream pair over loopback.
    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (TcpStream::from_std(client), peer)
    }

    fn backend() -> (Backend, std::net::TcpStream) {
        let (stream, peer) = connected_pair();
        let addr = peer.local_addr().unwrap();
        (Backend::new(stream, addr), peer)
    }

    #[test]
    fn test_push_pending_deduplicates() {
        let (mut b, _peer) = backend();
        b.push_pending(3);
        b.push_pending(7);
        b.push_pending(3);
        assert_eq!(b.take_pending(), vec![3, 7]);
    }

    #[test]
    fn test_promotion_gate() {
        let (mut b, _peer) = backend();
        assert!(!b.can_promote()); // nothing pending

        b.push_pending(1);
        assert!(b.can_promote());

        b.begin_batch(vec![(1, Bytes::from_static(b"PING\r\n"))]);
        b.push_pending(2);
        // A batch is staged and a reply is owed: no new promotion.
        assert!(!b.can_promote());

        b.drain_ready(1);
        // Reply dispatched but batch still marked in flight.
        assert!(b.has_batch());
        assert!(!b.can_promote());
    }

    #[test]
    fn test_write_batch_concatenates_segments_in_order() {
        let (mut b, mut peer) = backend();
        b.begin_batch(vec![
            (0, Bytes::from_static(b"PING\r\n")),
            (1, Bytes::from_static(b"GET x\r\n")),
        ]);
        assert!(b.write_batch().unwrap());
        assert!(!b.has_batch());
        assert_eq!(b.ready_len(), 2);

        let mut read = vec![0u8; 13];
        peer.read_exact(&mut read).unwrap();
        assert_eq!(&read, b"PING\r\nGET x\r\n");
    }

    #[test]
    fn test_pop_client_tombstones_ready_and_compacts_pending() {
        let (mut b, _peer) = backend();
        b.begin_batch(vec![
            (4, Bytes::from_static(b"a")),
            (5, Bytes::from_static(b"b")),
            (4, Bytes::from_static(b"c")),
        ]);
        b.push_pending(4);
        b.push_pending(6);

        b.pop_client(4);

        assert_eq!(b.take_pending(), vec![6]);
        assert_eq!(b.ready_len(), 3);
        assert_eq!(b.ready_slot(0), None);
        assert_eq!(b.ready_slot(1), Some(5));
        assert_eq!(b.ready_slot(2), None);
    }

    #[test]
    fn test_drain_ready_keeps_later_slots_aligned() {
        let (mut b, _peer) = backend();
        b.begin_batch(vec![
            (1, Bytes::from_static(b"a")),
            (2, Bytes::from_static(b"b")),
            (3, Bytes::from_static(b"c")),
        ]);
        b.drain_ready(2);
        assert_eq!(b.ready_len(), 1);
        assert_eq!(b.ready_slot(0), Some(3));
    }

    #[test]
    fn test_batch_unwritten_slices_skip_written_prefix() {
        let batch = Batch {
            segments: vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")],
            written: 6,
        };
        let slices = batch.unwritten_slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"gh");
    }

    #[test]
    fn test_ready_slot_out_of_range() {
        let (b, _peer) = backend();
        assert_eq!(b.ready_slot(0), None);
    }
}
