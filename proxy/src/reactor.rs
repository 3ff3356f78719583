//! The event loop: accept, coalesce, flush, fan out.
//!
//! A single mio `Poll` drives every socket edge-triggered. Client tokens
//! are slab keys; the listener and the upstream connection live above a
//! reserved offset. Request flow: client socket -> client recv buffer ->
//! promoted batch -> one vectored upstream write. Reply flow: upstream
//! socket -> backend recv buffer -> framer -> per-client send buffers,
//! routed purely by position.

use crate::backend::Backend;
use crate::client::Client;
use crate::config::{Config, ExcessReplyPolicy};
use crate::metrics::{
    CLIENT_BYTES_RX, CLIENT_CONNECTIONS, REPLIES_DISCARDED, UPSTREAM_BATCHES, UPSTREAM_BYTES_TX,
    UPSTREAM_CONNECTS, UPSTREAM_REPLIES,
};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info, trace, warn};

/// Client tokens are slab keys; fixed tokens live above this offset.
const RESERVED_TOKEN_OFFSET: usize = 1 << 30;

/// The listening socket.
const LISTENER: Token = Token(RESERVED_TOKEN_OFFSET);

/// The upstream connection.
const BACKEND: Token = Token(RESERVED_TOKEN_OFFSET + 1);

/// Listen backlog.
const BACKLOG: i32 = 20;

/// Event capacity per poll.
const MAX_EVENTS: usize = 1024;

/// The proxy: one listener, one optional upstream, many clients.
pub struct Proxy {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    clients: Slab<Client>,
    backend: Option<Backend>,
    config: Config,
    /// Tokens freed during the current event batch. Later events in the
    /// same snapshot for these tokens belong to the dead connection and
    /// must not reach whatever reuses the slot.
    freed: Vec<Token>,
}

impl Proxy {
    /// Bind the listener and set up the reactor.
    pub fn new(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = listen(config.proxy.listen)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        info!(listen = %config.proxy.listen, "listening");

        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            listener,
            clients: Slab::with_capacity(1024),
            backend: None,
            config,
            freed: Vec::new(),
        })
    }

    /// The bound listen address (useful when configured with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the event loop until a fatal error.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.turn()?;
        }
    }

    /// One blocking wait plus dispatch of its ready set.
    fn turn(&mut self) -> io::Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        // Snapshot the readiness set: handlers reregister sockets and
        // mutate the slab while we dispatch.
        let ready: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable(),
                    e.is_writable(),
                    e.is_read_closed() || e.is_error(),
                )
            })
            .collect();

        self.freed.clear();
        for (token, readable, writable, closed) in ready {
            if self.freed.contains(&token) {
                continue;
            }
            match token {
                LISTENER => self.accept_clients()?,
                BACKEND => self.backend_ready(readable, writable, closed)?,
                Token(key) => self.client_ready(key, readable, writable, closed)?,
            }
        }
        Ok(())
    }

    // ── Acceptor ────────────────────────────────────────────────────────

    /// Accept until the listener would block.
    fn accept_clients(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "set_nodelay failed");
                    }
                    let entry = self.clients.vacant_entry();
                    let token = Token(entry.key());
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    entry.insert(Client::new(stream, addr));
                    CLIENT_CONNECTIONS.increment();
                    trace!(client = token.0, peer = %addr, "accepted");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_transient_accept_error(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ── Client ──────────────────────────────────────────────────────────

    fn client_ready(
        &mut self,
        key: usize,
        readable: bool,
        writable: bool,
        closed: bool,
    ) -> io::Result<()> {
        if !self.clients.contains(key) {
            return Ok(());
        }
        if closed {
            self.close_client(key, "peer closed");
            return Ok(());
        }
        if readable {
            self.client_readable(key)?;
        }
        if writable && self.clients.contains(key) {
            self.client_writable(key)?;
        }
        Ok(())
    }

    /// Drain the client socket and stage its request for the next
    /// coalescing window.
    fn client_readable(&mut self, key: usize) -> io::Result<()> {
        // The shared upstream is established lazily, on first demand.
        if self.backend.is_none() {
            self.connect_backend()?;
        }

        let Some(client) = self.clients.get_mut(key) else {
            return Ok(());
        };
        let outcome = match client.recv_buf.read_from(&mut client.stream) {
            Ok(o) => o,
            Err(e) => {
                debug!(client = key, error = %e, "read failed");
                self.close_client(key, "read error");
                return Ok(());
            }
        };
        CLIENT_BYTES_RX.add(outcome.bytes as u64);

        if outcome.closed {
            self.close_client(key, "eof");
            return Ok(());
        }
        if outcome.bytes == 0 {
            return Ok(());
        }

        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        backend.push_pending(key);
        trace!(client = key, bytes = outcome.bytes, "request buffered");

        // The flush itself waits for the upstream's writable event, so
        // requests from other clients in this same wakeup coalesce.
        self.poll.registry().reregister(
            &mut backend.stream,
            BACKEND,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    /// Push queued replies to the client socket.
    fn client_writable(&mut self, key: usize) -> io::Result<()> {
        let Some(client) = self.clients.get_mut(key) else {
            return Ok(());
        };
        match client.send_buf.write_to(&mut client.stream) {
            Ok(_) => {
                let interest = if client.has_pending_send() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                self.poll
                    .registry()
                    .reregister(&mut client.stream, Token(key), interest)?;
            }
            Err(e) => {
                debug!(client = key, error = %e, "write failed");
                self.close_client(key, "write error");
            }
        }
        Ok(())
    }

    /// Free a client: scrub it from the upstream queues (tombstoning its
    /// ready slots), deregister, and drop the stream, closing the fd.
    fn close_client(&mut self, key: usize, reason: &str) {
        let Some(mut client) = self.clients.try_remove(key) else {
            return;
        };
        if let Some(backend) = self.backend.as_mut() {
            backend.pop_client(key);
        }
        if let Err(e) = self.poll.registry().deregister(&mut client.stream) {
            debug!(client = key, error = %e, "deregister failed");
        }
        self.freed.push(Token(key));
        CLIENT_CONNECTIONS.decrement();
        debug!(client = key, peer = %client.addr, reason, "client closed");
    }

    // ── Upstream ────────────────────────────────────────────────────────

    /// Establish the shared upstream connection. Idempotent.
    fn connect_backend(&mut self) -> io::Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let addr = resolve(&self.config.upstream.host, self.config.upstream.port)?;
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(upstream = %addr, error = %e, "set_nodelay failed");
        }
        let mut backend = Backend::new(stream, addr);
        // Writable fires when the non-blocking connect completes.
        self.poll.registry().register(
            &mut backend.stream,
            BACKEND,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        UPSTREAM_CONNECTS.increment();
        info!(upstream = %addr, "connecting");
        self.backend = Some(backend);
        Ok(())
    }

    fn backend_ready(&mut self, readable: bool, writable: bool, closed: bool) -> io::Result<()> {
        if self.backend.is_none() {
            return Ok(());
        }
        if closed {
            self.drop_backend("upstream closed");
            return Ok(());
        }
        if readable {
            self.recv_replies()?;
        }
        if writable && self.backend.is_some() {
            self.flush_upstream()?;
        }
        Ok(())
    }

    /// Promote the pending queue into a coalesced batch and write it
    /// upstream as a single vectored write.
    fn flush_upstream(&mut self) -> io::Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };

        if !backend.has_batch() {
            // Promote only once every reply from the previous batch has
            // been dispatched; slot i of this batch owns reply i.
            if !backend.can_promote() {
                return Ok(());
            }
            let keys = backend.take_pending();
            let mut entries = Vec::with_capacity(keys.len());
            for key in keys {
                let Some(client) = self.clients.get_mut(key) else {
                    continue;
                };
                let segment = client.recv_buf.take();
                if segment.is_empty() {
                    continue;
                }
                entries.push((key, segment));
            }
            if entries.is_empty() {
                self.poll.registry().reregister(
                    &mut backend.stream,
                    BACKEND,
                    Interest::READABLE,
                )?;
                return Ok(());
            }
            let total: usize = entries.iter().map(|(_, s)| s.len()).sum();
            UPSTREAM_BATCHES.increment();
            UPSTREAM_BYTES_TX.add(total as u64);
            trace!(clients = entries.len(), bytes = total, "batch promoted");
            backend.begin_batch(entries);
        }

        match backend.write_batch() {
            Ok(true) => {
                // Batch on the wire; now waiting on replies.
                self.poll.registry().reregister(
                    &mut backend.stream,
                    BACKEND,
                    Interest::READABLE,
                )?;
            }
            Ok(false) => {
                // WouldBlock mid-batch: stay write-armed, resume later.
                trace!("upstream write blocked, batch retained");
            }
            Err(e) => {
                warn!(error = %e, "upstream write failed");
                self.drop_backend("write error");
            }
        }
        Ok(())
    }

    /// Drain the upstream socket and route complete reply frames to the
    /// clients that own them.
    fn recv_replies(&mut self) -> io::Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let outcome = match backend.recv_buf.read_from(&mut backend.stream) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "upstream read failed");
                self.drop_backend("read error");
                return Ok(());
            }
        };

        if outcome.bytes > 0 {
            self.dispatch_replies()?;
        }
        if self.backend.is_none() {
            return Ok(());
        }
        if outcome.closed {
            self.drop_backend("upstream eof");
            return Ok(());
        }

        // Pending may have grown while replies were dispatched; arm for
        // both directions and let the flush gate decide.
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        self.poll.registry().reregister(
            &mut backend.stream,
            BACKEND,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    /// Frame the buffered reply bytes and copy each frame to the ready
    /// client at the same ordinal position.
    fn dispatch_replies(&mut self) -> io::Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };

        let split = match funnel_resp::split(backend.recv_buf.as_slice()) {
            Ok(s) => s,
            Err(e) => {
                // The reply stream is unparseable, so the position-based
                // routing contract is unrecoverable.
                error!(
                    error = %e,
                    buffer = %String::from_utf8_lossy(backend.recv_buf.as_slice()),
                    "malformed upstream reply stream"
                );
                return Err(io::Error::other("malformed upstream reply stream"));
            }
        };

        if split.len() > backend.ready_len() {
            let expected = backend.ready_len();
            let buffer = String::from_utf8_lossy(backend.recv_buf.as_slice()).into_owned();
            match self.config.upstream.excess_replies {
                ExcessReplyPolicy::Exit => {
                    error!(
                        expected,
                        actual = split.len(),
                        buffer = %buffer,
                        "more replies than clients awaiting them"
                    );
                    return Err(io::Error::other("unsolicited upstream replies"));
                }
                ExcessReplyPolicy::Disconnect => {
                    warn!(
                        expected,
                        actual = split.len(),
                        "unsolicited upstream replies, dropping upstream"
                    );
                    self.drop_backend("unsolicited replies");
                    return Ok(());
                }
            }
        }

        let mut notify = Vec::with_capacity(split.len());
        for (i, range) in split.frames().iter().enumerate() {
            UPSTREAM_REPLIES.increment();
            match backend.ready_slot(i) {
                Some(key) => {
                    if let Some(client) = self.clients.get_mut(key) {
                        client.queue_reply(&backend.recv_buf.as_slice()[range.clone()]);
                        notify.push(key);
                    }
                }
                None => {
                    // Tombstone: the owed client is gone; the reply is
                    // consumed to keep later slots aligned.
                    REPLIES_DISCARDED.increment();
                    trace!(slot = i, "reply for departed client discarded");
                }
            }
        }
        backend.drain_ready(split.len());

        if split.finished() {
            backend.recv_buf.clear();
        } else {
            backend.recv_buf.truncate_front(split.interrupt_point());
        }

        self.notify_each(&notify)?;
        Ok(())
    }

    /// Arm each recipient for writing; the next loop iteration drains
    /// their reply buffers.
    fn notify_each(&mut self, keys: &[usize]) -> io::Result<()> {
        for &key in keys {
            if let Some(client) = self.clients.get_mut(key) {
                self.poll.registry().reregister(
                    &mut client.stream,
                    Token(key),
                    Interest::READABLE | Interest::WRITABLE,
                )?;
            }
        }
        Ok(())
    }

    /// Tear down the upstream connection.
    ///
    /// Clients still awaiting replies are freed with it: their replies
    /// can never arrive. Clients with buffered but unpromoted requests
    /// keep their bytes and trigger a fresh connect on their next
    /// readable event.
    fn drop_backend(&mut self, reason: &str) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut backend.stream) {
            debug!(error = %e, "upstream deregister failed");
        }
        self.freed.push(BACKEND);
        warn!(upstream = %backend.addr, reason, "upstream connection dropped");
        for slot in backend.take_ready() {
            if let Some(key) = slot {
                self.close_client(key, "upstream lost");
            }
        }
    }
}

/// Run the proxy until a fatal error.
pub fn run(config: Config) -> io::Result<()> {
    let mut proxy = Proxy::new(config)?;
    proxy.run()
}

/// Resolve the upstream endpoint to a socket address.
fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "upstream host did not resolve"))
}

/// Bind the listening socket: SO_REUSEADDR + SO_REUSEPORT, non-blocking,
/// fixed backlog.
fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        let fd = socket.as_raw_fd();
        let optval: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

/// Accept errors that the loop ignores.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    ) || e.raw_os_error() == Some(libc::EPROTO)
}
