//! End-to-end tests for the proxy.
//!
//! Each test runs a real proxy thread against a scripted upstream and
//! drives it with plain blocking sockets. Upstream scripts only ever read
//! what the proxy has provably forwarded, which keeps the scenarios
//! deterministic without polling loops.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Start a proxy pointed at `upstream_addr`, return its listen address.
fn start_proxy(upstream_addr: SocketAddr) -> SocketAddr {
    let config: funnel::Config = toml::from_str(&format!(
        r#"
        [proxy]
        listen = "127.0.0.1:0"

        [upstream]
        host = "127.0.0.1"
        port = {}
        "#,
        upstream_addr.port()
    ))
    .unwrap();

    let mut proxy = funnel::Proxy::new(config).unwrap();
    let addr = proxy.local_addr().unwrap();
    thread::spawn(move || {
        let _ = proxy.run();
    });
    addr
}

/// Read exactly `n` bytes, with a timeout so a broken proxy fails the
/// test instead of hanging it.
fn recv_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Assert that no further bytes arrive within a short window.
fn assert_silent(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "unexpected bytes: {:?}", &buf[..n]),
        Err(e) => assert!(
            matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "unexpected error: {e}"
        ),
    }
}

/// Park on a blocking read so the connection stays open until the test
/// process exits.
fn hold_open(mut conn: TcpStream) {
    let _ = conn.set_read_timeout(None);
    let _ = conn.read(&mut [0u8; 1]);
}

/// An upstream that answers every `PING\r\n` with `+PONG\r\n`, however
/// the requests are packed into reads.
fn spawn_ping_upstream(listener: TcpListener, expected: usize) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut acc = Vec::new();
        let mut chunk = [0u8; 256];
        let mut served = 0;
        while served < expected {
            let n = conn.read(&mut chunk).unwrap();
            if n == 0 {
                return;
            }
            acc.extend_from_slice(&chunk[..n]);
            while acc.len() >= 6 && served < expected {
                assert_eq!(&acc[..6], b"PING\r\n");
                acc.drain(..6);
                conn.write_all(b"+PONG\r\n").unwrap();
                served += 1;
            }
        }
        hold_open(conn);
    })
}

#[test]
fn test_single_ping_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    spawn_ping_upstream(listener, 1);

    let proxy_addr = start_proxy(upstream_addr);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.write_all(b"PING\r\n").unwrap();
    assert_eq!(recv_exactly(&mut client, 7), b"+PONG\r\n");
    assert_silent(&mut client);
}

#[test]
fn test_two_clients_coalesce_and_fan_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    spawn_ping_upstream(listener, 2);

    let proxy_addr = start_proxy(upstream_addr);
    let mut a = TcpStream::connect(proxy_addr).unwrap();
    let mut b = TcpStream::connect(proxy_addr).unwrap();
    a.write_all(b"PING\r\n").unwrap();
    b.write_all(b"PING\r\n").unwrap();

    // Each client gets exactly one reply, never its neighbor's.
    assert_eq!(recv_exactly(&mut a, 7), b"+PONG\r\n");
    assert_eq!(recv_exactly(&mut b, 7), b"+PONG\r\n");
    assert_silent(&mut a);
    assert_silent(&mut b);
}

#[test]
fn test_interleaved_rounds() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    spawn_ping_upstream(listener, 6);

    let proxy_addr = start_proxy(upstream_addr);
    let mut clients: Vec<TcpStream> = (0..3)
        .map(|_| TcpStream::connect(proxy_addr).unwrap())
        .collect();

    for _ in 0..2 {
        for client in clients.iter_mut() {
            client.write_all(b"PING\r\n").unwrap();
        }
        for client in clients.iter_mut() {
            assert_eq!(recv_exactly(client, 7), b"+PONG\r\n");
        }
    }
}

#[test]
fn test_reply_split_across_upstream_reads() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut req = [0u8; 7];
        conn.read_exact(&mut req).unwrap();
        assert_eq!(&req, b"GET x\r\n");
        // Cut the bulk reply mid-payload.
        conn.write_all(b"$5\r\nhel").unwrap();
        conn.flush().unwrap();
        thread::sleep(Duration::from_millis(100));
        conn.write_all(b"lo\r\n").unwrap();
        hold_open(conn);
    });

    let proxy_addr = start_proxy(upstream_addr);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.write_all(b"GET x\r\n").unwrap();
    assert_eq!(recv_exactly(&mut client, 11), b"$5\r\nhello\r\n");
    assert_silent(&mut client);
}

#[test]
fn test_departed_client_reply_is_discarded() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let (forwarded_tx, forwarded_rx) = mpsc::channel::<()>();
    let (reply_tx, reply_rx) = mpsc::channel::<()>();

    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        // A's request hits the wire only after promotion, so once this
        // read returns, A occupies a ready slot.
        let mut req = [0u8; 7];
        conn.read_exact(&mut req).unwrap();
        assert_eq!(&req, b"GET a\r\n");
        forwarded_tx.send(()).unwrap();

        // Hold A's reply until the test has disconnected A.
        reply_rx.recv().unwrap();
        conn.write_all(b"$1\r\na\r\n").unwrap();

        // A's slot was a tombstone, so its reply is discarded and B's
        // batch flushes next.
        let mut req = [0u8; 7];
        conn.read_exact(&mut req).unwrap();
        assert_eq!(&req, b"GET b\r\n");
        conn.write_all(b"$1\r\nb\r\n").unwrap();
        hold_open(conn);
    });

    let proxy_addr = start_proxy(upstream_addr);

    let mut a = TcpStream::connect(proxy_addr).unwrap();
    a.write_all(b"GET a\r\n").unwrap();
    forwarded_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // B arrives while A's reply is owed: it must wait in pending.
    let mut b = TcpStream::connect(proxy_addr).unwrap();
    b.write_all(b"GET b\r\n").unwrap();
    thread::sleep(Duration::from_millis(150));

    // A leaves before its reply exists.
    drop(a);
    thread::sleep(Duration::from_millis(150));
    reply_tx.send(()).unwrap();

    // B receives its own reply and nothing of A's.
    assert_eq!(recv_exactly(&mut b, 8), b"$1\r\nb\r\n");
    assert_silent(&mut b);
}

#[test]
fn test_upstream_close_triggers_reconnect_on_next_request() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        // First connection: one round trip, then close.
        let (mut conn, _) = listener.accept().unwrap();
        let mut req = [0u8; 6];
        conn.read_exact(&mut req).unwrap();
        conn.write_all(b"+PONG\r\n").unwrap();
        drop(conn);

        // The next request must arrive on a fresh connection.
        let (mut conn, _) = listener.accept().unwrap();
        let mut req = [0u8; 6];
        conn.read_exact(&mut req).unwrap();
        assert_eq!(&req, b"PING\r\n");
        conn.write_all(b"+PONG\r\n").unwrap();
        hold_open(conn);
    });

    let proxy_addr = start_proxy(upstream_addr);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.write_all(b"PING\r\n").unwrap();
    assert_eq!(recv_exactly(&mut client, 7), b"+PONG\r\n");

    // Let the proxy observe the upstream's close. The client owes no
    // reply, so it survives the teardown.
    thread::sleep(Duration::from_millis(150));

    client.write_all(b"PING\r\n").unwrap();
    assert_eq!(recv_exactly(&mut client, 7), b"+PONG\r\n");
}

#[test]
fn test_client_awaiting_reply_is_torn_down_with_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        // Take the request into a ready slot, then vanish without
        // replying.
        let mut req = [0u8; 6];
        conn.read_exact(&mut req).unwrap();
        drop(conn);
    });

    let proxy_addr = start_proxy(upstream_addr);
    let mut client = TcpStream::connect(proxy_addr).unwrap();
    client.write_all(b"PING\r\n").unwrap();

    // The owed reply can never arrive; the proxy closes the client.
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 16];
    match client.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "expected close, got bytes: {:?}", &buf[..n]),
        Err(e) => assert!(
            matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ),
            "unexpected error: {e}"
        ),
    }
}
