//! Graceful half-close: queued output drains before the socket's write side
//! is actually closed, and the connection only fully tears down once the
//! peer closes its side too (spec.md §4.6 `TcpConnection::shutdown`).

use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use reactor_net::tcp_connection::ConnectionCallback;
use reactor_net::{Endpoint, EventLoopThread, TcpServer};

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn shutdown_drains_pending_writes_then_half_closes() {
    init_logging();

    let thread = EventLoopThread::new("shutdown-test");
    let main_loop = thread.start_loop();

    let server = TcpServer::new(main_loop, Endpoint::loopback_v4(0), "ShutdownServer", false);

    let (down_tx, down_rx) = mpsc::channel();
    let on_connect: ConnectionCallback = Arc::new(move |conn| {
        if conn.connected() {
            conn.send(b"part1");
            conn.send(b"part2");
            conn.shutdown();
        } else {
            let _ = down_tx.send(());
        }
    });
    server.set_connection_callback(on_connect);
    server.start();

    let addr = server.local_addr();
    let mut stream = TcpStream::connect(std::net::SocketAddr::from(addr)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut received = Vec::new();
    stream
        .read_to_end(&mut received)
        .expect("read until the half-close EOF");
    assert_eq!(received, b"part1part2");

    // The server only half-closed (SHUT_WR); it is still waiting on a read
    // from us. Closing our side now lets it observe EOF and tear down.
    drop(stream);

    down_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("connection callback to fire DOWN after the peer fully closes");
}

#[test]
fn shutdown_on_an_idle_connection_half_closes_immediately() {
    init_logging();

    let thread = EventLoopThread::new("shutdown-idle");
    let main_loop = thread.start_loop();

    let server = TcpServer::new(main_loop, Endpoint::loopback_v4(0), "ShutdownIdleServer", false);

    let on_connect: ConnectionCallback = Arc::new(move |conn| {
        if conn.connected() {
            conn.shutdown();
        }
    });
    server.set_connection_callback(on_connect);
    server.start();

    let addr = server.local_addr();
    let mut stream = TcpStream::connect(std::net::SocketAddr::from(addr)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut received = Vec::new();
    stream
        .read_to_end(&mut received)
        .expect("read until the half-close EOF");
    assert!(received.is_empty());
}
