//! End-to-end echo scenario: a client writes bytes, the server's message
//! callback sends them straight back, the client reads the same bytes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use reactor_net::tcp_connection::MessageCallback;
use reactor_net::{Endpoint, EventLoopThread, TcpServer};

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn echoes_bytes_back_to_the_client() {
    init_logging();

    let thread = EventLoopThread::new("echo-test");
    let main_loop = thread.start_loop();

    let server = TcpServer::new(main_loop, Endpoint::loopback_v4(0), "EchoServer", false);

    let echo: MessageCallback = Arc::new(|conn, buf, _recv_time| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    });
    server.set_message_callback(echo);
    server.start();

    let addr = server.local_addr();
    let mut stream = TcpStream::connect(std::net::SocketAddr::from(addr))
        .expect("client connect to the running acceptor");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    stream.write_all(b"hello reactor").unwrap();

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read the echoed bytes");
    assert_eq!(&buf[..n], b"hello reactor");

    stream.write_all(b"second message").unwrap();
    let n = stream.read(&mut buf).expect("read the second echo");
    assert_eq!(&buf[..n], b"second message");
}

#[test]
fn multiple_clients_each_get_their_own_echo() {
    init_logging();

    let thread = EventLoopThread::new("echo-test-multi");
    let main_loop = thread.start_loop();

    let server = TcpServer::new(main_loop, Endpoint::loopback_v4(0), "EchoServerMulti", false);
    let echo: MessageCallback = Arc::new(|conn, buf, _recv_time| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    });
    server.set_message_callback(echo);
    server.start();

    let addr = server.local_addr();

    for i in 0..4 {
        let payload = format!("client-{i}");
        let mut stream = TcpStream::connect(std::net::SocketAddr::from(addr)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(payload.as_bytes()).unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, payload.as_bytes());
    }
}
