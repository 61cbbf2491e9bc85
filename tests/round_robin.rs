//! New connections are distributed round-robin across the server's sub-loop
//! pool (spec.md §4.7 `getNextLoop`).

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactor_net::tcp_connection::{ConnectionCallback, MessageCallback};
use reactor_net::{Endpoint, EventLoopThread, TcpServer};

fn init_logging() {
    let _ = env_logger::try_init();
}

#[test]
fn connections_are_distributed_round_robin_across_sub_loops() {
    init_logging();

    let thread = EventLoopThread::new("round-robin-test");
    let main_loop = thread.start_loop();

    let server = TcpServer::new(main_loop, Endpoint::loopback_v4(0), "RoundRobinServer", false);
    server.set_thread_num(2);

    let loop_ids: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let loop_ids_for_cb = loop_ids.clone();
    let on_connect: ConnectionCallback = Arc::new(move |conn| {
        if conn.connected() {
            let ptr = Arc::as_ptr(conn.loop_()) as usize;
            loop_ids_for_cb.lock().unwrap().push(ptr);
        }
    });
    server.set_connection_callback(on_connect);

    let echo: MessageCallback = Arc::new(|conn, buf, _recv_time| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    });
    server.set_message_callback(echo);
    server.start();

    let addr = server.local_addr();

    for _ in 0..4 {
        let mut stream = TcpStream::connect(std::net::SocketAddr::from(addr)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).unwrap();
        // Dropping here closes the connection before the next connect, so
        // acceptance order (and thus round-robin order) stays deterministic.
    }

    std::thread::sleep(Duration::from_millis(100));

    let ids = loop_ids.lock().unwrap();
    assert_eq!(ids.len(), 4);
    let distinct: HashSet<_> = ids.iter().collect();
    assert_eq!(distinct.len(), 2, "expected exactly 2 distinct sub-loops used");
    assert_eq!(ids[0], ids[2], "round-robin should cycle back to the first sub-loop");
    assert_eq!(ids[1], ids[3]);
    assert_ne!(ids[0], ids[1]);
}

#[test]
fn zero_threads_means_every_connection_uses_the_main_loop() {
    init_logging();

    let thread = EventLoopThread::new("round-robin-single");
    let main_loop = thread.start_loop();
    let main_loop_ptr = Arc::as_ptr(&main_loop) as usize;

    let server = TcpServer::new(main_loop, Endpoint::loopback_v4(0), "SingleLoopServer", false);
    // no set_thread_num call: pool stays empty, every connection lands on
    // the base (main) loop.

    let loop_ids: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let loop_ids_for_cb = loop_ids.clone();
    let on_connect: ConnectionCallback = Arc::new(move |conn| {
        if conn.connected() {
            loop_ids_for_cb
                .lock()
                .unwrap()
                .push(Arc::as_ptr(conn.loop_()) as usize);
        }
    });
    server.set_connection_callback(on_connect);
    server.start();

    let addr = server.local_addr();
    for _ in 0..3 {
        let mut stream = TcpStream::connect(std::net::SocketAddr::from(addr)).unwrap();
        stream.write_all(b"x").unwrap();
        drop(stream);
    }
    std::thread::sleep(Duration::from_millis(100));

    let ids = loop_ids.lock().unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|&id| id == main_loop_ptr));
}
