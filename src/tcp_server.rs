//! Composes an [`Acceptor`] on a "main" loop with a pool of sub-loops and
//! owns the map of live connections (spec.md §3/§4.7 "TcpServer"). Grounded
//! on muduo's `TcpServer.{h,cc}`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThreadPool, LoopInitCallback};
use crate::socket_ops;
use crate::tcp_connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};

/// Owns the acceptor, the sub-loop pool, and the connection-name-keyed map.
/// Shared as `Arc<TcpServer>` so the acceptor's new-connection callback and
/// each connection's close callback can reach back without a strong cycle
/// (both capture `Weak<TcpServer>`, matching `Acceptor`'s own pattern).
pub struct TcpServer {
    loop_: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: RefCell<Option<Arc<Acceptor>>>,
    thread_pool: RefCell<EventLoopThreadPool>,

    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    thread_init_callback: RefCell<Option<LoopInitCallback>>,

    next_conn_id: Cell<u64>,
    connections: RefCell<HashMap<String, Arc<TcpConnection>>>,
    started: AtomicBool,
}

// Same thread-confinement discipline as `EventLoop`/`TcpConnection`: every
// `Cell`/`RefCell` field is read and mutated only on `loop_`'s thread
// (`new_connection`/`remove_connection_in_loop`/`start` all assert it);
// neither `Send` nor `Sync` is auto-derivable because of the boxed
// callbacks and the `RefCell<HashMap<_, Arc<TcpConnection>>>`.
unsafe impl Sync for TcpServer {}
unsafe impl Send for TcpServer {}

impl TcpServer {
    pub fn new(
        loop_: Arc<EventLoop>,
        listen_addr: Endpoint,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Arc<TcpServer> {
        let name = name.into();
        let ip_port = listen_addr.to_ip_port();

        let server = Arc::new(TcpServer {
            loop_: loop_.clone(),
            ip_port,
            name: name.clone(),
            acceptor: RefCell::new(None),
            thread_pool: RefCell::new(EventLoopThreadPool::new(loop_.clone(), name)),
            connection_callback: RefCell::new(Arc::new(default_connection_callback)),
            message_callback: RefCell::new(Arc::new(default_message_callback)),
            write_complete_callback: RefCell::new(None),
            thread_init_callback: RefCell::new(None),
            next_conn_id: Cell::new(1),
            connections: RefCell::new(HashMap::new()),
            started: AtomicBool::new(false),
        });

        let acceptor = Acceptor::new(loop_, listen_addr, reuse_port);
        {
            let weak: Weak<TcpServer> = Arc::downgrade(&server);
            acceptor.set_new_connection_callback(move |fd: RawFd, peer_addr: Endpoint| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer_addr);
                } else {
                    socket_ops::close(fd);
                }
            });
        }
        *server.acceptor.borrow_mut() = Some(acceptor);

        server
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The acceptor's bound address, useful when the server was constructed
    /// with an ephemeral port (port 0).
    pub fn local_addr(&self) -> Endpoint {
        self.acceptor
            .borrow()
            .as_ref()
            .expect("acceptor initialized in TcpServer::new")
            .local_addr()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.borrow_mut() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.borrow_mut() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.borrow_mut() = Some(cb);
    }

    pub fn set_thread_init_callback(&self, cb: LoopInitCallback) {
        *self.thread_init_callback.borrow_mut() = Some(cb);
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.borrow_mut().set_thread_num(num_threads);
    }

    pub fn num_connections(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Idempotent: an atomic test-and-set gates starting the pool and
    /// posting `acceptor.listen()` onto the main loop (spec.md §4.7).
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let init_cb = self.thread_init_callback.borrow().clone();
        self.thread_pool.borrow_mut().start(init_cb);

        let acceptor = self
            .acceptor
            .borrow()
            .clone()
            .expect("acceptor initialized in TcpServer::new");
        self.loop_.run_in_loop(move || {
            if !acceptor.is_listening() {
                acceptor.listen();
            }
        });
    }

    fn new_connection(self: &Arc<Self>, fd: RawFd, peer_addr: Endpoint) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self.thread_pool.borrow().get_next_loop();

        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        let local_addr = match socket_ops::local_addr(fd) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpServer::new_connection getsockname fd={}: {}", fd, err);
                socket_ops::close(fd);
                return;
            }
        };

        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), fd, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_callback.borrow().clone());
        conn.set_message_callback(self.message_callback.borrow().clone());
        if let Some(cb) = self.write_complete_callback.borrow().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak_server: Weak<TcpServer> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |c: &Arc<TcpConnection>| {
            if let Some(server) = weak_server.upgrade() {
                server.remove_connection(c.clone());
            }
        }));

        self.connections.borrow_mut().insert(conn_name, conn.clone());

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Installed as every connection's close callback: always defers onto
    /// the main loop, matching muduo's `TcpServer::removeConnection`
    /// binding `this` without taking ownership of the server.
    pub(crate) fn remove_connection(self: &Arc<Self>, conn: Arc<TcpConnection>) {
        let this = self.clone();
        self.loop_.queue_in_loop(move || this.remove_connection_in_loop(conn));
    }

    /// Erases the map entry (dropping one strong reference) then posts
    /// `connectDestroyed` onto the connection's own sub-loop via
    /// `queue_in_loop` — not `run_in_loop` — so that in single-threaded
    /// mode (where the sub-loop *is* the main loop) this still runs after
    /// the current dispatch frame unwinds, never inside it (spec.md §4.7).
    fn remove_connection_in_loop(self: &Arc<Self>, conn: Arc<TcpConnection>) {
        self.loop_.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        self.connections.borrow_mut().remove(conn.name());
        let conn_loop = conn.loop_().clone();
        conn_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!("TcpServer::dtor[{}]", self.name);
        for (_, conn) in self.connections.borrow_mut().drain() {
            let conn_loop = conn.loop_().clone();
            conn_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
