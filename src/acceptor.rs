//! Turns a listening socket into a source of new connections (spec.md §3/§4.5
//! "Acceptor"). Grounded on muduo's `Acceptor.{h,cc}`.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use log::error;

use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::{channel::Channel, socket_ops};

type NewConnectionCallback = Box<dyn FnMut(RawFd, Endpoint)>;

/// Accepts connections on one listening socket and hands accepted
/// descriptors to `new_connection_callback`.
///
/// `idle_fd` holds a spare, already-open descriptor (`/dev/null`) so that
/// when `accept4` fails with `EMFILE`, the acceptor can close it, accept
/// (and immediately drop) the pending connection to stop the listening
/// socket from busy-spinning readiness, then reopen the spare — the dance
/// muduo credits to libev's docs (spec.md §4.5 edge cases).
pub struct Acceptor {
    loop_: Arc<EventLoop>,
    accept_fd: RawFd,
    channel: Arc<Channel>,
    listening: Cell<bool>,
    idle_fd: Cell<RawFd>,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(loop_: Arc<EventLoop>, listen_addr: Endpoint, reuse_port: bool) -> Arc<Acceptor> {
        let accept_fd = socket_ops::create_nonblocking_socket(listen_addr)
            .unwrap_or_else(|e| panic!("Acceptor: create_nonblocking_socket failed: {}", e));
        socket_ops::set_reuse_addr(accept_fd, true).expect("SO_REUSEADDR");
        socket_ops::set_reuse_port(accept_fd, reuse_port).expect("SO_REUSEPORT");
        socket_ops::bind(accept_fd, listen_addr).expect("bind");

        let idle_fd = open_idle_fd();
        let channel = Arc::new(Channel::new(loop_.clone(), accept_fd));

        let acceptor = Arc::new(Acceptor {
            loop_,
            accept_fd,
            channel,
            listening: Cell::new(false),
            idle_fd: Cell::new(idle_fd),
            new_connection_callback: RefCell::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor
            .channel
            .set_read_callback(move |_recv_time| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_read();
                }
            });

        acceptor
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(RawFd, Endpoint) + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    /// The listening socket's bound address, useful when `listen_addr` was
    /// given with an ephemeral port (port 0).
    pub fn local_addr(&self) -> Endpoint {
        socket_ops::local_addr(self.accept_fd).expect("getsockname on listening socket")
    }

    pub fn listen(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        self.listening.set(true);
        socket_ops::listen(self.accept_fd, 1024).expect("listen");
        self.channel.enable_reading();
    }

    fn handle_read(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        loop {
            match socket_ops::accept(self.accept_fd) {
                Ok(Some((conn_fd, peer_addr))) => {
                    if let Some(cb) = self.new_connection_callback.borrow_mut().as_mut() {
                        cb(conn_fd, peer_addr);
                    } else {
                        socket_ops::close(conn_fd);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!("Acceptor::handle_read: {}", err);
                    if err.raw_os_error() == Some(libc::EMFILE) {
                        socket_ops::close(self.idle_fd.get());
                        let placeholder = unsafe {
                            libc::accept(self.accept_fd, std::ptr::null_mut(), std::ptr::null_mut())
                        };
                        socket_ops::close(placeholder);
                        self.idle_fd.set(open_idle_fd());
                    }
                    break;
                }
            }
        }
    }
}

fn open_idle_fd() -> RawFd {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        panic!("Acceptor: failed to open /dev/null: {}", std::io::Error::last_os_error());
    }
    fd
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        socket_ops::close(self.accept_fd);
        socket_ops::close(self.idle_fd.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    /// Restores `RLIMIT_NOFILE` on drop, including on an early panic, so a
    /// failed assertion can never leave the test process's descriptor
    /// ceiling tightened for whatever runs afterward.
    struct RestoreRlimit(libc::rlimit);

    impl Drop for RestoreRlimit {
        fn drop(&mut self) {
            unsafe {
                libc::setrlimit(libc::RLIMIT_NOFILE, &self.0);
            }
        }
    }

    /// Scenario 6 (EMFILE survival) in isolation: rather than actually
    /// exhausting descriptors process-wide, pin `RLIMIT_NOFILE`'s soft limit
    /// down to 3 — below any fd this process has already opened getting
    /// here (stdio alone is 0-2, plus the loop's epoll/eventfd/timerfd and
    /// this acceptor's listening + idle fds) — so the very next fd
    /// allocation is guaranteed to fail with EMFILE regardless of what any
    /// other test happens to have open concurrently.
    #[test]
    fn emfile_during_accept_recovers_via_the_idle_fd_dance() {
        let loop_ = EventLoop::new();
        let acceptor = Acceptor::new(loop_.clone(), Endpoint::loopback_v4(0), false);
        acceptor.listen();
        let addr = acceptor.local_addr();

        let accepted: Arc<Mutex<Vec<RawFd>>> = Arc::new(Mutex::new(Vec::new()));
        let accepted_for_cb = accepted.clone();
        acceptor.set_new_connection_callback(move |fd, _peer| {
            accepted_for_cb.lock().unwrap().push(fd);
        });

        // A pending connection for handle_read to drain via the idle-fd
        // dance instead of handing it to the callback above.
        let client = std::net::TcpStream::connect(SocketAddr::from(addr))
            .expect("client connect to the acceptor's listening socket");

        let mut original = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut original) };
        assert_eq!(ret, 0, "getrlimit: {}", std::io::Error::last_os_error());
        let _restore = RestoreRlimit(original);

        let tight = libc::rlimit {
            rlim_cur: 3,
            rlim_max: original.rlim_max,
        };
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &tight) };
        assert_eq!(ret, 0, "setrlimit: {}", std::io::Error::last_os_error());

        let idle_fd_before = acceptor.idle_fd.get();
        acceptor.handle_read();

        drop(_restore);

        // The pending connection was accept4'd and immediately closed to
        // stop the listening socket from busy-spinning, never reaching the
        // new-connection callback.
        assert!(accepted.lock().unwrap().is_empty());
        // The idle fd was closed and replaced, not merely left in place.
        assert_ne!(acceptor.idle_fd.get(), idle_fd_before);

        drop(client);

        // With descriptors available again, the next connection is
        // accepted normally.
        let client2 = std::net::TcpStream::connect(SocketAddr::from(addr))
            .expect("second client connect after the limit is restored");
        acceptor.handle_read();
        let fds = accepted.lock().unwrap();
        assert_eq!(fds.len(), 1);
        socket_ops::close(fds[0]);
        drop(client2);
    }
}
