//! One accepted socket, its channel, and its state machine (spec.md §3/§4.6
//! "TcpConnection"). Grounded on muduo's `TcpConnection.{h,cc}`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::socket_ops;
use crate::timestamp::Timestamp;

/// 64 MiB, matching muduo's `TcpConnection::kHighWaterMark` default.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback =
    Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Shared handle type used throughout the crate, matching muduo's
/// `TcpConnectionPtr` (a `shared_ptr<TcpConnection>`).
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Logs the connection's up/down transition and discards every message,
/// matching muduo's `defaultConnectionCallback`. `TcpServer::new` installs
/// this until the caller supplies its own.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    debug!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards every byte received, matching muduo's `defaultMessageCallback`.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _recv_time: Timestamp) {
    buf.retrieve_all();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One accepted TCP socket. Lives as `Arc<TcpConnection>` so the owning
/// sub-loop's channel callbacks (captured as `Weak`, matching `Acceptor`'s
/// pattern) and the server's connection map (a strong reference) can share
/// it without a cycle (spec.md §4.6 "Lifetime contract").
pub struct TcpConnection {
    loop_: Arc<EventLoop>,
    name: String,
    state: Cell<State>,
    reading: Cell<bool>,
    fd: RawFd,
    channel: Arc<Channel>,
    local_addr: Endpoint,
    peer_addr: Endpoint,

    callbacks: RefCell<Callbacks>,
    high_water_mark: Cell<usize>,

    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,

    context: RefCell<Option<Box<dyn Any>>>,
}

// Every `Cell`/`RefCell` field above is mutated only from `loop_`'s thread:
// the public send/shutdown/force_close/start_read/stop_read entry points
// forward to `*_in_loop` via `run_in_loop` when off-loop, exactly as
// `EventLoop` itself forwards cross-thread posts through its mutex-guarded
// queue. `context` is the one field a caller might touch off-loop (get/set
// context is documented as loop-thread-only, matching muduo's own
// `getContext`/`setContext`, which are not synchronized either).
unsafe impl Sync for TcpConnection {}

// The boxed callbacks (`Box<dyn Any>` context, `Channel`'s boxed `FnMut`s)
// keep this type from auto-deriving `Send`, but `TcpServer::new_connection`
// constructs a connection on the main loop's thread and then hands the
// resulting `Arc<TcpConnection>` to its sub-loop — sound under the same
// thread-confinement discipline as `EventLoop`'s own `Send` impl.
unsafe impl Send for TcpConnection {}

impl TcpConnection {
    pub fn new(
        loop_: Arc<EventLoop>,
        name: impl Into<String>,
        fd: RawFd,
        local_addr: Endpoint,
        peer_addr: Endpoint,
    ) -> Arc<TcpConnection> {
        socket_ops::set_keep_alive(fd, true).ok();
        let channel = Arc::new(Channel::new(loop_.clone(), fd));
        let name = name.into();
        debug!("TcpConnection::ctor[{}] fd={}", name, fd);

        let conn = Arc::new(TcpConnection {
            loop_,
            name,
            state: Cell::new(State::Connecting),
            reading: Cell::new(false),
            fd,
            channel,
            local_addr,
            peer_addr,
            callbacks: RefCell::new(Callbacks::default()),
            high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: RefCell::new(Buffer::new()),
            output_buffer: RefCell::new(Buffer::new()),
            context: RefCell::new(None),
        });

        let weak: Weak<TcpConnection> = Arc::downgrade(&conn);
        {
            let weak = weak.clone();
            conn.channel.set_read_callback(move |recv_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(recv_time);
                }
            });
        }
        {
            let weak = weak.clone();
            conn.channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
        }
        {
            let weak = weak.clone();
            conn.channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
        {
            let weak = weak.clone();
            conn.channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });
        }

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    pub fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Endpoint {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.get() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state.get() == State::Disconnected
    }

    pub fn input_buffer(&self) -> std::cell::RefMut<'_, Buffer> {
        self.input_buffer.borrow_mut()
    }

    pub fn output_buffer(&self) -> std::cell::RefMut<'_, Buffer> {
        self.output_buffer.borrow_mut()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.borrow_mut().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.borrow_mut().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.borrow_mut().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, high_water_mark: usize) {
        self.callbacks.borrow_mut().high_water_mark = Some(cb);
        self.high_water_mark.set(high_water_mark);
    }

    /// Installed by `TcpServer`, not user-facing: schedules
    /// `removeConnectionInLoop` back onto the server's main loop.
    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.borrow_mut().close = Some(cb);
    }

    pub fn set_context(&self, context: Box<dyn Any>) {
        *self.context.borrow_mut() = Some(context);
    }

    pub fn get_context(&self) -> std::cell::Ref<'_, Option<Box<dyn Any>>> {
        self.context.borrow()
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = socket_ops::set_tcp_no_delay(self.fd, on) {
            warn!("TcpConnection::set_tcp_no_delay fd={}: {}", self.fd, err);
        }
    }

    /// `getsockopt(IPPROTO_TCP, TCP_INFO)`, a diagnostic accessor from the
    /// original (SPEC_FULL.md §3.1); not used by any invariant in this
    /// crate.
    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        unsafe {
            let mut info: libc::tcp_info = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
            syscall!(getsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut libc::tcp_info as *mut libc::c_void,
                &mut len,
            ))?;
            Ok(info)
        }
    }

    pub fn tcp_info_string(&self) -> String {
        match self.tcp_info() {
            Ok(info) => format!(
                "unrecovered={} rto={} ato={} snd_mss={} rcv_mss={} lost={} retrans={} rtt={} rttvar={} sshthresh={} cwnd={}",
                info.tcpi_retransmits,
                info.tcpi_rto,
                info.tcpi_ato,
                info.tcpi_snd_mss,
                info.tcpi_rcv_mss,
                info.tcpi_lost,
                info.tcpi_retrans,
                info.tcpi_rtt,
                info.tcpi_rttvar,
                info.tcpi_snd_ssthresh,
                info.tcpi_snd_cwnd,
            ),
            Err(err) => format!("tcp_info unavailable: {}", err),
        }
    }

    /// Ties the channel to this connection, enables reading, and fires
    /// `connectionCallback` — run once, posted by the server onto this
    /// connection's sub-loop right after construction (spec.md §4.6).
    pub fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state.get(), State::Connecting);
        self.state.set(State::Connected);
        self.channel.tie(self);
        self.channel.enable_reading();
        self.reading.set(true);
        self.fire_connection_callback();
    }

    /// Last act before the connection is dropped from the server's map:
    /// disables all events and fires `connectionCallback` one final time if
    /// the connection was still up, then removes the channel.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnected);
            self.channel.disable_all();
            self.fire_connection_callback();
        }
        self.channel.remove();
    }

    fn fire_connection_callback(self: &Arc<Self>) {
        let cb = self.callbacks.borrow().connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.loop_.assert_in_loop_thread();
        let result = self.input_buffer.borrow_mut().read_fd(self.fd);
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                let _ = n;
                let cb = self.callbacks.borrow().message.clone();
                if let Some(cb) = cb {
                    cb(self, &mut self.input_buffer.borrow_mut(), receive_time);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            debug!("TcpConnection fd={} not writing, skip", self.fd);
            return;
        }
        let outcome = {
            let mut output = self.output_buffer.borrow_mut();
            let readable = output.peek();
            if readable.is_empty() {
                None
            } else {
                match socket_ops::write(self.fd, readable) {
                    Ok(n) => {
                        output.retrieve(n);
                        Some(output.readable_bytes())
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Some(readable.len()),
                    Err(err) => {
                        error!("TcpConnection::handle_write [{}]: {}", self.name, err);
                        None
                    }
                }
            }
        };

        match outcome {
            Some(0) => {
                self.channel.disable_writing();
                let cb = self.callbacks.borrow().write_complete.clone();
                if let Some(cb) = cb {
                    let this = self.clone();
                    self.loop_.queue_in_loop(move || cb(&this));
                }
                if self.state.get() == State::Disconnecting {
                    self.shutdown_in_loop();
                }
            }
            Some(_) => {}
            None => {}
        }
    }

    /// `handleClose`: disable everything, mark Disconnected, and hold a
    /// strong self-reference across both the user's `connectionCallback`
    /// and the server's `closeCallback` — the latter erases this
    /// connection from the server's map, which would otherwise be the last
    /// strong reference and free `self` mid-call (spec.md §4.6).
    fn handle_close(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        debug!(
            "TcpConnection::handle_close [{}] state={:?}",
            self.name,
            self.state.get()
        );
        assert!(matches!(
            self.state.get(),
            State::Connected | State::Disconnecting
        ));
        self.state.set(State::Disconnected);
        self.channel.disable_all();

        let guard_this = self.clone();
        self.fire_connection_callback();
        // Must be the last line: the close callback may erase the server's
        // map entry, which is allowed to be the *only* other strong
        // reference left besides `guard_this`.
        let cb = guard_this.callbacks.borrow().close.clone();
        if let Some(cb) = cb {
            cb(&guard_this);
        }
    }

    fn handle_error(&self) {
        let err = socket_ops::socket_error(self.fd).unwrap_or(-1);
        error!(
            "TcpConnection::handle_error [{}] - SO_ERROR = {}",
            self.name, err
        );
    }

    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state.get() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.clone();
            let owned = data.to_vec();
            self.loop_.run_in_loop(move || this.send_in_loop(&owned));
        }
    }

    /// Takes ownership of `buf`'s readable region and sends it, leaving
    /// `buf` empty — matches muduo's `send(Buffer*)` overload.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        let data = buf.retrieve_all_as_vec();
        self.send(&data);
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();

        if self.state.get() == State::Disconnected {
            warn!("TcpConnection::send_in_loop [{}] disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut fault_error = false;

        if !self.channel.is_writing() && self.output_buffer.borrow().is_empty() {
            match socket_ops::write(self.fd, data) {
                Ok(n) => {
                    nwrote = n;
                    if nwrote == data.len() {
                        let cb = self.callbacks.borrow().write_complete.clone();
                        if let Some(cb) = cb {
                            let this = self.clone();
                            self.loop_.queue_in_loop(move || cb(&this));
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                        if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                            fault_error = true;
                        }
                    }
                }
            }
        }

        if fault_error {
            return;
        }
        let remaining = &data[nwrote..];
        if remaining.is_empty() {
            return;
        }

        let old_len = self.output_buffer.borrow().readable_bytes();
        let new_len = old_len + remaining.len();
        let high_water_mark = self.high_water_mark.get();
        if new_len >= high_water_mark && old_len < high_water_mark {
            let cb = self.callbacks.borrow().high_water_mark.clone();
            if let Some(cb) = cb {
                let this = self.clone();
                self.loop_.queue_in_loop(move || cb(&this, new_len));
            }
        }
        self.output_buffer.borrow_mut().append(remaining);
        if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    /// Half-closes the write side once any in-flight output drains
    /// (spec.md §4.6).
    pub fn shutdown(self: &Arc<Self>) {
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnecting);
            let this = self.clone();
            self.loop_.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            socket_ops::shutdown_write(self.fd).ok();
        }
    }

    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.state.set(State::Disconnecting);
            let this = self.clone();
            self.loop_.queue_in_loop(move || this.force_close_in_loop());
        }
    }

    /// Schedules `force_close` after `delay`, via a `Weak`-capturing timer
    /// closure that calls the *public* `force_close` (not
    /// `force_close_in_loop` directly) — muduo's comment on the equivalent
    /// `makeWeakCallback` calls this out explicitly "to avoid race
    /// condition" with a connection that is re-established under the same
    /// fd before the timer fires.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<TcpConnection> = Arc::downgrade(self);
        self.loop_.run_after(delay, move || {
            if let Some(conn) = weak.upgrade() {
                conn.force_close();
            }
        });
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }

    pub fn start_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_.run_in_loop(move || this.start_read_in_loop());
    }

    fn start_read_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.reading.get() || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.set(true);
        }
    }

    pub fn stop_read(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_.run_in_loop(move || this.stop_read_in_loop());
    }

    fn stop_read_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.reading.get() || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.set(false);
        }
    }

    pub fn is_reading(&self) -> bool {
        self.reading.get()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!("TcpConnection::dtor[{}] fd={} state={:?}", self.name, self.fd, self.state.get());
        // The channel never closes fd (spec.md §5); this is the one owner.
        socket_ops::close(self.fd);
    }
}
