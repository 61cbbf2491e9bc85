//! Per-descriptor event dispatcher bound to exactly one loop (spec.md §3/§4.2
//! "Channel"). Grounded on muduo's `Channel.{h,cc}`: holds an interest mask,
//! the latest received-events mask, a demultiplexer-private index, four
//! callbacks, and a weak "tie" used to extend an owning object's lifetime
//! for the duration of one dispatch.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use log::warn;

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

// Bit layout matches POSIX `poll(2)` flags; the epoll backend reuses these
// verbatim because `EPOLLIN == POLLIN` etc. on Linux (spec.md §4.1).
pub const NONE_EVENT: i16 = 0;
pub const READ_EVENT: i16 = (libc::POLLIN | libc::POLLPRI) as i16;
pub const WRITE_EVENT: i16 = libc::POLLOUT as i16;

type ReadCallback = Box<dyn FnMut(Timestamp)>;
type EventCallback = Box<dyn FnMut()>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// A selectable I/O channel. Does not own `fd` — the socket/eventfd/timerfd
/// owner closes it, matching spec.md §5's "channel never closes its fd".
///
/// `loop_` is a non-owning raw pointer, not an `Arc`, mirroring muduo's plain
/// `EventLoop* loop_`: the owner of a `Channel` (`EventLoop`, `TimerQueue`,
/// `Acceptor`, `TcpConnection`) already holds its own `Arc<EventLoop>` (or is
/// itself nested inside the `EventLoop`), so an `Arc` here would be a second,
/// cycle-forming strong reference back to the very object that owns this
/// channel — the loop would then never reach a strong count of zero and its
/// `Drop` (closing its eventfd/epollfd) would never run. A `Weak` doesn't
/// work either: `EventLoop`'s and `TimerQueue`'s own channels are torn down
/// from inside their owner's `Drop::drop`, by which point the owning `Arc`'s
/// strong count has already hit zero and `Weak::upgrade` would return `None`
/// even though the `EventLoop` value itself is still alive and valid.
pub struct Channel {
    loop_: *const EventLoop,
    fd: RawFd,
    events: Cell<i16>,
    revents: Cell<i16>,
    /// Demultiplexer-private slot index; -1 until first registered.
    index: Cell<i32>,
    log_hup: Cell<bool>,
    tie: RefCell<Option<Weak<dyn Any + Send + Sync>>>,
    tied: Cell<bool>,
    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    callbacks: RefCell<Callbacks>,
}

impl Channel {
    pub fn new(loop_: Arc<EventLoop>, fd: RawFd) -> Channel {
        Channel {
            loop_: Arc::as_ptr(&loop_),
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            index: Cell::new(-1),
            log_hup: Cell::new(true),
            tie: RefCell::new(None),
            tied: Cell::new(false),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            callbacks: RefCell::new(Callbacks::default()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> i16 {
        self.events.get()
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    pub fn index(&self) -> i32 {
        self.index.get()
    }

    pub fn set_index(&self, idx: i32) {
        self.index.set(idx);
    }

    pub fn set_revents(&self, revents: i16) {
        self.revents.set(revents);
    }

    pub fn do_not_log_hup(&self) {
        self.log_hup.set(false);
    }

    pub fn owner_loop(&self) -> &EventLoop {
        // Safety: see the field doc comment on `Channel::loop_` — a channel
        // never outlives the loop that owns it.
        unsafe { &*self.loop_ }
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        self.callbacks.borrow_mut().read = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.callbacks.borrow_mut().write = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        self.callbacks.borrow_mut().close = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        self.callbacks.borrow_mut().error = Some(Box::new(cb));
    }

    /// Tie this channel to the owner managed by `Arc`, preventing the owner
    /// being dropped inside `handle_event` (spec.md §4.2).
    pub fn tie<T: Any + Send + Sync + 'static>(&self, owner: &Arc<T>) {
        *self.tie.borrow_mut() = Some(Arc::downgrade(owner) as Weak<dyn Any + Send + Sync>);
        self.tied.set(true);
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    fn update(self: &Arc<Self>) {
        self.added_to_loop.set(true);
        self.owner_loop().update_channel(self);
    }

    /// Remove this channel from its loop. Must be called with no interest
    /// left (`disable_all` first), mirroring muduo's `Channel::remove`.
    pub fn remove(self: &Arc<Self>) {
        debug_assert!(self.is_none_event());
        self.added_to_loop.set(false);
        self.owner_loop().remove_channel(self);
    }

    /// Dispatch precedence per spec.md §4.2: (HUP && !IN) -> close; NVAL is
    /// logged; (ERR | NVAL) -> error; (IN | PRI | RDHUP) -> read; OUT -> write.
    pub fn handle_event(&self, receive_time: Timestamp) {
        let guard = if self.tied.get() {
            let g = self.tie.borrow().as_ref().and_then(Weak::upgrade);
            if g.is_none() {
                return;
            }
            g
        } else {
            None
        };
        self.handle_event_with_guard(receive_time);
        drop(guard);
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        self.event_handling.set(true);
        let revents = self.revents.get();

        if (revents & libc::POLLHUP as i16 != 0) && (revents & libc::POLLIN as i16 == 0) {
            if self.log_hup.get() {
                warn!("fd = {} Channel::handle_event() POLLHUP", self.fd);
            }
            if let Some(cb) = self.callbacks.borrow_mut().close.as_mut() {
                cb();
            }
        }

        if revents & libc::POLLNVAL as i16 != 0 {
            warn!("fd = {} Channel::handle_event() POLLNVAL", self.fd);
        }

        if revents & (libc::POLLERR | libc::POLLNVAL) as i16 != 0 {
            if let Some(cb) = self.callbacks.borrow_mut().error.as_mut() {
                cb();
            }
        }

        if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as i16 != 0 {
            if let Some(cb) = self.callbacks.borrow_mut().read.as_mut() {
                cb(receive_time);
            }
        }

        if revents & libc::POLLOUT as i16 != 0 {
            if let Some(cb) = self.callbacks.borrow_mut().write.as_mut() {
                cb();
            }
        }

        self.event_handling.set(false);
    }

    pub fn events_to_string(fd: RawFd, ev: i16) -> String {
        let mut s = format!("{}: ", fd);
        if ev & libc::POLLIN as i16 != 0 {
            s.push_str("IN ");
        }
        if ev & libc::POLLPRI as i16 != 0 {
            s.push_str("PRI ");
        }
        if ev & libc::POLLOUT as i16 != 0 {
            s.push_str("OUT ");
        }
        if ev & libc::POLLHUP as i16 != 0 {
            s.push_str("HUP ");
        }
        if ev & libc::POLLRDHUP as i16 != 0 {
            s.push_str("RDHUP ");
        }
        if ev & libc::POLLERR as i16 != 0 {
            s.push_str("ERR ");
        }
        if ev & libc::POLLNVAL as i16 != 0 {
            s.push_str("NVAL ");
        }
        s
    }

    pub fn revents_to_string(&self) -> String {
        Channel::events_to_string(self.fd, self.revents.get())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.get());
        debug_assert!(!self.added_to_loop.get());
    }
}
