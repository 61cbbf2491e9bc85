//! Thread-pinned reactor: demultiplex, dispatch, drain (spec.md §3/§4.3
//! "EventLoop"). Grounded on muduo's `EventLoop.{h,cc}`.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::timer::{Timer, TimerId};
use crate::timer_queue::TimerQueue;
use crate::timestamp::Timestamp;

/// Fixed demultiplexer timeout bounding the worst-case latency between a
/// `queueInLoop`-equivalent post (which otherwise wakes the loop) and
/// observation of `quit` (spec.md §4.3/§5).
const POLL_TIME_MS: i32 = 10_000;

/// A boxed, one-shot task posted across threads via `run_in_loop`/`queue_in_loop`.
///
/// Not actually `Send` in general (it may capture loop-thread-confined
/// state such as an `Rc`-like connection handle), but it is only ever
/// invoked on the one OS thread that owns the `EventLoop` it was posted to
/// — the same discipline muduo relies on for its `Functor` queue. That
/// invariant, not the type system, is what makes moving it across the
/// posting thread's boundary sound.
struct Functor(Box<dyn FnOnce() + 'static>);
unsafe impl Send for Functor {}

/// Tunables analogous to muduo's `EventLoopBuilder`-style defaults.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    pub poll_timeout: Duration,
    pub initial_event_capacity: usize,
}

impl Default for EventLoopConfig {
    fn default() -> EventLoopConfig {
        EventLoopConfig {
            poll_timeout: Duration::from_millis(POLL_TIME_MS as u64),
            initial_event_capacity: 16,
        }
    }
}

static IGNORE_SIGPIPE: Once = Once::new();

/// Ignore `SIGPIPE` process-wide, once (spec.md §4.3/§5/§7). Without this, a
/// write to a peer that has already reset the connection raises `SIGPIPE`
/// and kills the process before `TcpConnection::send_in_loop`'s own
/// `EPIPE`/`ECONNRESET` handling ever runs — matching muduo's global
/// `IgnoreSigPipe` initializer in `EventLoop.cc`.
fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        let previous = libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        if previous == libc::SIG_ERR {
            error!(
                "EventLoop: failed to install SIGPIPE ignore handler: {}",
                std::io::Error::last_os_error()
            );
        }
    });
}

fn create_eventfd() -> RawFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        panic!(
            "EventLoop: eventfd creation failed: {}",
            std::io::Error::last_os_error()
        );
    }
    fd
}

thread_local! {
    static CURRENT_LOOP: Cell<*const EventLoop> = Cell::new(std::ptr::null());
}

/// One-per-thread dispatcher. See spec.md §3 "EventLoop" for the full
/// invariant list; summarized: all channel/timer mutation happens on
/// `thread_id`, foreign threads interact only through `run_in_loop`/
/// `queue_in_loop`/`wakeup`/`quit`.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: Cell<bool>,
    quit: AtomicBool,
    event_handling: Cell<bool>,
    calling_pending_functors: AtomicBool,
    iteration: Cell<u64>,
    poll_timeout: Duration,

    poller: RefCell<Box<dyn Poller>>,
    timer_queue: RefCell<Option<TimerQueue>>,

    wakeup_fd: RawFd,
    wakeup_channel: RefCell<Option<Arc<Channel>>>,

    active_channels: RefCell<Vec<Arc<Channel>>>,
    current_active_channel: RefCell<Option<Arc<Channel>>>,
    poll_return_time: Cell<Timestamp>,

    pending_functors: Mutex<Vec<Functor>>,
}

// Every RefCell/Cell-guarded field above is mutated only by `thread_id`;
// cross-thread callers only ever reach `pending_functors` (a real `Mutex`),
// `quit`/`calling_pending_functors` (atomics) and `wakeup_fd` (one `write`
// syscall), matching muduo's own "only two thread-safe primitives" design
// (spec.md §5).
unsafe impl Sync for EventLoop {}

// Channel/Timer callbacks are boxed `FnMut`, not `Send`, so this type isn't
// automatically `Send` either, yet `EventLoopThread` hands an `Arc<EventLoop>`
// from the thread that built it to whichever thread called `start_loop`.
// Sound for the same reason as the `Sync` impl above: every field this could
// expose across that handoff is only ever mutated by `thread_id`.
unsafe impl Send for EventLoop {}

impl EventLoop {
    pub fn new() -> Arc<EventLoop> {
        EventLoop::with_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> Arc<EventLoop> {
        ignore_sigpipe();
        let wakeup_fd = create_eventfd();
        let loop_ = Arc::new(EventLoop {
            thread_id: thread::current().id(),
            looping: Cell::new(false),
            quit: AtomicBool::new(false),
            event_handling: Cell::new(false),
            calling_pending_functors: AtomicBool::new(false),
            iteration: Cell::new(0),
            poll_timeout: config.poll_timeout,
            poller: RefCell::new(poller::default_poller(config.initial_event_capacity)),
            timer_queue: RefCell::new(None),
            wakeup_fd,
            wakeup_channel: RefCell::new(None),
            active_channels: RefCell::new(Vec::new()),
            current_active_channel: RefCell::new(None),
            poll_return_time: Cell::new(Timestamp::INVALID),
            pending_functors: Mutex::new(Vec::new()),
        });

        CURRENT_LOOP.with(|cell| {
            if !cell.get().is_null() {
                panic!(
                    "another EventLoop already exists in thread {:?}",
                    thread::current().id()
                );
            }
            cell.set(Arc::as_ptr(&loop_));
        });

        let wakeup_channel = Arc::new(Channel::new(loop_.clone(), wakeup_fd));
        {
            let loop_for_read = loop_.clone();
            wakeup_channel.set_read_callback(move |_recv_time| loop_for_read.handle_wakeup_read());
        }
        wakeup_channel.enable_reading();
        *loop_.wakeup_channel.borrow_mut() = Some(wakeup_channel);

        let timer_queue = TimerQueue::new(&loop_);
        *loop_.timer_queue.borrow_mut() = Some(timer_queue);

        debug!("EventLoop created in thread {:?}", loop_.thread_id);
        loop_
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop::assert_in_loop_thread - created in {:?}, current thread {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    /// Pins to the current thread and runs the demultiplex/dispatch/drain
    /// cycle until `quit()` is observed at the top of an iteration. Fatal
    /// (panics) if called from a thread other than the one that created
    /// this loop, or re-entrantly.
    pub fn run(self: &Arc<Self>) {
        assert!(!self.looping.get());
        self.assert_in_loop_thread();
        self.looping.set(true);
        self.quit.store(false, Ordering::Release);
        trace!("EventLoop start looping");

        while !self.quit.load(Ordering::Acquire) {
            self.active_channels.borrow_mut().clear();
            let active = {
                let mut poller = self.poller.borrow_mut();
                let mut active_channels = self.active_channels.borrow_mut();
                let timeout_ms = self.poll_timeout.as_millis() as i32;
                let now = poller.poll(timeout_ms, &mut active_channels);
                self.poll_return_time.set(now);
                active_channels.clone()
            };
            self.iteration.set(self.iteration.get() + 1);

            self.event_handling.set(true);
            for channel in &active {
                *self.current_active_channel.borrow_mut() = Some(channel.clone());
                channel.handle_event(self.poll_return_time.get());
            }
            *self.current_active_channel.borrow_mut() = None;
            self.event_handling.set(false);

            self.do_pending_functors();
        }

        trace!("EventLoop stop looping");
        self.looping.set(false);
    }

    /// Cross-thread safe: may be called from any thread to stop the loop.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `f` immediately if already on the loop thread, otherwise enqueue
    /// it for the loop thread to run.
    pub fn run_in_loop(self: &Arc<Self>, f: impl FnOnce() + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always enqueues, even when called from the loop thread itself —
    /// useful to defer `f` past the in-progress dispatch/drain iteration.
    pub fn queue_in_loop(&self, f: impl FnOnce() + 'static) {
        {
            let mut functors = self.pending_functors.lock().unwrap();
            functors.push(Functor(Box::new(f)));
        }
        if !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn pending_task_count(&self) -> usize {
        self.pending_functors.lock().unwrap().len()
    }

    pub fn run_at(self: &Arc<Self>, when: Timestamp, cb: impl FnMut() + 'static) -> TimerId {
        let timer = Timer::new(Box::new(cb), when, Duration::ZERO, false);
        self.schedule(timer)
    }

    pub fn run_after(self: &Arc<Self>, delay: Duration, cb: impl FnMut() + 'static) -> TimerId {
        self.run_at(Timestamp::now().add(delay), cb)
    }

    pub fn run_every(self: &Arc<Self>, interval: Duration, cb: impl FnMut() + 'static) -> TimerId {
        let timer = Timer::new(Box::new(cb), Timestamp::now().add(interval), interval, true);
        self.schedule(timer)
    }

    fn schedule(self: &Arc<Self>, timer: Timer) -> TimerId {
        let id = timer.id();
        let loop_ = self.clone();
        self.run_in_loop(move || loop_.timer_queue_add_timer_in_loop(timer));
        id
    }

    pub fn cancel(self: &Arc<Self>, id: TimerId) {
        let loop_ = self.clone();
        self.run_in_loop(move || loop_.timer_queue_cancel_in_loop(id));
    }

    // These three forward through a shared (`borrow()`, not `borrow_mut()`)
    // borrow of the outer `Option` deliberately: `TimerQueue`'s own fields
    // are individually `RefCell`/`Cell`-guarded, so a timer callback that
    // reenters here (e.g. cancelling itself, or scheduling another timer)
    // only contends with the outer `Option`'s borrow bookkeeping, not a
    // single exclusive borrow held for the whole call.
    pub(crate) fn timer_queue_add_timer_in_loop(&self, timer: Timer) {
        self.assert_in_loop_thread();
        self.timer_queue
            .borrow()
            .as_ref()
            .expect("timer queue initialized")
            .add_timer_in_loop(timer);
    }

    pub(crate) fn timer_queue_cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop_thread();
        self.timer_queue
            .borrow()
            .as_ref()
            .expect("timer queue initialized")
            .cancel_in_loop(id);
    }

    pub(crate) fn timer_queue_handle_read(&self) {
        self.assert_in_loop_thread();
        self.timer_queue
            .borrow()
            .as_ref()
            .expect("timer queue initialized")
            .handle_read();
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if self.event_handling.get() {
            let current = self.current_active_channel.borrow();
            let is_current = current
                .as_ref()
                .map(|c| Arc::ptr_eq(c, channel))
                .unwrap_or(false);
            debug_assert!(
                is_current || !self.active_channels.borrow().iter().any(|c| Arc::ptr_eq(c, channel))
            );
        }
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    /// Write one 8-byte count to the wakeup eventfd, interrupting a blocked
    /// `poll`/`epoll_wait` in another thread.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        match crate::socket_ops::write(self.wakeup_fd, &one.to_ne_bytes()) {
            Ok(n) if n == 8 => {}
            Ok(n) => error!("EventLoop::wakeup wrote {} bytes instead of 8", n),
            Err(err) => error!("EventLoop::wakeup: {}", err),
        }
    }

    fn handle_wakeup_read(&self) {
        let mut buf = [0u8; 8];
        match crate::socket_ops::read(self.wakeup_fd, &mut buf) {
            Ok(n) if n == 8 => {}
            Ok(n) => error!("EventLoop::handle_wakeup_read read {} bytes instead of 8", n),
            Err(err) => error!("EventLoop::handle_wakeup_read: {}", err),
        }
    }

    fn do_pending_functors(&self) {
        self.calling_pending_functors.store(true, Ordering::Release);
        let functors: Vec<Functor> = {
            let mut guard = self.pending_functors.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for functor in functors {
            (functor.0)();
        }
        self.calling_pending_functors.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(channel) = self.wakeup_channel.borrow_mut().take() {
            channel.disable_all();
            channel.remove();
        }
        crate::socket_ops::close(self.wakeup_fd);
        CURRENT_LOOP.with(|cell| {
            if cell.get() == self as *const EventLoop {
                cell.set(std::ptr::null());
            }
        });
    }
}
