//! `timerfd(2)`-backed timer subsystem (spec.md §3/§4 "TimerQueue").
//!
//! Grounded on muduo's `TimerQueue.{h,cc}`. Timers are kept in two parallel
//! views over the same storage: `by_expiry` orders `(expiration, sequence)`
//! pairs for finding everything due; `timers` is the identity-keyed storage
//! (sequence -> `Timer`), playing the role of muduo's `ActiveTimerSet`.
//! `cancelling` records sequences cancelled while `handle_read` is iterating
//! expired timers, so a timer that reschedules itself and is cancelled in
//! the same tick does not get re-armed.
//!
//! Every field is its own `RefCell`/`Cell` (rather than one `RefCell`
//! wrapping the whole struct) so that a timer callback which itself calls
//! back into `add_timer_in_loop`/`cancel_in_loop` — entirely legal,
//! single-threaded reentrancy spec.md's "cancellation in the same tick as
//! expiry" invariant depends on — only ever takes a fresh, short-lived
//! borrow of one field, never one held open across the callback.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::timer::{Timer, TimerId};
use crate::timestamp::Timestamp;

/// Floor on the next expiry offered to the kernel, matching muduo's
/// `kMinInterval` (100 microseconds) so a timer already due doesn't get
/// silently skipped by `timerfd_settime` rounding to zero.
const MIN_INTERVAL: Duration = Duration::from_micros(100);

fn create_timerfd() -> RawFd {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        panic!(
            "TimerQueue: timerfd_create failed: {}",
            std::io::Error::last_os_error()
        );
    }
    fd
}

fn how_much_time_from_now(when: Timestamp) -> Duration {
    let micros = (when.diff_micros(Timestamp::now())).max(MIN_INTERVAL.as_micros() as i64);
    Duration::from_micros(micros as u64)
}

fn reset_timerfd(fd: RawFd, expiration: Timestamp) {
    let delta = how_much_time_from_now(expiration);
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delta.as_secs() as libc::time_t,
            tv_nsec: delta.subsec_nanos() as libc::c_long,
        },
    };
    let ret = unsafe { libc::timerfd_settime(fd, 0, &new_value, ptr::null_mut()) };
    if ret < 0 {
        log::error!("timerfd_settime: {}", std::io::Error::last_os_error());
    }
}

fn read_timerfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    let _ = crate::socket_ops::read(fd, &mut buf);
}

pub struct TimerQueue {
    timer_fd: RawFd,
    channel: Arc<Channel>,
    timers: RefCell<HashMap<i64, Timer>>,
    by_expiry: RefCell<BTreeSet<(Timestamp, i64)>>,
    calling_expired_timers: Cell<bool>,
    cancelling: RefCell<HashSet<i64>>,
}

impl TimerQueue {
    pub fn new(loop_: &Arc<EventLoop>) -> TimerQueue {
        let timer_fd = create_timerfd();
        let channel = Arc::new(Channel::new(loop_.clone(), timer_fd));
        let loop_for_read = loop_.clone();
        channel.set_read_callback(move |_recv_time| loop_for_read.timer_queue_handle_read());
        channel.enable_reading();
        TimerQueue {
            timer_fd,
            channel,
            timers: RefCell::new(HashMap::new()),
            by_expiry: RefCell::new(BTreeSet::new()),
            calling_expired_timers: Cell::new(false),
            cancelling: RefCell::new(HashSet::new()),
        }
    }

    /// Insert `timer` (already assigned its sequence/`TimerId` by the
    /// caller, synchronously, before posting here), rearming the kernel
    /// timer if this is now the earliest expiration.
    pub fn add_timer_in_loop(&self, timer: Timer) {
        let when = timer.expiration();
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            reset_timerfd(self.timer_fd, when);
        }
    }

    pub fn cancel_in_loop(&self, id: TimerId) {
        if self.timers.borrow_mut().remove(&id.sequence).is_some() {
            self.by_expiry.borrow_mut().retain(|&(_, seq)| seq != id.sequence);
        } else if self.calling_expired_timers.get() {
            self.cancelling.borrow_mut().insert(id.sequence);
        }
    }

    fn insert(&self, timer: Timer) -> bool {
        let earliest_changed = match self.by_expiry.borrow().iter().next() {
            None => true,
            Some(&(first_expiry, _)) => timer.expiration() < first_expiry,
        };
        self.by_expiry.borrow_mut().insert((timer.expiration(), timer.sequence()));
        self.timers.borrow_mut().insert(timer.sequence(), timer);
        earliest_changed
    }

    pub fn handle_read(&self) {
        let now = Timestamp::now();
        read_timerfd(self.timer_fd);

        let expired = self.get_expired(now);

        self.calling_expired_timers.set(true);
        self.cancelling.borrow_mut().clear();
        let mut ran: Vec<Timer> = Vec::with_capacity(expired.len());
        for mut timer in expired {
            timer.run();
            ran.push(timer);
        }
        self.calling_expired_timers.set(false);

        self.reset(ran, now);
    }

    /// Move every timer due at or before `now` out of the queue.
    fn get_expired(&self, now: Timestamp) -> Vec<Timer> {
        let due: Vec<(Timestamp, i64)> = self
            .by_expiry
            .borrow()
            .range(..=(now, i64::MAX))
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(due.len());
        for key in due {
            self.by_expiry.borrow_mut().remove(&key);
            if let Some(timer) = self.timers.borrow_mut().remove(&key.1) {
                out.push(timer);
            }
        }
        out
    }

    /// Re-insert repeating timers (unless cancelled mid-tick) and rearm the
    /// kernel timer for whatever is now earliest.
    fn reset(&self, expired: Vec<Timer>, now: Timestamp) {
        for mut timer in expired {
            if timer.repeat() && !self.cancelling.borrow().contains(&timer.sequence()) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        if let Some(&(next_expiry, _)) = self.by_expiry.borrow().iter().next() {
            reset_timerfd(self.timer_fd, next_expiry);
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        crate::socket_ops::close(self.timer_fd);
        trace!("TimerQueue dropped, {} timers pending", self.timers.borrow().len());
    }
}
