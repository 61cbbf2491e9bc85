//! A single one-shot or repeating timer (spec.md §3 "Timer"/"TimerId").
//!
//! Grounded on muduo's `Timer.{h,cc}`. A timer is identified for
//! cancellation purposes by a process-wide monotonically increasing
//! sequence number rather than by address, which sidesteps needing raw
//! pointer identity in `TimerQueue`'s ordered sets.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::timestamp::Timestamp;

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

/// Opaque cancellation handle returned by `TimerQueue::add_timer`. Only
/// meaningful to the `TimerQueue` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) sequence: i64,
}

impl TimerId {
    pub(crate) fn new(sequence: i64) -> TimerId {
        TimerId { sequence }
    }
}

pub type TimerCallback = Box<dyn FnMut() + 'static>;

pub struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: Duration,
    repeat: bool,
    sequence: i64,
}

impl Timer {
    pub fn new(callback: TimerCallback, when: Timestamp, interval: Duration, repeat: bool) -> Timer {
        Timer {
            callback,
            expiration: when,
            interval,
            repeat,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn run(&mut self) {
        (self.callback)();
    }

    pub fn expiration(&self) -> Timestamp {
        self.expiration
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn id(&self) -> TimerId {
        TimerId::new(self.sequence)
    }

    /// Advance `expiration` by `interval` for a repeating timer, or mark it
    /// invalid (never to be rearmed) otherwise.
    pub fn restart(&mut self, now: Timestamp) {
        if self.repeat {
            self.expiration = now.add(self.interval);
        } else {
            self.expiration = Timestamp::INVALID;
        }
    }
}
