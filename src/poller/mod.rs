//! Readiness demultiplexer abstraction (spec.md §4.1 "Demultiplexer").
//!
//! Two backends implement the same contract: `poll` blocks up to a timeout
//! and appends every channel with pending events to the active list after
//! setting its received-events mask; `update_channel`/`remove_channel`
//! register/detach interest. All three execute on the owning loop's thread.

mod epoll;
mod poll;

use std::sync::Arc;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

pub use epoll::EpollPoller;
pub use poll::PollPoller;

pub trait Poller {
    /// Block up to `timeout_ms` (or indefinitely if negative), returning the
    /// timestamp taken immediately after unblocking. Every channel with
    /// pending events is appended to `active_channels`.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp;

    fn update_channel(&mut self, channel: &Arc<Channel>);

    fn remove_channel(&mut self, channel: &Arc<Channel>);

    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

/// Picks the epoll backend by default; set `REACTOR_NET_USE_POLL=1` to force
/// the poll-style backend, matching muduo's `MUDUO_USE_POLL` escape hatch.
/// `initial_event_capacity` seeds the epoll backend's event buffer (ignored
/// by the poll backend, which has no fixed-size event array).
pub fn default_poller(initial_event_capacity: usize) -> Box<dyn Poller> {
    if std::env::var_os("REACTOR_NET_USE_POLL").is_some() {
        Box::new(PollPoller::new())
    } else {
        Box::new(EpollPoller::with_capacity(initial_event_capacity))
    }
}
