//! `epoll(4)`-style demultiplexer backend (spec.md §4.1).
//!
//! Grounded on muduo's `EPollPoller.{h,cc}`. On Linux the `EPOLLIN` family of
//! constants coincide bit-for-bit with `POLLIN` etc., so `Channel`'s masks
//! are passed straight through. A channel's `index` is a three-valued tag:
//! new (-1) -> added on first interest; added -> deleted when interest
//! becomes empty (`EPOLL_CTL_DEL` issued but the map entry kept); deleted ->
//! added on re-arm; added/deleted -> new on explicit removal.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::{error, trace};

use crate::channel::Channel;
use crate::timestamp::Timestamp;

use super::Poller;

const NEW: i32 = -1;
const ADDED: i32 = 1;
const DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> EpollPoller {
        EpollPoller::with_capacity(INIT_EVENT_LIST_SIZE)
    }

    pub fn with_capacity(initial_event_capacity: usize) -> EpollPoller {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            panic!(
                "EpollPoller::new: epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            );
        }
        let capacity = initial_event_capacity.max(1);
        EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { std::mem::zeroed() }; capacity],
            channels: HashMap::new(),
        }
    }

    fn update(&self, operation: libc::c_int, channel: &Arc<Channel>) {
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        event.events = channel.events() as u32;
        event.u64 = Arc::as_ptr(channel) as u64;
        let fd = channel.fd();
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd.as_raw_fd(), operation, fd, &mut event)
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if operation == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl DEL fd={}: {}", fd, err);
            } else {
                panic!("epoll_ctl {} fd={}: {}", operation, fd, err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp {
        trace!("fd total count {}", self.channels.len());
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Timestamp::now();
        if num_events > 0 {
            trace!("{} events happened", num_events);
            for ev in &self.events[..num_events as usize] {
                // `data.ptr`'s C++ role is played here by a raw `Arc` pointer
                // stashed in `u64`; it never outlives the registration that
                // set it because `remove_channel` always runs `EPOLL_CTL_DEL`
                // first.
                let raw = ev.u64 as *const Channel;
                let channel = unsafe { Arc::from_raw(raw) };
                let channel_again = channel.clone();
                std::mem::forget(channel);
                channel_again.set_revents(ev.events as i16);
                active_channels.push(channel_again);
            }
            if num_events as usize == self.events.len() {
                self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
            }
        } else if num_events == 0 {
            trace!("nothing happened");
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!("EpollPoller::poll: {}", err);
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(
            "fd = {} events = {} index = {}",
            channel.fd(),
            channel.events(),
            index
        );
        if index == NEW || index == DELETED {
            let fd = channel.fd();
            if index == NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                debug_assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            let fd = channel.fd();
            debug_assert!(self.channels.contains_key(&fd));
            debug_assert_eq!(index, ADDED);
            if channel.is_none_event() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {}", fd);
        debug_assert!(self.channels.contains_key(&fd));
        debug_assert!(channel.is_none_event());
        let index = channel.index();
        debug_assert!(index == ADDED || index == DELETED);
        self.channels.remove(&fd);
        if index == ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(NEW);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels.get(&channel.fd()).is_some()
    }
}
