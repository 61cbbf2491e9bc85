//! Level-triggered `poll(2)`-style demultiplexer backend (spec.md §4.1).
//!
//! Grounded on muduo's `PollPoller.{h,cc}`: a `Vec<pollfd>` plus a `fd ->
//! channel` map. A channel's `index` is its slot in the vector. To disable a
//! channel without removing it, the slot's `fd` is encoded as `-fd-1` (the
//! kernel then reports `POLLNVAL` for it, which `Channel` ignores); removal
//! swaps the slot with the last and pops.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::trace;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

use super::Poller;

pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, num_events: i32, active_channels: &mut Vec<Arc<Channel>>) {
        let mut remaining = num_events;
        for pfd in &self.pollfds {
            if remaining <= 0 {
                break;
            }
            if pfd.revents > 0 {
                remaining -= 1;
                let real_fd = if pfd.fd >= 0 { pfd.fd } else { -pfd.fd - 1 };
                if let Some(channel) = self.channels.get(&real_fd) {
                    channel.set_revents(pfd.revents);
                    active_channels.push(channel.clone());
                }
            }
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp {
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Timestamp::now();
        if num_events > 0 {
            trace!("{} events happened", num_events);
            self.fill_active_channels(num_events, active_channels);
        } else if num_events == 0 {
            trace!("nothing happened");
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!("PollPoller::poll: {}", err);
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if channel.index() < 0 {
            debug_assert!(!self.channels.contains_key(&fd));
            let pfd = libc::pollfd {
                fd,
                events: channel.events(),
                revents: 0,
            };
            self.pollfds.push(pfd);
            let idx = (self.pollfds.len() - 1) as i32;
            channel.set_index(idx);
            self.channels.insert(fd, channel.clone());
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            let idx = channel.index() as usize;
            debug_assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.events = channel.events();
            pfd.revents = 0;
            if channel.is_none_event() {
                // Disable without removing: offset by one so fd 0 still
                // encodes to a negative slot.
                pfd.fd = -fd - 1;
            } else {
                pfd.fd = fd;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        debug_assert!(self.channels.contains_key(&fd));
        debug_assert!(channel.is_none_event());
        let idx = channel.index() as usize;
        debug_assert!(idx < self.pollfds.len());
        self.channels.remove(&fd);

        if idx == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            let last_idx = self.pollfds.len() - 1;
            self.pollfds.swap(idx, last_idx);
            let moved_fd = self.pollfds[idx].fd;
            let moved_fd = if moved_fd >= 0 { moved_fd } else { -moved_fd - 1 };
            if let Some(moved_channel) = self.channels.get(&moved_fd) {
                moved_channel.set_index(idx as i32);
            }
            self.pollfds.pop();
        }
        channel.set_index(-1);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels.get(&channel.fd()).is_some()
    }
}
