//! Growable byte buffer with read/write cursors (spec.md §3 "Buffer").
//!
//! Grounded on muduo's `Buffer.h`/`Buffer.cc`: a contiguous region with
//! `readerIndex_`/`writerIndex_` and a small prepend reserve, scatter-read
//! via a stack-local fallback buffer to bound a single `readv(2)`.

use std::io;
use std::os::unix::io::RawFd;

/// Default prepend reserve, matching muduo's `kCheapPrepend = 8`.
pub const DEFAULT_PREPEND: usize = 8;

/// Initial total capacity, matching muduo's `kInitialSize = 1024`.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack fallback buffer used by scatter-read, matching muduo's
/// `readFd`'s on-stack `extrabuf[65536]`.
const SCATTER_READ_EXTRA: usize = 65536;

/// A growable byte buffer with read/write cursors and a prepend reserve.
///
/// Invariants (spec.md §3): `0 <= reader <= writer <= capacity`; readable
/// region is `[reader, writer)`; the prepend region `[0, reserve)` is never
/// encroached upon by `retrieve`/`retrieve_all` (it can only shrink via
/// `prepend`, which writes backwards from `reader`).
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
    reserve: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_reserve(DEFAULT_PREPEND)
    }

    pub fn with_reserve(reserve: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; reserve + INITIAL_SIZE],
            reader: reserve,
            writer: reserve,
            reserve,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region, `[reader, writer)`.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Advance the reader cursor by `len` bytes (discarding them). A
    /// `len` at or past `readable_bytes()` resets to empty-at-reserve,
    /// matching muduo's `retrieve`'s `retrieveAll` fallback.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = self.reserve;
        self.writer = self.reserve;
    }

    /// Take the whole readable region as an owned `Vec<u8>`, emptying the
    /// buffer — matches muduo's `retrieveAllAsString`.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let data = self.peek().to_vec();
        self.retrieve_all();
        data
    }

    /// Append bytes to the writable end, growing/moving the buffer as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Reserve room for `len` more writable bytes, growing geometrically or
    /// compacting (moving the readable region to the front) first, exactly
    /// as spec.md describes: "if writable+(reader-reserve) suffices, the
    /// readable region is moved to the front instead".
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + (self.reader - self.reserve) >= len {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, self.reserve);
            self.reader = self.reserve;
            self.writer = self.reserve + readable;
        } else {
            self.buf.resize(self.writer + len, 0);
        }
    }

    /// Prepend `data` just before the readable region; requires
    /// `data.len() <= prependable_bytes()`, matching muduo's `prepend`
    /// (used by a framing layer to write a length header without allocation).
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Scatter-read via `readv(2)` into the writable tail plus an on-stack
    /// fallback buffer, bounding a single syscall the way muduo's
    /// `Buffer::readFd` does. Returns the number of bytes read (0 = peer
    /// closed), or an `io::Error` (including `WouldBlock`) on failure.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; SCATTER_READ_EXTRA];
        let writable = self.writable_bytes();

        let mut iov: [libc::iovec; 2] = [
            libc::iovec {
                iov_base: self.buf[self.writer..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        // Only offer the stack fallback if the primary buffer can't hold a
        // typical socket read, matching muduo's `iovcnt = (writable < sizeof
        // extrabuf) ? 2 : 1`.
        let iovcnt = if writable < extra_buf.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt as libc::c_int))?;
        let n = n as usize;

        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_retrieve_partial() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.readable_bytes(), 5);
    }

    #[test]
    fn prepend_then_retrieve_all() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(b"LEN4");
        let all = buf.retrieve_all_as_vec();
        assert_eq!(&all, b"LEN4payload");
    }

    #[test]
    fn empty_read_is_defined() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        buf.retrieve(100); // retrieving more than available is a safe no-op clear
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn grows_geometrically_when_compaction_is_insufficient() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 2000]);
        assert!(buf.buf.len() >= 2000 + DEFAULT_PREPEND);
        assert_eq!(buf.readable_bytes(), 2000);
    }

    #[test]
    fn compacts_instead_of_growing_when_prefix_is_reclaimable() {
        let mut buf = Buffer::new();
        buf.append(&vec![7u8; 900]);
        buf.retrieve(900); // reader now far past reserve, plenty of reclaimable space
        buf.append(&vec![9u8; 900]);
        assert_eq!(buf.readable_bytes(), 900);
        assert_eq!(buf.peek(), vec![9u8; 900].as_slice());
    }

    #[test]
    fn prepend_reserve_never_negative() {
        let buf = Buffer::with_reserve(8);
        assert_eq!(buf.prependable_bytes(), 8);
    }
}
