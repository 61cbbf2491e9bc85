//! Stateless wrappers over non-blocking socket syscalls (spec.md §4.1/§4.2
//! "Socket ops"). Grounded on mio's `sys::unix::socket::Socket` and
//! `sys::unix::net` helpers, flattened into free functions the way muduo's
//! `SocketsOps.{h,cc}` namespace-level functions are: these don't own a file
//! descriptor, callers do (spec.md §5 "Shared-resource policy").

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::endpoint::Endpoint;

fn sockaddr_from(addr: SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match &addr {
        SocketAddr::V4(v4) => (
            v4 as *const _ as *const libc::sockaddr,
            mem::size_of_val(v4) as libc::socklen_t,
        ),
        SocketAddr::V6(v6) => (
            v6 as *const _ as *const libc::sockaddr,
            mem::size_of_val(v6) as libc::socklen_t,
        ),
    }
}

// Casts a `sockaddr_in`/`sockaddr_in6` directly to the `std::net` equivalent
// rather than field-by-field constructing one; mio's `sys::unix::net::to_socket_addr`
// relies on the same layout compatibility on every target this crate supports.
unsafe fn sockaddr_to_endpoint(storage: &libc::sockaddr_storage) -> io::Result<Endpoint> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => Ok(Endpoint::V4(
            *(storage as *const libc::sockaddr_storage as *const std::net::SocketAddrV4),
        )),
        libc::AF_INET6 => Ok(Endpoint::V6(
            *(storage as *const libc::sockaddr_storage as *const std::net::SocketAddrV6),
        )),
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// `socket(2)` with `SOCK_NONBLOCK | SOCK_CLOEXEC` set atomically.
pub fn create_nonblocking_socket(endpoint: Endpoint) -> io::Result<RawFd> {
    let domain = if endpoint.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))
}

pub fn bind(fd: RawFd, endpoint: Endpoint) -> io::Result<()> {
    let addr: SocketAddr = endpoint.into();
    let (storage, len) = sockaddr_from(addr);
    syscall!(bind(fd, storage, len)).map(|_| ())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

/// `accept4(2)` with `SOCK_NONBLOCK | SOCK_CLOEXEC`, as spec.md §4.5 requires.
///
/// Returns `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` (no pending connection),
/// surfacing every other error (including `EMFILE`) to the caller so
/// `Acceptor::handle_read` can apply the idle-fd dance.
pub fn accept(listen_fd: RawFd) -> io::Result<Option<(RawFd, Endpoint)>> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let result = syscall!(accept4(
        listen_fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ));
    match result {
        Ok(fd) => {
            let storage = unsafe { storage.assume_init() };
            let endpoint = unsafe { sockaddr_to_endpoint(&storage)? };
            Ok(Some((fd, endpoint)))
        }
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EAGAIN) =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// `connect(2)`; an in-progress non-blocking connect (`EINPROGRESS`) is not
/// an error here, matching mio's `Socket::connect2`.
pub fn connect(fd: RawFd, endpoint: Endpoint) -> io::Result<()> {
    let addr: SocketAddr = endpoint.into();
    let (storage, len) = sockaddr_from(addr);
    match syscall!(connect(fd, storage, len)) {
        Ok(_) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(err) => Err(err),
    }
}

/// `shutdown(fd, SHUT_WR)` — half-close the write side (spec.md §4.6).
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let value: libc::c_int = if on { 1 } else { 0 };
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub fn set_tcp_no_delay(fd: RawFd, on: bool) -> io::Result<()> {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

/// `getsockopt(SO_ERROR)` — pending asynchronous error on the socket.
pub fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(err)
}

pub fn local_addr(fd: RawFd) -> io::Result<Endpoint> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { sockaddr_to_endpoint(&storage.assume_init()) }
}

pub fn peer_addr(fd: RawFd) -> io::Result<Endpoint> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { sockaddr_to_endpoint(&storage.assume_init()) }
}

/// `read(2)` into `buf`, treating `EAGAIN`/`EWOULDBLOCK` as "0 bytes right now"
/// is NOT done here — callers (Channel dispatch only fires on readiness) call
/// this directly and propagate `WouldBlock` as an error; scatter-read in
/// `Buffer::read_fd` handles the non-blocking contract itself.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(read(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
    ))?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len()))?;
    Ok(n as usize)
}

pub fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}
