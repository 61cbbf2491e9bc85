/// Execute a system call, turning a `-1` return into `io::Error::last_os_error`.
///
/// Mirrors the convention mio uses at every raw libc call site.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
