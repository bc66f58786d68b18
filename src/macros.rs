//! Small helper macros, kept free of any feature gating since this crate
//! targets a single platform (Linux).

/// Execute a system call that signals failure with `-1`, turning it into an
/// `io::Result`.
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
