// Not all helpers are used by every integration test.
#![allow(dead_code)]

use std::io;
use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    })
}

/// A non-blocking pipe, used in place of a real socket wherever a test only
/// needs *some* fd the reactor can register and close.
pub fn make_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    assert_eq!(ret, 0, "pipe2 failed: {}", io::Error::last_os_error());
    (fds[0], fds[1])
}
