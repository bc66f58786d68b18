//! Cross-worker accept-lock arbitration: a process-shared mutex held by
//! at most one worker at a time, so only one worker registers interest on
//! the listener fds and the thundering herd of simultaneously-unblocked
//! workers all observing the same pending accept is avoided.
//!
//! Implemented as an advisory `flock(2)` on a lock file, the simplest
//! portable process-shared mutex available without a shared-memory
//! segment. `flock` trylock (`LOCK_EX | LOCK_NB`) gives exactly the
//! non-blocking acquire-attempt semantics the reactor loop needs.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

pub struct AcceptMutex {
    fd: OwnedFd,
    held: bool,
}

impl AcceptMutex {
    pub fn open(path: &Path) -> io::Result<AcceptMutex> {
        use std::os::fd::FromRawFd;
        let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let raw = syscall!(open(
            c_path.as_ptr(),
            libc::O_CREAT | libc::O_RDWR | libc::O_CLOEXEC,
            0o600
        ))?;
        // SAFETY: `open(2)` returned a valid owned fd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(AcceptMutex { fd, held: false })
    }

    /// Non-blocking acquire attempt. Returns `Ok(true)` if this call
    /// acquired the lock, `Ok(false)` if another worker already holds it.
    pub fn try_lock(&mut self) -> io::Result<bool> {
        if self.held {
            return Ok(true);
        }
        let res = unsafe { libc::flock(self.fd.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res == 0 {
            self.held = true;
            Ok(true)
        } else {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Release the lock if held. Hold duration is bounded to one dispatch
    /// iteration by the reactor loop calling this at the end of every
    /// iteration; `release` itself places no bound.
    pub fn release(&mut self) -> io::Result<()> {
        if !self.held {
            return Ok(());
        }
        syscall!(flock(self.fd.as_raw_fd(), libc::LOCK_UN)).map(|_| ())?;
        self.held = false;
        Ok(())
    }
}

impl Drop for AcceptMutex {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
