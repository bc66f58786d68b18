//! The concrete edge-triggered readiness backend, built directly on
//! `epoll(7)` the way `mio`'s `sys/unix/selector/epoll.rs` does: raw
//! `libc` calls behind the `syscall!` helper, one `OwnedFd` for the epoll
//! instance, and a `Vec<libc::epoll_event>` as the batch buffer.
//!
//! Cross-thread wakeup uses an `eventfd`, mirroring
//! `sys/unix/waker/eventfd.rs`: an 8-byte, edge-triggered counter that's
//! drained after being observed ready.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use super::{BackendCaps, Interest, ReadReady, ReadinessBackend};
use crate::token::Handle;

/// Edge-triggered `epoll` readiness backend.
pub struct Epoll {
    ep: OwnedFd,
    waker_fd: OwnedFd,
    waker_handle: Handle,
    raw_events: Vec<libc::epoll_event>,
}

/// A cheaply cloneable handle other threads use to wake the reactor.
/// Holds a raw duplicate of the eventfd so it outlives any particular
/// `Epoll` borrow.
pub struct EpollWaker {
    fd: RawFd,
}

// SAFETY: writing to an eventfd from any thread is the documented use case.
unsafe impl Send for EpollWaker {}
unsafe impl Sync for EpollWaker {}

impl Drop for EpollWaker {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl Epoll {
    fn interests_to_epoll(interest: Interest) -> u32 {
        let mut bits = EPOLLET;
        if interest.readable {
            bits |= EPOLLIN | EPOLLRDHUP;
        }
        if interest.writable {
            bits |= EPOLLOUT;
        }
        bits as u32
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: Option<&mut libc::epoll_event>) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        let ptr = event
            .map(|e| e as *mut libc::epoll_event)
            .unwrap_or(std::ptr::null_mut());
        syscall!(epoll_ctl(ep, op, fd, ptr)).map(|_| ())
    }
}

impl ReadinessBackend for Epoll {
    type Waker = EpollWaker;

    fn new(capacity_hint: usize) -> io::Result<Epoll> {
        // SAFETY: `epoll_create1` returns a valid owned fd or -1.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };

        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let waker_raw = syscall!(eventfd(0, flags))?;
        // SAFETY: `eventfd` returns a valid owned fd or -1.
        let waker_fd = unsafe { OwnedFd::from_raw_fd(waker_raw) };

        let waker_handle = Handle::new(u32::MAX, 0);

        let mut epoll = Epoll {
            ep,
            waker_fd,
            waker_handle,
            raw_events: Vec::with_capacity(capacity_hint.max(1)),
        };
        let fd = epoll.waker_fd.as_raw_fd();
        let handle = epoll.waker_handle;
        epoll.register(fd, handle, Interest::READABLE)?;
        Ok(epoll)
    }

    fn caps(&self) -> BackendCaps {
        BackendCaps {
            peer_hangup: true,
            deferred_accept: true,
        }
    }

    fn register(&mut self, fd: i32, handle: Handle, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::interests_to_epoll(interest),
            u64: handle.pack(),
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(&mut event))
    }

    fn reregister(&mut self, fd: i32, handle: Handle, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::interests_to_epoll(interest),
            u64: handle.pack(),
        };
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(&mut event))
    }

    fn deregister(&mut self, fd: i32, fd_closing: bool) -> io::Result<()> {
        if fd_closing {
            // Closing the fd drops kernel interest for free.
            return Ok(());
        }
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn waker(&mut self, _handle: Handle) -> io::Result<EpollWaker> {
        // Duplicate so the caller can move the handle to another thread
        // while this `Epoll` keeps its own copy registered.
        let dup = syscall!(dup(self.waker_fd.as_raw_fd()))?;
        Ok(EpollWaker { fd: dup })
    }

    fn wake(waker: &EpollWaker) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        let res = unsafe { libc::write(waker.fd, buf.as_ptr() as *const _, 8) };
        if res == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                // The counter is about to overflow; nothing to do but
                // leave it saturated, the reactor will drain it shortly.
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn drain_waker(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        let res = unsafe { libc::read(self.waker_fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, 8) };
        if res == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<ReadReady>) -> io::Result<()> {
        out.clear();

        let timeout_ms = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        self.raw_events.clear();
        let cap = self.raw_events.capacity();

        let n = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.raw_events.as_mut_ptr(),
            cap as i32,
            timeout_ms,
        )) {
            // SAFETY: `epoll_wait` just initialized the first `n` entries
            // of the buffer backing this allocation.
            Ok(n) => unsafe {
                self.raw_events.set_len(n as usize);
                n as usize
            },
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                // A signal interrupted the wait: return an empty batch,
                // not an error.
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for raw in &self.raw_events[..n] {
            let bits = raw.events as libc::c_int;
            out.push(ReadReady {
                handle: Handle::unpack(raw.u64),
                readable: bits & EPOLLIN != 0,
                writable: bits & EPOLLOUT != 0,
                peer_hangup: bits & EPOLLRDHUP != 0,
                hangup: bits & EPOLLHUP != 0,
                error: bits & EPOLLERR != 0,
            });
        }
        self.raw_events.clear();
        Ok(())
    }
}
