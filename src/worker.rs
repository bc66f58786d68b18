//! Fork-per-worker process harness: the binary-level host the reactor core
//! plugs into, so a consumer gets the "multi-process fan-out, one
//! single-threaded reactor per worker" model described in §5 without having
//! to hand-roll `fork`/`setsid`/signal-install bookkeeping itself.
//!
//! Grounded in `original_source/src/os/unix/ngx_daemon.c`'s daemonization
//! sequence (`fork`, `setsid`, `umask`, redirect std streams to `/dev/null`)
//! and nginx's master/worker split more generally: the master binds
//! listening sockets and forks `N` children before any of them open an
//! `epoll` instance or install the worker signal contract, so every worker
//! inherits the same already-bound listener fds across `fork` rather than
//! each independently racing to bind (no `SO_REUSEPORT` requirement on the
//! listener).

use std::io;
use std::process;

/// Daemonize the current process: fork, let the parent exit immediately,
/// detach the child into its own session, and redirect `stdin`/`stdout` to
/// `/dev/null`. Mirrors `ngx_daemon`'s sequence exactly, including leaving
/// `stderr` attached (nginx does too, behind the same `#if 0`) so panics and
/// early startup errors are still visible before logging is configured.
///
/// Must be called before any threads are spawned and before the readiness
/// backend or listeners are created, since `fork` only duplicates the
/// calling thread.
pub fn daemonize() -> io::Result<()> {
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {} // child falls through
        _ => process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    unsafe { libc::umask(0) };

    let devnull_path = std::ffi::CString::new("/dev/null").unwrap();
    let devnull = syscall!(open(devnull_path.as_ptr(), libc::O_RDWR))?;
    syscall!(dup2(devnull, libc::STDIN_FILENO))?;
    syscall!(dup2(devnull, libc::STDOUT_FILENO))?;
    if devnull > libc::STDERR_FILENO {
        syscall!(close(devnull))?;
    }
    Ok(())
}

/// Fork `count` worker processes, each running `worker_main(index)` and
/// exiting with status 0 when it returns. Returns the parent's view: the
/// child pids, in fork order.
///
/// Listening sockets must already be open in the calling process before
/// this is called — `fork` duplicates the fd table, so every worker
/// inherits the same bound listeners without any of them binding
/// themselves. Each worker is expected to install its own signal handlers
/// and construct its own `Reactor` after forking (`ngx_daemon.c`'s
/// documented reason for not installing the worker signal contract until
/// after the process split: the master and the workers react to some of
/// the same signal numbers differently).
pub fn spawn_workers<F>(count: usize, mut worker_main: F) -> io::Result<Vec<libc::pid_t>>
where
    F: FnMut(usize),
{
    let mut pids = Vec::with_capacity(count);
    for idx in 0..count {
        match unsafe { libc::fork() } {
            -1 => return Err(io::Error::last_os_error()),
            0 => {
                worker_main(idx);
                process::exit(0);
            }
            pid => pids.push(pid),
        }
    }
    Ok(pids)
}

/// Reap any worker children that have exited, without blocking. Intended
/// to be called by the master process once per iteration of its own
/// (much simpler) loop after observing `SIGCHLD` via
/// [`crate::signals::take`]'s `child_exit` flag.
///
/// Returns the pids reaped this call, paired with their exit status, for
/// a master that wants to restart a worker that died unexpectedly.
pub fn reap_children() -> Vec<(libc::pid_t, i32)> {
    let mut reaped = Vec::new();
    loop {
        let mut status: i32 = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        reaped.push((pid, status));
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_children_returns_empty_when_nothing_has_exited() {
        assert!(reap_children().is_empty());
    }

    #[test]
    fn spawn_workers_runs_the_closure_in_each_forked_child() {
        let pids = spawn_workers(3, |idx| {
            process::exit(idx as i32);
        })
        .expect("fork should succeed");
        assert_eq!(pids.len(), 3);

        for (worker_idx, pid) in pids.iter().enumerate() {
            let mut status: i32 = 0;
            // Blocking wait on this exact pid: deterministic, no polling
            // loop needed since `waitpid` itself suspends until this child
            // (which exits almost immediately) is reaped.
            let waited = unsafe { libc::waitpid(*pid, &mut status, 0) };
            assert_eq!(waited, *pid, "waitpid should reap the exact child requested");
            let exit_code = (status >> 8) & 0xff;
            assert_eq!(
                exit_code, worker_idx as i32,
                "child {worker_idx} should have exited with its own worker index"
            );
        }
    }
}
