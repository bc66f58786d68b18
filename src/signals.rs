//! Process-level signal contract: a handful of `sig_atomic_t`-equivalent
//! flags, set by signal handlers that do nothing but store a value, and
//! examined once per reactor iteration. No handler-driven work happens
//! inside the handler itself — grounded in
//! `original_source/src/os/unix/ngx_daemon.c`'s signal-safety discipline
//! (no allocation, no syscalls beyond what's async-signal-safe).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static RELOAD: AtomicBool = AtomicBool::new(false);
static GRACEFUL_SHUTDOWN: AtomicBool = AtomicBool::new(false);
static TERMINATE: AtomicBool = AtomicBool::new(false);
static REOPEN_LOGS: AtomicBool = AtomicBool::new(false);
static CHILD_EXIT: AtomicBool = AtomicBool::new(false);

static INSTALLED: OnceLock<()> = OnceLock::new();

/// A snapshot of the signal flags, taken once per reactor iteration and
/// then cleared so the next iteration only sees newly-arrived signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalFlags {
    pub reload: bool,
    pub graceful_shutdown: bool,
    pub terminate: bool,
    pub reopen_logs: bool,
    pub child_exit: bool,
}

impl SignalFlags {
    pub fn any(&self) -> bool {
        self.reload || self.graceful_shutdown || self.terminate || self.reopen_logs || self.child_exit
    }
}

extern "C" fn on_reload(_sig: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

extern "C" fn on_graceful_shutdown(_sig: libc::c_int) {
    GRACEFUL_SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_terminate(_sig: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

extern "C" fn on_reopen_logs(_sig: libc::c_int) {
    REOPEN_LOGS.store(true, Ordering::SeqCst);
}

extern "C" fn on_child_exit(_sig: libc::c_int) {
    CHILD_EXIT.store(true, Ordering::SeqCst);
}

/// Install the reactor's signal handlers: `SIGHUP` (reload), `SIGQUIT`
/// (graceful shutdown), `SIGTERM`/`SIGINT` (immediate shutdown), `SIGUSR1`
/// (reopen logs), `SIGCHLD` (child exit — worker harness only, harmless in
/// a library-only test process).
///
/// Idempotent: only the first call in a process actually installs
/// handlers, since `libc::signal` is process-global and reinstalling from
/// multiple tests racing in the same process would be meaningless at best.
pub fn install() {
    INSTALLED.get_or_init(|| unsafe {
        libc::signal(libc::SIGHUP, on_reload as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, on_graceful_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
        libc::signal(libc::SIGUSR1, on_reopen_logs as libc::sighandler_t);
        libc::signal(libc::SIGCHLD, on_child_exit as libc::sighandler_t);
    });
}

/// Take a snapshot of whatever flags have been set since the last call,
/// clearing them atomically. Called once per reactor iteration.
pub fn take() -> SignalFlags {
    SignalFlags {
        reload: RELOAD.swap(false, Ordering::SeqCst),
        graceful_shutdown: GRACEFUL_SHUTDOWN.swap(false, Ordering::SeqCst),
        terminate: TERMINATE.swap(false, Ordering::SeqCst),
        reopen_logs: REOPEN_LOGS.swap(false, Ordering::SeqCst),
        child_exit: CHILD_EXIT.swap(false, Ordering::SeqCst),
    }
}

#[cfg(test)]
pub(crate) fn raise_graceful_shutdown_for_test() {
    GRACEFUL_SHUTDOWN.store(true, Ordering::SeqCst);
}
