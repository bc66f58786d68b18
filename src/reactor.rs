//! The per-worker main loop and the connection-lifecycle operations that
//! plug into it. `Reactor<B>` is an explicit value threaded through the
//! worker's call stack, in place of the process-wide globals a C
//! implementation of the same loop would reach for.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::accept_mutex::AcceptMutex;
use crate::backend::{BackendCaps, Interest, ReadReady, ReadinessBackend};
use crate::config::ReactorConfig;
use crate::connection::ConnFlags;
use crate::error::{ConfigError, ReactorError};
use crate::event::{Direction, EventFlags, HandlerFn};
use crate::listener::{accept_one, ListenerOptions, ListenerSet};
use crate::pool::ConnectionPool;
use crate::timer::TimerIndex;
use crate::token::Handle;

/// Sentinel index (beyond any real pool slot) identifying the waker in a
/// dispatched [`ReadReady`] entry.
const WAKER_INDEX: u32 = u32::MAX;

/// What a deferred-queue entry or a freshly-observed ready event refers
/// to: either a listener's accept-ready event, or one direction of a
/// pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Listener(usize),
    /// Slot index, direction, and the connection's generation at the
    /// moment this entry was queued — needed so draining the queue later
    /// in the same iteration can still tell a stale entry apart from a
    /// fresh one (the slot may have been closed and recycled for an
    /// unrelated connection by an accept processed earlier in this same
    /// iteration).
    Connection(usize, Direction, u32),
}

/// Closures queued by [`Notifier::notify`] to run on the reactor thread.
type PostedFn<B> = Box<dyn FnOnce(&mut Reactor<B>) + Send>;

/// A cheaply cloneable, `Send` handle other threads use to schedule work
/// on the reactor thread.
pub struct Notifier<B: ReadinessBackend> {
    queue: Arc<Mutex<VecDeque<PostedFn<B>>>>,
    waker: Arc<B::Waker>,
}

impl<B: ReadinessBackend> Clone for Notifier<B> {
    fn clone(&self) -> Self {
        Notifier {
            queue: self.queue.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<B: ReadinessBackend> Notifier<B> {
    pub fn notify<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut Reactor<B>) + Send + 'static,
    {
        self.queue.lock().unwrap().push_back(Box::new(f));
        B::wake(&self.waker)
    }
}

pub struct Reactor<B: ReadinessBackend = crate::backend::epoll::Epoll> {
    backend: B,
    pool: ConnectionPool<B>,
    timers: TimerIndex,
    listeners: ListenerSet<B>,
    config: ReactorConfig,
    caps: BackendCaps,

    accept_mutex: Option<AcceptMutex>,
    accept_mutex_held: bool,
    listeners_registered: bool,
    /// `N/8 - free_count`; while positive, this worker yields accept
    /// responsibility for one turn.
    accept_disabled: i64,

    accept_events: VecDeque<Target>,
    posted_events: VecDeque<Target>,

    notifier_state: Option<(Arc<Mutex<VecDeque<PostedFn<B>>>>, Arc<B::Waker>)>,

    epoch: Instant,
    now_ms: u64,

    shutting_down: bool,
    terminating: bool,

    pub accepted_total: u64,
    pub econnaborted_total: u64,
}

impl<B: ReadinessBackend> Reactor<B> {
    pub fn new(config: ReactorConfig) -> Result<Reactor<B>, ReactorError> {
        config.validate()?;

        let backend = B::new(config.events).map_err(ReactorError::BackendWait)?;
        let caps = backend.caps();
        let pool = ConnectionPool::new(config.worker_connections);

        raise_rlimit_nofile(config.worker_connections);

        Ok(Reactor {
            backend,
            pool,
            timers: TimerIndex::new(),
            listeners: ListenerSet::new(),
            accept_mutex: None,
            accept_mutex_held: false,
            listeners_registered: false,
            accept_disabled: 0,
            accept_events: VecDeque::new(),
            posted_events: VecDeque::new(),
            notifier_state: None,
            epoch: Instant::now(),
            now_ms: 0,
            shutting_down: false,
            terminating: false,
            accepted_total: 0,
            econnaborted_total: 0,
            caps,
            config,
        })
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub fn caps(&self) -> BackendCaps {
        self.caps
    }

    pub fn pool(&self) -> &ConnectionPool<B> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ConnectionPool<B> {
        &mut self.pool
    }

    pub fn listeners_mut(&mut self) -> &mut ListenerSet<B> {
        &mut self.listeners
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn refresh_clock(&mut self) {
        self.now_ms = self.epoch.elapsed().as_millis() as u64;
    }

    /// Enable the cross-worker accept lock, backed by an `flock` on
    /// `lock_path`. Only meaningful when `config.accept_mutex` is true.
    pub fn enable_accept_mutex(&mut self, lock_path: &Path) -> Result<(), ReactorError> {
        let mutex = AcceptMutex::open(lock_path).map_err(ReactorError::AcceptMutexInit)?;
        self.accept_mutex = Some(mutex);
        Ok(())
    }

    /// Bind and listen on `addr` with `options`, returning the index used
    /// to install an accept handler via `listeners_mut().set_accept_handler`.
    pub fn create_listening(&mut self, addr: SocketAddr, options: ListenerOptions) -> usize {
        self.listeners.create_listening(addr, options)
    }

    /// As `create_listening`, but parses a textual `listen`-directive-style
    /// address, surfacing a malformed address as
    /// [`crate::error::ConfigError::BadListenAddress`] instead of panicking
    /// on an unwrapped `.parse()`.
    pub fn create_listening_str(&mut self, addr: &str, options: ListenerOptions) -> Result<usize, ConfigError> {
        self.listeners.create_listening_str(addr, options)
    }

    /// Bind, configure, and `listen` on every listener registered via
    /// `create_listening`. A bind/listen/setsockopt failure is a
    /// startup-time configuration error (§7): it's wrapped with the
    /// offending address into [`ReactorError::ListenSetup`] rather than a
    /// bare `io::Error`, so a caller aborting on it can log which listener
    /// failed.
    pub fn open_listening_sockets(&mut self) -> Result<(), ReactorError> {
        self.listeners.open_listening_sockets()
    }

    // ----- connection pool operations -----

    /// `get_connection(fd)`: allocate a connection slot for `fd`, first
    /// attempting a reusable-LRU reclamation pass if the freelist is
    /// empty.
    pub fn get_connection(&mut self, fd: i32) -> Result<usize, ReactorError> {
        if self.pool.free_count() == 0 {
            if let Some(victim) = self.pool.reusable_pop_tail() {
                debug!("reclaiming reusable connection #{}", self.pool.connection(victim).number);
                self.pool.connection_mut(victim).flags.insert(ConnFlags::CLOSE);
                self.invoke_handler(victim, Direction::Read);
            }
        }

        let idx = self.pool.pop_free().ok_or(ReactorError::NoFreeConnections)?;
        self.pool.activate(idx, fd, self.now_ms);
        self.recompute_accept_disabled();
        Ok(idx)
    }

    /// `free_connection(c)`.
    pub fn free_connection(&mut self, idx: usize) {
        self.pool.push_free(idx);
        self.recompute_accept_disabled();
    }

    /// `close_connection(c)`: deregister from the backend, drop any
    /// armed timers and deferred-queue membership, mark the fd closed,
    /// actually close it, then return the slot to the freelist.
    pub fn close_connection(&mut self, idx: usize) {
        let fd = self.pool.connection(idx).fd;
        if fd == -1 {
            return;
        }

        if let Err(err) = self.backend.deregister(fd, true) {
            warn!("error deregistering fd {fd} on close: {err}");
        }

        {
            let rev = self.pool.read_event_mut(idx);
            if rev.flags.contains(EventFlags::TIMER_SET) {
                let mut key = rev.timer_key;
                let mut flags = rev.flags;
                self.timers.del_timer(&mut flags, &mut key);
                let rev = self.pool.read_event_mut(idx);
                rev.flags = flags;
                rev.timer_key = key;
            }
        }
        {
            let wev = self.pool.write_event_mut(idx);
            if wev.flags.contains(EventFlags::TIMER_SET) {
                let mut key = wev.timer_key;
                let mut flags = wev.flags;
                self.timers.del_timer(&mut flags, &mut key);
                let wev = self.pool.write_event_mut(idx);
                wev.flags = flags;
                wev.timer_key = key;
            }
        }

        let belongs_to_idx = |t: &Target| matches!(t, Target::Connection(slot, _, _) if *slot == idx);
        self.accept_events.retain(|t| !belongs_to_idx(t));
        self.posted_events.retain(|t| !belongs_to_idx(t));

        self.pool.set_reusable(idx, false);
        self.pool.connection_mut(idx).fd = -1;
        let _ = unsafe { libc::close(fd) };
        self.pool.connection_mut(idx).data = None;
        self.pool.connection_mut(idx).scratch = None;

        self.free_connection(idx);
    }

    /// `reusable(c, on)`.
    pub fn reusable(&mut self, idx: usize, on: bool) {
        self.pool.set_reusable(idx, on);
        self.pool.connection_mut(idx).flags.set(ConnFlags::IDLE, on);
    }

    /// Lazily fill and return this connection's local address, caching the
    /// result on the first call so later calls don't re-syscall (spec.md
    /// §3: local address is "lazily filled", never populated by the accept
    /// loop itself).
    pub fn local_addr(&mut self, idx: usize) -> io::Result<SocketAddr> {
        if let Some(addr) = self.pool.connection(idx).local_addr {
            return Ok(addr);
        }
        let fd = self.pool.connection(idx).fd;
        let addr = crate::listener::get_local_addr(fd)?;
        self.pool.connection_mut(idx).local_addr = Some(addr);
        Ok(addr)
    }

    fn recompute_accept_disabled(&mut self) {
        let n = self.pool.capacity() as i64;
        let free = self.pool.free_count() as i64;
        self.accept_disabled = n / 8 - free;
    }

    // ----- handler installation -----

    pub fn set_read_handler<F>(&mut self, idx: usize, handler: F)
    where
        F: FnMut(&mut Reactor<B>, usize) + 'static,
    {
        self.pool.read_event_mut(idx).handler = Some(Box::new(handler));
    }

    pub fn set_write_handler<F>(&mut self, idx: usize, handler: F)
    where
        F: FnMut(&mut Reactor<B>, usize) + 'static,
    {
        self.pool.write_event_mut(idx).handler = Some(Box::new(handler));
    }

    /// Invoke the handler for one direction of `idx`, handling the
    /// callback-graph break described in the Design Notes: the handler
    /// takes `&mut Reactor<B>`, so the closure must be removed from its
    /// slot before the call (otherwise we'd need two mutable borrows of
    /// the pool at once). If the handler replaced its own registration
    /// (a common re-arm pattern) that replacement wins; otherwise the
    /// original closure is put back, unless the connection's generation
    /// changed during the call (it was closed and the slot recycled),
    /// in which case there is nothing to restore it into.
    fn invoke_handler(&mut self, idx: usize, dir: Direction) {
        let generation_before = self.pool.connection(idx).generation;

        let taken: Option<HandlerFn<B>> = match dir {
            Direction::Read => self.pool.read_event_mut(idx).handler.take(),
            Direction::Write => self.pool.write_event_mut(idx).handler.take(),
        };
        let Some(mut handler) = taken else { return };

        handler(self, idx);

        if self.pool.connection(idx).generation != generation_before {
            // The slot was recycled during the callback; the handler
            // belongs to a prior incarnation and must not be restored.
            return;
        }
        let slot = match dir {
            Direction::Read => &mut self.pool.read_event_mut(idx).handler,
            Direction::Write => &mut self.pool.write_event_mut(idx).handler,
        };
        if slot.is_none() {
            *slot = Some(handler);
        }
    }

    // ----- timers -----

    pub fn add_timer(&mut self, idx: usize, dir: Direction, delay: Duration) {
        let now_ms = self.now_ms;
        let hysteresis = self.config.timer_reinsert_hysteresis.as_millis() as u64;
        let ev = match dir {
            Direction::Read => self.pool.read_event_mut(idx),
            Direction::Write => self.pool.write_event_mut(idx),
        };
        self.timers.add_timer(
            &mut ev.flags,
            &mut ev.timer_key,
            idx,
            dir,
            now_ms,
            delay.as_millis() as u64,
            hysteresis,
        );
    }

    pub fn del_timer(&mut self, idx: usize, dir: Direction) {
        let ev = match dir {
            Direction::Read => self.pool.read_event_mut(idx),
            Direction::Write => self.pool.write_event_mut(idx),
        };
        self.timers.del_timer(&mut ev.flags, &mut ev.timer_key);
    }

    /// `find_timer()`, used to compute the next `wait` timeout.
    pub fn find_timer(&self) -> Option<u64> {
        self.timers.find_timer(self.now_ms)
    }

    /// `no_timers_left()`: true iff every remaining armed timer belongs
    /// to a cancelable event. Used during graceful shutdown.
    pub fn no_timers_left(&self) -> bool {
        self.timers.iter().all(|(idx, dir)| {
            let ev = match dir {
                Direction::Read => self.pool.read_event(idx),
                Direction::Write => self.pool.write_event(idx),
            };
            ev.flags.contains(EventFlags::CANCELABLE)
        })
    }

    fn expire_timers(&mut self) {
        let due = self.timers.pop_expired(self.now_ms);
        for (_, idx, dir) in due {
            let ev = match dir {
                Direction::Read => self.pool.read_event_mut(idx),
                Direction::Write => self.pool.write_event_mut(idx),
            };
            ev.flags.insert(EventFlags::TIMEDOUT);
            ev.flags.remove(EventFlags::TIMER_SET);
            ev.timer_key = None;
            self.pool.connection_mut(idx).flags.insert(ConnFlags::TIMEDOUT);
            self.invoke_handler(idx, dir);
        }
    }

    // ----- idempotent re-arm helpers -----

    /// Re-register read interest after a partial drain so a handler that
    /// read fewer bytes than `available` and wants to be notified again
    /// doesn't have to reason about ADD vs MOD itself.
    pub fn handle_read(&mut self, idx: usize) -> io::Result<()> {
        self.rearm(idx, Direction::Read)
    }

    /// Symmetric with `handle_read`; `lowat` (low watermark) is accepted
    /// for interface symmetry with `handle_read` but unused by an
    /// edge-triggered backend that always re-arms fully.
    pub fn handle_write(&mut self, idx: usize, _lowat: usize) -> io::Result<()> {
        self.rearm(idx, Direction::Write)
    }

    fn rearm(&mut self, idx: usize, dir: Direction) -> io::Result<()> {
        let fd = self.pool.connection(idx).fd;
        if fd == -1 {
            return Ok(());
        }
        let generation = self.pool.connection(idx).generation;
        let handle = Handle::new(idx as u32, generation);

        let (already_active, other_active) = {
            let (this, other) = match dir {
                Direction::Read => (self.pool.read_event(idx), self.pool.write_event(idx)),
                Direction::Write => (self.pool.write_event(idx), self.pool.read_event(idx)),
            };
            (this.flags.contains(EventFlags::ACTIVE), other.flags.contains(EventFlags::ACTIVE))
        };
        if already_active {
            return Ok(());
        }

        let interest = match (dir, other_active) {
            (Direction::Read, false) => Interest::READABLE,
            (Direction::Write, false) => Interest::WRITABLE,
            (_, true) => Interest::both(),
        };
        if other_active {
            self.backend.reregister(fd, handle, interest)?;
        } else {
            self.backend.register(fd, handle, interest)?;
        }

        let ev = match dir {
            Direction::Read => self.pool.read_event_mut(idx),
            Direction::Write => self.pool.write_event_mut(idx),
        };
        ev.flags.insert(EventFlags::ACTIVE);
        Ok(())
    }

    /// Clear the `ACTIVE` bit for one direction, demoting the backend's
    /// registration to the other direction if it's still active, or
    /// removing it entirely otherwise. The `CLOSE` connection flag
    /// short-circuits the syscall since the fd is about to be closed
    /// anyway.
    fn deactivate(&mut self, idx: usize, dir: Direction) -> io::Result<()> {
        let fd = self.pool.connection(idx).fd;
        let closing = self.pool.connection(idx).flags.contains(ConnFlags::CLOSE);
        let generation = self.pool.connection(idx).generation;
        let handle = Handle::new(idx as u32, generation);

        let other_active = match dir {
            Direction::Read => self.pool.write_event(idx).flags.contains(EventFlags::ACTIVE),
            Direction::Write => self.pool.read_event(idx).flags.contains(EventFlags::ACTIVE),
        };

        if fd != -1 {
            if closing {
                self.backend.deregister(fd, true)?;
            } else if other_active {
                let remaining = match dir {
                    Direction::Read => Interest::WRITABLE,
                    Direction::Write => Interest::READABLE,
                };
                self.backend.reregister(fd, handle, remaining)?;
            } else {
                self.backend.deregister(fd, false)?;
            }
        }

        let ev = match dir {
            Direction::Read => self.pool.read_event_mut(idx),
            Direction::Write => self.pool.write_event_mut(idx),
        };
        ev.flags.remove(EventFlags::ACTIVE);
        Ok(())
    }

    pub fn deactivate_read(&mut self, idx: usize) -> io::Result<()> {
        self.deactivate(idx, Direction::Read)
    }

    pub fn deactivate_write(&mut self, idx: usize) -> io::Result<()> {
        self.deactivate(idx, Direction::Write)
    }

    /// Register both directions at once for a freshly accepted
    /// connection, edge-triggered.
    pub fn register_connection(&mut self, idx: usize, interest: Interest) -> io::Result<()> {
        let fd = self.pool.connection(idx).fd;
        let generation = self.pool.connection(idx).generation;
        let handle = Handle::new(idx as u32, generation);
        self.backend.register(fd, handle, interest)?;
        if interest.readable {
            self.pool.read_event_mut(idx).flags.insert(EventFlags::ACTIVE);
        }
        if interest.writable {
            self.pool.write_event_mut(idx).flags.insert(EventFlags::ACTIVE);
        }
        Ok(())
    }

    // ----- cross-thread notify -----

    pub fn notifier(&mut self) -> io::Result<Notifier<B>> {
        if self.notifier_state.is_none() {
            let waker = self.backend.waker(Handle::new(WAKER_INDEX, 0))?;
            self.notifier_state = Some((Arc::new(Mutex::new(VecDeque::new())), Arc::new(waker)));
        }
        let (queue, waker) = self.notifier_state.as_ref().unwrap();
        Ok(Notifier {
            queue: queue.clone(),
            waker: waker.clone(),
        })
    }

    fn drain_notify_queue(&mut self) {
        let queue = match &self.notifier_state {
            Some((queue, _)) => queue.clone(),
            None => return,
        };
        let pending: Vec<PostedFn<B>> = {
            let mut q = queue.lock().unwrap();
            q.drain(..).collect()
        };
        for f in pending {
            f(self);
        }
    }

    // ----- listener accept loop -----

    fn register_listeners(&mut self) -> io::Result<()> {
        let generation = 0;
        let indices: Vec<usize> = (0..self.listeners.len()).collect();
        for idx in indices {
            let fd = self.listeners.get(idx).fd;
            let handle = Handle::new(self.pool.capacity() as u32 + idx as u32, generation);
            self.backend.register(fd, handle, Interest::READABLE)?;
        }
        self.listeners_registered = true;
        Ok(())
    }

    fn deregister_listeners(&mut self) -> io::Result<()> {
        for idx in 0..self.listeners.len() {
            let fd = self.listeners.get(idx).fd;
            self.backend.deregister(fd, false)?;
        }
        self.listeners_registered = false;
        Ok(())
    }

    fn accept_loop(&mut self, listener_idx: usize) {
        let limit = self.config.multi_accept;
        let listener_fd = self.listeners.get(listener_idx).fd;
        for _ in 0..limit {
            match accept_one(listener_fd) {
                Ok((fd, peer)) => {
                    self.accepted_total += 1;
                    match self.get_connection(fd) {
                        Ok(idx) => {
                            self.pool.connection_mut(idx).peer_addr = Some(peer);
                            if let Err(err) = self.register_connection(idx, Interest::READABLE) {
                                error!("failed to register accepted connection: {err}");
                                self.close_connection(idx);
                                continue;
                            }
                            // Dispatch to the protocol-installed accept
                            // handler, take/restore the same way
                            // `invoke_handler` does, since it also needs
                            // `&mut Reactor`.
                            let taken = self.listeners.get_mut(listener_idx).accept_handler.take();
                            if let Some(mut handler) = taken {
                                handler(self, idx);
                                if self.listeners.get_mut(listener_idx).accept_handler.is_none() {
                                    self.listeners.get_mut(listener_idx).accept_handler = Some(handler);
                                }
                            }
                        }
                        Err(ReactorError::NoFreeConnections) => {
                            warn!("no free connections available, dropping accepted fd {fd}");
                            let _ = unsafe { libc::close(fd) };
                            break;
                        }
                        Err(err) => {
                            error!("get_connection failed: {err}");
                            let _ = unsafe { libc::close(fd) };
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => match err.raw_os_error() {
                    Some(libc::ECONNABORTED) => {
                        self.econnaborted_total += 1;
                    }
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        self.accept_disabled = self.pool.capacity() as i64;
                        warn!("accept failed with {err}, disabling accepts for this worker");
                        break;
                    }
                    _ => {
                        error!("accept4 failed: {err}");
                    }
                },
            }
        }
    }

    // ----- dispatch -----

    fn classify(&self, handle: Handle) -> Option<Target> {
        if handle.index == WAKER_INDEX {
            return None;
        }
        let cap = self.pool.capacity() as u32;
        if handle.index < cap {
            Some(Target::Connection(handle.index as usize, Direction::Read, handle.generation))
        } else {
            Some(Target::Listener((handle.index - cap) as usize))
        }
    }

    /// True if this notification is stale: the fd was closed (and
    /// possibly the slot recycled) since this notification was queued.
    fn is_stale(&self, idx: usize, handle_generation: u32) -> bool {
        let conn = self.pool.connection(idx);
        conn.fd == -1 || conn.generation != handle_generation
    }

    fn dispatch_one(&mut self, ready: ReadReady, defer_accepts: bool, defer_all: bool) {
        let Some(target) = self.classify(ready.handle) else {
            // Waker readiness: drain the counter and run whatever was
            // posted to the notify queue.
            if let Err(err) = self.backend.drain_waker() {
                warn!("failed to drain waker: {err}");
            }
            self.drain_notify_queue();
            return;
        };

        match target {
            Target::Listener(listener_idx) => {
                if listener_idx >= self.listeners.len() {
                    return;
                }
                if defer_accepts {
                    self.accept_events.push_back(Target::Listener(listener_idx));
                } else {
                    self.accept_loop(listener_idx);
                }
            }
            Target::Connection(idx, _, generation) => {
                if self.is_stale(idx, generation) {
                    trace!("discarding stale event for slot {idx}");
                    return;
                }

                let readable = ready.effective_readable();
                let writable = ready.effective_writable();

                if readable {
                    self.dispatch_direction(idx, Direction::Read, generation, defer_all);
                }
                // Re-check staleness: the read handler may have closed
                // the connection (scenario S2).
                if writable && !self.is_stale(idx, generation) {
                    self.dispatch_direction(idx, Direction::Write, generation, defer_all);
                }
            }
        }
    }

    fn dispatch_direction(&mut self, idx: usize, dir: Direction, generation: u32, defer_all: bool) {
        {
            let ev = match dir {
                Direction::Read => self.pool.read_event_mut(idx),
                Direction::Write => self.pool.write_event_mut(idx),
            };
            ev.flags.insert(EventFlags::READY);
        }
        if defer_all {
            self.posted_events.push_back(Target::Connection(idx, dir, generation));
        } else {
            self.invoke_handler(idx, dir);
        }
    }

    fn drain_accept_events(&mut self) {
        while let Some(target) = self.accept_events.pop_front() {
            if let Target::Listener(listener_idx) = target {
                self.accept_loop(listener_idx);
            }
        }
    }

    fn drain_posted_events(&mut self) {
        while let Some(target) = self.posted_events.pop_front() {
            if let Target::Connection(idx, dir, generation) = target {
                if !self.is_stale(idx, generation) {
                    self.invoke_handler(idx, dir);
                }
            }
        }
    }

    /// One iteration of the reactor loop: try the accept lock, compute
    /// the wait timeout, wait, dispatch the batch (with stale-event
    /// filtering), drain the deferred queues, expire timers.
    pub fn run_one_iteration(&mut self, out: &mut Vec<ReadReady>) -> io::Result<()> {
        let mutex_enabled = self.config.accept_mutex && self.accept_mutex.is_some();
        let backpressured = mutex_enabled && self.accept_disabled > 0;
        let contending = mutex_enabled && !backpressured;
        let mut defer_accepts = false;

        if contending {
            let acquired = self.accept_mutex.as_mut().unwrap().try_lock()?;
            self.accept_mutex_held = acquired;
            if acquired {
                if !self.listeners_registered {
                    self.register_listeners()?;
                }
            } else if self.listeners_registered {
                self.deregister_listeners()?;
            }
            defer_accepts = acquired;
        } else if backpressured {
            // Under pool pressure (§4.4's `accept_disabled` backoff): yield
            // accept duty for this turn exactly as a failed `try_lock`
            // would, releasing the lock if held and withdrawing listener
            // registration, rather than leaving a stale registration (and
            // a stale lock) in place because neither branch above ran.
            if self.accept_mutex_held {
                if let Some(mutex) = self.accept_mutex.as_mut() {
                    mutex.release()?;
                }
                self.accept_mutex_held = false;
            }
            if self.listeners_registered {
                self.deregister_listeners()?;
            }
        } else if !self.config.accept_mutex && !self.listeners_registered && !self.listeners.is_empty() {
            self.register_listeners()?;
        }

        let timer_timeout = self.find_timer();
        let timeout = if contending && !self.accept_mutex_held {
            Some(self.config.accept_mutex_delay)
        } else {
            timer_timeout.map(Duration::from_millis)
        };

        self.backend.wait(timeout, out)?;
        self.refresh_clock();

        for &ready in out.iter() {
            self.dispatch_one(ready, defer_accepts, false);
        }

        self.drain_accept_events();

        if self.accept_mutex_held {
            if let Some(mutex) = self.accept_mutex.as_mut() {
                mutex.release()?;
            }
            self.accept_mutex_held = false;
        }

        self.drain_posted_events();
        self.expire_timers();

        Ok(())
    }

    /// Observe the process-level signal flags once per iteration. Returns
    /// `true` if the worker should stop running.
    fn handle_signals(&mut self) -> bool {
        let flags = crate::signals::take();
        if flags.terminate {
            self.terminating = true;
        }
        if flags.graceful_shutdown {
            self.shutting_down = true;
        }
        if self.shutting_down && !self.terminating {
            // Reclaim idle, reusable connections immediately; a
            // mid-request connection with a non-cancelable timer is left
            // to finish (scenario S6).
            let mut reusable_indices = Vec::new();
            loop {
                match self.pool.reusable_pop_tail() {
                    Some(idx) => reusable_indices.push(idx),
                    None => break,
                }
            }
            for idx in reusable_indices {
                self.close_connection(idx);
            }
            if self.no_timers_left() {
                self.terminating = true;
            }
        }
        self.terminating
    }

    /// Run until an explicit shutdown signal is observed. Transient wait
    /// failures are logged and absorbed; the loop never terminates on its
    /// own otherwise.
    pub fn run(&mut self) -> io::Result<()> {
        crate::signals::install();
        let mut batch = Vec::with_capacity(self.config.events);
        loop {
            if let Err(err) = self.run_one_iteration(&mut batch) {
                error!("reactor iteration failed: {err}");
            }
            if self.handle_signals() {
                break;
            }
        }
        Ok(())
    }
}

/// Inflate `RLIMIT_NOFILE` to at least the configured connection count.
/// Best-effort: failures are logged, not fatal, since the worker may
/// simply lack permission to raise its own hard limit.
fn raise_rlimit_nofile(worker_connections: usize) {
    let wanted = worker_connections as u64 + 16;
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: well-formed out-param for `getrlimit`.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return;
    }
    if limit.rlim_cur >= wanted {
        return;
    }
    let new_cur = wanted.min(limit.rlim_max);
    let mut new_limit = libc::rlimit {
        rlim_cur: new_cur,
        rlim_max: limit.rlim_max,
    };
    // SAFETY: well-formed in-param for `setrlimit`.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &mut new_limit) } != 0 {
        warn!(
            "failed to raise RLIMIT_NOFILE to {new_cur}: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::epoll::Epoll;
    use std::cell::Cell;
    use std::rc::Rc;

    fn test_config(worker_connections: usize) -> ReactorConfig {
        let mut config = ReactorConfig::default();
        config.worker_connections = worker_connections;
        config.events = 8;
        config.accept_mutex = false;
        config
    }

    /// A pipe gives us two real, independently closeable fds without
    /// needing an actual socket.
    fn make_pipe_fd() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(res, 0, "pipe2 failed: {}", io::Error::last_os_error());
        (fds[0], fds[1])
    }

    #[test]
    fn stale_event_is_discarded_after_slot_recycled() {
        let mut reactor: Reactor<Epoll> = Reactor::new(test_config(2)).unwrap();

        let (fd_a, fd_a_peer) = make_pipe_fd();
        let idx = reactor.get_connection(fd_a).unwrap();
        let stale_generation = reactor.pool.connection(idx).generation;

        let fired = Rc::new(Cell::new(false));
        let fired_in_handler = fired.clone();
        reactor.set_read_handler(idx, move |_r, _i| fired_in_handler.set(true));

        // Close the connection (frees the slot) and immediately recycle it
        // for an unrelated connection, the same race a deferred-queue entry
        // or a batch dispatched earlier in the iteration could lose to.
        reactor.close_connection(idx);
        let (fd_b, fd_b_peer) = make_pipe_fd();
        let idx2 = reactor.get_connection(fd_b).unwrap();
        assert_eq!(idx2, idx, "the only free slot should be reused");

        let stale_ready = ReadReady {
            handle: Handle::new(idx as u32, stale_generation),
            readable: true,
            writable: false,
            peer_hangup: false,
            hangup: false,
            error: false,
        };
        reactor.dispatch_one(stale_ready, false, false);
        assert!(!fired.get(), "a stale notification must not invoke the recycled slot's handler");

        reactor.close_connection(idx2);
        unsafe {
            libc::close(fd_a_peer);
            libc::close(fd_b_peer);
        }
    }

    #[test]
    fn expired_timer_invokes_handler_and_sets_timedout() {
        let mut reactor: Reactor<Epoll> = Reactor::new(test_config(1)).unwrap();
        let (fd, fd_peer) = make_pipe_fd();
        let idx = reactor.get_connection(fd).unwrap();

        let fired = Rc::new(Cell::new(false));
        let fired_in_handler = fired.clone();
        reactor.set_read_handler(idx, move |r, i| {
            assert!(r.pool().connection(i).flags.contains(ConnFlags::TIMEDOUT));
            fired_in_handler.set(true);
        });

        reactor.add_timer(idx, Direction::Read, Duration::from_millis(0));
        assert!(reactor.pool.read_event(idx).flags.contains(EventFlags::TIMER_SET));

        reactor.now_ms = 5;
        reactor.expire_timers();

        assert!(fired.get(), "expiry must invoke the handler");
        assert!(!reactor.pool.read_event(idx).flags.contains(EventFlags::TIMER_SET));
        assert!(reactor.no_timers_left());

        reactor.close_connection(idx);
        unsafe { libc::close(fd_peer) };
    }

    #[test]
    fn accept_disabled_tracks_free_count() {
        let mut reactor: Reactor<Epoll> = Reactor::new(test_config(16)).unwrap();
        assert_eq!(reactor.accept_disabled, 16 / 8 - 16);

        let mut opened = Vec::new();
        for _ in 0..14 {
            let (fd, fd_peer) = make_pipe_fd();
            let idx = reactor.get_connection(fd).unwrap();
            opened.push((idx, fd_peer));
        }
        // free_count == 2, worker_connections / 8 == 2: right at the
        // threshold, accepting is still allowed.
        assert_eq!(reactor.accept_disabled, 0);

        let (fd, fd_peer) = make_pipe_fd();
        let idx = reactor.get_connection(fd).unwrap();
        opened.push((idx, fd_peer));
        // free_count == 1 now: one below the threshold, this worker yields
        // accept duty for a turn.
        assert_eq!(reactor.accept_disabled, 1);

        for (idx, fd_peer) in opened {
            reactor.close_connection(idx);
            unsafe { libc::close(fd_peer) };
        }
    }

    #[test]
    fn get_connection_reclaims_reusable_lru_when_pool_is_full() {
        let mut reactor: Reactor<Epoll> = Reactor::new(test_config(1)).unwrap();
        let (fd_a, fd_a_peer) = make_pipe_fd();
        let idx_a = reactor.get_connection(fd_a).unwrap();
        reactor.set_read_handler(idx_a, |r, i| r.close_connection(i));
        reactor.reusable(idx_a, true);

        let (fd_b, fd_b_peer) = make_pipe_fd();
        let idx_b = reactor.get_connection(fd_b).expect("reclaiming the reusable slot should succeed");
        assert_eq!(idx_b, idx_a);

        reactor.close_connection(idx_b);
        unsafe {
            libc::close(fd_a_peer);
            libc::close(fd_b_peer);
        }
    }

    #[test]
    fn accept_disabled_withdraws_listener_registration_even_with_accept_mutex_on() {
        let mut config = test_config(8);
        config.accept_mutex = true;
        let mut reactor: Reactor<Epoll> = Reactor::new(config).unwrap();

        let lock_path = std::env::temp_dir().join(format!(
            "reactor-core-accept-mutex-test-{}-{}.lock",
            std::process::id(),
            reactor.pool.capacity()
        ));
        reactor.enable_accept_mutex(&lock_path).unwrap();

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        reactor.create_listening(addr, ListenerOptions::with_backlog(16));
        reactor.open_listening_sockets().unwrap();

        let mut batch = Vec::with_capacity(8);
        reactor.run_one_iteration(&mut batch).unwrap();
        assert!(
            reactor.listeners_registered,
            "an uncontended first iteration should acquire the lock and register the listener"
        );

        // Push the pool past the accept_disabled threshold (N/8) directly
        // through get_connection, without going through an actual accept,
        // to isolate the backpressure interaction from accept() itself.
        let mut opened = Vec::new();
        for _ in 0..8 {
            let (fd, fd_peer) = make_pipe_fd();
            let idx = reactor.get_connection(fd).unwrap();
            opened.push((idx, fd_peer));
        }
        assert!(reactor.accept_disabled > 0, "pool should be past the accept_disabled threshold");

        reactor.run_one_iteration(&mut batch).unwrap();
        assert!(
            !reactor.listeners_registered,
            "accept-disabled backpressure must withdraw the listener registration even though accept_mutex is configured on"
        );
        assert!(
            !reactor.accept_mutex_held,
            "accept-disabled backpressure must not leave the accept lock held while this worker isn't contending"
        );

        for (idx, fd_peer) in opened {
            reactor.close_connection(idx);
            unsafe { libc::close(fd_peer) };
        }
        let _ = std::fs::remove_file(&lock_path);
    }
}
