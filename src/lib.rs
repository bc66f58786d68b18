//! A single-threaded, per-worker event reactor and connection lifecycle
//! layer built on Linux `epoll`.
//!
//! The crate multiplexes readiness notifications across a pre-allocated
//! pool of connections, filters out notifications for file descriptors that
//! were closed and recycled within the same dispatch batch, drives
//! per-connection timers from one monotonic deadline index, and hosts
//! listening sockets whose accepted connections are handed into the pool.
//!
//! Protocol parsing is out of scope: callers install read/write handlers
//! (see [`Reactor::set_read_handler`] / [`Reactor::set_write_handler`]) and
//! the reactor takes care of *when* to call them.

#[macro_use]
mod macros;

pub mod accept_mutex;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod listener;
pub mod pool;
pub mod reactor;
pub mod signals;
pub mod timer;
pub mod token;
pub mod worker;

pub use accept_mutex::AcceptMutex;
pub use backend::epoll::Epoll;
pub use backend::{BackendCaps, Interest, ReadReady, ReadinessBackend};
pub use config::ReactorConfig;
pub use connection::{Connection, ConnFlags, LogErrorPolicy};
pub use error::{ConfigError, ReactorError};
pub use event::{Direction, EventFlags, EventRecord};
pub use listener::{Listener, ListenerOptions, ListenerSet};
pub use pool::ConnectionPool;
pub use reactor::Reactor;
pub use timer::TimerIndex;
pub use token::Handle;
pub use worker::{daemonize, reap_children, spawn_workers};
