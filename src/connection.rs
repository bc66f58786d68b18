use std::net::SocketAddr;
use std::time::Duration;

/// Per-connection policy for how I/O errors are logged, matching the
/// `log_error` field nginx carries per connection
/// (`original_source/src/core/ngx_connection.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogErrorPolicy {
    Alert,
    Err,
    Info,
    IgnoreEconnreset,
    IgnoreEinval,
}

impl Default for LogErrorPolicy {
    fn default() -> LogErrorPolicy {
        LogErrorPolicy::Alert
    }
}

/// Boolean flags carried on a [`Connection`]. Same hand-rolled bitset style
/// as [`crate::event::EventFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnFlags(u8);

impl ConnFlags {
    pub const REUSABLE: ConnFlags = ConnFlags(1 << 0);
    pub const IDLE: ConnFlags = ConnFlags(1 << 1);
    pub const CLOSE: ConnFlags = ConnFlags(1 << 2);
    pub const DESTROYED: ConnFlags = ConnFlags(1 << 3);
    pub const ERROR: ConnFlags = ConnFlags(1 << 4);
    pub const TIMEDOUT: ConnFlags = ConnFlags(1 << 5);
    pub const SHARED: ConnFlags = ConnFlags(1 << 6);
    pub const SENDFILE: ConnFlags = ConnFlags(1 << 7);

    pub const fn empty() -> ConnFlags {
        ConnFlags(0)
    }

    pub fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ConnFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ConnFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: ConnFlags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

/// Opaque per-request state the owning protocol attaches to a connection.
/// Dropped automatically when the connection is torn down
/// (`close_connection`), standing in for an arena allocator's "freed en
/// masse at connection teardown" semantics without requiring one.
pub type ProtocolData = Box<dyn std::any::Any>;

/// Represents one socket: listening, accepted, or outbound.
///
/// Addressed only by slot index from [`crate::pool::ConnectionPool`]; it
/// does not hold a pointer to its paired event records (see
/// `crate::event::EventRecord`'s doc comment on the cyclic-ownership
/// concern this avoids).
pub struct Connection {
    pub fd: i32,
    /// Bumped (wrapping) every time this slot transitions Free -> InUse;
    /// copied into both paired event records' `instance` field at that
    /// point. See `crate::token::Handle`.
    pub generation: u32,

    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,

    pub number: u64,
    pub start_time_ms: u64,
    pub requests: u64,
    pub sent: u64,

    pub flags: ConnFlags,
    pub log_error: LogErrorPolicy,

    pub data: Option<ProtocolData>,
    pub scratch: Option<Vec<u8>>,

    /// Position in the reusable LRU's intrusive doubly linked list, if
    /// `flags.contains(ConnFlags::REUSABLE)`.
    pub(crate) lru_prev: Option<usize>,
    pub(crate) lru_next: Option<usize>,
}

impl Connection {
    pub(crate) fn empty() -> Connection {
        Connection {
            fd: -1,
            generation: 0,
            peer_addr: None,
            local_addr: None,
            number: 0,
            start_time_ms: 0,
            requests: 0,
            sent: 0,
            flags: ConnFlags::empty(),
            log_error: LogErrorPolicy::default(),
            data: None,
            scratch: None,
            lru_prev: None,
            lru_next: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd != -1
    }

    pub fn elapsed(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.start_time_ms))
    }
}
