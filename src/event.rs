use crate::backend::ReadinessBackend;
use crate::reactor::Reactor;

/// One direction of interest on a connection: read XOR write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Boolean flags carried on an [`EventRecord`]. A hand-rolled bitset
/// rather than a `bitflags!`-crate type, in the style of `queen_io::Ready`
/// (`danclive-queen-io/src/ready.rs`): a newtype over an integer with
/// `const` flag values and the usual bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags(u16);

impl EventFlags {
    pub const ACTIVE: EventFlags = EventFlags(1 << 0);
    pub const READY: EventFlags = EventFlags(1 << 1);
    pub const TIMEDOUT: EventFlags = EventFlags(1 << 2);
    pub const TIMER_SET: EventFlags = EventFlags(1 << 3);
    pub const ERROR: EventFlags = EventFlags(1 << 4);
    pub const EOF: EventFlags = EventFlags(1 << 5);
    pub const PENDING_EOF: EventFlags = EventFlags(1 << 6);
    pub const ACCEPT: EventFlags = EventFlags(1 << 7);
    pub const WRITE: EventFlags = EventFlags(1 << 8);
    pub const POSTED: EventFlags = EventFlags(1 << 9);
    pub const CANCELABLE: EventFlags = EventFlags(1 << 10);
    pub const DEFERRED: EventFlags = EventFlags(1 << 11);
    pub const CLOSED: EventFlags = EventFlags(1 << 12);

    pub const fn empty() -> EventFlags {
        EventFlags(0)
    }

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EventFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: EventFlags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = EventFlags;
    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

/// Callback invoked when an event becomes ready or times out. Takes the
/// reactor (so the handler can re-arm itself, install timers, or close the
/// connection) and the slot index of the connection the event belongs to.
pub type HandlerFn<B> = Box<dyn FnMut(&mut Reactor<B>, usize)>;

/// Represents interest in one direction on one connection.
///
/// The event never holds a pointer back to its connection, avoiding the
/// cyclic ownership an event -> connection -> event arrangement would
/// create: it's addressed by slot index instead, and the slot arrays in
/// [`crate::pool::ConnectionPool`] are the sole owner of both.
pub struct EventRecord<B: ReadinessBackend> {
    pub flags: EventFlags,
    /// Generation bit copied from the owning connection's slot at
    /// allocation time (`Handle`'s redesign of the instance bit — see
    /// `crate::token`).
    pub instance: u32,
    /// Bytes readable/writable, or `-1` for unknown.
    pub available: i64,
    /// Key used to remove this event from the timer index in O(log n),
    /// `None` unless `TIMER_SET` is set.
    pub timer_key: Option<(u64, u64)>,
    /// Whether this event is currently linked into a deferred queue.
    pub queued: bool,
    pub handler: Option<HandlerFn<B>>,
}

impl<B: ReadinessBackend> EventRecord<B> {
    pub fn new() -> EventRecord<B> {
        EventRecord {
            flags: EventFlags::empty(),
            instance: 0,
            available: -1,
            timer_key: None,
            queued: false,
            handler: None,
        }
    }
}

impl<B: ReadinessBackend> Default for EventRecord<B> {
    fn default() -> Self {
        EventRecord::new()
    }
}
