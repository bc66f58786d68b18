use crate::backend::ReadinessBackend;
use crate::connection::{ConnFlags, Connection};
use crate::event::EventRecord;

/// One connection slot plus its paired read/write event records, indexed
/// identically.
///
/// Keeping all three in one `Slot` rather than three parallel `Vec`s is the
/// same data, addressed the same way (by slot index), but avoids the
/// bookkeeping hazard of three independently-resizable vectors staying in
/// lock-step — the pool's capacity never changes after construction, so a
/// single `Vec<Slot<B>>` is both simpler and exactly as "parallel".
pub struct Slot<B: ReadinessBackend> {
    pub connection: Connection,
    pub read_event: EventRecord<B>,
    pub write_event: EventRecord<B>,
}

/// Fixed-size freelist of connection slots, plus an intrusive
/// reusable-connections LRU for graceful reclamation under pressure.
pub struct ConnectionPool<B: ReadinessBackend> {
    slots: Vec<Slot<B>>,
    free: Vec<u32>,
    reusable_head: Option<usize>,
    reusable_tail: Option<usize>,
    reusable_count: usize,
    next_number: u64,
}

impl<B: ReadinessBackend> ConnectionPool<B> {
    pub fn new(capacity: usize) -> ConnectionPool<B> {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                connection: Connection::empty(),
                read_event: EventRecord::new(),
                write_event: EventRecord::new(),
            });
            free.push(i as u32);
        }
        // Pop from the back, so slot 0 is handed out first.
        free.reverse();
        ConnectionPool {
            slots,
            free,
            reusable_head: None,
            reusable_tail: None,
            reusable_count: 0,
            next_number: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn reusable_count(&self) -> usize {
        self.reusable_count
    }

    pub fn connection(&self, idx: usize) -> &Connection {
        &self.slots[idx].connection
    }

    pub fn connection_mut(&mut self, idx: usize) -> &mut Connection {
        &mut self.slots[idx].connection
    }

    pub fn read_event(&self, idx: usize) -> &EventRecord<B> {
        &self.slots[idx].read_event
    }

    pub fn read_event_mut(&mut self, idx: usize) -> &mut EventRecord<B> {
        &mut self.slots[idx].read_event
    }

    pub fn write_event(&self, idx: usize) -> &EventRecord<B> {
        &self.slots[idx].write_event
    }

    pub fn write_event_mut(&mut self, idx: usize) -> &mut EventRecord<B> {
        &mut self.slots[idx].write_event
    }

    /// Pop the head of the freelist, if any. Does not touch the slot's
    /// contents; callers must re-initialize via [`Self::activate`].
    pub fn pop_free(&mut self) -> Option<usize> {
        self.free.pop().map(|i| i as usize)
    }

    /// `free_connection(c)`: push `c` onto the freelist head. Does not
    /// clear `fd` — the caller (`close_connection`) is responsible for
    /// that; the reactor's stale-event path only checks for `fd == -1`.
    pub fn push_free(&mut self, idx: usize) {
        debug_assert!(!self.is_reusable(idx), "freeing a connection still on the reusable LRU");
        self.free.push(idx as u32);
    }

    /// `get_connection`'s allocation half once a free slot is in hand:
    /// bump the slot's generation, reset both event records (dropping
    /// whatever handlers the prior incarnation installed), set the fd and
    /// default log-error policy, and assign the next monotonic `number`.
    pub fn activate(&mut self, idx: usize, fd: i32, start_time_ms: u64) {
        self.next_number += 1;
        let number = self.next_number;

        let slot = &mut self.slots[idx];
        slot.connection.generation = slot.connection.generation.wrapping_add(1);
        let generation = slot.connection.generation;

        slot.connection.fd = fd;
        slot.connection.peer_addr = None;
        slot.connection.local_addr = None;
        slot.connection.number = number;
        slot.connection.start_time_ms = start_time_ms;
        slot.connection.requests = 0;
        slot.connection.sent = 0;
        slot.connection.flags = ConnFlags::empty();
        slot.connection.log_error = Default::default();
        slot.connection.data = None;
        slot.connection.scratch = None;
        slot.connection.lru_prev = None;
        slot.connection.lru_next = None;

        slot.read_event = EventRecord::new();
        slot.read_event.instance = generation;
        slot.write_event = EventRecord::new();
        slot.write_event.instance = generation;
    }

    fn is_reusable(&self, idx: usize) -> bool {
        self.slots[idx].connection.flags.contains(ConnFlags::REUSABLE)
    }

    /// `reusable(c, on)`: toggle LRU membership. Pushing links at the
    /// head (most-recently-made-reusable); reclamation pops from the
    /// tail (least-recently-made-reusable), matching an LRU eviction
    /// order.
    pub fn set_reusable(&mut self, idx: usize, on: bool) {
        let already = self.is_reusable(idx);
        if on == already {
            return;
        }
        if on {
            self.slots[idx].connection.flags.insert(ConnFlags::REUSABLE);
            self.lru_push_front(idx);
        } else {
            self.slots[idx].connection.flags.remove(ConnFlags::REUSABLE);
            self.lru_unlink(idx);
        }
    }

    fn lru_push_front(&mut self, idx: usize) {
        self.slots[idx].connection.lru_prev = None;
        self.slots[idx].connection.lru_next = self.reusable_head;
        if let Some(head) = self.reusable_head {
            self.slots[head].connection.lru_prev = Some(idx);
        }
        self.reusable_head = Some(idx);
        if self.reusable_tail.is_none() {
            self.reusable_tail = Some(idx);
        }
        self.reusable_count += 1;
    }

    fn lru_unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let c = &self.slots[idx].connection;
            (c.lru_prev, c.lru_next)
        };
        match prev {
            Some(p) => self.slots[p].connection.lru_next = next,
            None => self.reusable_head = next,
        }
        match next {
            Some(n) => self.slots[n].connection.lru_prev = prev,
            None => self.reusable_tail = prev,
        }
        self.slots[idx].connection.lru_prev = None;
        self.slots[idx].connection.lru_next = None;
        self.reusable_count -= 1;
    }

    /// Pop the least-recently-made-reusable connection's slot index, for
    /// `get_connection`'s reclamation pass. The caller is responsible for
    /// invoking the holder's read handler with the close hint and for
    /// actually tearing the connection down; this only removes it from
    /// the LRU bookkeeping.
    pub fn reusable_pop_tail(&mut self) -> Option<usize> {
        let idx = self.reusable_tail?;
        self.lru_unlink(idx);
        self.slots[idx].connection.flags.remove(ConnFlags::REUSABLE);
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::epoll::Epoll;

    #[test]
    fn alloc_then_free_conserves_free_count() {
        let mut pool: ConnectionPool<Epoll> = ConnectionPool::new(4);
        assert_eq!(pool.free_count(), 4);

        let idx = pool.pop_free().unwrap();
        pool.activate(idx, 10, 0);
        assert_eq!(pool.free_count(), 3);

        pool.connection_mut(idx).fd = -1;
        pool.push_free(idx);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn repeated_alloc_free_cycles_are_stable() {
        let mut pool: ConnectionPool<Epoll> = ConnectionPool::new(8);
        for i in 0..100_000u64 {
            let idx = pool.pop_free().expect("pool should never run dry in this test");
            pool.activate(idx, 3, i);
            assert!(pool.connection(idx).generation >= 1);
            pool.connection_mut(idx).fd = -1;
            pool.push_free(idx);
        }
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn generation_bumps_on_every_allocation() {
        let mut pool: ConnectionPool<Epoll> = ConnectionPool::new(1);
        let idx = pool.pop_free().unwrap();
        pool.activate(idx, 1, 0);
        let g1 = pool.connection(idx).generation;
        pool.push_free(idx);

        let idx2 = pool.pop_free().unwrap();
        assert_eq!(idx2, idx);
        pool.activate(idx2, 2, 0);
        let g2 = pool.connection(idx2).generation;
        assert_ne!(g1, g2);
    }

    #[test]
    fn reusable_lru_evicts_tail_first() {
        let mut pool: ConnectionPool<Epoll> = ConnectionPool::new(4);
        let a = pool.pop_free().unwrap();
        pool.activate(a, 1, 0);
        let b = pool.pop_free().unwrap();
        pool.activate(b, 2, 0);
        let c = pool.pop_free().unwrap();
        pool.activate(c, 3, 0);

        pool.set_reusable(a, true);
        pool.set_reusable(b, true);
        pool.set_reusable(c, true);
        assert_eq!(pool.reusable_count(), 3);

        // a was made reusable first, so it's the LRU tail.
        assert_eq!(pool.reusable_pop_tail(), Some(a));
        assert_eq!(pool.reusable_pop_tail(), Some(b));
        assert_eq!(pool.reusable_pop_tail(), Some(c));
        assert_eq!(pool.reusable_pop_tail(), None);
    }
}
