use std::collections::BTreeMap;

use crate::event::{Direction, EventFlags};

/// Ordered map of deadline (milliseconds since an arbitrary monotonic
/// epoch) to the event it belongs to, supporting O(log n) insert, delete
/// by key, and O(log n) find-min.
///
/// Keyed by `(deadline_ms, sequence)` rather than `deadline_ms` alone so
/// duplicate deadlines are permitted without clobbering each other in the
/// `BTreeMap` — tie-break order between equal deadlines is just insertion
/// order; any event whose deadline has passed is an acceptable pick.
pub struct TimerIndex {
    entries: BTreeMap<(u64, u64), (usize, Direction)>,
    next_seq: u64,
}

pub type TimerKey = (u64, u64);

impl TimerIndex {
    pub fn new() -> TimerIndex {
        TimerIndex {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `add_timer(ev, ms)`: arm a deadline of `now_ms + delay_ms` for the
    /// event at `(slot, dir)`. If the event already carries a timer whose
    /// deadline is within `hysteresis_ms` of the new one, does nothing —
    /// trading timer accuracy for insert churn. The window is a
    /// configurable tunable, `ReactorConfig::timer_reinsert_hysteresis`,
    /// rather than a hardcoded constant.
    pub fn add_timer(
        &mut self,
        flags: &mut EventFlags,
        timer_key: &mut Option<TimerKey>,
        slot: usize,
        dir: Direction,
        now_ms: u64,
        delay_ms: u64,
        hysteresis_ms: u64,
    ) {
        let new_deadline = now_ms + delay_ms;

        if flags.contains(EventFlags::TIMER_SET) {
            if let Some((old_deadline, _)) = *timer_key {
                if old_deadline.abs_diff(new_deadline) <= hysteresis_ms {
                    return;
                }
            }
            self.del_timer(flags, timer_key);
        }

        let key = (new_deadline, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, (slot, dir));
        *timer_key = Some(key);
        flags.insert(EventFlags::TIMER_SET);
        flags.remove(EventFlags::TIMEDOUT);
    }

    /// `del_timer(ev)`: unlink, clear `timer_set`. A no-op if no timer is
    /// set (cancellation of an already-cancelled or already-fired timer is
    /// not an error).
    pub fn del_timer(&mut self, flags: &mut EventFlags, timer_key: &mut Option<TimerKey>) {
        if let Some(key) = timer_key.take() {
            self.entries.remove(&key);
        }
        flags.remove(EventFlags::TIMER_SET);
    }

    /// `find_timer()`: milliseconds to wait until the next deadline, or
    /// `None` for "no timers, wait forever".
    pub fn find_timer(&self, now_ms: u64) -> Option<u64> {
        self.entries
            .keys()
            .next()
            .map(|&(deadline, _)| deadline.saturating_sub(now_ms))
    }

    /// `expire_timers()`'s extraction half: repeatedly take the minimum
    /// key while it's `<= now_ms`, removing each from the index. Returns
    /// the `(slot, dir)` pairs so the caller (which alone has access to
    /// the owning `ConnectionPool` and its handlers) can clear flags and
    /// invoke handlers. Extracting before invoking means a handler that
    /// re-arms itself during its own callback is safe — it's no longer in
    /// the map when the handler runs.
    pub fn pop_expired(&mut self, now_ms: u64) -> Vec<(TimerKey, usize, Direction)> {
        let mut expired = Vec::new();
        loop {
            let due = match self.entries.keys().next() {
                Some(&key) if key.0 <= now_ms => key,
                _ => break,
            };
            let (slot, dir) = self.entries.remove(&due).expect("key just observed present");
            expired.push((due, slot, dir));
        }
        expired
    }

    /// Iterate over the `(slot, dir)` pairs of every timer still armed, for
    /// `no_timers_left`'s cancelable check.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Direction)> + '_ {
        self.entries.values().copied()
    }
}

impl Default for TimerIndex {
    fn default() -> TimerIndex {
        TimerIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_with_timer() -> (EventFlags, Option<TimerKey>) {
        (EventFlags::empty(), None)
    }

    #[test]
    fn find_timer_is_infinite_when_empty() {
        let idx = TimerIndex::new();
        assert_eq!(idx.find_timer(1_000), None);
    }

    #[test]
    fn insert_then_find_min_matches_remaining_time() {
        let mut idx = TimerIndex::new();
        let (mut flags, mut key) = flags_with_timer();
        idx.add_timer(&mut flags, &mut key, 0, Direction::Read, 1_000, 50, 300);
        assert!(flags.contains(EventFlags::TIMER_SET));
        assert_eq!(idx.find_timer(1_000), Some(50));
        assert_eq!(idx.find_timer(1_040), Some(10));
        assert_eq!(idx.find_timer(1_060), Some(0));
    }

    #[test]
    fn hysteresis_suppresses_reinsert_within_window() {
        let mut idx = TimerIndex::new();
        let (mut flags, mut key) = flags_with_timer();
        idx.add_timer(&mut flags, &mut key, 0, Direction::Read, 1_000, 1_000, 300);
        let first_key = key;
        // New deadline is 1_900 + 150 = ... within 300ms of 2_000, so this
        // should be a no-op, not a delete+reinsert.
        idx.add_timer(&mut flags, &mut key, 0, Direction::Read, 1_900, 150, 300);
        assert_eq!(key, first_key);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn outside_hysteresis_reinserts() {
        let mut idx = TimerIndex::new();
        let (mut flags, mut key) = flags_with_timer();
        idx.add_timer(&mut flags, &mut key, 0, Direction::Read, 1_000, 1_000, 300);
        let first_key = key;
        idx.add_timer(&mut flags, &mut key, 0, Direction::Read, 1_000, 5_000, 300);
        assert_ne!(key, first_key);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn expire_timers_removes_due_entries_and_sets_timedout() {
        let mut idx = TimerIndex::new();
        let (mut a_flags, mut a_key) = flags_with_timer();
        let (mut b_flags, mut b_key) = flags_with_timer();
        idx.add_timer(&mut a_flags, &mut a_key, 0, Direction::Read, 0, 10, 300);
        idx.add_timer(&mut b_flags, &mut b_key, 1, Direction::Write, 0, 1_000, 300);

        let expired = idx.pop_expired(50);
        assert_eq!(expired.len(), 1);
        assert_eq!((expired[0].1, expired[0].2), (0, Direction::Read));
        assert_eq!(idx.len(), 1);

        // Deadlines remaining in the index are all > now.
        assert!(idx.find_timer(50).unwrap() > 0);
    }

    #[test]
    fn del_timer_clears_flag_and_removes_entry() {
        let mut idx = TimerIndex::new();
        let (mut flags, mut key) = flags_with_timer();
        idx.add_timer(&mut flags, &mut key, 0, Direction::Read, 0, 10, 300);
        idx.del_timer(&mut flags, &mut key);
        assert!(!flags.contains(EventFlags::TIMER_SET));
        assert!(key.is_none());
        assert!(idx.is_empty());
    }
}
