//! The cycle scheduler: a single sorted event queue advancing a 64-bit
//! tick counter.
//!
//! A [`Tick`] is one ARM7-equivalent half-cycle. The ARM9 runs at twice
//! that rate, so its local cycle counter is doubled before being compared
//! against a scheduler horizon (see [`crate::cpu::arm9`]).
//!
//! Unlike the teacher's per-CPU fixed "event slot" arrays, this scheduler
//! is the general min-heap the data model calls for: any component can
//! schedule an arbitrary number of outstanding events and cancel them by
//! handle. Ties at the same `fire_tick` resolve in insertion order, so a
//! DMA and a timer IRQ scheduled for the same tick fire in the order they
//! were queued.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u64);

impl Tick {
    #[inline]
    pub const fn checked_sub(self, rhs: Tick) -> Option<u64> {
        self.0.checked_sub(rhs.0)
    }
}

impl core::ops::Add<u64> for Tick {
    type Output = Tick;
    #[inline]
    fn add(self, rhs: u64) -> Tick {
        Tick(self.0 + rhs)
    }
}

impl core::ops::Sub<u64> for Tick {
    type Output = Tick;
    #[inline]
    fn sub(self, rhs: u64) -> Tick {
        Tick(self.0 - rhs)
    }
}

/// Opaque identity of a scheduled event, returned by [`Scheduler::schedule`]
/// and accepted by [`Scheduler::cancel`]. Cancellation is idempotent: an
/// already-fired or already-cancelled handle is simply ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

/// A caller-defined event kind plus the 32-bit parameter the original
/// scheduler caller attached to it, and the reload interval for events
/// that re-arm themselves (e.g. a timer overflow, a DMA repeat).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event<K> {
    pub kind: K,
    pub param: u32,
    pub reload: Option<u64>,
}

impl<K> Event<K> {
    #[inline]
    pub const fn new(kind: K) -> Self {
        Event {
            kind,
            param: 0,
            reload: None,
        }
    }

    #[inline]
    pub const fn with_param(mut self, param: u32) -> Self {
        self.param = param;
        self
    }

    #[inline]
    pub const fn with_reload(mut self, reload: u64) -> Self {
        self.reload = Some(reload);
        self
    }
}

struct Entry<K> {
    fire_tick: Tick,
    sequence: u64,
    handle: EventHandle,
    event: Event<K>,
}

impl<K> PartialEq for Entry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_tick == other.fire_tick && self.sequence == other.sequence
    }
}
impl<K> Eq for Entry<K> {}

impl<K> PartialOrd for Entry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Entry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert both fields so the earliest
        // fire_tick (and, on ties, the earliest insertion) pops first.
        other
            .fire_tick
            .cmp(&self.fire_tick)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Totally orders future events and advances simulated time.
pub struct Scheduler<K> {
    now: Tick,
    next_sequence: u64,
    next_handle: u64,
    heap: BinaryHeap<Entry<K>>,
    cancelled: HashSet<EventHandle>,
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Scheduler<K> {
    #[inline]
    pub fn new() -> Self {
        Scheduler {
            now: Tick(0),
            next_sequence: 0,
            next_handle: 0,
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
        }
    }

    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Inserts an event to fire at `fire_tick`. A `fire_tick` earlier than
    /// `now()` is permitted and fires on the very next `run_until` call
    /// ("zero-delay" peripherals rely on this).
    pub fn schedule(&mut self, fire_tick: Tick, event: Event<K>) -> EventHandle {
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Entry {
            fire_tick,
            sequence,
            handle,
            event,
        });
        handle
    }

    /// Idempotent: marks the entry dead, actually removed lazily on pop.
    pub fn cancel(&mut self, handle: EventHandle) {
        self.cancelled.insert(handle);
    }

    #[inline]
    pub fn next_fire_tick(&self) -> Option<Tick> {
        self.heap
            .iter()
            .filter(|e| !self.cancelled.contains(&e.handle))
            .map(|e| e.fire_tick)
            .min()
    }

    /// Pops the next live event due at or before `now`, advancing `now` to
    /// its `fire_tick`. Re-arms self-reloading events.
    pub fn pop_due(&mut self, horizon: Tick) -> Option<(Tick, Event<K>)>
    where
        K: Copy,
    {
        loop {
            let due = matches!(self.heap.peek(), Some(e) if e.fire_tick <= horizon);
            if !due {
                return None;
            }
            let entry = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.handle) {
                continue;
            }
            self.now = self.now.max(entry.fire_tick);
            if let Some(reload) = entry.event.reload {
                self.schedule(entry.fire_tick + reload, entry.event);
            }
            return Some((entry.fire_tick, entry.event));
        }
    }

    /// Advances `now` directly to `horizon` with no pending event in the
    /// way (used when the queue is empty or the next event is further out).
    pub fn advance_to(&mut self, horizon: Tick) {
        self.now = self.now.max(horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Kind {
        A,
        B,
    }

    #[test]
    fn fires_at_exact_tick() {
        let mut s: Scheduler<Kind> = Scheduler::new();
        s.schedule(Tick(100), Event::new(Kind::A));
        let (tick, ev) = s.pop_due(Tick(200)).unwrap();
        assert_eq!(tick, Tick(100));
        assert_eq!(s.now(), Tick(100));
        assert_eq!(ev.kind, Kind::A);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut s: Scheduler<Kind> = Scheduler::new();
        s.schedule(Tick(50), Event::new(Kind::A));
        s.schedule(Tick(50), Event::new(Kind::B));
        let (_, first) = s.pop_due(Tick(50)).unwrap();
        let (_, second) = s.pop_due(Tick(50)).unwrap();
        assert_eq!(first.kind, Kind::A);
        assert_eq!(second.kind, Kind::B);
    }

    #[test]
    fn cancel_before_horizon_never_fires() {
        let mut s: Scheduler<Kind> = Scheduler::new();
        let handle = s.schedule(Tick(100), Event::new(Kind::A));
        s.cancel(handle);
        assert!(s.pop_due(Tick(200)).is_none());
        s.advance_to(Tick(200));
        assert_eq!(s.now(), Tick(200));
    }

    #[test]
    fn zero_delay_fires_immediately() {
        let mut s: Scheduler<Kind> = Scheduler::new();
        s.advance_to(Tick(10));
        s.schedule(Tick(5), Event::new(Kind::A));
        assert!(s.pop_due(Tick(10)).is_some());
    }
}
