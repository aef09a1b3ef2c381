//! Priority-ordered event queue with deterministic tie-breaking.
//!
//! Events fire in `(time, priority, insertion id)` order: strictly earlier
//! times first, then lower priority values, then first-scheduled-first.
//! The insertion id makes results bit-reproducible across runs even when
//! several events resolve to the same simulated instant.
//!
//! Cancellation is lazy: `unschedule` marks the handle and the entry is
//! dropped when it reaches the head of the queue. Any cleanup performed
//! before the cancel stays; a handle that already fired is ignored.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use super::event::SimEvent;

/// Handle to a scheduled event, used to cancel it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

#[derive(Debug)]
struct Queued {
    time: f64,
    priority: i32,
    seq: u64,
    event: SimEvent,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// The simulation clock and pending-event queue.
///
/// `now` is monotonic non-decreasing: it only advances when an event is
/// popped, to that event's time. Scheduling into the past is a programming
/// error and halts the simulation.
pub struct Scheduler {
    queue: BinaryHeap<Reverse<Queued>>,
    cancelled: HashSet<u64>,
    now: f64,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            queue: BinaryHeap::new(),
            cancelled: HashSet::new(),
            now: 0.0,
            next_seq: 0,
        }
    }

    /// Current simulation time in seconds.
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Schedule `event` at `time` with default priority 0.
    pub fn schedule(&mut self, time: f64, event: SimEvent) -> EventHandle {
        self.schedule_with_priority(time, 0, event)
    }

    /// Schedule `event` at `time`; lower `priority` values fire first among
    /// events with equal time.
    ///
    /// # Panics
    ///
    /// Panics if `time` is in the past (`time < now`).
    pub fn schedule_with_priority(
        &mut self,
        time: f64,
        priority: i32,
        event: SimEvent,
    ) -> EventHandle {
        assert!(
            time >= self.now,
            "cannot schedule event in the past: {time} < {}",
            self.now
        );
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Queued {
            time,
            priority,
            seq,
            event,
        }));
        EventHandle(seq)
    }

    /// Cancel a pending event. The entry stays in the queue and is
    /// discarded when popped; cancelling an already-fired handle is a no-op.
    pub fn unschedule(&mut self, handle: EventHandle) {
        self.cancelled.insert(handle.0);
    }

    /// Pop the next non-cancelled event with `time <= t_end`, advancing the
    /// clock to its time. Returns `None` when the queue is empty or the
    /// next live event lies beyond `t_end`.
    pub fn pop_due(&mut self, t_end: f64) -> Option<SimEvent> {
        loop {
            let head = self.queue.peek()?;
            if self.cancelled.remove(&head.0.seq) {
                self.queue.pop();
                continue;
            }
            if head.0.time > t_end {
                return None;
            }
            let Reverse(entry) = self.queue.pop().expect("peeked entry present");
            self.now = entry.time;
            return Some(entry.event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.iter().all(|e| self.cancelled.contains(&e.0.seq))
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::event::SimEvent;

    fn marker(node: usize) -> SimEvent {
        SimEvent::MacTrySendNext { node }
    }

    fn popped_node(ev: SimEvent) -> usize {
        match ev {
            SimEvent::MacTrySendNext { node } => node,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_fire_in_time_order() {
        let mut s = Scheduler::new();
        s.schedule(3.0, marker(3));
        s.schedule(1.0, marker(1));
        s.schedule(2.0, marker(2));

        assert_eq!(popped_node(s.pop_due(10.0).unwrap()), 1);
        assert_eq!(s.now(), 1.0);
        assert_eq!(popped_node(s.pop_due(10.0).unwrap()), 2);
        assert_eq!(popped_node(s.pop_due(10.0).unwrap()), 3);
        assert!(s.pop_due(10.0).is_none());
    }

    #[test]
    fn equal_times_break_ties_by_priority_then_insertion() {
        let mut s = Scheduler::new();
        s.schedule_with_priority(5.0, 1, marker(10));
        s.schedule_with_priority(5.0, 0, marker(20));
        s.schedule_with_priority(5.0, 1, marker(30));

        assert_eq!(popped_node(s.pop_due(10.0).unwrap()), 20);
        // same (time, priority): first scheduled fires first
        assert_eq!(popped_node(s.pop_due(10.0).unwrap()), 10);
        assert_eq!(popped_node(s.pop_due(10.0).unwrap()), 30);
    }

    #[test]
    fn cancelled_event_never_fires() {
        let mut s = Scheduler::new();
        let h = s.schedule(1.0, marker(1));
        s.schedule(2.0, marker(2));
        s.unschedule(h);

        assert_eq!(popped_node(s.pop_due(10.0).unwrap()), 2);
        assert!(s.pop_due(10.0).is_none());
    }

    #[test]
    fn pop_due_respects_horizon() {
        let mut s = Scheduler::new();
        s.schedule(1.0, marker(1));
        s.schedule(7.5, marker(2));

        assert!(s.pop_due(5.0).is_some());
        assert!(s.pop_due(5.0).is_none());
        // the late event is still queued and fires once the horizon moves
        assert_eq!(popped_node(s.pop_due(8.0).unwrap()), 2);
    }

    #[test]
    #[should_panic(expected = "cannot schedule event in the past")]
    fn scheduling_in_the_past_panics() {
        let mut s = Scheduler::new();
        s.schedule(5.0, marker(1));
        s.pop_due(10.0);
        s.schedule(1.0, marker(2));
    }
}
