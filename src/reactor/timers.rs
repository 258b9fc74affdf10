//! Ordered timer heap keyed on expiry (spec §3 "Timer record", §4.1 step 4).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crate::reactor::Reactor;
use crate::time::Instant;

/// Opaque handle returned by [`crate::reactor::Reactor::start_timer`].
///
/// Dropping a `TimerId` does not cancel the timer; call
/// [`crate::reactor::Reactor::stop_timer`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type TimerCallback = Box<dyn FnOnce(&mut Reactor)>;

#[derive(Default)]
pub(crate) struct TimerQueue {
    next_id: u64,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    // A timer present in `heap` but absent from `live` has been cancelled.
    live: HashMap<TimerId, TimerCallback>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            next_id: 0,
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    pub(crate) fn start(&mut self, now: Instant, delay: Duration, cb: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let expiry = now.checked_add(delay).unwrap_or(now);
        self.heap.push(Reverse((expiry, id)));
        self.live.insert(id, cb);
        id
    }

    /// Returns `true` if a live timer with this id was cancelled.
    pub(crate) fn stop(&mut self, id: TimerId) -> bool {
        self.live.remove(&id).is_some()
    }

    /// Delay until the next live timer's expiry, or `None` if the queue is
    /// effectively empty (only cancelled entries remain, or it is empty).
    pub(crate) fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        self.drop_cancelled_heads();
        self.heap.peek().map(|Reverse((expiry, _))| expiry.duration_until(now))
    }

    fn drop_cancelled_heads(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Pops and returns every timer callback whose expiry is `<= now`, in
    /// expiry order, skipping cancelled entries.
    pub(crate) fn expire_due(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        loop {
            match self.heap.peek() {
                Some(Reverse((expiry, _))) if *expiry <= now => {
                    let Reverse((_, id)) = self.heap.pop().unwrap();
                    if let Some(cb) = self.live.remove(&id) {
                        due.push(cb);
                    }
                }
                _ => break,
            }
        }
        due
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
