//! Hybrid logical clock for ordering events within one store.
//!
//! Each put receives a tick strictly greater than every tick issued before it
//! by this store and strictly greater than the largest time among its
//! parents. Causal order always wins; concurrent events still get a total
//! order for stable iteration.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::event::LogicalTime;

/// Source of logical timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Issue a fresh tick greater than `reference` (the max parent time) and
    /// than every earlier tick.
    fn tick(&self, reference: Option<LogicalTime>) -> LogicalTime;

    /// Record that `time` is already in use so later ticks exceed it.
    fn observe(&self, time: LogicalTime);
}

/// Process-local counter clock, serialised by a mutex.
#[derive(Debug, Default)]
pub struct LogicalClock {
    /// Smallest value the next tick may take.
    next: Mutex<u64>,
}

impl LogicalClock {
    /// A fresh clock; its first tick without a reference is `0`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose next tick follows `last`.
    #[must_use]
    pub fn resume_after(last: LogicalTime) -> Self {
        Self {
            next: Mutex::new(last.next().get()),
        }
    }

    /// The value the next unreferenced tick would return.
    #[must_use]
    pub fn peek(&self) -> LogicalTime {
        LogicalTime::new(*self.next.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Clock for LogicalClock {
    fn tick(&self, reference: Option<LogicalTime>) -> LogicalTime {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let floor = reference.map_or(0, |t| t.next().get());
        let issued = (*next).max(floor);
        *next = issued.saturating_add(1);
        LogicalTime::new(issued)
    }

    fn observe(&self, time: LogicalTime) {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        *next = (*next).max(time.next().get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_tick_is_zero_and_ticks_increase() {
        let clock = LogicalClock::new();
        assert_eq!(clock.tick(None).get(), 0);
        assert_eq!(clock.tick(None).get(), 1);
        assert_eq!(clock.tick(None).get(), 2);
    }

    #[test]
    fn tick_exceeds_reference() {
        let clock = LogicalClock::new();
        let t = clock.tick(Some(LogicalTime::new(41)));
        assert_eq!(t.get(), 42);
        // Lower references never move the clock backwards.
        assert_eq!(clock.tick(Some(LogicalTime::new(3))).get(), 43);
    }

    #[test]
    fn observe_and_resume_skip_used_times() {
        let clock = LogicalClock::new();
        clock.observe(LogicalTime::new(10));
        assert_eq!(clock.peek().get(), 11);
        assert_eq!(clock.tick(None).get(), 11);
        clock.observe(LogicalTime::new(5));
        assert_eq!(clock.tick(None).get(), 12);

        let resumed = LogicalClock::resume_after(LogicalTime::new(7));
        assert_eq!(resumed.tick(None).get(), 8);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(LogicalClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..250).map(|_| clock.tick(None).get()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 2000);
    }
}
