//! Logical (Lamport) clock and adjustable physical clock

use crate::types::now_unix;
use std::sync::Mutex;
use tracing::info;

/// Lamport counter. Ticked on every send, merged on every receive.
///
/// All three operations run under one mutex, so for any set of concurrent
/// calls the returned values are distinct and strictly increasing.
#[derive(Debug, Default)]
pub struct LogicalClock {
    counter: Mutex<i64>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new value
    pub fn tick(&self) -> i64 {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        *counter
    }

    /// Fold in a clock received from another process:
    /// `max(local, received) + 1`
    pub fn merge(&self, received: i64) -> i64 {
        let mut counter = self.counter.lock().unwrap();
        if received > *counter {
            *counter = received;
        }
        *counter += 1;
        *counter
    }

    /// Current value, unchanged
    pub fn peek(&self) -> i64 {
        *self.counter.lock().unwrap()
    }
}

/// Wall time plus a signed offset maintained by Berkeley rounds.
///
/// There is no drift model; whatever the last round distributed is
/// authoritative until the next one.
#[derive(Debug, Default)]
pub struct PhysicalClock {
    offset: Mutex<i64>,
}

impl PhysicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjusted unix seconds
    pub fn now(&self) -> i64 {
        now_unix() + *self.offset.lock().unwrap()
    }

    /// Current offset in seconds
    pub fn offset(&self) -> i64 {
        *self.offset.lock().unwrap()
    }

    /// Add `delta` seconds to the offset
    pub fn adjust(&self, delta: i64) {
        let mut offset = self.offset.lock().unwrap();
        let old = *offset;
        *offset += delta;
        info!(delta, old_offset = old, new_offset = *offset, "physical clock adjusted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LogicalClock::new();
        let mut last = clock.peek();
        for _ in 0..100 {
            let next = clock.tick();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn merge_exceeds_both_inputs() {
        let clock = LogicalClock::new();
        clock.tick();
        clock.tick();
        let local = clock.peek();

        let merged = clock.merge(40);
        assert!(merged > 40);
        assert!(merged > local);

        // A stale remote clock must not move us backwards
        let merged = clock.merge(3);
        assert_eq!(merged, 42);
    }

    #[test]
    fn concurrent_ticks_cover_the_range() {
        let clock = Arc::new(LogicalClock::new());
        let before = clock.peek();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..250).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();

        let mut values: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        values.sort_unstable();

        let expected: Vec<i64> = (before + 1..=before + 2000).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn adjust_accumulates() {
        let clock = PhysicalClock::new();
        clock.adjust(10);
        clock.adjust(-3);
        assert_eq!(clock.offset(), 7);

        let wall = now_unix();
        let adjusted = clock.now();
        assert!((adjusted - wall - 7).abs() <= 1);
    }
}
