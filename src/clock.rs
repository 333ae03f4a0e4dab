//! A [Lamport clock](https://en.wikipedia.org/wiki/Lamport_timestamp), which
//! provides the total order used to decide when a queued request is stable.
//!
//! Every process holds one clock and touches it on every message send and
//! every message receive. Both operations are lock-free compare-and-swap
//! loops, so the clock can be advanced from any task without participating in
//! the lock ordering of the rest of the system.

use std::sync::atomic::{AtomicU64, Ordering};

/// A per-process monotonic event counter with Lamport-style update on receive.
#[derive(Debug, Default)]
pub struct LogicalClock(AtomicU64);

impl LogicalClock {
    /// Instantiates a clock at zero.
    pub fn new() -> Self {
        LogicalClock(AtomicU64::new(0))
    }

    /// Stamps a local event: increments the clock and returns the new value.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Folds in a remote timestamp: advances the clock to
    /// `max(current, observed) + 1` and returns the new value.
    pub fn observe(&self, observed: u64) -> u64 {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let next = current.max(observed) + 1;
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the current value without advancing the clock.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
