//! # Monotonic Clock
//!
//! A thin wrapper around `quanta::Instant` so the rest of the crate reasons
//! in monotonic microseconds rather than depending on `quanta` directly.
//! Per-platform time sourcing beyond this is a named external collaborator;
//! this is the consumed interface.

use quanta::Instant;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn zero() -> Self {
        Timestamp(0)
    }

    pub fn as_micros(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, d: Duration) -> Self {
        Timestamp(self.0 + d.as_micros() as u64)
    }
}

/// Monotonic clock. The instance is re-read once per dispatch; state
/// machines compute relative expiries ("now + ivl") from that single read
/// so drift within one dispatch doesn't cascade between timers.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp(self.epoch.elapsed().as_micros() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
