//! Monotonic instants used for timer ordering and duration arithmetic.
//!
//! Never expose wall-clock time through this type; it exists purely so the
//! reactor's timer heap can be written against something whose `Ord` is
//! unaffected by system clock adjustments.

use std::time::{Duration, Instant as StdInstant};

/// A nanosecond-resolution instant, ordered only relative to other
/// `Instant`s produced by the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(StdInstant);

impl Instant {
    pub fn now() -> Self {
        Instant(StdInstant::now())
    }

    pub fn checked_add(self, dur: Duration) -> Option<Self> {
        self.0.checked_add(dur).map(Instant)
    }

    /// Saturating duration until `self`, or `Duration::ZERO` if `self` is
    /// already in the past.
    pub fn duration_until(self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now.0)
    }

    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs)
    }
}
