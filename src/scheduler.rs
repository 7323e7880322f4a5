//! Fixed-interval timers driven by the host tick.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Fires once per elapsed interval, carrying overshoot into the next one.
///
/// Firing subtracts the interval from the accumulator instead of resetting
/// it, so for deltas summing to `S` the timer fires `floor(S / interval)`
/// times and keeps `S mod interval`.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    interval: Duration,
    accumulated: Duration,
}

impl PeriodicTask {
    /// Create a timer with the given interval.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub fn new(interval: Duration) -> Self {
        assert!(!interval.is_zero(), "periodic interval must be non-zero");
        Self {
            interval,
            accumulated: Duration::ZERO,
        }
    }

    /// Create a timer with an interval in milliseconds.
    pub fn from_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// The firing interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time accumulated towards the next firing.
    pub fn accumulated(&self) -> Duration {
        self.accumulated
    }

    /// Advance by `elapsed` and return how many intervals completed.
    ///
    /// The count saturates at `u64::MAX`.
    pub fn tick(&mut self, elapsed: Duration) -> u64 {
        self.accumulated = self.accumulated.saturating_add(elapsed);
        if self.accumulated < self.interval {
            return 0;
        }

        let interval = self.interval.as_nanos();
        let total = self.accumulated.as_nanos();
        let remainder = total % interval;
        // remainder < interval, so the seconds part fits in u64
        self.accumulated = Duration::new(
            (remainder / NANOS_PER_SEC) as u64,
            (remainder % NANOS_PER_SEC) as u32,
        );
        u64::try_from(total / interval).unwrap_or(u64::MAX)
    }

    /// Advance by `elapsed`, calling `f` once per completed interval.
    pub fn tick_with(&mut self, elapsed: Duration, mut f: impl FnMut()) -> u64 {
        let fired = self.tick(elapsed);
        for _ in 0..fired {
            f();
        }
        fired
    }

    /// Discard accumulated time.
    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
    }
}
