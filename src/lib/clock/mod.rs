pub mod jitter;
pub mod presentation;

use std::time::{Duration, Instant};

/// Integer timebase for all presentation timestamps and frame durations.
/// Divisible by 48000 and by the common NTSC rates.
pub const TIMEBASE: i64 = 120_000;

/// Sample rate of the mixed audio output.
pub const OUTPUT_SAMPLE_RATE: i64 = 48_000;

/// Converts a duration in [`TIMEBASE`] units to wall-clock time.
pub fn timebase_to_duration(ticks: i64) -> Duration {
    debug_assert!(ticks >= 0, "negative tick count: {ticks}");
    Duration::from_nanos((ticks.max(0) as u128 * 1_000_000_000 / TIMEBASE as u128) as u64)
}

/// Converts wall-clock time to [`TIMEBASE`] units, rounding down.
pub fn duration_to_timebase(duration: Duration) -> i64 {
    (duration.as_nanos() * TIMEBASE as u128 / 1_000_000_000) as i64
}

pub fn timebase_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / TIMEBASE as f64
}

/// Source of "now" for the scheduler. Real runs use [`MonotonicTime`];
/// simulations drive a manual clock.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicTime;

impl TimeSource for MonotonicTime {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualTime {
    now: parking_lot::Mutex<Instant>,
}

impl ManualTime {
    pub fn new(start: Instant) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    pub fn set(&self, now: Instant) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
