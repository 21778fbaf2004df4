use super::{OUTPUT_SAMPLE_RATE, TIMEBASE};

/// Tick counter for the mixed output, in [`TIMEBASE`] units.
///
/// Only the scheduler thread owns one of these.
#[derive(Debug, Default, Clone)]
pub struct PresentationClock {
    pts: i64,
    ticks: u64,
}

impl PresentationClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    /// Number of times the clock was advanced.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Moves the clock forward by `duration`. A non-positive duration would
    /// let a timestamp repeat, which downstream encoders cannot recover from.
    pub fn advance(&mut self, duration: i64) -> i64 {
        assert!(duration > 0, "presentation clock advanced by {duration}");
        self.pts += duration;
        self.ticks += 1;
        self.pts
    }
}

/// Converts tick durations into whole output sample counts while carrying
/// the fractional remainder, so that the total sample count never drifts
/// from wall-clock time.
#[derive(Debug, Default, Clone)]
pub struct SampleAccumulator {
    /// Remainder scaled by [`TIMEBASE`]; always in `0..TIMEBASE`.
    leftover: i64,
}

impl SampleAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of output samples covering the next `duration` timebase units.
    pub fn samples_for(&mut self, duration: i64) -> usize {
        assert!(duration >= 0);
        let samples_times_timebase = OUTPUT_SAMPLE_RATE * duration + self.leftover;
        let samples = samples_times_timebase / TIMEBASE;
        self.leftover = samples_times_timebase % TIMEBASE;
        debug_assert!((0..TIMEBASE).contains(&self.leftover));
        samples as usize
    }

    pub fn leftover(&self) -> i64 {
        self.leftover
    }
}
