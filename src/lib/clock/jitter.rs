//! Statistical model of frame-arrival jitter for one clock (an input source
//! or the output device).
//!
//! Every arrival is compared against the time we expected it, and the
//! absolute deviation goes into a bounded history. The estimate is a high
//! percentile of that history rather than its maximum, so a single outlier
//! does not inflate buffering for every following frame.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use super::timebase_to_duration;

/// Number of deviations kept.
pub const JITTER_HISTORY_LENGTH: usize = 5000;
/// Order statistic used for the estimate.
pub const JITTER_PERCENTILE: f64 = 0.999;
/// Safety factor applied on top of the percentile.
pub const JITTER_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    expected_next_frame: Option<Instant>,
    last_duration: i64,
    /// Deviations in arrival order, in nanoseconds.
    history: VecDeque<u64>,
    /// The same deviations, kept sorted for order-statistic lookup.
    orders: Vec<u64>,
    underestimated_frames: u64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything learned so far. Called whenever the nominal frame
    /// duration changes, since the old samples describe a different clock.
    pub fn clear(&mut self) {
        self.expected_next_frame = None;
        self.last_duration = 0;
        self.history.clear();
        self.orders.clear();
    }

    /// Registers an arrival at `now` of a frame lasting `duration` timebase
    /// units, preceded by `dropped_frames` frames that never showed up.
    pub fn frame_arrived(&mut self, now: Instant, duration: i64, dropped_frames: u32) {
        if duration != self.last_duration {
            self.clear();
        }

        let frame_duration = timebase_to_duration(duration);

        if let Some(expected) = self.expected_next_frame {
            let expected = expected + frame_duration * dropped_frames;
            let jitter = if expected > now {
                expected - now
            } else {
                now - expected
            };

            if jitter > self.estimate_max_jitter() {
                self.underestimated_frames += 1;
            }

            self.insert(jitter.as_nanos() as u64);
        }

        self.expected_next_frame = Some(now + frame_duration);
        self.last_duration = duration;
    }

    /// Conservative bound on how late the next frame may be. Zero until at
    /// least one deviation has been recorded.
    pub fn estimate_max_jitter(&self) -> Duration {
        if self.orders.is_empty() {
            return Duration::ZERO;
        }

        let index = ((self.orders.len() - 1) as f64 * JITTER_PERCENTILE).round() as usize;
        Duration::from_nanos(self.orders[index]) * JITTER_MULTIPLIER
    }

    pub fn get_expected_next_frame(&self) -> Option<Instant> {
        self.expected_next_frame
    }

    /// Nominal duration of the last frame seen, in timebase units, or 0.
    pub fn last_duration(&self) -> i64 {
        self.last_duration
    }

    /// How many arrivals were later than the estimate at the time.
    pub fn underestimated_frames(&self) -> u64 {
        self.underestimated_frames
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }

    fn insert(&mut self, jitter_ns: u64) {
        let position = self.orders.partition_point(|&value| value < jitter_ns);
        self.orders.insert(position, jitter_ns);
        self.history.push_back(jitter_ns);

        if self.history.len() > JITTER_HISTORY_LENGTH {
            if let Some(oldest) = self.history.pop_front() {
                let position = self.orders.partition_point(|&value| value < oldest);
                assert_eq!(self.orders.get(position), Some(&oldest));
                self.orders.remove(position);
            }
        }

        assert!(self.history.len() <= JITTER_HISTORY_LENGTH);
        assert_eq!(self.history.len(), self.orders.len());
    }
}
