//! Decides how many buffered frames a non-master source may keep.

use std::time::{Duration, Instant};

use crate::clock::timebase_to_seconds;

/// How many master ticks ahead we assume a slower input keeps draining.
const DRAIN_LOOKAHEAD_FRAMES: f64 = 5.0;

#[derive(Debug, Clone, Default)]
pub struct QueueLengthPolicy {
    safe_queue_length: usize,
}

impl QueueLengthPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.safe_queue_length = 0;
    }

    /// Recomputes the safe queue length.
    ///
    /// We figure out when the next input frame can be expected assuming it is
    /// maximally late, and count how many master ticks may happen before
    /// then, assuming the master ticks as early as its jitter allows.
    pub fn update_policy(
        &mut self,
        now: Instant,
        expected_next_input_frame: Instant,
        input_frame_duration: i64,
        master_frame_duration: i64,
        max_input_jitter: Duration,
        max_master_jitter: Duration,
    ) -> usize {
        let input_frame_duration_seconds = timebase_to_seconds(input_frame_duration);
        let master_frame_duration_seconds = timebase_to_seconds(master_frame_duration);

        let until_next = if expected_next_input_frame >= now {
            (expected_next_input_frame - now).as_secs_f64()
        } else {
            -(now - expected_next_input_frame).as_secs_f64()
        };
        let seconds_until_next_frame = (until_next + max_input_jitter.as_secs_f64()).max(0.0);

        let frames_needed = (seconds_until_next_frame + max_master_jitter.as_secs_f64())
            / master_frame_duration_seconds;

        // A faster master drains the queue on its own, but for close rates
        // (60 vs 59.94) too slowly to matter per tick, so look a few ticks
        // ahead instead.
        let frames_allowed = if master_frame_duration < input_frame_duration {
            frames_needed
                + DRAIN_LOOKAHEAD_FRAMES
                    * (input_frame_duration_seconds - master_frame_duration_seconds)
                    / master_frame_duration_seconds
        } else {
            frames_needed
        };

        self.safe_queue_length = frames_allowed.floor().max(0.0) as usize;
        self.safe_queue_length
    }

    pub fn get_safe_queue_length(&self) -> usize {
        self.safe_queue_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::timebase_to_duration;

    #[test]
    fn safe_length_counts_master_ticks_until_next_input() {
        let now = Instant::now();
        let mut policy = QueueLengthPolicy::new();
        // The next input frame is 2.4 master ticks away.
        let safe = policy.update_policy(
            now,
            now + Duration::from_millis(40),
            2000,
            2000,
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(safe, 2);

        let safe = policy.update_policy(
            now,
            now - Duration::from_millis(50),
            2000,
            2000,
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(safe, 0);
        assert_eq!(policy.get_safe_queue_length(), 0);
    }

    #[test]
    fn jitter_widens_the_margin() {
        let now = Instant::now();
        let mut policy = QueueLengthPolicy::new();
        let frame = timebase_to_duration(2000);
        let without = policy.update_policy(
            now,
            now + frame / 2,
            2000,
            2000,
            Duration::ZERO,
            Duration::ZERO,
        );
        let with = policy.update_policy(
            now,
            now + frame / 2,
            2000,
            2000,
            frame,
            frame,
        );
        assert_eq!(without, 0);
        assert_eq!(with, 2);
    }

    #[test]
    fn faster_master_self_drains() {
        // Master ticks 10% faster than the input, no jitter at all.
        let master = 2000;
        let input = 2200;
        let input_step = timebase_to_duration(input);
        let master_step = timebase_to_duration(master);

        let start = Instant::now();
        let mut policy = QueueLengthPolicy::new();
        let mut last_input_arrival = start;
        let mut now = start;
        let mut seen_zero_at = None;

        for tick in 0..200 {
            now += master_step;
            while last_input_arrival + input_step <= now {
                last_input_arrival += input_step;
            }
            let safe = policy.update_policy(
                now,
                last_input_arrival + input_step,
                input,
                master,
                Duration::ZERO,
                Duration::ZERO,
            );
            assert!(safe <= 1, "tick {tick}: safe length {safe}");
            if safe == 0 && seen_zero_at.is_none() {
                seen_zero_at = Some(tick);
            }
        }

        assert!(seen_zero_at.is_some_and(|tick| tick <= 11));
    }

    #[test]
    fn slower_master_gets_no_drain_margin() {
        let now = Instant::now();
        let mut policy = QueueLengthPolicy::new();
        let safe = policy.update_policy(
            now,
            now + timebase_to_duration(1000),
            1000,
            2400,
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(safe, 0);
    }
}
