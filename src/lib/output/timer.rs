//! A free-running software output clock, for running without playout
//! hardware.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::*;

use super::{OutputBeat, OutputDevice};
use crate::{capture::validate_mode, clock::timebase_to_duration, frame::VideoMode};

#[derive(Debug)]
struct Running {
    mode: VideoMode,
    start: Instant,
    period: Duration,
    beat: u64,
    preroll_left: u32,
}

#[derive(Debug)]
pub struct TimerOutput {
    preroll_beats: u32,
    running: Option<Running>,
}

impl TimerOutput {
    pub fn new(preroll_beats: u32) -> Self {
        Self {
            preroll_beats,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

/// Whole beats missed when waking up `lateness` after a deadline.
pub fn late_beats(lateness: Duration, period: Duration) -> u32 {
    if period.is_zero() {
        return 0;
    }
    (lateness.as_nanos() / period.as_nanos()) as u32
}

/// When beat number `beat` is due, counted from `start`.
pub fn beat_deadline(start: Instant, period: Duration, beat: u64) -> Instant {
    let nanos = period.as_nanos() * beat as u128;
    start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

impl OutputDevice for TimerOutput {
    fn pick_video_mode(&self, desired: &VideoMode) -> VideoMode {
        match validate_mode(desired) {
            Ok(()) => *desired,
            Err(_) => VideoMode::default(),
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn start_output(&mut self, mode: VideoMode, base_pts: i64) -> Result<()> {
        validate_mode(&mode).context("Failed starting software output")?;

        info!("Starting software output clock at {mode}");
        self.running = Some(Running {
            mode,
            start: Instant::now(),
            period: timebase_to_duration(mode.frame_duration()),
            beat: 0,
            preroll_left: self.preroll_beats,
        });
        Ok(())
    }

    fn end_output(&mut self) {
        if self.running.take().is_some() {
            info!("Software output clock stopped");
        }
    }

    fn wait_for_frame(&mut self, _pts: i64) -> OutputBeat {
        let running = self.running.get_or_insert_with(|| {
            error!("Software output clock used before being started");
            let mode = VideoMode::default();
            Running {
                mode,
                start: Instant::now(),
                period: timebase_to_duration(mode.frame_duration()),
                beat: 0,
                preroll_left: 0,
            }
        });
        let frame_duration = running.mode.frame_duration();

        if running.preroll_left > 0 {
            running.preroll_left -= 1;
            return OutputBeat {
                dropped_frames: 0,
                frame_duration,
                is_preroll: true,
                timestamp: Instant::now(),
            };
        }

        running.beat += 1;
        let deadline = beat_deadline(running.start, running.period, running.beat);
        let now = Instant::now();
        if now < deadline {
            std::thread::sleep(deadline - now);
        }

        let timestamp = Instant::now();
        let dropped_frames = late_beats(timestamp.saturating_duration_since(deadline), running.period);
        if dropped_frames > 0 {
            debug!("Software output clock woke up late, dropping {dropped_frames} beat(s)");
            running.beat += dropped_frames as u64;
        }

        OutputBeat {
            dropped_frames,
            frame_duration,
            is_preroll: false,
            timestamp,
        }
    }

    fn description(&self) -> String {
        match &self.running {
            Some(running) => format!("software clock {}", running.mode),
            None => "software clock (stopped)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_beats_counts_whole_periods() {
        let period = Duration::from_millis(20);
        assert_eq!(late_beats(Duration::ZERO, period), 0);
        assert_eq!(late_beats(Duration::from_millis(19), period), 0);
        assert_eq!(late_beats(Duration::from_millis(20), period), 1);
        assert_eq!(late_beats(Duration::from_millis(65), period), 3);
        assert_eq!(late_beats(Duration::from_millis(65), Duration::ZERO), 0);
    }

    #[test]
    fn deadlines_keep_counting_past_u32_beats() {
        let start = Instant::now();
        let period = Duration::from_millis(20);
        assert_eq!(beat_deadline(start, period, 0), start);
        assert_eq!(beat_deadline(start, period, 3), start + Duration::from_millis(60));

        let beat = (1u64 << 32) + 1;
        assert_eq!(
            beat_deadline(start, period, beat),
            start + Duration::from_millis(20 * beat)
        );
    }

    #[test]
    fn preroll_beats_come_first_and_do_not_wait() {
        let mut output = TimerOutput::new(2);
        output.start_output(VideoMode::new(8, 8, 50, 1), 0).unwrap();

        let start = Instant::now();
        assert!(output.wait_for_frame(0).is_preroll);
        assert!(output.wait_for_frame(0).is_preroll);
        assert!(start.elapsed() < Duration::from_millis(20));

        let beat = output.wait_for_frame(0);
        assert!(!beat.is_preroll);
        assert_eq!(beat.frame_duration, 2400);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn oversleeping_reports_dropped_beats() {
        let mut output = TimerOutput::new(0);
        output.start_output(VideoMode::new(8, 8, 100, 1), 0).unwrap();
        output.wait_for_frame(0);

        std::thread::sleep(Duration::from_millis(55));
        let beat = output.wait_for_frame(0);
        assert!(beat.dropped_frames >= 3, "dropped {}", beat.dropped_frames);

        // Back on schedule afterwards.
        let beat = output.wait_for_frame(0);
        assert!(beat.dropped_frames <= 1);
    }

    #[test]
    fn invalid_mode_does_not_start() {
        let mut output = TimerOutput::new(0);
        assert!(output.start_output(VideoMode::new(8, 8, 0, 1), 0).is_err());
        assert!(!output.is_running());
        assert_eq!(
            output.pick_video_mode(&VideoMode::new(8, 8, 0, 1)),
            VideoMode::default()
        );
    }
}
