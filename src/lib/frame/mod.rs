pub mod pool;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use serde::{Deserialize, Serialize};

use crate::clock::TIMEBASE;
use pool::FrameLease;

/// Bytes per pixel of the 8-bit 4:2:2 payloads every backend delivers.
pub const BYTES_PER_PIXEL: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    #[serde(default)]
    pub interlaced: bool,
}

impl VideoMode {
    pub const fn new(width: u32, height: u32, frame_rate_num: u32, frame_rate_den: u32) -> Self {
        Self {
            width,
            height,
            frame_rate_num,
            frame_rate_den,
            interlaced: false,
        }
    }

    /// Length of one frame (or field, if interlaced) in timebase units.
    pub fn frame_duration(&self) -> i64 {
        self.frame_rate_den as i64 * TIMEBASE / self.frame_rate_num.max(1) as i64
    }

    pub fn nominal_fps(&self) -> f64 {
        self.frame_rate_num as f64 / self.frame_rate_den.max(1) as f64
    }

    /// Expected payload length of one frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl Default for VideoMode {
    fn default() -> Self {
        // 720p59.94
        Self::new(1280, 720, 60000, 1001)
    }
}

impl std::fmt::Display for VideoMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}{}{:.2}",
            self.width,
            self.height,
            if self.interlaced { "i" } else { "p" },
            self.nominal_fps()
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl AudioFormat {
    /// Input samples (per channel) covering `duration` timebase units.
    pub fn samples_for(&self, duration: i64) -> usize {
        (self.sample_rate as i64 * duration / TIMEBASE) as usize
    }
}

/// A video payload as delivered by a backend. Zero length is the reserved
/// "corrupted" sentinel.
#[derive(Debug)]
pub struct VideoPayload {
    pub frame: Option<FrameLease>,
    pub mode: VideoMode,
}

impl VideoPayload {
    pub fn new(frame: FrameLease, mode: VideoMode) -> Self {
        Self {
            frame: Some(frame),
            mode,
        }
    }

    /// The corrupted sentinel. It still carries the mode, so the frame
    /// duration is known.
    pub fn corrupted(mode: VideoMode) -> Self {
        Self { frame: None, mode }
    }

    pub fn len(&self) -> usize {
        self.frame.as_ref().map(FrameLease::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero length, or a length that does not match the declared mode.
    pub fn is_corrupted(&self) -> bool {
        self.is_empty() || self.len() != self.mode.frame_size()
    }
}

/// Interleaved PCM that came along with one video frame.
#[derive(Debug, Clone, Default)]
pub struct AudioPayload {
    pub samples: Vec<f32>,
    pub format: AudioFormat,
}

impl AudioPayload {
    pub fn new(samples: Vec<f32>, format: AudioFormat) -> Self {
        Self { samples, format }
    }

    pub fn silence(format: AudioFormat, duration: i64) -> Self {
        Self {
            samples: vec![0.0; format.samples_for(duration) * format.channels as usize],
            format,
        }
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }
}

/// Everything a backend hands over in one frame callback.
#[derive(Debug)]
pub struct CapturedFrame {
    /// Wraps at 2^16, increments by one per frame while started.
    pub sequence: u16,
    pub video: VideoPayload,
    pub audio: AudioPayload,
    pub timestamp: Instant,
}

/// Result of comparing a frame's sequence number with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceGap {
    /// The first frame after a (re)start, or the next one in line.
    Contiguous,
    /// This many frames went missing right before this one.
    Dropped(u32),
    /// The sequence jumped too far to be a plausible drop.
    Discontinuity(i64),
}

impl SequenceGap {
    pub fn dropped_frames(&self) -> u32 {
        match self {
            SequenceGap::Dropped(count) => *count,
            _ => 0,
        }
    }
}

/// A frame waiting in a source queue, and later in its history ring.
#[derive(Debug)]
pub struct BufferedFrame {
    pub video: VideoPayload,
    pub audio: AudioPayload,
    pub gap: SequenceGap,
    pub received_timestamp: Instant,
    prepared: AtomicBool,
}

impl BufferedFrame {
    pub fn new(
        video: VideoPayload,
        audio: AudioPayload,
        gap: SequenceGap,
        received_timestamp: Instant,
    ) -> Self {
        Self {
            video,
            audio,
            gap,
            received_timestamp,
            prepared: AtomicBool::new(false),
        }
    }

    pub fn dropped_frames_before(&self) -> u32 {
        self.gap.dropped_frames()
    }

    /// Frames this entry stands for when measuring queue latency.
    pub fn queue_weight(&self) -> usize {
        1 + self.dropped_frames_before() as usize
    }

    pub fn duration(&self) -> i64 {
        self.video.mode.frame_duration()
    }

    pub fn is_corrupted(&self) -> bool {
        self.video.is_empty()
    }

    /// Marks the GPU-side resources as prepared. Returns true only for the
    /// first caller.
    pub fn mark_prepared(&self) -> bool {
        !self.prepared.swap(true, Ordering::AcqRel)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_modes_have_exact_durations() {
        assert_eq!(VideoMode::new(1920, 1080, 60, 1).frame_duration(), 2000);
        assert_eq!(VideoMode::new(1920, 1080, 60000, 1001).frame_duration(), 2002);
        assert_eq!(VideoMode::new(1920, 1080, 50, 1).frame_duration(), 2400);
        assert_eq!(VideoMode::new(1920, 1080, 25, 1).frame_duration(), 4800);
    }

    #[test]
    fn prepared_flag_is_set_once() {
        let frame = BufferedFrame::new(
            VideoPayload::corrupted(VideoMode::default()),
            AudioPayload::default(),
            SequenceGap::Dropped(2),
            Instant::now(),
        );
        assert_eq!(frame.queue_weight(), 3);
        assert!(frame.mark_prepared());
        assert!(!frame.mark_prepared());
        assert!(frame.is_prepared());
    }

    #[test]
    fn length_mismatch_counts_as_corrupted() {
        let pool = pool::FramePool::new(1, 64);
        let mode = VideoMode::new(4, 4, 60, 1);
        let mut lease = pool.acquire().unwrap();
        lease.write(16, |_| ()).unwrap();
        let payload = VideoPayload::new(lease, mode);
        assert!(payload.is_corrupted());
        assert!(!payload.is_empty());
    }
}
