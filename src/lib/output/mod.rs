pub mod timer;

use std::time::Instant;

use anyhow::Result;

use crate::frame::VideoMode;

/// What an output device reports when it is ready for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBeat {
    /// Beats the device had to skip since the previous call.
    pub dropped_frames: u32,
    pub frame_duration: i64,
    /// Pre-roll beats are queued ahead and say nothing about the device
    /// clock.
    pub is_preroll: bool,
    pub timestamp: Instant,
}

/// A playout device. When configured as clock master, its beats drive the
/// scheduler.
pub trait OutputDevice: Send + std::fmt::Debug {
    /// The supported mode closest to `desired`.
    fn pick_video_mode(&self, desired: &VideoMode) -> VideoMode;

    fn start_output(&mut self, mode: VideoMode, base_pts: i64) -> Result<()>;

    fn end_output(&mut self);

    /// Blocks until the device wants the frame for `pts`.
    fn wait_for_frame(&mut self, pts: i64) -> OutputBeat;

    fn description(&self) -> String;
}

/// Binds a device to the slot it physically shares with an input.
#[derive(Debug)]
pub struct OutputAssignment {
    pub slot: usize,
    pub device: Box<dyn OutputDevice>,
    pub clock_master: bool,
}

/// The output currently in use, owned by the scheduler.
#[derive(Debug)]
pub struct ActiveOutput {
    pub slot: usize,
    pub device: Box<dyn OutputDevice>,
    pub clock_master: bool,
    pub mode: VideoMode,
}
