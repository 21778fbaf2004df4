//! Virtual source replaying a script of stalls, drops, corruption and
//! disconnects on top of a steady frame cadence.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::*;

use super::{
    flat_video, sleep_until, validate_mode, CaptureBackendInterface, FrameSink, Pacer,
    ProducerThread, BACKEND_POOL_FRAMES,
};
use crate::{
    clock::presentation::SampleAccumulator,
    frame::{
        pool::FramePool, AudioFormat, AudioPayload, CapturedFrame, VideoMode, VideoPayload,
    },
};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptEvent {
    /// Hold the frame back; later frames are then delivered in a burst.
    Stall { milliseconds: u64 },
    /// Skip this many sequence numbers before the frame.
    Drop { frames: u16 },
    /// Deliver the frame with an empty video payload.
    Corrupt,
    /// Report a disconnection and stop producing.
    Disconnect,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ScriptStep {
    pub at_frame: u64,
    pub event: ScriptEvent,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ScriptedSettings {
    pub name: String,
    pub mode: VideoMode,
    /// Deviation of the source clock from its nominal rate.
    #[serde(default)]
    pub rate_offset_ppm: i32,
    /// Only send frames on content change and on repaint requests.
    #[serde(default)]
    pub push_style: bool,
    /// For push-style sources, content changes every this many beats.
    #[serde(default = "default_update_every")]
    pub update_every: u32,
    /// Constant level of the audio that comes with every frame.
    #[serde(default)]
    pub audio_level: f32,
    #[serde(default)]
    pub script: Vec<ScriptStep>,
}

fn default_update_every() -> u32 {
    1
}

impl ScriptedSettings {
    pub fn new(name: &str, mode: VideoMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            rate_offset_ppm: 0,
            push_style: false,
            update_every: default_update_every(),
            audio_level: 0.0,
            script: vec![],
        }
    }
}

#[derive(Debug)]
pub struct ScriptedCapture {
    settings: ScriptedSettings,
    pool: FramePool,
    repaint: Arc<AtomicBool>,
    producer: Option<ProducerThread>,
}

impl ScriptedCapture {
    pub fn new(mut settings: ScriptedSettings) -> Self {
        settings.script.sort_by_key(|step| step.at_frame);

        Self {
            pool: FramePool::new(BACKEND_POOL_FRAMES, settings.mode.frame_size()),
            settings,
            repaint: Default::default(),
            producer: None,
        }
    }

    pub fn settings(&self) -> &ScriptedSettings {
        &self.settings
    }
}

impl CaptureBackendInterface for ScriptedCapture {
    fn configure(&mut self, mode: &VideoMode) -> Result<()> {
        validate_mode(mode)?;
        if mode.frame_size() != self.pool.frame_size() {
            self.pool = FramePool::new(BACKEND_POOL_FRAMES, mode.frame_size());
        }
        self.settings.mode = *mode;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, sink), fields(slot = sink.slot(), name = %self.settings.name))]
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        self.stop();

        let settings = self.settings.clone();
        let pool = self.pool.clone();
        let repaint = self.repaint.clone();

        self.producer = Some(ProducerThread::spawn(
            format!("scripted-{}", sink.slot()),
            move |running| run_script(settings, pool, repaint, sink, running),
        )?);

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
    }

    fn video_mode(&self) -> VideoMode {
        self.settings.mode
    }

    fn is_push_style(&self) -> bool {
        self.settings.push_style
    }

    fn request_repaint(&self) {
        self.repaint.store(true, Ordering::Release);
    }

    fn description(&self) -> String {
        format!("scripted \"{}\" {}", self.settings.name, self.settings.mode)
    }
}

fn run_script(
    settings: ScriptedSettings,
    pool: FramePool,
    repaint: Arc<AtomicBool>,
    sink: FrameSink,
    running: Arc<AtomicBool>,
) {
    debug!("Scripted producer \"{}\" started!", settings.name);

    let mode = settings.mode;
    let duration = mode.frame_duration();
    let format = AudioFormat::default();
    let mut pacer = Pacer::new(duration, settings.rate_offset_ppm);
    let mut samples = SampleAccumulator::new();
    let mut steps = settings.script.iter().peekable();
    let mut sequence: u16 = 0;
    let mut beat: u64 = 0;

    while pacer.wait(&running) {
        let index = beat;
        beat += 1;

        // Audio keeps flowing with the cadence even when no frame is sent.
        let audio_samples = samples.samples_for(duration);

        let mut corrupt = false;
        while let Some(step) = steps.next_if(|step| step.at_frame <= index) {
            match step.event {
                ScriptEvent::Stall { milliseconds } => {
                    let until = Instant::now() + Duration::from_millis(milliseconds);
                    if !sleep_until(until, &running) {
                        return;
                    }
                }
                ScriptEvent::Drop { frames } => sequence = sequence.wrapping_add(frames),
                ScriptEvent::Corrupt => corrupt = true,
                ScriptEvent::Disconnect => {
                    sink.disconnected();
                    return;
                }
            }
        }

        if settings.push_style {
            let changed = index % settings.update_every.max(1) as u64 == 0;
            if !changed && !repaint.swap(false, Ordering::AcqRel) {
                continue;
            }
        }

        let video = if corrupt {
            VideoPayload::corrupted(mode)
        } else {
            flat_video(&pool, &mode, (index % 0xdb) as u8 + 0x10)
        };
        let audio = AudioPayload::new(
            vec![settings.audio_level; audio_samples * format.channels as usize],
            format,
        );

        let frame = CapturedFrame {
            sequence,
            video,
            audio,
            timestamp: Instant::now(),
        };
        if !sink.deliver(frame) {
            break;
        }
        sequence = sequence.wrapping_add(1);
    }

    debug!("Scripted producer \"{}\" stopped", settings.name);
}
