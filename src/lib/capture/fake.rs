//! Deterministic filler keeping a slot visible when no real device feeds it.

use anyhow::Result;
use tracing::*;

use super::{
    flat_video, validate_mode, CaptureBackendInterface, FrameSink, Pacer, ProducerThread,
    BACKEND_POOL_FRAMES,
};
use crate::{
    clock::presentation::SampleAccumulator,
    frame::{pool::FramePool, AudioFormat, AudioPayload, CapturedFrame, VideoMode},
};

/// Luma of the filler picture.
const FAKE_LUMA: u8 = 0x10;

#[derive(Debug)]
pub struct FakeCapture {
    mode: VideoMode,
    pool: FramePool,
    producer: Option<ProducerThread>,
}

impl FakeCapture {
    pub fn new(mode: VideoMode) -> Self {
        Self {
            mode,
            pool: FramePool::new(BACKEND_POOL_FRAMES, mode.frame_size()),
            producer: None,
        }
    }
}

impl CaptureBackendInterface for FakeCapture {
    fn configure(&mut self, mode: &VideoMode) -> Result<()> {
        validate_mode(mode)?;
        if mode.frame_size() != self.pool.frame_size() {
            self.pool = FramePool::new(BACKEND_POOL_FRAMES, mode.frame_size());
        }
        self.mode = *mode;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, sink), fields(slot = sink.slot()))]
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        self.stop();

        let mode = self.mode;
        let pool = self.pool.clone();
        let format = AudioFormat::default();

        self.producer = Some(ProducerThread::spawn(
            format!("fake-{}", sink.slot()),
            move |running| {
                debug!("Fake producer for source {} started!", sink.slot());

                let duration = mode.frame_duration();
                let mut pacer = Pacer::new(duration, 0);
                let mut samples = SampleAccumulator::new();
                let mut sequence: u16 = 0;

                while pacer.wait(&running) {
                    let audio = AudioPayload::new(
                        vec![0.0; samples.samples_for(duration) * format.channels as usize],
                        format,
                    );
                    let frame = CapturedFrame {
                        sequence,
                        video: flat_video(&pool, &mode, FAKE_LUMA),
                        audio,
                        timestamp: std::time::Instant::now(),
                    };
                    if !sink.deliver(frame) {
                        break;
                    }
                    sequence = sequence.wrapping_add(1);
                }

                debug!("Fake producer for source {} stopped", sink.slot());
            },
        )?);

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
    }

    fn video_mode(&self) -> VideoMode {
        self.mode
    }

    fn is_push_style(&self) -> bool {
        false
    }

    fn request_repaint(&self) {}

    fn description(&self) -> String {
        format!("fake {}", self.mode)
    }
}
