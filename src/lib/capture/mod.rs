pub mod channel;
pub mod fake;
pub mod scripted;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use enum_dispatch::enum_dispatch;
use tracing::*;

use crate::{
    clock::timebase_to_duration,
    frame::{pool::FramePool, CapturedFrame, VideoMode, VideoPayload},
    lifecycle::hotplug::{HotplugEvent, HotplugQueue},
    queue::source_queue::SourceQueue,
};

use channel::ChannelCapture;
use fake::FakeCapture;
use scripted::ScriptedCapture;

/// Buffers each backend keeps in its pool.
pub const BACKEND_POOL_FRAMES: usize = 32;

#[enum_dispatch]
pub trait CaptureBackendInterface {
    /// Sets the mode the backend should produce. Only called while stopped.
    fn configure(&mut self, mode: &VideoMode) -> Result<()>;

    /// Starts producing frames into `sink`, from the backend's own thread.
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Stops producing. No frame is delivered once this returns.
    fn stop(&mut self);

    fn video_mode(&self) -> VideoMode;

    /// Whether the backend only sends frames when its content changes.
    fn is_push_style(&self) -> bool;

    /// Asks a push-style backend to send its current frame again.
    fn request_repaint(&self);

    fn description(&self) -> String;
}

#[enum_dispatch(CaptureBackendInterface)]
#[derive(Debug)]
pub enum CaptureBackend {
    Fake(FakeCapture),
    Scripted(ScriptedCapture),
    Channel(ChannelCapture),
}

/// The frame callback handed to a backend on start.
///
/// It is bound to one slot and one queue generation: once the slot gets a
/// new backend, deliveries through an old sink are refused.
#[derive(Debug, Clone)]
pub struct FrameSink {
    queue: Arc<SourceQueue>,
    generation: u64,
    hotplug: HotplugQueue,
}

impl FrameSink {
    pub fn new(queue: Arc<SourceQueue>, generation: u64, hotplug: HotplugQueue) -> Self {
        Self {
            queue,
            generation,
            hotplug,
        }
    }

    pub fn slot(&self) -> usize {
        self.queue.slot()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues one frame. Returns false if this sink is stale.
    pub fn deliver(&self, frame: CapturedFrame) -> bool {
        self.queue.push(self.generation, frame)
    }

    pub fn is_current(&self) -> bool {
        self.queue.generation() == self.generation
    }

    /// Reports that the device behind this sink went away.
    pub fn disconnected(&self) {
        info!("Source {}: backend reported a disconnection", self.slot());
        self.hotplug.push(HotplugEvent::Detached {
            slot: self.slot(),
            generation: self.generation,
        });
    }
}

pub(crate) fn validate_mode(mode: &VideoMode) -> Result<()> {
    if mode.width == 0 || mode.height == 0 {
        return Err(anyhow!("Unsupported video mode {mode}: empty frame"));
    }
    if mode.frame_rate_num == 0 || mode.frame_rate_den == 0 {
        return Err(anyhow!("Unsupported video mode {mode}: invalid frame rate"));
    }
    if mode.frame_duration() <= 0 {
        return Err(anyhow!(
            "Unsupported video mode {mode}: frames shorter than one timebase unit"
        ));
    }
    Ok(())
}

/// Fills a pooled buffer with a flat 4:2:2 picture. An exhausted pool gives
/// the corrupted sentinel, like a starved hardware allocator would.
pub(crate) fn flat_video(pool: &FramePool, mode: &VideoMode, luma: u8) -> VideoPayload {
    let mut lease = match pool.acquire() {
        Ok(lease) => lease,
        Err(error) => {
            debug!("{error}");
            return VideoPayload::corrupted(*mode);
        }
    };

    let result = lease.write(mode.frame_size(), |bytes| {
        // A recycled buffer may already hold this picture.
        if bytes.get(..2) != Some(&[0x80, luma][..]) {
            for pixel in bytes.chunks_exact_mut(2) {
                pixel[0] = 0x80;
                pixel[1] = luma;
            }
        }
    });

    match result {
        Ok(()) => VideoPayload::new(lease, *mode),
        Err(error) => {
            warn!("Failed filling video frame: {error}");
            VideoPayload::corrupted(*mode)
        }
    }
}

/// Schedules beats at a fixed rate from an absolute start, so that late
/// beats are caught up instead of shifting the cadence.
#[derive(Debug)]
pub(crate) struct Pacer {
    start: Instant,
    period_ns: f64,
    beat: u64,
}

impl Pacer {
    pub fn new(frame_duration: i64, rate_offset_ppm: i32) -> Self {
        let nominal = timebase_to_duration(frame_duration).as_nanos() as f64;
        Self {
            start: Instant::now(),
            period_ns: nominal * 1e6 / (1e6 + rate_offset_ppm as f64),
            beat: 0,
        }
    }

    fn deadline(&self) -> Instant {
        self.start + Duration::from_nanos((self.period_ns * self.beat as f64) as u64)
    }

    /// Sleeps until the next beat. Returns false if `running` was cleared.
    pub fn wait(&mut self, running: &AtomicBool) -> bool {
        self.beat += 1;
        sleep_until(self.deadline(), running)
    }
}

/// Sleeps in short slices so a stop request is noticed quickly.
pub(crate) fn sleep_until(deadline: Instant, running: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(10);

    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}

/// A running producer thread. Stopping (or dropping) it joins the thread.
#[derive(Debug)]
pub(crate) struct ProducerThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProducerThread {
    pub fn spawn(
        name: String,
        body: impl FnOnce(Arc<AtomicBool>) + Send + 'static,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = crate::helper::threads::spawn_named(name, {
            let running = running.clone();
            move || body(running)
        })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let name = handle.thread().name().unwrap_or("producer").to_string();
            crate::helper::threads::join_logged(&name, handle);
        }
    }
}

impl Drop for ProducerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::metrics::SourceMetrics;

    #[test]
    fn stale_sink_is_refused() {
        let queue = Arc::new(SourceQueue::new(2, 4, Arc::new(SourceMetrics::default())));
        let hotplug = HotplugQueue::default();
        let mode = VideoMode::new(4, 2, 60, 1);
        let pool = FramePool::new(4, mode.frame_size());

        let sink = FrameSink::new(queue.clone(), queue.generation(), hotplug.clone());
        let frame = |sequence| CapturedFrame {
            sequence,
            video: flat_video(&pool, &mode, 0x10),
            audio: Default::default(),
            timestamp: Instant::now(),
        };
        assert!(sink.deliver(frame(1)));

        queue.reset();
        assert!(!sink.is_current());
        assert!(!sink.deliver(frame(2)));
        assert!(queue.is_empty());

        sink.disconnected();
        match hotplug.drain().pop() {
            Some(HotplugEvent::Detached { slot, generation }) => {
                assert_eq!(slot, 2);
                assert_eq!(generation, sink.generation());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn flat_video_falls_back_to_corrupted_when_exhausted() {
        let mode = VideoMode::new(4, 2, 60, 1);
        let pool = FramePool::new(1, mode.frame_size());

        let first = flat_video(&pool, &mode, 0x10);
        assert!(!first.is_corrupted());
        first
            .frame
            .as_ref()
            .unwrap()
            .read(|bytes| assert_eq!(&bytes[..4], &[0x80, 0x10, 0x80, 0x10]))
            .unwrap();

        assert!(flat_video(&pool, &mode, 0x10).is_corrupted());
        drop(first);
        assert!(!flat_video(&pool, &mode, 0x10).is_corrupted());
    }

    #[test]
    fn invalid_modes_are_rejected() {
        assert!(validate_mode(&VideoMode::default()).is_ok());
        assert!(validate_mode(&VideoMode::new(0, 720, 60, 1)).is_err());
        assert!(validate_mode(&VideoMode::new(1280, 720, 0, 1)).is_err());
        assert!(validate_mode(&VideoMode::new(8, 4, 240_000, 1)).is_err());
        assert!(validate_mode(&VideoMode::new(8, 4, 120_000, 1)).is_ok());
    }
}
