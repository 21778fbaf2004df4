//! Backend fed by the embedding application: whatever thread holds the
//! [`ChannelCaptureHandle`] is the producer.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::Result;
use parking_lot::Mutex;

use super::{
    flat_video, validate_mode, CaptureBackendInterface, FrameSink, BACKEND_POOL_FRAMES,
};
use crate::frame::{pool::FramePool, AudioFormat, AudioPayload, CapturedFrame, VideoMode};

#[derive(Debug)]
struct ChannelShared {
    name: String,
    sink: Mutex<Option<FrameSink>>,
    mode: Mutex<VideoMode>,
    pool: Mutex<FramePool>,
    repaint_requests: AtomicU64,
}

#[derive(Debug)]
pub struct ChannelCapture {
    shared: Arc<ChannelShared>,
    push_style: bool,
}

/// Producer side of a [`ChannelCapture`].
#[derive(Debug, Clone)]
pub struct ChannelCaptureHandle {
    shared: Arc<ChannelShared>,
}

impl ChannelCapture {
    pub fn new(name: &str, mode: VideoMode, push_style: bool) -> (Self, ChannelCaptureHandle) {
        let shared = Arc::new(ChannelShared {
            name: name.to_string(),
            sink: Mutex::new(None),
            mode: Mutex::new(mode),
            pool: Mutex::new(FramePool::new(BACKEND_POOL_FRAMES, mode.frame_size())),
            repaint_requests: AtomicU64::new(0),
        });

        (
            Self {
                shared: shared.clone(),
                push_style,
            },
            ChannelCaptureHandle { shared },
        )
    }
}

impl CaptureBackendInterface for ChannelCapture {
    fn configure(&mut self, mode: &VideoMode) -> Result<()> {
        validate_mode(mode)?;
        let mut pool = self.shared.pool.lock();
        if pool.frame_size() != mode.frame_size() {
            *pool = FramePool::new(BACKEND_POOL_FRAMES, mode.frame_size());
        }
        *self.shared.mode.lock() = *mode;
        Ok(())
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        *self.shared.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.sink.lock().take();
    }

    fn video_mode(&self) -> VideoMode {
        *self.shared.mode.lock()
    }

    fn is_push_style(&self) -> bool {
        self.push_style
    }

    fn request_repaint(&self) {
        self.shared.repaint_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn description(&self) -> String {
        format!("channel \"{}\" {}", self.shared.name, self.video_mode())
    }
}

impl ChannelCaptureHandle {
    /// Hands one frame to the engine. Returns false while the backend is not
    /// started, or after it was replaced.
    pub fn deliver(&self, frame: CapturedFrame) -> bool {
        match self.shared.sink.lock().as_ref() {
            Some(sink) => sink.deliver(frame),
            None => false,
        }
    }

    /// A flat frame in the current mode, with silence for its duration.
    pub fn blank_frame(&self, sequence: u16, timestamp: Instant) -> CapturedFrame {
        let mode = *self.shared.mode.lock();
        let pool = self.shared.pool.lock().clone();

        CapturedFrame {
            sequence,
            video: flat_video(&pool, &mode, 0xeb),
            audio: AudioPayload::silence(AudioFormat::default(), mode.frame_duration()),
            timestamp,
        }
    }

    pub fn send(&self, sequence: u16, timestamp: Instant) -> bool {
        self.deliver(self.blank_frame(sequence, timestamp))
    }

    pub fn pool(&self) -> FramePool {
        self.shared.pool.lock().clone()
    }

    pub fn video_mode(&self) -> VideoMode {
        *self.shared.mode.lock()
    }

    pub fn is_started(&self) -> bool {
        self.shared.sink.lock().is_some()
    }

    /// Simulates the device going away.
    pub fn disconnect(&self) {
        if let Some(sink) = self.shared.sink.lock().take() {
            sink.disconnected();
        }
    }

    pub fn repaint_requests(&self) -> u64 {
        self.shared.repaint_requests.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lifecycle::hotplug::HotplugQueue, queue::source_queue::SourceQueue,
        source::metrics::SourceMetrics,
    };

    #[test]
    fn frames_only_flow_while_started() {
        let queue = Arc::new(SourceQueue::new(1, 8, Arc::new(SourceMetrics::default())));
        let hotplug = HotplugQueue::default();
        let (mut capture, handle) = ChannelCapture::new("app", VideoMode::new(4, 2, 60, 1), false);

        assert!(!handle.send(0, Instant::now()));

        capture
            .start(FrameSink::new(queue.clone(), queue.generation(), hotplug.clone()))
            .unwrap();
        assert!(handle.is_started());
        assert!(handle.send(0, Instant::now()));
        assert!(handle.send(1, Instant::now()));
        assert_eq!(queue.len(), 2);

        capture.stop();
        assert!(!handle.send(2, Instant::now()));
        assert_eq!(queue.len(), 2);
        assert!(hotplug.is_empty());
    }

    #[test]
    fn disconnect_reports_once() {
        let queue = Arc::new(SourceQueue::new(1, 8, Arc::new(SourceMetrics::default())));
        let hotplug = HotplugQueue::default();
        let (mut capture, handle) = ChannelCapture::new("app", VideoMode::new(4, 2, 60, 1), true);
        capture
            .start(FrameSink::new(queue.clone(), queue.generation(), hotplug.clone()))
            .unwrap();

        handle.disconnect();
        handle.disconnect();
        assert_eq!(hotplug.len(), 1);
        assert!(!handle.is_started());

        capture.request_repaint();
        assert_eq!(handle.repaint_requests(), 1);
    }

    #[test]
    fn reconfigure_resizes_the_pool() {
        let (mut capture, handle) = ChannelCapture::new("app", VideoMode::new(4, 2, 60, 1), false);
        capture.configure(&VideoMode::new(8, 8, 50, 1)).unwrap();
        assert_eq!(handle.pool().frame_size(), 8 * 8 * 2);
        assert_eq!(handle.blank_frame(0, Instant::now()).video.len(), 128);
    }
}
