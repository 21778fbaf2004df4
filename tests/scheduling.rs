use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use sync_mixer::{
    audio::{dispatch::audio_task_channel, mixer::AudioMixer},
    capture::{
        channel::{ChannelCapture, ChannelCaptureHandle},
        CaptureBackend,
    },
    clock::{ManualTime, MonotonicTime, TimeSource},
    control::{ControlPlane, MixerContext},
    frame::VideoMode,
    lifecycle::{LifecycleManager, LifecyclePolicy},
    scheduler::{
        frame_set::{CommittedFrameSet, Renderer},
        Scheduler, SchedulerConfig, TickKind,
    },
    source::SourceState,
};

const MODE_60: VideoMode = VideoMode::new(8, 4, 60, 1);
const MODE_59_94: VideoMode = VideoMode::new(8, 4, 60000, 1001);

/// Keeps only the latest frame set, so pooled frames go back to their
/// backends like they would behind a real renderer.
#[derive(Default, Clone)]
struct Collector {
    pts: Arc<Mutex<Vec<i64>>>,
    latest: Arc<Mutex<Option<CommittedFrameSet>>>,
}

impl Renderer for Collector {
    fn render(&mut self, frames: CommittedFrameSet) {
        self.pts.lock().push(frames.pts);
        *self.latest.lock() = Some(frames);
    }
}

struct Mixer {
    scheduler: Scheduler,
    control: ControlPlane,
    rendered: Collector,
}

impl Mixer {
    fn new(min_sources: usize, master_timeout: Duration, time: Arc<dyn TimeSource>) -> Self {
        let context = MixerContext::new(16, 0);
        let audio = Arc::new(AudioMixer::new());
        let lifecycle = LifecycleManager::new(
            context.clone(),
            audio.clone(),
            LifecyclePolicy {
                min_sources,
                fake_mode: MODE_60,
            },
        );
        // Nobody consumes audio here.
        let (dispatch, _tasks) = audio_task_channel();
        let rendered = Collector::default();

        let scheduler = Scheduler::new(
            context.clone(),
            lifecycle,
            audio,
            dispatch,
            Box::new(rendered.clone()),
            time,
            SchedulerConfig {
                master_timeout,
                hard_queue_ceiling: 16,
            },
        );

        Self {
            scheduler,
            control: ControlPlane::new(context),
            rendered,
        }
    }

    fn attach(&self, name: &str, mode: VideoMode) -> ChannelCaptureHandle {
        let (capture, handle) = ChannelCapture::new(name, mode, false);
        self.control
            .attach(CaptureBackend::Channel(capture))
            .unwrap();
        handle
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

#[test]
fn stalled_master_produces_synthetic_beats() {
    let mut mixer = Mixer::new(0, Duration::from_millis(200), Arc::new(MonotonicTime));
    let master = Arc::new(mixer.attach("master", MODE_60));

    // Nothing can arrive before the attach is applied.
    assert_eq!(mixer.scheduler.tick().kind, TickKind::Timeout);

    assert!(master.send(0, Instant::now()));
    assert_eq!(mixer.scheduler.tick().kind, TickKind::Normal);

    let stalled = std::thread::spawn({
        let master = master.clone();
        move || {
            std::thread::sleep(Duration::from_millis(500));
            assert!(master.send(1, Instant::now()));
        }
    });

    let outcomes: Vec<_> = (0..3).map(|_| mixer.scheduler.tick()).collect();
    stalled.join().unwrap();

    let kinds: Vec<_> = outcomes.iter().map(|outcome| outcome.kind).collect();
    assert_eq!(
        kinds,
        vec![TickKind::Timeout, TickKind::Timeout, TickKind::Normal]
    );
    assert_eq!(outcomes[0].duration, 24000);
    assert_eq!(outcomes[1].duration, 24000);
    assert_eq!(outcomes[2].duration, 2000);

    // Presentation time only moves forward, by exactly what was ticked.
    assert_eq!(
        *mixer.rendered.pts.lock(),
        vec![0, 24000, 26000, 50000, 74000]
    );
    assert_eq!(mixer.scheduler.pts(), 76000);
}

#[test]
fn close_frame_rates_keep_queues_short() {
    let start = Instant::now();
    let time = Arc::new(ManualTime::new(start));
    let mut mixer = Mixer::new(0, Duration::from_millis(10), time.clone());
    let master = mixer.attach("master", MODE_60);
    let input = mixer.attach("input", MODE_59_94);

    // Applies both attachments.
    assert_eq!(mixer.scheduler.tick().kind, TickKind::Timeout);
    assert_eq!(mixer.scheduler.sources()[1].state(), SourceState::Live);

    let master_period = |beat: u64| Duration::from_nanos(beat * 1_000_000_000 / 60);
    let input_period = |frame: u64| Duration::from_nanos(frame * 1_001_000_000_000 / 60_000);

    let mut next_input = 0u64;
    for beat in 0..10_000u64 {
        let now = start + master_period(beat);
        time.set(now);

        while start + input_period(next_input) <= now {
            assert!(input.send(next_input as u16, start + input_period(next_input)));
            next_input += 1;
        }
        assert!(master.send(beat as u16, now));

        let outcome = mixer.scheduler.tick();
        assert_eq!(outcome.kind, TickKind::Normal, "beat {beat}");
        let queued = mixer.scheduler.sources()[1].queue().len();
        assert!(queued <= 1, "beat {beat}: {queued} frames queued");
    }

    let metrics = &mixer.control.metrics()[1];
    assert_eq!(metrics.dropped_frames_latency, 0);
    // 10000 beats of 60 Hz against 59.94 Hz leaves the input about ten
    // frames short, plus the warm-up tick.
    assert!(
        (9..=12).contains(&metrics.duplicated_frames),
        "{} duplicated frames",
        metrics.duplicated_frames
    );
}

#[test]
fn live_disconnect_falls_back_within_one_tick() {
    let time = Arc::new(ManualTime::new(Instant::now()));
    let mut mixer = Mixer::new(2, Duration::from_millis(10), time.clone());
    let master = mixer.attach("master", MODE_60);
    let camera = mixer.attach("camera", MODE_60);

    mixer.scheduler.tick();
    assert_eq!(mixer.scheduler.sources()[1].state(), SourceState::Live);
    mixer.control.set_route(0, 1).unwrap();
    mixer.control.set_route(1, 0).unwrap();

    camera.disconnect();
    assert!(master.send(0, time.now()));
    let outcome = mixer.scheduler.tick();
    assert_eq!(outcome.kind, TickKind::Normal);

    assert_eq!(mixer.scheduler.sources()[1].state(), SourceState::Fake);
    let routing = mixer.control.routing();
    assert_eq!(routing.slot_for(0), None);
    assert_eq!(routing.slot_for(1), Some(0));

    let latest = mixer.rendered.latest.lock();
    let last = latest.as_ref().unwrap();
    assert_eq!(last.source(1).unwrap().state, SourceState::Fake);
    assert!(last.signal(0).is_none());
    assert!(last.signal(1).is_some());
}
