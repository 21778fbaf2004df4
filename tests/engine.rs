use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use sync_mixer::{
    audio::{task::AudioTask, AudioOutput},
    capture::scripted::{ScriptEvent, ScriptStep, ScriptedSettings},
    engine::Engine,
    frame::VideoMode,
    scheduler::frame_set::{CommittedFrameSet, MasterClock, Renderer},
    settings::manager::{OutputSettings, SchedulerSettings, SettingsStruct, SourceSettings},
    source::SourceState,
};

#[derive(Default, Clone)]
struct Recorder {
    masters: Arc<Mutex<Vec<(MasterClock, i64)>>>,
}

impl Renderer for Recorder {
    fn render(&mut self, frames: CommittedFrameSet) {
        self.masters.lock().push((frames.master, frames.pts));
    }
}

#[derive(Default, Clone)]
struct Sink {
    samples: Arc<Mutex<usize>>,
}

impl AudioOutput for Sink {
    fn consume(&mut self, task: &AudioTask, _pcm: &[f32]) {
        *self.samples.lock() += task.num_samples;
    }
}

#[test]
fn software_output_clock_drives_scripted_sources() {
    let mode = VideoMode::new(32, 18, 100, 1);
    let mut scripted = ScriptedSettings::new("camera", mode);
    scripted.rate_offset_ppm = 500;
    scripted.script = vec![
        ScriptStep {
            at_frame: 5,
            event: ScriptEvent::Drop { frames: 2 },
        },
        ScriptStep {
            at_frame: 10,
            event: ScriptEvent::Corrupt,
        },
    ];

    let settings = SettingsStruct {
        scheduler: SchedulerSettings {
            min_sources: 1,
            ..Default::default()
        },
        fake_mode: mode,
        sources: vec![SourceSettings::Scripted(scripted)],
        output: Some(OutputSettings {
            slot: 3,
            clock_master: true,
            preroll_beats: 2,
        }),
        ..Default::default()
    };

    let recorder = Recorder::default();
    let sink = Sink::default();
    let mut engine =
        Engine::start(&settings, Box::new(recorder.clone()), Box::new(sink.clone())).unwrap();

    std::thread::sleep(Duration::from_millis(500));
    let metrics = engine.control().metrics();
    engine.shutdown();

    assert_eq!(metrics[0].state, SourceState::Live);
    assert_eq!(metrics[3].state, SourceState::OutputParked);
    assert_eq!(metrics[0].dropped_frames_error, 1);

    let masters = recorder.masters.lock();
    assert!(masters.len() >= 20, "only {} frames", masters.len());
    assert!(masters
        .iter()
        .skip(1)
        .all(|(master, _)| *master == MasterClock::Output(3)));
    assert!(masters.windows(2).all(|pair| pair[0].1 < pair[1].1));

    // 480 samples per 100 Hz beat, dropped beats included.
    assert!(*sink.samples.lock() >= masters.len() * 480);
}
