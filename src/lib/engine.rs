//! Wires the scheduler, the audio worker and the configured sources together
//! and owns their threads.

use std::{sync::Arc, thread::JoinHandle, time::Duration};

use anyhow::{Context, Result};
use tracing::*;

use crate::{
    audio::{
        dispatch::{audio_task_channel, AudioWorker, AudioWorkerStats},
        mixer::AudioMixer,
        AudioOutput, AudioSink,
    },
    capture::{fake::FakeCapture, scripted::ScriptedCapture, CaptureBackend},
    clock::{MonotonicTime, TimeSource},
    control::{ControlError, ControlPlane, MixerContext},
    helper::threads::{join_logged, spawn_named},
    lifecycle::{LifecycleManager, LifecyclePolicy},
    output::{timer::TimerOutput, OutputAssignment},
    scheduler::{frame_set::Renderer, Scheduler, SchedulerConfig},
    settings::manager::{SettingsStruct, SourceSettings},
    source::MAX_SOURCES,
};

/// A running mixer. Dropping it shuts everything down.
#[derive(Debug)]
pub struct Engine {
    control: ControlPlane,
    scheduler: Option<JoinHandle<()>>,
    audio_worker: AudioWorker,
}

impl Engine {
    pub fn start(
        settings: &SettingsStruct,
        renderer: Box<dyn Renderer>,
        audio_output: Box<dyn AudioOutput>,
    ) -> Result<Self> {
        Self::start_with_time(settings, renderer, audio_output, Arc::new(MonotonicTime))
    }

    #[instrument(level = "debug", skip_all)]
    pub fn start_with_time(
        settings: &SettingsStruct,
        renderer: Box<dyn Renderer>,
        audio_output: Box<dyn AudioOutput>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let scheduler_settings = &settings.scheduler;
        if scheduler_settings.master_slot >= MAX_SOURCES {
            return Err(ControlError::InvalidSlot(scheduler_settings.master_slot))
                .context("Invalid master slot in settings");
        }

        let config = SchedulerConfig {
            master_timeout: Duration::from_millis(scheduler_settings.master_timeout_ms),
            hard_queue_ceiling: scheduler_settings.hard_queue_ceiling,
        };
        config.validate().context("Invalid scheduler settings")?;

        let context = MixerContext::new(
            scheduler_settings.hard_queue_ceiling,
            scheduler_settings.master_slot,
        );
        let control = ControlPlane::new(context.clone());
        let audio = Arc::new(AudioMixer::new());

        let (dispatch, tasks) = audio_task_channel();
        let audio_worker =
            AudioWorker::spawn(tasks, audio.clone() as Arc<dyn AudioSink>, audio_output)?;

        let lifecycle = LifecycleManager::new(
            context.clone(),
            audio.clone(),
            LifecyclePolicy {
                min_sources: scheduler_settings.min_sources.min(MAX_SOURCES),
                fake_mode: settings.fake_mode,
            },
        );
        let scheduler = Scheduler::new(
            context,
            lifecycle,
            audio,
            dispatch,
            renderer,
            time,
            config,
        );

        // Picked up by the first tick, before anything is rendered.
        for source in &settings.sources {
            control.attach(backend_from_settings(source))?;
        }
        if let Some(output) = &settings.output {
            control.set_output(Some(OutputAssignment {
                slot: output.slot,
                device: Box::new(TimerOutput::new(output.preroll_beats)),
                clock_master: output.clock_master,
            }))?;
        }

        let scheduler = spawn_named("scheduler", move || scheduler.run())?;
        info!(
            "Engine started with {} configured source(s)",
            settings.sources.len()
        );

        Ok(Self {
            control,
            scheduler: Some(scheduler),
            audio_worker,
        })
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn audio_stats(&self) -> &Arc<AudioWorkerStats> {
        self.audio_worker.stats()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the scheduler (and with it every producer), then lets the audio
    /// worker drain what is left.
    #[instrument(level = "debug", skip(self))]
    pub fn shutdown(&mut self) {
        let Some(scheduler) = self.scheduler.take() else {
            return;
        };

        self.control.shutdown();
        join_logged("scheduler", scheduler);
        self.audio_worker.stop();
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn backend_from_settings(settings: &SourceSettings) -> CaptureBackend {
    match settings {
        SourceSettings::Fake { mode } => CaptureBackend::Fake(FakeCapture::new(*mode)),
        SourceSettings::Scripted(scripted) => {
            CaptureBackend::Scripted(ScriptedCapture::new(scripted.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{
        audio::task::AudioTask, frame::VideoMode, scheduler::frame_set::CommittedFrameSet,
        settings::manager::SchedulerSettings, source::SourceState,
    };

    #[derive(Default, Clone)]
    struct Counter(Arc<AtomicU64>);

    impl Renderer for Counter {
        fn render(&mut self, _frames: CommittedFrameSet) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl AudioOutput for Counter {
        fn consume(&mut self, task: &AudioTask, pcm: &[f32]) {
            assert_eq!(pcm.len(), task.num_samples * 2);
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn settings() -> SettingsStruct {
        SettingsStruct {
            scheduler: SchedulerSettings {
                min_sources: 2,
                ..Default::default()
            },
            fake_mode: VideoMode::new(16, 8, 100, 1),
            sources: vec![SourceSettings::Fake {
                mode: VideoMode::new(16, 8, 100, 1),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn runs_and_stops() {
        let rendered = Counter::default();
        let audio = Counter::default();
        let mut engine = Engine::start(
            &settings(),
            Box::new(rendered.clone()),
            Box::new(audio.clone()),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert!(engine.is_running());
        let metrics = engine.control().metrics();
        assert_eq!(metrics[0].state, SourceState::Live);
        assert_eq!(metrics[1].state, SourceState::Fake);
        assert_eq!(metrics[2].state, SourceState::Inactive);

        engine.shutdown();
        assert!(!engine.is_running());

        let ticks = engine.control().context().ticks();
        assert!(ticks >= 10, "only {ticks} ticks");
        assert_eq!(rendered.0.load(Ordering::Relaxed), ticks);
        // Every emitted task reached the output before the worker stopped.
        assert!(audio.0.load(Ordering::Relaxed) >= ticks);
        assert_eq!(
            engine.control().force_active(3, true),
            Err(ControlError::ShuttingDown)
        );
    }

    #[test]
    fn bad_master_is_refused() {
        let mut settings = settings();
        settings.scheduler.master_slot = MAX_SOURCES;
        assert!(Engine::start(
            &settings,
            Box::new(Counter::default()),
            Box::new(Counter::default())
        )
        .is_err());
    }

    #[test]
    fn degenerate_scheduler_settings_are_refused() {
        let start = |scheduler: SchedulerSettings| {
            let settings = SettingsStruct {
                scheduler,
                ..settings()
            };
            Engine::start(
                &settings,
                Box::new(Counter::default()),
                Box::new(Counter::default()),
            )
        };

        let error = start(SchedulerSettings {
            master_timeout_ms: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(format!("{error:#}").contains("timebase unit"), "{error:#}");

        let error = start(SchedulerSettings {
            hard_queue_ceiling: 0,
            ..Default::default()
        })
        .unwrap_err();
        assert!(format!("{error:#}").contains("at least one frame"), "{error:#}");
    }
}
