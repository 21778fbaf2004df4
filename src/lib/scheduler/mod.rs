//! The mixer's heartbeat: waits for the master clock, collects one frame per
//! active source, keeps queues short and hands the result to the renderer.

pub mod frame_set;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::*;

use crate::{
    audio::{dispatch::AudioTaskDispatch, mixer::AudioMixer, task::AudioTask},
    capture::CaptureBackendInterface,
    clock::{
        duration_to_timebase,
        jitter::JitterEstimator,
        presentation::{PresentationClock, SampleAccumulator},
        TimeSource,
    },
    control::MixerContext,
    frame::{BufferedFrame, SequenceGap},
    lifecycle::LifecycleManager,
    output::ActiveOutput,
    source::{metrics::SourceMetrics, Source, MAX_SOURCES},
};
use frame_set::{CommittedFrameSet, MasterClock, Renderer, SourceFrames};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// How long to wait for an input master before ticking anyway.
    pub master_timeout: Duration,
    /// Upper bound on any non-master queue, whatever the policy says.
    pub hard_queue_ceiling: usize,
}

impl SchedulerConfig {
    /// Every tick has to move the clock, and every queue has to hold a frame.
    pub fn validate(&self) -> anyhow::Result<()> {
        if duration_to_timebase(self.master_timeout) <= 0 {
            anyhow::bail!(
                "Master timeout of {:?} is shorter than one timebase unit",
                self.master_timeout
            );
        }
        if self.hard_queue_ceiling == 0 {
            anyhow::bail!("Hard queue ceiling must allow at least one frame");
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            master_timeout: Duration::from_millis(200),
            hard_queue_ceiling: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Normal,
    /// The input master did not deliver in time; a synthetic beat was made.
    Timeout,
    /// The master delivered a corrupted frame; nothing was rendered.
    CorruptedMaster,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub kind: TickKind,
    pub master: MasterClock,
    /// Presentation time of the rendered (or skipped) frame.
    pub pts: i64,
    pub duration: i64,
    /// Beats the master skipped before this one.
    pub dropped_beats: u32,
    /// Audio samples requested per emitted task, oldest first.
    pub audio_samples: Vec<usize>,
    pub rendered: bool,
}

/// What the master produced for this tick.
struct MasterBeat {
    kind: TickKind,
    master: MasterClock,
    duration: i64,
    dropped: u32,
    is_preroll: bool,
    timestamp: Instant,
    frame: Option<BufferedFrame>,
}

pub struct Scheduler {
    context: Arc<MixerContext>,
    lifecycle: LifecycleManager,
    sources: Vec<Source>,
    output: Option<ActiveOutput>,
    output_jitter: JitterEstimator,
    clock: PresentationClock,
    samples: SampleAccumulator,
    audio: Arc<AudioMixer>,
    dispatch: AudioTaskDispatch,
    renderer: Box<dyn Renderer>,
    time: Arc<dyn TimeSource>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pts", &self.clock.pts())
            .field("ticks", &self.clock.ticks())
            .field("output", &self.output)
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        context: Arc<MixerContext>,
        lifecycle: LifecycleManager,
        audio: Arc<AudioMixer>,
        dispatch: AudioTaskDispatch,
        renderer: Box<dyn Renderer>,
        time: Arc<dyn TimeSource>,
        config: SchedulerConfig,
    ) -> Self {
        let fake_mode = lifecycle.policy().fake_mode;
        let mut sources: Vec<Source> = (0..MAX_SOURCES)
            .map(|slot| Source::new(context.queue(slot).clone(), fake_mode))
            .collect();
        lifecycle.initialize(&mut sources);

        Self {
            context,
            lifecycle,
            sources,
            output: None,
            output_jitter: JitterEstimator::new(),
            clock: PresentationClock::new(),
            samples: SampleAccumulator::new(),
            audio,
            dispatch,
            renderer,
            time,
            config,
        }
    }

    pub fn pts(&self) -> i64 {
        self.clock.pts()
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn output(&self) -> Option<&ActiveOutput> {
        self.output.as_ref()
    }

    /// Ticks until shutdown is requested, then stops every producer.
    #[instrument(level = "debug", skip(self))]
    pub fn run(mut self) {
        info!("Scheduler started at pts {}", self.clock.pts());

        while !self.context.is_shutting_down() {
            let outcome = self.tick();
            trace!("Tick: {outcome:?}");
        }

        self.shutdown();
        info!(
            "Scheduler finished after {} ticks at pts {}",
            self.clock.ticks(),
            self.clock.pts()
        );
    }

    pub fn shutdown(&mut self) {
        self.lifecycle.shutdown(&mut self.sources, &mut self.output);
    }

    /// Runs one full scheduling step.
    pub fn tick(&mut self) -> TickOutcome {
        // Read once, so the slot we wait on is the one that got a filler.
        let master = self
            .lifecycle
            .apply(&mut self.sources, &mut self.output, self.clock.pts());

        let mut beat = self.wait_for_master(master);
        let now = self.time.now();

        let master_slot = match beat.master {
            MasterClock::Input(slot) => Some(slot),
            MasterClock::Output(_) => None,
        };

        let mut fresh: Vec<Option<BufferedFrame>> = (0..MAX_SOURCES).map(|_| None).collect();
        if let (Some(slot), Some(frame)) = (master_slot, beat.frame.take()) {
            fresh[slot] = Some(frame);
        }

        if beat.kind == TickKind::CorruptedMaster {
            // Keep audio in step with the timeline, but show nothing.
            if let Some(slot) = master_slot {
                if let Some(frame) = fresh[slot].take() {
                    self.account_audio(slot, &frame);
                }
            }
            let (pts, audio_samples) = self.emit_audio_tasks(&beat);
            self.clock.advance(beat.duration);
            self.context.count_tick();

            return TickOutcome {
                kind: beat.kind,
                master: beat.master,
                pts,
                duration: beat.duration,
                dropped_beats: beat.dropped,
                audio_samples,
                rendered: false,
            };
        }

        self.collect(master_slot, &mut fresh);

        for (slot, frame) in fresh.iter().enumerate() {
            if let Some(frame) = frame {
                self.account_audio(slot, frame);
            }
        }

        let committed = self.commit(fresh);
        let master_jitter = self.master_jitter(&beat);
        self.trim_queues(master_slot, now, beat.duration, master_jitter);

        let (pts, audio_samples) = self.emit_audio_tasks(&beat);

        let frames = CommittedFrameSet {
            pts,
            duration: beat.duration,
            timestamp: beat.timestamp,
            master: beat.master,
            sources: committed,
            routing: self.context.routing(),
        };
        self.renderer.render(frames);
        self.clock.advance(beat.duration);
        self.context.count_tick();

        TickOutcome {
            kind: beat.kind,
            master: beat.master,
            pts,
            duration: beat.duration,
            dropped_beats: beat.dropped,
            audio_samples,
            rendered: true,
        }
    }

    fn wait_for_master(&mut self, slot: usize) -> MasterBeat {
        if let Some(output) = self.output.as_mut().filter(|output| output.clock_master) {
            let beat = output.device.wait_for_frame(self.clock.pts());
            if !beat.is_preroll {
                self.output_jitter
                    .frame_arrived(beat.timestamp, beat.frame_duration, beat.dropped_frames);
            }
            if beat.dropped_frames > 0 {
                debug!(
                    "Output {} dropped {} beat(s)",
                    output.slot, beat.dropped_frames
                );
            }

            return MasterBeat {
                kind: TickKind::Normal,
                master: MasterClock::Output(output.slot),
                duration: beat.frame_duration,
                dropped: beat.dropped_frames,
                is_preroll: beat.is_preroll,
                timestamp: beat.timestamp,
                frame: None,
            };
        }

        let master = MasterClock::Input(slot);
        let deadline = Instant::now() + self.config.master_timeout;
        let context = &self.context;
        let frame = self.sources[slot]
            .queue()
            .pop_front_until(deadline, || context.is_shutting_down());

        match frame {
            Some(frame) => MasterBeat {
                kind: if frame.is_corrupted() {
                    warn!("Master source {slot} delivered a corrupted frame, skipping render");
                    TickKind::CorruptedMaster
                } else {
                    TickKind::Normal
                },
                master,
                duration: frame.duration(),
                dropped: frame.dropped_frames_before(),
                is_preroll: false,
                timestamp: frame.received_timestamp,
                frame: Some(frame),
            },
            None => {
                if !self.context.is_shutting_down() {
                    warn!(
                        "Master source {slot} did not deliver within {:?}, ticking anyway",
                        self.config.master_timeout
                    );
                }
                MasterBeat {
                    kind: TickKind::Timeout,
                    master,
                    duration: duration_to_timebase(self.config.master_timeout),
                    dropped: 0,
                    is_preroll: false,
                    timestamp: self.time.now(),
                    frame: None,
                }
            }
        }
    }

    fn master_jitter(&self, beat: &MasterBeat) -> Duration {
        match beat.master {
            MasterClock::Output(_) => self.output_jitter.estimate_max_jitter(),
            MasterClock::Input(slot) => self.sources[slot].queue().timing().max_jitter,
        }
    }

    /// Takes one frame from every other active source. A source with nothing
    /// new keeps showing its last frame.
    fn collect(&mut self, master_slot: Option<usize>, fresh: &mut [Option<BufferedFrame>]) {
        for source in self.sources.iter() {
            let slot = source.slot();
            if !source.is_active() || Some(slot) == master_slot {
                continue;
            }

            match source.queue().pop_front() {
                Some(frame) => fresh[slot] = Some(frame),
                None => {
                    SourceMetrics::add(&source.queue().metrics().duplicated_frames, 1);
                    if source.is_push_style() && source.queue().take_repaint_request() {
                        debug!("Source {slot} starved after a trim, asking for a repaint");
                        if let Some(backend) = source.backend.as_ref() {
                            backend.request_repaint();
                        }
                    }
                }
            }
        }
    }

    /// Feeds the frame's audio to its resampler, padding over lost frames and
    /// restarting it after a discontinuity.
    fn account_audio(&self, slot: usize, frame: &BufferedFrame) {
        match frame.gap {
            SequenceGap::Contiguous => (),
            SequenceGap::Dropped(count) => {
                trace!("Source {slot}: {count} frame(s) lost, padding audio with silence");
                self.audio.add_silence(slot, frame.duration(), count);
            }
            SequenceGap::Discontinuity(jump) => {
                warn!("Source {slot}: sequence discontinuity ({jump}), restarting its audio");
                self.audio.reset_resampler(slot);
                SourceMetrics::add(&self.sources[slot].queue().metrics().resets, 1);
            }
        }
        self.audio.add_audio(slot, &frame.audio);
    }

    /// Moves fresh frames into the histories and snapshots every active
    /// source for the renderer.
    fn commit(&mut self, mut fresh: Vec<Option<BufferedFrame>>) -> Vec<SourceFrames> {
        let mut committed = Vec::new();

        for source in self.sources.iter_mut() {
            if !source.is_active() {
                continue;
            }
            let slot = source.slot();

            let mut is_fresh = false;
            let mut needs_prepare = false;
            if let Some(frame) = fresh[slot].take() {
                // A corrupted frame was already counted; keep the old picture.
                if !frame.is_corrupted() {
                    let interlaced = frame.video.mode.interlaced;
                    let frame = Arc::new(frame);
                    needs_prepare = frame.mark_prepared();
                    source.history.commit(frame, interlaced);
                    is_fresh = true;
                }
            }

            committed.push(SourceFrames {
                slot,
                state: source.state(),
                history: source.history.snapshot(),
                fresh: is_fresh,
                needs_prepare,
            });
        }

        committed
    }

    /// Brings every non-master queue down to what its policy allows.
    fn trim_queues(
        &mut self,
        master_slot: Option<usize>,
        now: Instant,
        master_duration: i64,
        master_jitter: Duration,
    ) {
        let ceiling = self.config.hard_queue_ceiling;

        for source in self.sources.iter_mut() {
            if !source.is_active() || Some(source.slot()) == master_slot {
                continue;
            }

            let timing = source.queue().timing();
            let Some(expected_next_frame) = timing.expected_next_frame else {
                continue;
            };
            if timing.frame_duration <= 0 {
                continue;
            }

            let safe = source.policy.update_policy(
                now,
                expected_next_frame,
                timing.frame_duration,
                master_duration,
                timing.max_jitter,
                master_jitter,
            );
            let push_style = source.is_push_style();
            source.queue().trim(safe.min(ceiling), push_style);
        }
    }

    /// Emits one audio task per beat, the skipped ones first. Returns the
    /// pts of the last beat and the sample counts.
    fn emit_audio_tasks(&mut self, beat: &MasterBeat) -> (i64, Vec<usize>) {
        let mut samples = Vec::with_capacity(beat.dropped as usize + 1);

        for index in 0..=beat.dropped {
            let last = index == beat.dropped;
            let num_samples = self.samples.samples_for(beat.duration);
            self.dispatch.dispatch(AudioTask {
                pts: self.clock.pts(),
                num_samples,
                adjust_rate: last && beat.kind == TickKind::Normal && !beat.is_preroll,
                timestamp: beat.timestamp,
            });
            samples.push(num_samples);

            if !last {
                self.clock.advance(beat.duration);
            }
        }

        (self.clock.pts(), samples)
    }
}
