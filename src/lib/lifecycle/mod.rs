//! Moves capture slots between their lifecycle states. Runs only on the
//! scheduler thread, at the top of a tick.

pub mod hotplug;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::*;

use crate::{
    audio::mixer::AudioMixer,
    capture::{fake::FakeCapture, CaptureBackend, CaptureBackendInterface, FrameSink},
    control::{ControlRequest, MixerContext},
    frame::VideoMode,
    output::{ActiveOutput, OutputAssignment},
    source::{Source, SourceState},
};
use hotplug::HotplugEvent;

#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Slots below this index always show something, a filler if needed.
    pub min_sources: usize,
    pub fake_mode: VideoMode,
}

#[derive(Debug)]
pub struct LifecycleManager {
    context: Arc<MixerContext>,
    audio: Arc<AudioMixer>,
    policy: LifecyclePolicy,
}

impl LifecycleManager {
    pub fn new(context: Arc<MixerContext>, audio: Arc<AudioMixer>, policy: LifecyclePolicy) -> Self {
        Self {
            context,
            audio,
            policy,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Installs fillers on the slots that must be visible from the start.
    #[instrument(level = "debug", skip_all)]
    pub fn initialize(&self, sources: &mut [Source]) {
        for source in sources.iter_mut() {
            if !source.is_active() && self.must_remain_visible(source) {
                self.retire_or_fill(source);
            }
        }
    }

    /// Applies every queued request and hotplug notification, in arrival
    /// order. This is the only place slots change state. Returns the master
    /// slot that was given a backend, which is the one to wait on this tick.
    pub fn apply(
        &self,
        sources: &mut [Source],
        output: &mut Option<ActiveOutput>,
        pts: i64,
    ) -> usize {
        for request in self.context.take_requests() {
            self.apply_request(sources, output, request, pts);
        }

        for event in self.context.hotplug().drain() {
            self.apply_hotplug(sources, event);
        }

        // Whatever slot was picked as master has to produce beats.
        let master = self.context.master_slot();
        if let Some(source) = sources.get_mut(master) {
            if !source.is_active() {
                info!("Source {master} is the clock master, installing a filler");
                self.retire_or_fill(source);
            }
        }
        master
    }

    /// Stops every producer and the output. Nothing runs afterwards.
    #[instrument(level = "debug", skip_all)]
    pub fn shutdown(&self, sources: &mut [Source], output: &mut Option<ActiveOutput>) {
        if let Some(mut active) = output.take() {
            active.device.end_output();
        }

        for source in sources.iter_mut() {
            stop_backend(source);
            if let Some(mut parked) = source.parked.take() {
                parked.stop();
            }
            source.set_state(SourceState::Inactive);
        }
    }

    fn must_remain_visible(&self, source: &Source) -> bool {
        source.slot() < self.policy.min_sources
            || source.forced_active()
            || source.slot() == self.context.master_slot()
    }

    fn apply_request(
        &self,
        sources: &mut [Source],
        output: &mut Option<ActiveOutput>,
        request: ControlRequest,
        pts: i64,
    ) {
        match request {
            ControlRequest::ForceActive { slot, active } => {
                let Some(source) = sources.get_mut(slot) else {
                    return;
                };
                source.forced_active = active;

                match source.state() {
                    SourceState::Inactive if active => self.retire_or_fill(source),
                    SourceState::Fake if !self.must_remain_visible(source) => {
                        self.retire_or_fill(source)
                    }
                    _ => (),
                }
            }
            ControlRequest::SetVideoMode { slot, mode } => {
                if let Some(source) = sources.get_mut(slot) {
                    self.change_video_mode(source, mode);
                }
            }
            ControlRequest::SetOutput(assignment) => {
                self.release_output(sources, output);
                if let Some(assignment) = assignment {
                    *output = self.take_output(sources, assignment, pts);
                }
            }
        }
    }

    fn apply_hotplug(&self, sources: &mut [Source], event: HotplugEvent) {
        match event {
            HotplugEvent::Attached(backend) => {
                let free = sources
                    .iter()
                    .position(|source| source.state() == SourceState::Fake)
                    .or_else(|| sources.iter().position(|source| !source.is_active()));

                let Some(slot) = free else {
                    warn!(
                        "No free slot for {}, ignoring it",
                        backend.description()
                    );
                    return;
                };

                let source = &mut sources[slot];
                let mode = backend.video_mode();
                info!("Source {slot}: attaching {}", backend.description());
                if let Err(error) = self.activate(source, backend, mode, SourceState::Live) {
                    error!("Source {slot}: failed activating backend: {error:?}");
                    self.retire_or_fill(source);
                }
            }
            HotplugEvent::Detached { slot, generation } => {
                let Some(source) = sources.get_mut(slot) else {
                    return;
                };
                if source.queue().generation() != generation {
                    debug!("Source {slot}: ignoring stale detach notification");
                    return;
                }

                match source.state() {
                    SourceState::Inactive => (),
                    SourceState::OutputParked => {
                        warn!("Source {slot} is in use as output, ignoring detach");
                    }
                    state => {
                        if state == SourceState::Live {
                            warn!("Source {slot}: {} disconnected", source.description());
                        }
                        stop_backend(source);
                        self.retire_or_fill(source);

                        let signals = self.context.clear_routes_to(slot);
                        if !signals.is_empty() {
                            info!("Source {slot}: cleared routing of signals {signals:?}");
                        }
                    }
                }
            }
        }
    }

    /// Starts `backend` on `source`, replacing whatever fed it. On error the
    /// slot is left without a backend.
    fn activate(
        &self,
        source: &mut Source,
        mut backend: CaptureBackend,
        mode: VideoMode,
        state: SourceState,
    ) -> Result<()> {
        stop_backend(source);
        let generation = source.queue().reset();
        source.reset_stream_state();
        self.audio.remove_source(source.slot());

        backend
            .configure(&mode)
            .with_context(|| format!("Failed configuring {} to {mode}", backend.description()))?;

        // Make sure a half-started backend never keeps running.
        let mut backend = scopeguard::guard(backend, |mut backend| backend.stop());
        let sink = FrameSink::new(
            source.queue().clone(),
            generation,
            self.context.hotplug().clone(),
        );
        backend
            .start(sink)
            .with_context(|| format!("Failed starting {}", backend.description()))?;
        let backend = scopeguard::ScopeGuard::into_inner(backend);

        source.backend = Some(backend);
        source.mode = mode;
        source.set_state(state);
        Ok(())
    }

    /// After a slot lost its backend: a filler if it must stay visible,
    /// inactive otherwise.
    fn retire_or_fill(&self, source: &mut Source) {
        if self.must_remain_visible(source) {
            let fake = CaptureBackend::Fake(FakeCapture::new(self.policy.fake_mode));
            match self.activate(source, fake, self.policy.fake_mode, SourceState::Fake) {
                Ok(()) => return,
                Err(error) => error!("Source {}: failed installing filler: {error:?}", source.slot()),
            }
        }

        stop_backend(source);
        source.queue().reset();
        source.reset_stream_state();
        self.audio.remove_source(source.slot());
        source.set_state(SourceState::Inactive);
    }

    fn change_video_mode(&self, source: &mut Source, mode: VideoMode) {
        let slot = source.slot();
        let Some(backend) = source.backend.take() else {
            source.mode = mode;
            return;
        };

        info!("Source {slot}: switching to {mode}");
        let state = source.state();
        if let Err(error) = self.activate(source, backend, mode, state) {
            error!("Source {slot}: failed changing video mode: {error:?}");
            self.retire_or_fill(source);
        }
    }

    fn take_output(
        &self,
        sources: &mut [Source],
        mut assignment: OutputAssignment,
        pts: i64,
    ) -> Option<ActiveOutput> {
        let slot = assignment.slot;
        let source = sources.get_mut(slot)?;

        let desired = if source.is_active() {
            source.mode()
        } else {
            self.policy.fake_mode
        };
        let mode = assignment.device.pick_video_mode(&desired);
        if let Err(error) = assignment.device.start_output(mode, pts) {
            error!("Failed starting output on slot {slot}: {error:?}");
            return None;
        }

        // The slot's input side stays visible with a filler while the live
        // backend waits.
        if source.state() == SourceState::Live {
            if let Some(mut live) = source.backend.take() {
                live.stop();
                info!("Source {slot}: parking {} while in use as output", live.description());
                source.parked = Some(live);
            }
        }

        let fake = CaptureBackend::Fake(FakeCapture::new(mode));
        if let Err(error) = self.activate(source, fake, mode, SourceState::OutputParked) {
            error!("Source {slot}: failed installing output filler: {error:?}");
            assignment.device.end_output();
            self.resume_parked(source);
            return None;
        }

        info!("Using {} on slot {slot} as output", assignment.device.description());
        Some(ActiveOutput {
            slot,
            device: assignment.device,
            clock_master: assignment.clock_master,
            mode,
        })
    }

    fn release_output(&self, sources: &mut [Source], output: &mut Option<ActiveOutput>) {
        let Some(mut active) = output.take() else {
            return;
        };

        info!("Releasing output on slot {}", active.slot);
        active.device.end_output();
        if let Some(source) = sources.get_mut(active.slot) {
            self.resume_parked(source);
        }
    }

    fn resume_parked(&self, source: &mut Source) {
        match source.parked.take() {
            Some(parked) => {
                let mode = parked.video_mode();
                info!("Source {}: resuming {}", source.slot(), parked.description());
                if let Err(error) = self.activate(source, parked, mode, SourceState::Live) {
                    error!("Source {}: failed resuming parked backend: {error:?}", source.slot());
                    self.retire_or_fill(source);
                }
            }
            None => {
                stop_backend(source);
                self.retire_or_fill(source);
            }
        }
    }
}

fn stop_backend(source: &mut Source) {
    if let Some(mut backend) = source.backend.take() {
        backend.stop();
    }
}
