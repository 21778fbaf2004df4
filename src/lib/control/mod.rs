//! Shared state between the scheduler and everyone else, and the handle
//! other threads use to steer the engine.

pub mod routing;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use tracing::*;

use crate::{
    capture::{validate_mode, CaptureBackend},
    frame::VideoMode,
    lifecycle::hotplug::{HotplugEvent, HotplugQueue},
    output::OutputAssignment,
    queue::source_queue::SourceQueue,
    source::{
        metrics::{SourceMetrics, SourceMetricsSnapshot},
        MAX_SOURCES,
    },
};
use routing::RoutingTable;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("Slot {0} is out of range, there are {max} slots", max = MAX_SOURCES)]
    InvalidSlot(usize),
    #[error("Video mode {0} is not supported")]
    InvalidMode(VideoMode),
    #[error("The engine is shutting down")]
    ShuttingDown,
}

/// Deferred work for the lifecycle manager, applied at the top of a tick.
#[derive(Debug)]
pub enum ControlRequest {
    ForceActive { slot: usize, active: bool },
    SetVideoMode { slot: usize, mode: VideoMode },
    SetOutput(Option<OutputAssignment>),
}

/// Everything the scheduler shares with other threads.
#[derive(Debug)]
pub struct MixerContext {
    shutdown: AtomicBool,
    master: AtomicUsize,
    ticks: AtomicU64,
    requests: Mutex<VecDeque<ControlRequest>>,
    hotplug: HotplugQueue,
    routing: RwLock<RoutingTable>,
    queues: Vec<Arc<SourceQueue>>,
}

impl MixerContext {
    pub fn new(hard_queue_ceiling: usize, master_slot: usize) -> Arc<Self> {
        assert!(master_slot < MAX_SOURCES, "invalid master slot {master_slot}");

        let queues = (0..MAX_SOURCES)
            .map(|slot| {
                Arc::new(SourceQueue::new(
                    slot,
                    hard_queue_ceiling,
                    Arc::new(SourceMetrics::default()),
                ))
            })
            .collect();

        Arc::new(Self {
            shutdown: AtomicBool::new(false),
            master: AtomicUsize::new(master_slot),
            ticks: AtomicU64::new(0),
            requests: Default::default(),
            hotplug: HotplugQueue::default(),
            routing: Default::default(),
            queues,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Raises the shutdown flag and wakes the scheduler if it is waiting on
    /// a source.
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!("Shutdown requested");
        }
        for queue in &self.queues {
            queue.wake();
        }
    }

    pub fn master_slot(&self) -> usize {
        self.master.load(Ordering::Acquire)
    }

    pub fn queue(&self, slot: usize) -> &Arc<SourceQueue> {
        &self.queues[slot]
    }

    pub fn hotplug(&self) -> &HotplugQueue {
        &self.hotplug
    }

    pub fn routing(&self) -> RoutingTable {
        self.routing.read().clone()
    }

    pub(crate) fn clear_routes_to(&self, slot: usize) -> Vec<usize> {
        self.routing.write().clear_slot(slot)
    }

    pub(crate) fn take_requests(&self) -> Vec<ControlRequest> {
        self.requests.lock().drain(..).collect()
    }

    pub(crate) fn count_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> Vec<SourceMetricsSnapshot> {
        self.queues
            .iter()
            .map(|queue| queue.metrics().snapshot(queue.slot()))
            .collect()
    }
}

/// Cloneable handle for steering the engine from any thread. Every change
/// takes effect at the top of the next tick.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    context: Arc<MixerContext>,
}

impl ControlPlane {
    pub fn new(context: Arc<MixerContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<MixerContext> {
        &self.context
    }

    fn check_slot(&self, slot: usize) -> Result<(), ControlError> {
        if self.context.is_shutting_down() {
            return Err(ControlError::ShuttingDown);
        }
        if slot >= MAX_SOURCES {
            return Err(ControlError::InvalidSlot(slot));
        }
        Ok(())
    }

    fn request(&self, request: ControlRequest) {
        debug!("Queued control request: {request:?}");
        self.context.requests.lock().push_back(request);
    }

    /// Makes `slot` the clock master. An inactive slot gets a filler.
    #[instrument(level = "debug", skip(self))]
    pub fn set_master(&self, slot: usize) -> Result<(), ControlError> {
        self.check_slot(slot)?;
        self.context.master.store(slot, Ordering::Release);
        Ok(())
    }

    /// Keeps `slot` visible (with a filler if nothing feeds it), or lets it
    /// retire again.
    pub fn force_active(&self, slot: usize, active: bool) -> Result<(), ControlError> {
        self.check_slot(slot)?;
        self.request(ControlRequest::ForceActive { slot, active });
        Ok(())
    }

    pub fn set_video_mode(&self, slot: usize, mode: VideoMode) -> Result<(), ControlError> {
        self.check_slot(slot)?;
        validate_mode(&mode).map_err(|_| ControlError::InvalidMode(mode))?;
        self.request(ControlRequest::SetVideoMode { slot, mode });
        Ok(())
    }

    /// Uses a slot as the output device, or releases the current one.
    pub fn set_output(&self, output: Option<OutputAssignment>) -> Result<(), ControlError> {
        match &output {
            Some(assignment) => self.check_slot(assignment.slot)?,
            None if self.context.is_shutting_down() => return Err(ControlError::ShuttingDown),
            None => (),
        }
        self.request(ControlRequest::SetOutput(output));
        Ok(())
    }

    /// Offers a new backend; it takes the first free slot.
    pub fn attach(&self, backend: CaptureBackend) -> Result<(), ControlError> {
        if self.context.is_shutting_down() {
            return Err(ControlError::ShuttingDown);
        }
        self.context.hotplug.push(HotplugEvent::Attached(backend));
        Ok(())
    }

    /// Removes whatever currently feeds `slot`, as if it was unplugged.
    pub fn detach(&self, slot: usize) -> Result<(), ControlError> {
        self.check_slot(slot)?;
        self.context.hotplug.push(HotplugEvent::Detached {
            slot,
            generation: self.context.queue(slot).generation(),
        });
        Ok(())
    }

    pub fn set_route(&self, signal: usize, slot: usize) -> Result<(), ControlError> {
        self.check_slot(slot)?;
        self.context.routing.write().set(signal, slot);
        Ok(())
    }

    pub fn remove_route(&self, signal: usize) -> Option<usize> {
        self.context.routing.write().remove(signal)
    }

    pub fn routing(&self) -> RoutingTable {
        self.context.routing()
    }

    pub fn metrics(&self) -> Vec<SourceMetricsSnapshot> {
        self.context.metrics()
    }

    pub fn shutdown(&self) {
        self.context.request_shutdown();
    }
}
