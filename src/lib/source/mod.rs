pub mod metrics;
pub mod sequence;

use std::sync::Arc;

use serde::Serialize;
use tracing::*;

use crate::{
    capture::{CaptureBackend, CaptureBackendInterface},
    frame::VideoMode,
    queue::{history::RollingHistory, policy::QueueLengthPolicy, source_queue::SourceQueue},
};

/// Maximum number of capture slots the engine schedules.
pub const MAX_SOURCES: usize = 16;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SourceState {
    /// No backend, hidden.
    Inactive = 0,
    /// Synthetic filler keeping the slot visible.
    Fake = 1,
    /// Bound to a real or virtual backend.
    Live = 2,
    /// The slot serves as the output device, its live backend is parked and a
    /// filler runs in its place.
    OutputParked = 3,
}

impl SourceState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SourceState::Inactive,
            1 => SourceState::Fake,
            2 => SourceState::Live,
            3 => SourceState::OutputParked,
            _ => unreachable!("Invalid source state: {value}"),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, SourceState::Inactive)
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceState::Inactive => "inactive",
            SourceState::Fake => "fake",
            SourceState::Live => "live",
            SourceState::OutputParked => "output-parked",
        };
        write!(f, "{name}")
    }
}

/// Scheduler-side state of one capture slot. Only the scheduler thread
/// touches it; the producer side only sees [`SourceQueue`].
#[derive(Debug)]
pub struct Source {
    slot: usize,
    state: SourceState,
    pub(crate) backend: Option<CaptureBackend>,
    /// Live backend set aside while the slot serves as the output device.
    pub(crate) parked: Option<CaptureBackend>,
    pub(crate) queue: Arc<SourceQueue>,
    pub(crate) policy: QueueLengthPolicy,
    pub(crate) history: RollingHistory,
    pub(crate) mode: VideoMode,
    pub(crate) forced_active: bool,
}

impl Source {
    pub fn new(queue: Arc<SourceQueue>, mode: VideoMode) -> Self {
        queue.metrics().set_state(SourceState::Inactive);

        Self {
            slot: queue.slot(),
            state: SourceState::Inactive,
            backend: None,
            parked: None,
            queue,
            policy: QueueLengthPolicy::new(),
            history: RollingHistory::default(),
            mode,
            forced_active: false,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SourceState) {
        if self.state != state {
            debug!("Source {}: {} -> {state}", self.slot, self.state);
        }
        self.state = state;
        self.queue.metrics().set_state(state);
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn queue(&self) -> &Arc<SourceQueue> {
        &self.queue
    }

    pub fn mode(&self) -> VideoMode {
        self.mode
    }

    pub fn forced_active(&self) -> bool {
        self.forced_active
    }

    pub fn is_push_style(&self) -> bool {
        self.backend
            .as_ref()
            .map(CaptureBackendInterface::is_push_style)
            .unwrap_or(false)
    }

    pub fn description(&self) -> String {
        self.backend
            .as_ref()
            .map(CaptureBackendInterface::description)
            .unwrap_or_else(|| "none".to_string())
    }

    /// Forgets everything learned about the stream feeding this slot.
    pub(crate) fn reset_stream_state(&mut self) {
        self.policy.reset();
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::metrics::SourceMetrics;

    #[test]
    fn state_survives_the_metrics_round_trip() {
        for state in [
            SourceState::Inactive,
            SourceState::Fake,
            SourceState::Live,
            SourceState::OutputParked,
        ] {
            assert_eq!(SourceState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn new_source_is_inactive() {
        let queue = Arc::new(SourceQueue::new(
            3,
            8,
            Arc::new(SourceMetrics::default()),
        ));
        let mut source = Source::new(queue.clone(), VideoMode::default());
        assert_eq!(source.slot(), 3);
        assert!(!source.is_active());
        assert!(!source.is_push_style());

        source.set_state(SourceState::Fake);
        assert_eq!(queue.metrics().state(), SourceState::Fake);
        assert_eq!(queue.metrics().snapshot(3).state, SourceState::Fake);
    }
}
