use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use super::SourceState;

/// Per-source counters. Written by the producer and the scheduler, read by
/// anyone through [`SourceMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct SourceMetrics {
    pub received_frames: AtomicU64,
    pub dropped_frames_error: AtomicU64,
    pub dropped_frames_latency: AtomicU64,
    pub duplicated_frames: AtomicU64,
    pub resets: AtomicU64,
    pub underestimated_jitter_frames: AtomicU64,
    pub queue_length_frames: AtomicU64,
    pub safe_queue_length_frames: AtomicU64,
    pub estimated_max_jitter_us: AtomicU64,
    state: AtomicU8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceMetricsSnapshot {
    pub slot: usize,
    pub state: SourceState,
    pub received_frames: u64,
    pub dropped_frames_error: u64,
    pub dropped_frames_latency: u64,
    pub duplicated_frames: u64,
    pub resets: u64,
    pub underestimated_jitter_frames: u64,
    pub queue_length_frames: u64,
    pub safe_queue_length_frames: u64,
    pub estimated_max_jitter_us: u64,
}

impl SourceMetrics {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self, slot: usize) -> SourceMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        SourceMetricsSnapshot {
            slot,
            state: self.state(),
            received_frames: load(&self.received_frames),
            dropped_frames_error: load(&self.dropped_frames_error),
            dropped_frames_latency: load(&self.dropped_frames_latency),
            duplicated_frames: load(&self.duplicated_frames),
            resets: load(&self.resets),
            underestimated_jitter_frames: load(&self.underestimated_jitter_frames),
            queue_length_frames: load(&self.queue_length_frames),
            safe_queue_length_frames: load(&self.safe_queue_length_frames),
            estimated_max_jitter_us: load(&self.estimated_max_jitter_us),
        }
    }
}
