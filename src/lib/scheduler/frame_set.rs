use std::{sync::Arc, time::Instant};

use serde::Serialize;

use crate::{control::routing::RoutingTable, frame::BufferedFrame, source::SourceState};

/// What paced this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MasterClock {
    Output(usize),
    Input(usize),
}

/// One active slot as seen by the renderer.
#[derive(Debug, Clone)]
pub struct SourceFrames {
    pub slot: usize,
    pub state: SourceState,
    /// Newest first. Empty until the first good frame arrived.
    pub history: Vec<Arc<BufferedFrame>>,
    /// Whether the newest entry arrived during this tick.
    pub fresh: bool,
    /// The newest frame still needs its upload; only the first consumer sees
    /// this set.
    pub needs_prepare: bool,
}

/// Everything the renderer gets for one output frame.
#[derive(Debug, Clone)]
pub struct CommittedFrameSet {
    pub pts: i64,
    pub duration: i64,
    pub timestamp: Instant,
    pub master: MasterClock,
    pub sources: Vec<SourceFrames>,
    pub routing: RoutingTable,
}

impl CommittedFrameSet {
    pub fn source(&self, slot: usize) -> Option<&SourceFrames> {
        self.sources.iter().find(|frames| frames.slot == slot)
    }

    /// The slot shown as `signal`, if it is routed and active.
    pub fn signal(&self, signal: usize) -> Option<&SourceFrames> {
        self.routing
            .slot_for(signal)
            .and_then(|slot| self.source(slot))
    }
}

/// Consumer of committed frame sets. Called on the scheduler thread once per
/// rendered tick, so it must hand the work off rather than block.
pub trait Renderer: Send {
    fn render(&mut self, frames: CommittedFrameSet);
}
