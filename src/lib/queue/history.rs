use std::sync::Arc;

use ringbuffer::{AllocRingBuffer, RingBuffer};

use crate::frame::BufferedFrame;

/// Number of past frames kept per source for deinterlacing.
pub const HISTORY_DEPTH: usize = 5;

/// The last few committed frames of one source, newest first.
///
/// A progressive frame replaces the whole history, since older fields make no
/// sense for it; an interlaced one is shifted in at the front.
#[derive(Debug)]
pub struct RollingHistory {
    frames: AllocRingBuffer<Arc<BufferedFrame>>,
}

impl Default for RollingHistory {
    fn default() -> Self {
        Self {
            frames: AllocRingBuffer::new(HISTORY_DEPTH),
        }
    }
}

impl RollingHistory {
    pub fn commit(&mut self, frame: Arc<BufferedFrame>, interlaced: bool) {
        if !interlaced {
            self.frames.clear();
            for _ in 1..HISTORY_DEPTH {
                self.frames.push(frame.clone());
            }
        }
        self.frames.push(frame);
    }

    pub fn newest(&self) -> Option<&Arc<BufferedFrame>> {
        self.iter().next()
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BufferedFrame>> {
        self.frames.iter().rev()
    }

    pub fn snapshot(&self) -> Vec<Arc<BufferedFrame>> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
