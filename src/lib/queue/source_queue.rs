//! Bounded FIFO of arrived-but-unconsumed frames for one source.
//!
//! The producer thread pushes under a short critical section and never waits
//! for the scheduler; the scheduler pops, waits on it when the source is the
//! master, and trims it. Nobody else touches it.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::*;

use crate::{
    clock::jitter::JitterEstimator,
    frame::{BufferedFrame, CapturedFrame, SequenceGap, VideoPayload},
    source::{
        metrics::SourceMetrics,
        sequence::{max_plausible_gap, unwrap_sequence},
    },
};

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<BufferedFrame>,
    jitter: JitterEstimator,
    last_sequence: Option<i64>,
    /// Bumped whenever the backend feeding this queue is replaced, so late
    /// frames from a stopped producer are refused.
    generation: u64,
    may_have_dropped_last_frame: bool,
}

/// Timing information the queue length policy needs about one source.
#[derive(Debug, Clone, Copy)]
pub struct QueueTiming {
    pub expected_next_frame: Option<Instant>,
    pub max_jitter: Duration,
    pub frame_duration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrimOutcome {
    pub dropped: usize,
    /// Outstanding frames left, dropped-before counts included.
    pub remaining: usize,
}

#[derive(Debug)]
pub struct SourceQueue {
    slot: usize,
    hard_ceiling: usize,
    state: Mutex<QueueState>,
    changed: Condvar,
    metrics: Arc<SourceMetrics>,
}

impl SourceQueue {
    pub fn new(slot: usize, hard_ceiling: usize, metrics: Arc<SourceMetrics>) -> Self {
        assert!(hard_ceiling > 0, "source queues need room for at least one frame");

        Self {
            slot,
            hard_ceiling,
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
            metrics,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn metrics(&self) -> &Arc<SourceMetrics> {
        &self.metrics
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Drops everything buffered and learned, and starts a new generation.
    /// Frames pushed with an older generation are refused from now on.
    pub fn reset(&self) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            let generation = state.generation + 1;
            *state = QueueState {
                generation,
                ..Default::default()
            };
            generation
        };

        SourceMetrics::set(&self.metrics.queue_length_frames, 0);
        SourceMetrics::set(&self.metrics.safe_queue_length_frames, 0);
        self.changed.notify_all();
        generation
    }

    /// Producer side of the queue. Returns false if the frame came from a
    /// backend that has been replaced in the meantime.
    pub fn push(&self, generation: u64, captured: CapturedFrame) -> bool {
        let CapturedFrame {
            sequence,
            video,
            audio,
            timestamp,
        } = captured;

        let mode = video.mode;
        let duration = mode.frame_duration();
        let corrupted_length = video.is_corrupted().then(|| video.len());
        let mut evicted = 0;

        let (gap, queue_length) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }

            let gap = match state.last_sequence {
                None => {
                    state.last_sequence = Some(sequence as i64);
                    SequenceGap::Contiguous
                }
                Some(last) => {
                    let unwrapped = unwrap_sequence(sequence, last);
                    state.last_sequence = Some(unwrapped);
                    match unwrapped - last - 1 {
                        0 => SequenceGap::Contiguous,
                        gap if gap > max_plausible_gap(mode.nominal_fps()) => {
                            SequenceGap::Discontinuity(gap)
                        }
                        gap => SequenceGap::Dropped(gap as u32),
                    }
                }
            };

            state
                .jitter
                .frame_arrived(timestamp, duration, gap.dropped_frames());

            // A corrupted frame is still queued, so the clock can account for
            // the time it stood for, but its payload goes back right away.
            let video = match corrupted_length {
                Some(_) => VideoPayload::corrupted(mode),
                None => video,
            };

            while state.frames.len() >= self.hard_ceiling {
                state.frames.pop_front();
                evicted += 1;
            }

            state
                .frames
                .push_back(BufferedFrame::new(video, audio, gap, timestamp));

            SourceMetrics::set(
                &self.metrics.underestimated_jitter_frames,
                state.jitter.underestimated_frames(),
            );
            SourceMetrics::set(
                &self.metrics.estimated_max_jitter_us,
                state.jitter.estimate_max_jitter().as_micros() as u64,
            );

            (gap, state.frames.len())
        };
        self.changed.notify_all();

        SourceMetrics::add(&self.metrics.received_frames, 1);
        SourceMetrics::set(&self.metrics.queue_length_frames, queue_length as u64);
        if evicted > 0 {
            SourceMetrics::add(&self.metrics.dropped_frames_latency, evicted);
            debug!(
                "Source {}: queue at its ceiling of {} frames, dropped {evicted} oldest",
                self.slot, self.hard_ceiling
            );
        }
        if let Some(length) = corrupted_length {
            SourceMetrics::add(&self.metrics.dropped_frames_error, 1);
            if length != 0 {
                warn!(
                    "Source {}: dropping video frame with wrong length ({length}; expected {})",
                    self.slot,
                    mode.frame_size()
                );
            }
        }
        match gap {
            SequenceGap::Dropped(count) => {
                debug!("Source {}: {count} frame(s) dropped before sequence {sequence:#06x}", self.slot)
            }
            SequenceGap::Discontinuity(count) => warn!(
                "Source {}: sequence jumped by {count} before {sequence:#06x}, treating as a discontinuity",
                self.slot
            ),
            SequenceGap::Contiguous => (),
        }

        true
    }

    pub fn pop_front(&self) -> Option<BufferedFrame> {
        let (frame, length) = {
            let mut state = self.state.lock();
            let frame = state.frames.pop_front();
            (frame, state.frames.len())
        };
        SourceMetrics::set(&self.metrics.queue_length_frames, length as u64);
        frame
    }

    /// Blocks until a frame is available, `deadline` passes, or `cancelled`
    /// returns true after a [`Self::wake`].
    pub fn pop_front_until(
        &self,
        deadline: Instant,
        cancelled: impl Fn() -> bool,
    ) -> Option<BufferedFrame> {
        let (frame, length) = {
            let mut state = self.state.lock();
            while state.frames.is_empty() && !cancelled() {
                if self.changed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            let frame = state.frames.pop_front();
            (frame, state.frames.len())
        };
        SourceMetrics::set(&self.metrics.queue_length_frames, length as u64);
        frame
    }

    /// Wakes up anyone blocked in [`Self::pop_front_until`].
    pub fn wake(&self) {
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding frames, counting the dropped frames attached to entries.
    pub fn outstanding_frames(&self) -> usize {
        self.state
            .lock()
            .frames
            .iter()
            .map(BufferedFrame::queue_weight)
            .sum()
    }

    pub fn timing(&self) -> QueueTiming {
        let state = self.state.lock();
        QueueTiming {
            expected_next_frame: state.jitter.get_expected_next_frame(),
            max_jitter: state.jitter.estimate_max_jitter(),
            frame_duration: state.jitter.last_duration(),
        }
    }

    /// Drops the oldest frames until at most `safe_length` are outstanding.
    ///
    /// For push-style sources, emptying the queue raises the flag read by
    /// [`Self::take_repaint_request`], since such a backend will not resend
    /// the frame we just threw away on its own.
    pub fn trim(&self, safe_length: usize, push_style: bool) -> TrimOutcome {
        let outcome = {
            let mut state = self.state.lock();
            let outcome = trim_front(&mut state.frames, safe_length);
            if push_style && outcome.dropped > 0 && state.frames.is_empty() {
                state.may_have_dropped_last_frame = true;
            }
            outcome
        };

        if outcome.dropped > 0 {
            self.changed.notify_all();
            SourceMetrics::add(&self.metrics.dropped_frames_latency, outcome.dropped as u64);
            trace!(
                "Source {}: trimmed {} frame(s) to reach {safe_length}",
                self.slot,
                outcome.dropped
            );
        }
        SourceMetrics::set(&self.metrics.queue_length_frames, outcome.remaining as u64);
        SourceMetrics::set(&self.metrics.safe_queue_length_frames, safe_length as u64);

        outcome
    }

    /// True once after a trim emptied a push-style source.
    pub fn take_repaint_request(&self) -> bool {
        std::mem::take(&mut self.state.lock().may_have_dropped_last_frame)
    }
}

/// Removes entries from the front of `frames` while more than `safe_length`
/// frames are outstanding, each entry counting itself plus the frames dropped
/// right before it.
///
/// The dropped frames attached to the front entry are discounted first; if
/// that alone is enough the entry stays, so we never trim more than needed.
pub fn trim_front(frames: &mut VecDeque<BufferedFrame>, safe_length: usize) -> TrimOutcome {
    let mut queue_length: usize = frames.iter().map(BufferedFrame::queue_weight).sum();
    let mut dropped = 0;

    while queue_length > safe_length {
        let front = frames
            .front()
            .expect("outstanding frames counted in an empty queue");
        let dropped_before = front.dropped_frames_before() as usize;
        assert!(queue_length > dropped_before);
        queue_length -= dropped_before;

        if queue_length <= safe_length {
            break;
        }

        frames.pop_front();
        queue_length -= 1;
        dropped += 1;
    }

    TrimOutcome {
        dropped,
        remaining: queue_length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{pool::FramePool, AudioPayload, VideoMode};

    const MODE: VideoMode = VideoMode::new(4, 2, 60, 1);

    fn entry(dropped_before: u32, tag: u8, pool: &FramePool) -> BufferedFrame {
        let mut lease = pool.acquire().unwrap();
        lease.write(MODE.frame_size(), |bytes| bytes.fill(tag)).unwrap();
        let gap = if dropped_before == 0 {
            SequenceGap::Contiguous
        } else {
            SequenceGap::Dropped(dropped_before)
        };
        BufferedFrame::new(
            VideoPayload::new(lease, MODE),
            AudioPayload::default(),
            gap,
            Instant::now(),
        )
    }

    fn tag(frame: &BufferedFrame) -> u8 {
        frame.video.frame.as_ref().unwrap().read(|bytes| bytes[0]).unwrap()
    }

    fn captured(pool: &FramePool, sequence: u16, timestamp: Instant) -> CapturedFrame {
        let mut lease = pool.acquire().unwrap();
        lease.write(MODE.frame_size(), |bytes| bytes.fill(sequence as u8)).unwrap();
        CapturedFrame {
            sequence,
            video: VideoPayload::new(lease, MODE),
            audio: AudioPayload::default(),
            timestamp,
        }
    }

    fn queue(ceiling: usize) -> SourceQueue {
        SourceQueue::new(0, ceiling, Arc::new(SourceMetrics::default()))
    }

    #[test]
    fn trim_drops_oldest_first() {
        let pool = FramePool::new(8, MODE.frame_size());
        let mut frames: VecDeque<_> = (1..=4).map(|tag| entry(0, tag, &pool)).collect();

        let outcome = trim_front(&mut frames, 1);

        assert_eq!(outcome, TrimOutcome { dropped: 3, remaining: 1 });
        assert_eq!(frames.iter().map(tag).collect::<Vec<_>>(), vec![4]);
        // Trimmed payloads went back to the pool.
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn trim_never_over_trims() {
        let pool = FramePool::new(8, MODE.frame_size());
        let mut frames: VecDeque<_> = (1..=3).map(|tag| entry(0, tag, &pool)).collect();

        assert_eq!(trim_front(&mut frames, 3), TrimOutcome { dropped: 0, remaining: 3 });
        assert_eq!(trim_front(&mut frames, 5), TrimOutcome { dropped: 0, remaining: 3 });
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn dropped_counts_are_discounted_before_removing() {
        let pool = FramePool::new(8, MODE.frame_size());
        // Weights 3 + 1 + 1 = 5.
        let mut frames: VecDeque<_> = vec![entry(2, 1, &pool), entry(0, 2, &pool), entry(0, 3, &pool)].into();

        // Forgetting the two dropped frames is enough, nothing is removed.
        assert_eq!(trim_front(&mut frames, 3), TrimOutcome { dropped: 0, remaining: 3 });
        assert_eq!(frames.len(), 3);

        let mut frames: VecDeque<_> = vec![entry(2, 1, &pool), entry(0, 2, &pool), entry(0, 3, &pool)].into();
        assert_eq!(trim_front(&mut frames, 1), TrimOutcome { dropped: 2, remaining: 1 });
        assert_eq!(frames.iter().map(tag).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn trim_to_zero_empties_queue() {
        let pool = FramePool::new(8, MODE.frame_size());
        let mut frames: VecDeque<_> = (1..=2).map(|tag| entry(1, tag, &pool)).collect();
        assert_eq!(trim_front(&mut frames, 0), TrimOutcome { dropped: 2, remaining: 0 });
        assert!(frames.is_empty());
    }

    #[test]
    fn push_computes_gaps_and_resyncs() {
        let pool = FramePool::new(8, MODE.frame_size());
        let queue = queue(8);
        let generation = queue.generation();
        let now = Instant::now();

        assert!(queue.push(generation, captured(&pool, 0xfffe, now)));
        assert!(queue.push(generation, captured(&pool, 0x0001, now)));
        assert!(queue.push(generation, captured(&pool, 0x0400, now)));

        assert_eq!(queue.pop_front().unwrap().gap, SequenceGap::Contiguous);
        assert_eq!(queue.pop_front().unwrap().gap, SequenceGap::Dropped(2));
        assert_eq!(queue.pop_front().unwrap().gap, SequenceGap::Discontinuity(0x3fe));
        assert_eq!(queue.metrics().received_frames.load(std::sync::atomic::Ordering::Relaxed), 3);
    }

    #[test]
    fn hard_ceiling_evicts_oldest() {
        let pool = FramePool::new(8, MODE.frame_size());
        let queue = queue(2);
        let generation = queue.generation();
        let now = Instant::now();
        for sequence in 1..=4 {
            queue.push(generation, captured(&pool, sequence, now));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(tag(&queue.pop_front().unwrap()), 3);
        assert_eq!(
            queue
                .metrics()
                .dropped_frames_latency
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn stale_generation_is_refused() {
        let pool = FramePool::new(8, MODE.frame_size());
        let queue = queue(4);
        let old = queue.generation();
        queue.push(old, captured(&pool, 1, Instant::now()));

        let new = queue.reset();
        assert_ne!(old, new);
        assert!(queue.is_empty());
        assert!(!queue.push(old, captured(&pool, 2, Instant::now())));
        assert!(queue.push(new, captured(&pool, 3, Instant::now())));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn corrupted_frames_are_queued_without_payload() {
        let pool = FramePool::new(8, MODE.frame_size());
        let queue = queue(4);
        let frame = CapturedFrame {
            sequence: 9,
            video: VideoPayload::corrupted(MODE),
            audio: AudioPayload::default(),
            timestamp: Instant::now(),
        };
        queue.push(queue.generation(), frame);

        let mut lease = pool.acquire().unwrap();
        lease.write(3, |_| ()).unwrap();
        queue.push(
            queue.generation(),
            CapturedFrame {
                sequence: 10,
                video: VideoPayload::new(lease, MODE),
                audio: AudioPayload::default(),
                timestamp: Instant::now(),
            },
        );

        assert!(queue.pop_front().unwrap().is_corrupted());
        assert!(queue.pop_front().unwrap().is_corrupted());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(
            queue
                .metrics()
                .dropped_frames_error
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn emptying_a_push_style_source_requests_repaint() {
        let pool = FramePool::new(8, MODE.frame_size());
        let queue = queue(4);
        queue.push(queue.generation(), captured(&pool, 1, Instant::now()));

        queue.trim(0, true);
        assert!(queue.take_repaint_request());
        assert!(!queue.take_repaint_request());
    }

    #[test]
    fn waiting_times_out_on_an_empty_queue() {
        let queue = queue(4);
        let start = Instant::now();
        assert!(queue
            .pop_front_until(start + Duration::from_millis(20), || false)
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
