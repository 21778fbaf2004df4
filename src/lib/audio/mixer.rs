use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::*;

use super::{resampler::ResamplingQueue, task::AudioTask, AudioSink};
use crate::{frame::AudioPayload, source::MAX_SOURCES};

/// Changes to a source's queue, queued by the scheduler and applied by
/// whoever holds the queues next.
#[derive(Debug)]
enum QueueCommand {
    Audio(usize, AudioPayload),
    Silence {
        slot: usize,
        duration: i64,
        beats: u32,
    },
    Reset(usize),
    Remove(usize),
}

/// Per-source resampling queues, fed by the scheduler and drained by the
/// audio worker. The scheduler side only queues commands and never waits on
/// the lock, so resampling cannot hold up a tick.
#[derive(Debug)]
pub struct AudioMixer {
    commands: Sender<QueueCommand>,
    pending: Receiver<QueueCommand>,
    queues: Mutex<Vec<Option<ResamplingQueue>>>,
}

impl Default for AudioMixer {
    fn default() -> Self {
        let (commands, pending) = crossbeam_channel::unbounded();
        Self {
            commands,
            pending,
            queues: Mutex::new((0..MAX_SOURCES).map(|_| None).collect()),
        }
    }
}

impl AudioMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `command`, and applies the backlog right away when nobody is
    /// resampling. Never waits for the lock.
    fn send(&self, command: QueueCommand) {
        // Both ends live in `self`, so this cannot fail.
        let _ = self.commands.send(command);
        if let Some(mut queues) = self.queues.try_lock() {
            self.apply_pending(&mut queues);
        }
    }

    fn apply_pending(&self, queues: &mut [Option<ResamplingQueue>]) {
        for command in self.pending.try_iter() {
            apply(queues, command);
        }
    }

    /// Queues the audio that came with one frame. A format change starts a
    /// fresh queue.
    pub fn add_audio(&self, slot: usize, payload: &AudioPayload) {
        if slot < MAX_SOURCES {
            self.send(QueueCommand::Audio(slot, payload.clone()));
        }
    }

    /// Covers `beats` missing frames of `duration` each with silence.
    pub fn add_silence(&self, slot: usize, duration: i64, beats: u32) {
        self.send(QueueCommand::Silence {
            slot,
            duration,
            beats,
        });
    }

    pub fn reset_resampler(&self, slot: usize) {
        self.send(QueueCommand::Reset(slot));
    }

    /// Forgets the source entirely, until it sends audio again.
    pub fn remove_source(&self, slot: usize) {
        self.send(QueueCommand::Remove(slot));
    }

    pub fn has_source(&self, slot: usize) -> bool {
        matches!(self.queues().get(slot), Some(Some(_)))
    }

    pub fn buffered_frames(&self, slot: usize) -> Option<f64> {
        match self.queues().get(slot) {
            Some(Some(queue)) => Some(queue.buffered_frames()),
            _ => None,
        }
    }

    /// Locks the queues with every queued command applied.
    fn queues(&self) -> parking_lot::MutexGuard<'_, Vec<Option<ResamplingQueue>>> {
        let mut queues = self.queues.lock();
        self.apply_pending(&mut queues);
        queues
    }
}

fn apply(queues: &mut [Option<ResamplingQueue>], command: QueueCommand) {
    match command {
        QueueCommand::Audio(slot, payload) => {
            let Some(entry) = queues.get_mut(slot) else {
                return;
            };

            let same_format = matches!(entry, Some(queue) if queue.format() == payload.format);
            if !same_format {
                if entry.is_some() {
                    debug!("Source {slot}: audio format changed to {:?}", payload.format);
                }
                *entry = match ResamplingQueue::new(slot, payload.format) {
                    Ok(queue) => Some(queue),
                    Err(error) => {
                        warn!("Source {slot}: dropping audio: {error:#}");
                        None
                    }
                };
            }

            if let Some(queue) = entry {
                queue.add_samples(&payload);
            }
        }
        QueueCommand::Silence {
            slot,
            duration,
            beats,
        } => {
            if let Some(Some(queue)) = queues.get_mut(slot) {
                let frames = queue.format().samples_for(duration) * beats as usize;
                queue.add_silence(frames);
            }
        }
        QueueCommand::Reset(slot) => {
            if let Some(Some(queue)) = queues.get_mut(slot) {
                queue.reset();
            }
        }
        QueueCommand::Remove(slot) => {
            if let Some(entry) = queues.get_mut(slot) {
                entry.take();
            }
        }
    }
}

impl AudioSink for AudioMixer {
    fn process(&self, task: &AudioTask) -> Vec<f32> {
        let mut mixed = vec![0.0; task.num_samples * 2];

        for queue in self.queues().iter_mut().flatten() {
            let output = queue.get_output(task.num_samples, task.adjust_rate);
            for (mixed, sample) in mixed.iter_mut().zip(output) {
                *mixed += sample;
            }
        }

        mixed
    }
}
