//! Hands audio tasks from the scheduler to the audio worker thread.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::*;

use super::{task::AudioTask, AudioOutput, AudioSink};
use crate::helper::threads::{join_logged, spawn_named};

/// How long the worker waits for a task before checking for shutdown.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Scheduler side of the task queue. Never blocks.
#[derive(Debug, Clone)]
pub struct AudioTaskDispatch {
    sender: Sender<AudioTask>,
}

impl AudioTaskDispatch {
    pub fn dispatch(&self, task: AudioTask) {
        if self.sender.send(task).is_err() {
            trace!("Audio worker is gone, dropping task for pts {}", task.pts);
        }
    }

    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

pub fn audio_task_channel() -> (AudioTaskDispatch, Receiver<AudioTask>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (AudioTaskDispatch { sender }, receiver)
}

#[derive(Debug, Default)]
pub struct AudioWorkerStats {
    pub tasks: AtomicU64,
    pub samples: AtomicU64,
    pub rate_adjusting_tasks: AtomicU64,
}

#[derive(Debug)]
pub struct AudioWorker {
    stop: Arc<AtomicBool>,
    stats: Arc<AudioWorkerStats>,
    handle: Option<JoinHandle<()>>,
}

impl AudioWorker {
    #[instrument(level = "debug", skip_all)]
    pub fn spawn(
        receiver: Receiver<AudioTask>,
        sink: Arc<dyn AudioSink>,
        mut output: Box<dyn AudioOutput>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(AudioWorkerStats::default());

        let handle = spawn_named("audio-worker", {
            let stop = stop.clone();
            let stats = stats.clone();
            move || {
                debug!("Audio worker task started!");

                let mut run = |task: AudioTask| {
                    let pcm = sink.process(&task);
                    output.consume(&task, &pcm);

                    stats.tasks.fetch_add(1, Ordering::Relaxed);
                    stats
                        .samples
                        .fetch_add(task.num_samples as u64, Ordering::Relaxed);
                    if task.adjust_rate {
                        stats.rate_adjusting_tasks.fetch_add(1, Ordering::Relaxed);
                    }
                };

                loop {
                    match receiver.recv_timeout(WORKER_POLL_INTERVAL) {
                        Ok(task) => run(task),
                        Err(RecvTimeoutError::Timeout) => {
                            if stop.load(Ordering::Acquire) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                // Whatever the scheduler emitted before stopping still
                // belongs to the output.
                for task in receiver.try_iter() {
                    run(task);
                }

                debug!("Audio worker task finished");
            }
        })?;

        Ok(Self {
            stop,
            stats,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> &Arc<AudioWorkerStats> {
        &self.stats
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            join_logged("audio-worker", handle);
        }
    }
}

impl Drop for AudioWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        tasks: Arc<Mutex<Vec<(AudioTask, usize)>>>,
    }

    impl AudioOutput for Recorder {
        fn consume(&mut self, task: &AudioTask, pcm: &[f32]) {
            self.tasks.lock().push((*task, pcm.len()));
        }
    }

    struct Silence;

    impl AudioSink for Silence {
        fn process(&self, task: &AudioTask) -> Vec<f32> {
            vec![0.0; task.num_samples * 2]
        }
    }

    fn task(pts: i64, adjust_rate: bool) -> AudioTask {
        AudioTask {
            pts,
            num_samples: 800,
            adjust_rate,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn tasks_are_processed_in_order() {
        let recorder = Recorder::default();
        let tasks = recorder.tasks.clone();
        let (dispatch, receiver) = audio_task_channel();
        let mut worker = AudioWorker::spawn(receiver, Arc::new(Silence), Box::new(recorder)).unwrap();

        dispatch.dispatch(task(0, false));
        dispatch.dispatch(task(2002, true));
        dispatch.dispatch(task(4004, true));
        drop(dispatch);
        worker.stop();

        let tasks = tasks.lock();
        assert_eq!(
            tasks.iter().map(|(task, _)| task.pts).collect::<Vec<_>>(),
            vec![0, 2002, 4004]
        );
        assert!(tasks.iter().all(|(_, len)| *len == 1600));
        assert_eq!(worker.stats().tasks.load(Ordering::Relaxed), 3);
        assert_eq!(worker.stats().rate_adjusting_tasks.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn stop_drains_pending_tasks() {
        let recorder = Recorder::default();
        let tasks = recorder.tasks.clone();
        let (dispatch, receiver) = audio_task_channel();
        let mut worker = AudioWorker::spawn(receiver, Arc::new(Silence), Box::new(recorder)).unwrap();

        for beat in 0..10 {
            dispatch.dispatch(task(beat * 2002, false));
        }
        worker.stop();
        assert_eq!(tasks.lock().len(), 10);

        // The worker is gone, dispatching must not block or panic.
        dispatch.dispatch(task(0, false));
    }
}
