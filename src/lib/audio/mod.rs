pub mod dispatch;
pub mod mixer;
pub mod resampler;
pub mod task;

use task::AudioTask;

/// Produces the PCM for one audio task: interleaved stereo at the output
/// rate, `num_samples` frames long.
pub trait AudioSink: Send + Sync {
    fn process(&self, task: &AudioTask) -> Vec<f32>;
}

/// Where the audio worker puts what the sink produced.
pub trait AudioOutput: Send {
    fn consume(&mut self, task: &AudioTask, pcm: &[f32]);
}
