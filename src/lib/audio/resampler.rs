//! Per-source queue converting input audio to the output rate with a sinc
//! resampler, slowly steering its ratio to keep a fixed delay.

use anyhow::{Context, Result};
use rubato::{
    Resampler, SincFixedOut, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::*;

use crate::{
    clock::OUTPUT_SAMPLE_RATE,
    frame::{AudioFormat, AudioPayload},
};

/// Buffered input the queue aims to hold right after an output beat.
pub const TARGET_DELAY_SECONDS: f64 = 0.04;
/// Relative ratio change per second of delay error.
const RATE_CORRECTION_GAIN: f64 = 0.5;
/// Largest relative deviation from the nominal ratio.
pub const MAX_RATE_CORRECTION: f64 = 0.05;
/// Input kept at most; older audio is discarded beyond it.
const MAX_BUFFER_SECONDS: f64 = 1.0;
/// Output frames produced per resampler call. Leftovers wait for the next task.
const CHUNK_FRAMES: usize = 64;
const CHANNELS: usize = 2;

fn build_resampler(format: AudioFormat) -> Result<SincFixedOut<f32>> {
    let parameters = SincInterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    SincFixedOut::new(
        OUTPUT_SAMPLE_RATE as f64 / format.sample_rate as f64,
        1.0 + 2.0 * MAX_RATE_CORRECTION,
        parameters,
        CHUNK_FRAMES,
        CHANNELS,
    )
    .with_context(|| format!("Failed to create a resampler for {format:?}"))
}

pub struct ResamplingQueue {
    slot: usize,
    format: AudioFormat,
    resampler: SincFixedOut<f32>,
    /// Input not handed to the resampler yet, one vector per channel.
    input: [Vec<f32>; CHANNELS],
    /// Resampled output not delivered yet, one vector per channel.
    output: [Vec<f32>; CHANNELS],
    /// Input frames consumed per output frame.
    ratio: f64,
    nominal_ratio: f64,
    underruns: u64,
}

impl std::fmt::Debug for ResamplingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResamplingQueue")
            .field("slot", &self.slot)
            .field("format", &self.format)
            .field("buffered", &self.input[0].len())
            .field("ratio", &self.ratio)
            .field("underruns", &self.underruns)
            .finish()
    }
}

impl ResamplingQueue {
    pub fn new(slot: usize, format: AudioFormat) -> Result<Self> {
        let nominal_ratio = format.sample_rate as f64 / OUTPUT_SAMPLE_RATE as f64;
        Ok(Self {
            slot,
            format,
            resampler: build_resampler(format)?,
            input: Default::default(),
            output: Default::default(),
            ratio: nominal_ratio,
            nominal_ratio,
            underruns: 0,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Input frames not handed to the resampler yet.
    pub fn buffered_frames(&self) -> f64 {
        self.input[0].len() as f64
    }

    pub fn add_samples(&mut self, payload: &AudioPayload) {
        let channels = payload.format.channels.max(1) as usize;
        for frame in payload.samples.chunks_exact(channels) {
            let left = frame[0];
            self.input[0].push(left);
            self.input[1].push(frame.get(1).copied().unwrap_or(left));
        }
        self.limit_buffer();
    }

    pub fn add_silence(&mut self, frames: usize) {
        for channel in &mut self.input {
            channel.resize(channel.len() + frames, 0.0);
        }
        self.limit_buffer();
    }

    /// Throws away everything buffered, the filter history and the learned rate.
    pub fn reset(&mut self) {
        for channel in self.input.iter_mut().chain(self.output.iter_mut()) {
            channel.clear();
        }
        match build_resampler(self.format) {
            Ok(resampler) => self.resampler = resampler,
            Err(error) => warn!("Source {}: {error:#}", self.slot),
        }
        self.ratio = self.nominal_ratio;
    }

    fn limit_buffer(&mut self) {
        let limit = (MAX_BUFFER_SECONDS * self.format.sample_rate as f64) as usize;
        let excess = self.input[0].len().saturating_sub(limit);
        if excess > 0 {
            for channel in &mut self.input {
                channel.drain(..excess);
            }
            trace!("Source {}: discarded {excess} stale audio frames", self.slot);
        }
    }

    fn steer(&mut self, num_samples: usize) {
        let remaining = self.buffered_frames() - num_samples as f64 * self.ratio;
        let error_seconds = remaining / self.format.sample_rate as f64 - TARGET_DELAY_SECONDS;
        let correction =
            (error_seconds * RATE_CORRECTION_GAIN).clamp(-MAX_RATE_CORRECTION, MAX_RATE_CORRECTION);

        // The resampler's ratio is output over input, so consuming faster
        // means a lower value.
        match self
            .resampler
            .set_resample_ratio_relative(1.0 / (1.0 + correction), true)
        {
            Ok(()) => self.ratio = self.nominal_ratio * (1.0 + correction),
            Err(error) => warn!("Source {}: failed to adjust the audio rate: {error}", self.slot),
        }
    }

    /// Runs the resampler until `num_samples` output frames are ready or the
    /// input runs out.
    fn fill(&mut self, num_samples: usize) {
        while self.output[0].len() < num_samples {
            let needed = self.resampler.input_frames_next();
            if self.input[0].len() < needed {
                return;
            }

            let chunk: Vec<Vec<f32>> = self
                .input
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            match self.resampler.process(&chunk, None) {
                Ok(resampled) => {
                    for (output, resampled) in self.output.iter_mut().zip(resampled) {
                        output.extend(resampled);
                    }
                }
                Err(error) => {
                    warn!("Source {}: resampling failed: {error}", self.slot);
                    return;
                }
            }
        }
    }

    /// Produces `num_samples` interleaved stereo output frames. Missing input
    /// is replaced with silence.
    pub fn get_output(&mut self, num_samples: usize, adjust_rate: bool) -> Vec<f32> {
        if adjust_rate {
            self.steer(num_samples);
        }
        self.fill(num_samples);

        let available = self.output[0].len().min(num_samples);
        if available < num_samples {
            self.underruns += 1;
            trace!(
                "Source {}: audio underrun, {} of {num_samples} samples missing",
                self.slot,
                num_samples - available
            );
        }

        let [left, right] = &mut self.output;
        let mut output: Vec<f32> = left
            .drain(..available)
            .zip(right.drain(..available))
            .flat_map(|(left, right)| [left, right])
            .collect();
        output.resize(num_samples * CHANNELS, 0.0);
        output
    }
}
