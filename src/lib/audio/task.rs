use std::time::Instant;

/// One beat worth of mixed audio for the audio worker to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTask {
    pub pts: i64,
    /// Output samples per channel.
    pub num_samples: usize,
    /// Whether this beat may steer the resamplers' rate. Only real, on-time
    /// beats do.
    pub adjust_rate: bool,
    pub timestamp: Instant,
}
