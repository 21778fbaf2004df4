use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::Result;
use tracing::*;

use sync_mixer::{
    audio::{task::AudioTask, AudioOutput},
    cli, logger,
    engine::Engine,
    scheduler::frame_set::{CommittedFrameSet, Renderer},
    settings,
};

/// Stands in for a GPU compositor: logs what it would draw.
#[derive(Debug, Default)]
struct LoggingRenderer {
    frames: Arc<AtomicU64>,
}

impl Renderer for LoggingRenderer {
    fn render(&mut self, frames: CommittedFrameSet) {
        self.frames.fetch_add(1, Ordering::Relaxed);

        let fresh = frames
            .sources
            .iter()
            .filter(|source| source.fresh)
            .count();
        trace!(
            "Frame pts {} ({:?}): {} source(s), {fresh} fresh, {} route(s)",
            frames.pts,
            frames.master,
            frames.sources.len(),
            frames.routing.len(),
        );
    }
}

/// Stands in for a sound card: keeps the peak level of what it receives.
#[derive(Debug, Default)]
struct PeakMeter {
    peak: Arc<AtomicU64>,
}

impl AudioOutput for PeakMeter {
    fn consume(&mut self, task: &AudioTask, pcm: &[f32]) {
        let peak = pcm.iter().fold(0.0f32, |peak, sample| peak.max(sample.abs()));
        self.peak
            .fetch_max((peak * 1000.0) as u64, Ordering::Relaxed);
        trace!("Audio pts {}: {} samples", task.pts, task.num_samples);
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    // CLI should be started before logger to allow control over verbosity
    cli::manager::init();
    // Logger should start before everything else to register any log information
    logger::manager::init()?;
    // Settings should start before everybody else to ensure that the CLI are stored
    settings::manager::init(
        Some(&cli::manager::settings_file()),
        cli::manager::is_reset(),
    )?;

    let renderer = LoggingRenderer::default();
    let frames = renderer.frames.clone();
    let meter = PeakMeter::default();
    let peak = meter.peak.clone();

    let engine = Engine::start(
        &settings::manager::settings(),
        Box::new(renderer),
        Box::new(meter),
    )?;
    let control = engine.control().clone();

    let stats = cli::manager::stats_interval().map(|interval| {
        let control = control.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(
                    "{} ticks, {} frames rendered, audio peak {:.3}",
                    control.context().ticks(),
                    frames.load(Ordering::Relaxed),
                    peak.load(Ordering::Relaxed) as f64 / 1000.0,
                );
                for metrics in control
                    .metrics()
                    .into_iter()
                    .filter(|metrics| metrics.state.is_active())
                {
                    match serde_json::to_string(&metrics) {
                        Ok(line) => info!("Source: {line}"),
                        Err(error) => warn!("Failed to serialize metrics: {error:?}"),
                    }
                }
            }
        })
    });

    match cli::manager::duration() {
        Some(duration) => {
            info!("Running for {duration:?}");
            tokio::select! {
                _ = tokio::time::sleep(duration) => (),
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    if let Some(stats) = stats {
        stats.abort();
    }

    // Joining the engine threads blocks.
    tokio::task::spawn_blocking(move || drop(engine)).await?;

    Ok(())
}
