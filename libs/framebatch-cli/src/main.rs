// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! framebatch CLI: decode every input into one shared batch pipe and run
//! the demo pipeline over the emitted batches until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use framebatch::core::driver::emulated::EmulatedDriver;
use framebatch::core::driver::VideoDriver;
use framebatch::{
    BatchConfig, Coordinator, DecoderConfig, PipelineStages, QueueStrategy, StageConfig, StageWork,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    /// NVDEC via CUDA (requires the backend-nvdec build and an NVIDIA GPU).
    Nvdec,
    /// Deterministic in-process driver; no GPU required.
    Emulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    Wait,
    DropOldest,
    DropNewest,
}

impl From<Strategy> for QueueStrategy {
    fn from(value: Strategy) -> Self {
        match value {
            Strategy::Wait => QueueStrategy::Wait,
            Strategy::DropOldest => QueueStrategy::DropOldest,
            Strategy::DropNewest => QueueStrategy::DropNewest,
        }
    }
}

// clap needs Display for default_value_t; render the clap value names.
impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DriverKind::Nvdec => "nvdec",
            DriverKind::Emulated => "emulated",
        })
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Strategy::Wait => "wait",
            Strategy::DropOldest => "drop-oldest",
            Strategy::DropNewest => "drop-newest",
        })
    }
}

/// Multi-source GPU video decoding and cross-stream frame batching.
#[derive(Debug, Parser)]
#[command(name = "framebatch", version, about)]
struct Args {
    /// Input media paths (.h264 elementary streams, or containers with the
    /// demux-ffmpeg build).
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Decode driver.
    #[arg(long, value_enum, default_value_t = default_driver())]
    driver: DriverKind,

    /// GPU ordinal for the NVDEC driver.
    #[arg(long, default_value_t = 0)]
    device: u32,

    /// Frames per emitted batch.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Batch-sized slices in the ring.
    #[arg(long, default_value_t = 4)]
    batch_count: usize,

    /// Partial-batch flush interval in milliseconds (bounded to 1..=50).
    #[arg(long, default_value_t = 40)]
    timeout_ms: u64,

    /// Decoder output-queue bound per stream.
    #[arg(long, default_value_t = 4)]
    queue_len: usize,

    /// Overflow policy for full decoder queues.
    #[arg(long, value_enum, default_value_t = Strategy::Wait)]
    strategy: Strategy,

    /// Copy each frame into host memory as well.
    #[arg(long)]
    map_to_host: bool,

    /// Restart elementary-stream inputs from the beginning on EOF.
    #[arg(long = "loop")]
    loop_playback: bool,

    /// Downstream pipeline stages.
    #[arg(long, default_value_t = 3)]
    stages: usize,

    /// Worker threads per stage.
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

fn default_driver() -> DriverKind {
    if cfg!(feature = "backend-nvdec") {
        DriverKind::Nvdec
    } else {
        DriverKind::Emulated
    }
}

fn build_driver(args: &Args) -> anyhow::Result<Arc<dyn VideoDriver>> {
    match args.driver {
        DriverKind::Emulated => Ok(Arc::new(EmulatedDriver::new())),
        #[cfg(feature = "backend-nvdec")]
        DriverKind::Nvdec => {
            let driver = framebatch::nvdec::NvdecDriver::get(args.device)
                .with_context(|| format!("initializing NVDEC on device {}", args.device))?;
            Ok(driver)
        }
        #[cfg(not(feature = "backend-nvdec"))]
        DriverKind::Nvdec => {
            anyhow::bail!("this build has no NVDEC support; rebuild with --features backend-nvdec")
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let driver = build_driver(&args)?;

    let batch_config = BatchConfig {
        batch_size: args.batch_size,
        batch_count: args.batch_count,
        timeout_ms: args.timeout_ms,
        loop_playback: args.loop_playback,
        decoder: DecoderConfig {
            device_index: args.device,
            queue_len: args.queue_len,
            map_to_host: args.map_to_host,
            strategy: args.strategy.into(),
            ..DecoderConfig::default()
        },
        ..BatchConfig::default()
    };
    let stage_config = StageConfig {
        stages: args.stages,
        workers: args.workers,
        ..StageConfig::default()
    };

    let terminal = stage_config.stages.saturating_sub(1);
    let consumed = Arc::new(AtomicU64::new(0));
    let work: StageWork = {
        let consumed = consumed.clone();
        Arc::new(move |stage, frame| {
            if stage == terminal {
                let n = consumed.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 100 == 0 {
                    info!(frames = n, "pipeline progress");
                }
                if frame.last {
                    info!(stream = %frame.stream, "stream fully consumed");
                }
            }
        })
    };
    let stages = Arc::new(PipelineStages::new(&stage_config, work)?);
    let coordinator = Coordinator::new(driver, batch_config, stages.batch_callback())?;

    let mut started = 0usize;
    for input in &args.inputs {
        match coordinator.add_video(input.clone()) {
            Ok(stream) => {
                started += 1;
                info!(%stream, path = %input.display(), "stream scheduled");
            }
            // One bad input never takes the others down.
            Err(err) => error!(path = %input.display(), %err, "failed to start stream"),
        }
    }
    if started == 0 {
        anyhow::bail!("no stream could be started");
    }

    info!("pipeline ready; press Ctrl-C to stop");
    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("installing Ctrl-C handler")?;
    let _ = stop_rx.recv();

    info!("shutting down");
    coordinator.shutdown();
    drop(coordinator);
    drop(stages);
    info!(
        frames = consumed.load(Ordering::Relaxed),
        "orderly shutdown complete"
    );
    Ok(())
}
