// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Downstream multi-stage consumer of emitted batches.
//!
//! A chain of `N` stages with `W` worker threads each, connected by bounded
//! queues of frame handles. Stage `i` pops from queue `i`, runs the stage
//! work hook, and pushes to queue `i+1`; the terminal stage releases its
//! reference, which cascades frame and device-buffer return.
//!
//! Shutdown is a cascade: dropping the entry sender disconnects stage 0,
//! its workers drain and exit, their clones of the stage-1 sender drop, and
//! so on down the chain.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::core::batch::FrameBatchCallback;
use crate::core::config::StageConfig;
use crate::core::pool::SmartFrame;
use crate::core::{PipelineError, Result};

/// Per-stage work hook: `(stage_index, frame)`.
pub type StageWork = Arc<dyn Fn(usize, &SmartFrame) + Send + Sync>;

/// See the module docs.
#[derive(Debug)]
pub struct PipelineStages {
    entry: Option<Sender<SmartFrame>>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineStages {
    pub fn new(config: &StageConfig, work: StageWork) -> Result<Self> {
        if config.stages == 0 || config.workers == 0 {
            return Err(PipelineError::Configuration(
                "pipeline needs at least one stage and one worker".into(),
            ));
        }
        let depth = config.queue_depth.max(1);
        let (senders, receivers): (Vec<Sender<SmartFrame>>, Vec<Receiver<SmartFrame>>) =
            (0..config.stages).map(|_| bounded(depth)).unzip();

        let mut workers = Vec::with_capacity(config.stages * config.workers);
        for stage in 0..config.stages {
            for worker in 0..config.workers {
                let input = receivers[stage].clone();
                let next = senders.get(stage + 1).cloned();
                let work = work.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("stage-{stage}-worker-{worker}"))
                    .spawn(move || stage_loop(stage, &input, next.as_ref(), work.as_ref()))
                    .map_err(|err| {
                        PipelineError::Other(anyhow::anyhow!("spawn stage worker: {err}"))
                    })?;
                workers.push(handle);
            }
        }
        // Only the entry sender stays; every other sender now lives solely
        // in the workers of the preceding stage, so stage exits cascade.
        let entry = senders.into_iter().next();
        Ok(Self { entry, workers })
    }

    /// Feed an emitted batch into the entry queue.
    ///
    /// Blocks while the entry queue is full, which is the backpressure a
    /// slow pipeline exerts on the decoders upstream.
    pub fn eat_batch(&self, batch: &mut Vec<SmartFrame>) {
        let Some(entry) = self.entry.as_ref() else {
            batch.clear();
            return;
        };
        let mut failed = false;
        for frame in batch.drain(..) {
            if failed {
                continue;
            }
            if entry.send(frame).is_err() {
                failed = true;
            }
        }
        if failed {
            warn!("pipeline stopped; dropping remaining batch frames");
        }
    }

    /// Adapt this pipeline into a batch-pipe callback.
    pub fn batch_callback(self: &Arc<Self>) -> FrameBatchCallback {
        let stages = self.clone();
        Box::new(move |batch| stages.eat_batch(batch))
    }
}

fn stage_loop(
    stage: usize,
    input: &Receiver<SmartFrame>,
    next: Option<&Sender<SmartFrame>>,
    work: &(dyn Fn(usize, &SmartFrame) + Send + Sync),
) {
    while let Ok(frame) = input.recv() {
        work(stage, &frame);
        match next {
            Some(next) => {
                if next.send(frame).is_err() {
                    break;
                }
            }
            // Terminal stage: the reference drops here and the frame
            // cascades back to its pools.
            None => drop(frame),
        }
    }
    debug!(stage, "stage worker exiting");
}

impl Drop for PipelineStages {
    fn drop(&mut self) {
        // Closing the entry disconnects stage 0; the rest cascades.
        self.entry.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("pipeline stage worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::{FramePool, StreamId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn handles(pool: &FramePool, count: usize) -> Vec<SmartFrame> {
        (0..count)
            .map(|i| {
                let mut pooled = pool.get(StreamId(0)).expect("get");
                pooled.frame_no = i as u64;
                pooled.into_handle()
            })
            .collect()
    }

    #[test]
    fn frames_traverse_every_stage_and_release() {
        let hits = Arc::new(AtomicUsize::new(0));
        let work: StageWork = {
            let hits = hits.clone();
            Arc::new(move |_stage, _frame| {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        };
        let stages = PipelineStages::new(
            &StageConfig {
                stages: 3,
                workers: 2,
                queue_depth: 8,
            },
            work,
        )
        .expect("pipeline");

        let pool = FramePool::new(64);
        let mut batch = handles(&pool, 10);
        stages.eat_batch(&mut batch);
        assert!(batch.is_empty());

        drop(stages); // joins workers after they drain
        assert_eq!(hits.load(Ordering::Relaxed), 30, "10 frames x 3 stages");
        assert_eq!(pool.busy_len(), 0, "terminal stage released every handle");
    }

    #[test]
    fn slow_terminal_stage_pins_handles_then_drains() {
        let work: StageWork = Arc::new(|stage, _frame| {
            if stage == 1 {
                std::thread::sleep(Duration::from_millis(20));
            }
        });
        let stages = PipelineStages::new(
            &StageConfig {
                stages: 2,
                workers: 1,
                queue_depth: 16,
            },
            work,
        )
        .expect("pipeline");

        let pool = FramePool::new(64);
        let mut batch = handles(&pool, 4);
        stages.eat_batch(&mut batch);
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.busy_len() > 0, "slow stage still holds handles");
        drop(stages);
        assert_eq!(pool.busy_len(), 0);
    }

    #[test]
    fn rejects_empty_topology() {
        let work: StageWork = Arc::new(|_, _| {});
        let err = PipelineStages::new(
            &StageConfig {
                stages: 0,
                workers: 2,
                queue_depth: 4,
            },
            work,
        )
        .expect_err("zero stages");
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
