//! Multi-input orchestration: one (source + decoder + drain) per input,
//! all routed into one shared [`BatchPipe`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::core::batch::{BatchPipe, FrameBatchCallback};
use crate::core::config::BatchConfig;
use crate::core::driver::VideoDriver;
use crate::core::pool::StreamId;
use crate::core::Result;

/// See the module docs.
pub struct Coordinator {
    pipe: Arc<BatchPipe>,
    next_stream: AtomicU32,
}

impl Coordinator {
    /// Build the shared pipe. Batches reach `callback`; wire it to a
    /// [`PipelineStages`](crate::core::pipeline::PipelineStages) via
    /// `batch_callback()` for the full chain.
    pub fn new(
        driver: Arc<dyn VideoDriver>,
        config: BatchConfig,
        callback: FrameBatchCallback,
    ) -> Result<Self> {
        Ok(Self {
            pipe: BatchPipe::new(driver, config, callback)?,
            next_stream: AtomicU32::new(1),
        })
    }

    /// Start decoding one more input into the shared pipe.
    pub fn add_video(&self, path: impl Into<PathBuf>) -> Result<StreamId> {
        let stream = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let path = path.into();
        info!(%stream, path = %path.display(), "adding video");
        self.pipe.startup(path, stream)?;
        Ok(stream)
    }

    pub fn pipe(&self) -> Arc<BatchPipe> {
        self.pipe.clone()
    }

    /// Whether every started stream has run to completion (or aborted).
    pub fn streams_finished(&self) -> bool {
        self.pipe.streams_finished()
    }

    /// Poll [`streams_finished`](Self::streams_finished) up to `timeout`.
    pub fn wait_streams_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.streams_finished() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.streams_finished()
    }

    /// Stop all streams and the pipe. Safe to call more than once.
    pub fn shutdown(&self) {
        self.pipe.shutdown();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
