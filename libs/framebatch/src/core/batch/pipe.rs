// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The frame batch pipe: frame pool + circular batcher + flush timer.
//!
//! Streams hand decoded frames in through [`BatchPipe::input_frame`]; the
//! pipe wraps each in a pooled [`SmartFrame`] handle and pushes it into the
//! cross-stream ring. Full batches emit from the pushing thread; a timer
//! thread flushes partial batches so low input rates still make progress.
//!
//! `startup` runs one worker per input: it picks the source/decoder pair by
//! file extension and drains the decoder into the pipe until the last
//! frame. A failing stream aborts alone; the pipe keeps serving the others.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::batch::{BatchCallback, CircularBatch};
use crate::core::config::BatchConfig;
use crate::core::decode::{DecodedFrame, HardwareDecoder, VideoDecode};
use crate::core::driver::{Codec, VideoDriver};
use crate::core::pool::{DevicePool, FramePool, SmartFrame, StreamId};
use crate::core::source::{ElementaryStreamSource, MediaSource};
use crate::core::{PipelineError, Result};

/// Callback receiving emitted frame batches.
pub type FrameBatchCallback = BatchCallback<SmartFrame>;

thread_local! {
    /// Per-producer frame index. One drain thread per stream, so this is a
    /// per-stream counter that needs no synchronization.
    static FRAME_NO: Cell<u64> = const { Cell::new(0) };
}

/// How long a drain worker waits for a frame before re-checking flags.
const DRAIN_WAIT: Duration = Duration::from_millis(50);

struct TimerGate {
    quit: Mutex<bool>,
    tick: Condvar,
}

/// See the module docs.
pub struct BatchPipe {
    config: BatchConfig,
    driver: Arc<dyn VideoDriver>,
    frames: FramePool,
    ring: Arc<CircularBatch<SmartFrame>>,
    device_pool: Arc<DevicePool>,
    gate: Arc<TimerGate>,
    timer: Mutex<Option<JoinHandle<()>>>,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchPipe {
    pub fn new(
        driver: Arc<dyn VideoDriver>,
        config: BatchConfig,
        callback: FrameBatchCallback,
    ) -> Result<Arc<Self>> {
        let ring = Arc::new(CircularBatch::new(
            config.batch_size,
            config.batch_count,
            callback,
        )?);
        let device_pool = Arc::new(DevicePool::device(
            config.device_pool_size,
            driver.memory(),
        ));
        let gate = Arc::new(TimerGate {
            quit: Mutex::new(false),
            tick: Condvar::new(),
        });
        let pipe = Arc::new(Self {
            frames: FramePool::new(config.frame_pool_size),
            ring: ring.clone(),
            device_pool,
            gate: gate.clone(),
            timer: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            driver,
            config,
        });

        let timeout = Duration::from_millis(pipe.config.bounded_timeout_ms());
        let timer = std::thread::Builder::new()
            .name("batch-timer".into())
            .spawn(move || {
                let mut quit = gate.quit.lock();
                loop {
                    gate.tick.wait_for(&mut quit, timeout);
                    if *quit {
                        break;
                    }
                    drop(quit);
                    ring.flush();
                    quit = gate.quit.lock();
                }
            })
            .map_err(|err| PipelineError::Other(anyhow::anyhow!("spawn timer: {err}")))?;
        *pipe.timer.lock() = Some(timer);
        Ok(pipe)
    }

    /// Wrap a decoded frame in a pooled handle and push it into the ring.
    ///
    /// Does not sleep on the ring; it can wait on the frame pool when every
    /// handle is pinned downstream.
    pub fn input_frame(&self, decoded: DecodedFrame, stream: StreamId) -> Result<()> {
        let mut pooled = self.frames.get(stream)?;
        pooled.width = decoded.width;
        pooled.height = decoded.height;
        pooled.device_pitch = decoded.device_pitch;
        pooled.timestamp = decoded.timestamp;
        pooled.last = decoded.last;
        pooled.frame_no = FRAME_NO.with(|n| {
            let v = n.get();
            n.set(v + 1);
            v
        });
        pooled.device = decoded.device;
        pooled.host = decoded.host;

        let handle = pooled.into_handle();
        if let Some(closed) = self.ring.push(handle) {
            closed.emit();
        }
        Ok(())
    }

    /// Start one stream worker for `path`.
    ///
    /// `.h264` plays as a raw elementary stream; anything else goes through
    /// the container demuxer (when built in). Construction failures inside
    /// the worker abort that stream only.
    pub fn startup(self: &Arc<Self>, path: PathBuf, stream: StreamId) -> Result<()> {
        // A stream's worth of frames joins the shared VRAM budget.
        self.device_pool.grow(2);

        let pipe = self.clone();
        let worker = std::thread::Builder::new()
            .name(format!("stream-{}", stream.0))
            .spawn(move || {
                if let Err(err) = pipe.stream_worker(&path, stream) {
                    error!(%stream, path = %path.display(), %err, "stream aborted");
                }
            })
            .map_err(|err| PipelineError::Other(anyhow::anyhow!("spawn stream worker: {err}")))?;
        self.streams.lock().push(worker);
        Ok(())
    }

    fn stream_worker(self: &Arc<Self>, path: &Path, stream: StreamId) -> Result<()> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let (decoder, source): (Arc<HardwareDecoder>, Box<dyn MediaSource>) =
            if extension == "h264" {
                let decoder = Arc::new(HardwareDecoder::new(
                    self.driver.clone(),
                    Codec::H264,
                    &self.config.decoder,
                    Some(self.device_pool.clone()),
                )?);
                let source = ElementaryStreamSource::new(
                    path,
                    decoder.clone() as Arc<dyn VideoDecode>,
                    self.config.loop_playback,
                )?;
                (decoder, Box::new(source))
            } else {
                self.open_container(path)?
            };

        info!(%stream, path = %path.display(), "stream started");
        let result = self.drain(decoder.as_ref(), stream);
        source.stop();
        decoder.shutdown();
        debug!(%stream, "stream worker exiting");
        result
    }

    #[cfg(feature = "demux-ffmpeg")]
    fn open_container(
        self: &Arc<Self>,
        path: &Path,
    ) -> Result<(Arc<HardwareDecoder>, Box<dyn MediaSource>)> {
        use crate::core::source::{probe_codec, ContainerSource};

        let codec = probe_codec(path)?;
        let decoder = Arc::new(HardwareDecoder::new(
            self.driver.clone(),
            codec,
            &self.config.decoder,
            Some(self.device_pool.clone()),
        )?);
        let source = ContainerSource::new(path, decoder.clone() as Arc<dyn VideoDecode>)?;
        Ok((decoder, Box::new(source)))
    }

    #[cfg(not(feature = "demux-ffmpeg"))]
    fn open_container(
        self: &Arc<Self>,
        path: &Path,
    ) -> Result<(Arc<HardwareDecoder>, Box<dyn MediaSource>)> {
        Err(PipelineError::Unsupported(format!(
            "{}: container inputs require the demux-ffmpeg feature",
            path.display()
        )))
    }

    /// Turn `get_frame` into `input_frame` until the stream ends.
    fn drain(&self, decoder: &HardwareDecoder, stream: StreamId) -> Result<()> {
        loop {
            if *self.gate.quit.lock() {
                return Ok(());
            }
            match decoder.wait_frame(DRAIN_WAIT) {
                Some(frame) => {
                    let last = frame.last;
                    if frame.device.is_some() {
                        match self.input_frame(frame, stream) {
                            Ok(()) => {}
                            Err(PipelineError::ShuttingDown) => return Ok(()),
                            Err(err) => return Err(err),
                        }
                    } else if !last {
                        warn!(%stream, "dropping dataless frame");
                    }
                    if last {
                        info!(%stream, "end of decoded stream");
                        return Ok(());
                    }
                }
                None => {
                    if decoder.is_finished() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop everything this pipe started: timer first, then the stream
    /// workers, then a final partial flush so no handle stays in the ring.
    pub fn shutdown(&self) {
        {
            let mut quit = self.gate.quit.lock();
            if *quit {
                return;
            }
            *quit = true;
        }
        // Unblock any worker waiting on the frame pool before joining it.
        self.frames.shutdown();
        self.gate.tick.notify_all();
        if let Some(timer) = self.timer.lock().take() {
            if timer.join().is_err() {
                warn!("batch timer thread panicked");
            }
        }
        let workers = std::mem::take(&mut *self.streams.lock());
        let current = std::thread::current().id();
        for worker in workers {
            // A worker can end up running this shutdown itself when it owns
            // the last reference to the pipe; it must not join itself.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("stream worker thread panicked");
            }
        }
        self.ring.flush();
    }

    /// True when every started stream worker has exited.
    pub fn streams_finished(&self) -> bool {
        self.streams.lock().iter().all(|w| w.is_finished())
    }

    /// The shared VRAM pool frames are decoded into.
    pub fn device_pool(&self) -> Arc<DevicePool> {
        self.device_pool.clone()
    }

    /// Frame handles currently pinned outside the pool.
    pub fn frames_busy(&self) -> usize {
        self.frames.busy_len()
    }

    /// Elements waiting in the ring for a full batch or a timer flush.
    pub fn ring_pending(&self) -> usize {
        self.ring.pending()
    }
}

impl Drop for BatchPipe {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::emulated::{clip_bytes, write_clip, EmulatedDriver};
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    type Batches = Arc<StdMutex<Vec<Vec<(StreamId, u64, bool)>>>>;

    fn collecting() -> (Batches, FrameBatchCallback) {
        let batches: Batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = batches.clone();
        let callback: FrameBatchCallback = Box::new(move |batch| {
            let summary = batch
                .drain(..)
                .map(|f| (f.stream, f.frame_no, f.last))
                .collect();
            sink.lock().unwrap().push(summary);
        });
        (batches, callback)
    }

    fn clip_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".h264")
            .tempfile()
            .expect("temp file");
        file.write_all(bytes).expect("write clip");
        file.flush().expect("flush");
        file
    }

    fn wait_streams(pipe: &Arc<BatchPipe>) {
        for _ in 0..500 {
            if pipe.streams_finished() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("stream workers did not finish");
    }

    #[test]
    fn full_and_partial_batches_cover_the_stream() {
        let (batches, callback) = collecting();
        let driver = Arc::new(EmulatedDriver::new());
        let config = BatchConfig {
            batch_size: 8,
            timeout_ms: 40,
            ..BatchConfig::default()
        };
        let pipe = BatchPipe::new(driver, config, callback).expect("pipe");
        let clip = clip_file(&clip_bytes(320, 240, 20));
        pipe.startup(clip.path().to_owned(), StreamId(1)).expect("startup");
        wait_streams(&pipe);
        pipe.shutdown();

        let got = batches.lock().unwrap();
        let total: usize = got.iter().map(Vec::len).sum();
        assert_eq!(total, 20);
        // Full batches carry exactly batch_size frames; the tail arrives
        // through the timer (or the shutdown flush) as a partial.
        assert!(got.iter().all(|b| !b.is_empty() && b.len() <= 8));
        // Per-stream frame numbers are dense and ordered.
        let frame_nos: Vec<u64> = got.iter().flatten().map(|&(_, no, _)| no).collect();
        assert_eq!(frame_nos, (0..20).collect::<Vec<_>>());
        // Exactly one frame is marked last.
        assert_eq!(got.iter().flatten().filter(|&&(_, _, l)| l).count(), 1);
        assert_eq!(pipe.frames_busy(), 0);
        assert_eq!(pipe.ring_pending(), 0);
    }

    #[test]
    fn unknown_extension_aborts_only_that_stream() {
        let (batches, callback) = collecting();
        let driver = Arc::new(EmulatedDriver::new());
        let pipe = BatchPipe::new(driver, BatchConfig::default(), callback).expect("pipe");

        let bogus = tempfile::Builder::new()
            .suffix(".mp4")
            .tempfile()
            .expect("temp file");
        pipe.startup(bogus.path().to_owned(), StreamId(7)).expect("startup");

        let clip = clip_file(&clip_bytes(320, 240, 8));
        pipe.startup(clip.path().to_owned(), StreamId(8)).expect("startup");
        wait_streams(&pipe);
        pipe.shutdown();

        let got = batches.lock().unwrap();
        let total: usize = got.iter().map(Vec::len).sum();
        assert_eq!(total, 8, "healthy stream unaffected by the failing one");
        assert!(got.iter().flatten().all(|&(s, _, _)| s == StreamId(8)));
    }

    #[test]
    fn timer_flushes_a_lone_frame() {
        let (batches, callback) = collecting();
        let driver = Arc::new(EmulatedDriver::new());
        let config = BatchConfig {
            batch_size: 8,
            timeout_ms: 10,
            ..BatchConfig::default()
        };
        let pipe = BatchPipe::new(driver, config, callback).expect("pipe");
        let clip = clip_file(&{
            let mut v = Vec::new();
            write_clip(&mut v, [(320u16, 240u16)]).unwrap();
            v
        });
        pipe.startup(clip.path().to_owned(), StreamId(2)).expect("startup");

        // Liveness: the frame reaches the callback within 2x the timeout
        // (plus scheduling slack) without any further input.
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        loop {
            if batches.lock().unwrap().iter().map(Vec::len).sum::<usize>() == 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timer never flushed");
            std::thread::sleep(Duration::from_millis(5));
        }
        pipe.shutdown();
    }
}
