// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! One decoder per input stream.
//!
//! The decoder owns a hardware parser/decoder pair and a bounded output
//! queue of decoded NV12 frames. The driver invokes the sequence / decode /
//! display callbacks synchronously from `feed`; the display handler copies
//! each mapped surface into a pooled device buffer (so the driver surface
//! recycles immediately) and applies the configured overflow policy when
//! the queue is full.
//!
//! Timestamps are synthesized from a per-decoder epoch advanced by the
//! stream's nominal frame duration with a small jitter, in 100 ns ticks.
//! The parser-reported timestamp is not propagated.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::alloc::{host_pitch, nv12_size};
use crate::core::config::{DecoderConfig, QueueStrategy};
use crate::core::driver::{
    Codec, DeviceMemory, DisplayInfo, HwDecoder, HwParser, ParserEvents, PictureParams,
    SurfaceBudget, VideoDriver, VideoFormat,
};
use crate::core::pool::{DevicePool, HostPool, PooledDeviceBuffer, PooledHostBuffer};
use crate::core::{PipelineError, Result};

/// Synthesized timestamps deviate from the epoch grid by at most this many
/// 100 ns ticks, which keeps them strictly increasing for any realistic
/// frame duration while still looking like sampled wall-clock instants.
const TIMESTAMP_JITTER_TICKS: i64 = 500;

/// Backoff between transient map retries. The driver exposes no readiness
/// signal for its output surfaces, so this one wait stays a sleep.
const MAP_RETRY_WAIT: Duration = Duration::from_micros(500);
const MAP_RETRY_LIMIT: u32 = 4000;

/// One frame popped from a decoder's output queue.
///
/// Both buffers return to their pools when the frame is dropped, so the
/// device copy lives exactly as long as someone holds this (or the handle
/// it was converted into).
#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub device_pitch: u32,
    /// Synthesized timestamp, 100 ns ticks.
    pub timestamp: u64,
    /// End-of-stream sentinel.
    pub last: bool,
    pub device: Option<PooledDeviceBuffer>,
    pub host: Option<PooledHostBuffer>,
}

impl DecodedFrame {
    /// Trailing marker used when EOS arrives after the queue drained.
    fn end_marker() -> Self {
        Self {
            last: true,
            ..Self::default()
        }
    }

    /// Host copy (address and pitch), present only when the producing
    /// decoder ran with `map_to_host`.
    pub fn host_view(&self) -> Option<(*const u8, u32)> {
        self.host
            .as_ref()
            .map(|b| (b.addr().as_host_ptr() as *const u8, b.pitch()))
    }
}

/// Decode-side counters, exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_displayed: u64,
    pub frames_dropped: u64,
    pub sequence_changes: u64,
}

/// Behavioral surface of a decoder, whatever drives it.
pub trait VideoDecode: Send + Sync {
    /// Submit encoded bytes to the parser. An empty slice is the
    /// end-of-stream marker; the frame that ends up last in the output
    /// queue is tagged `last = true`.
    fn input_stream(&self, data: &[u8], timestamp: i64) -> Result<()>;

    /// Pop the head of the output queue, if any.
    fn get_frame(&self) -> Option<DecodedFrame>;

    /// Block up to `timeout` for a frame. Returns immediately once the
    /// stream has finished and the queue is empty.
    fn wait_frame(&self, timeout: Duration) -> Option<DecodedFrame>;

    /// Return a frame's buffers to their pools.
    fn put_frame(&self, frame: DecodedFrame);

    /// Switch the overflow policy.
    fn set_strategy(&self, strategy: QueueStrategy);

    /// EOS seen and every queued frame handed out.
    fn is_finished(&self) -> bool;
}

struct DecodeState {
    hw: Option<Box<dyn HwDecoder>>,
    format: Option<VideoFormat>,
    queue: VecDeque<DecodedFrame>,
    /// Base of the next synthesized timestamp.
    epoch: u64,
    /// Nominal frame duration in ticks, from the current format.
    nominal: u64,
    draining: bool,
    finished: bool,
    stats: DecoderStats,
}

struct DecoderCore {
    driver: Arc<dyn VideoDriver>,
    memory: Arc<dyn DeviceMemory>,
    device_pool: Arc<DevicePool>,
    host_pool: Arc<HostPool>,
    queue_len: usize,
    map_to_host: bool,
    strategy: Mutex<QueueStrategy>,
    state: Mutex<DecodeState>,
    /// Signaled when `get_frame` makes room in the queue.
    space: Condvar,
    /// Signaled when the display handler queues a frame.
    avail: Condvar,
    quit: AtomicBool,
}

impl DecoderCore {
    fn synthesize_timestamp(state: &mut DecodeState) -> u64 {
        let jitter = fastrand::i64(-TIMESTAMP_JITTER_TICKS..=TIMESTAMP_JITTER_TICKS);
        let ts = state.epoch.saturating_add_signed(jitter);
        state.epoch += state.nominal;
        ts
    }

    /// Copy the mapped surface into a pooled device buffer and build the
    /// queue entry. Called with the state lock held.
    fn copy_into_pooled(
        &self,
        state: &mut DecodeState,
        src: &dyn crate::core::driver::MappedSurface,
    ) -> Result<DecodedFrame> {
        let format = state
            .format
            .as_ref()
            .ok_or_else(|| PipelineError::DriverFatal("display before sequence".into()))?;
        let (width, height) = (format.coded_width, format.coded_height);
        let pitch = src.pitch();
        let len = nv12_size(pitch, height);
        let buffer = PooledDeviceBuffer::checkout(&self.device_pool, len)?;
        self.memory.copy_device_to_device(
            src.device_ptr(),
            pitch,
            buffer.addr(),
            pitch,
            pitch,
            height * 3 / 2,
        )?;
        let timestamp = Self::synthesize_timestamp(state);
        Ok(DecodedFrame {
            width,
            height,
            device_pitch: pitch,
            timestamp,
            last: false,
            device: Some(buffer),
            host: None,
        })
    }
}

impl ParserEvents for DecoderCore {
    fn on_sequence(&self, format: &VideoFormat) -> u32 {
        let mut state = self.state.lock();
        // Destroy any existing decoder before creating the replacement;
        // its surfaces belong to the old format.
        if state.hw.take().is_some() {
            debug!("destroying decoder for sequence change");
        }
        let budget = SurfaceBudget::for_queue_len(self.queue_len);
        match self.driver.create_decoder(format, budget) {
            Ok(hw) => {
                info!(
                    width = format.coded_width,
                    height = format.coded_height,
                    decode_surfaces = budget.decode_surfaces,
                    output_surfaces = budget.output_surfaces,
                    "decoder (re)created"
                );
                state.nominal = format.nominal_duration_ticks();
                state.hw = Some(hw);
                state.format = Some(format.clone());
                state.stats.sequence_changes += 1;
                budget.decode_surfaces
            }
            Err(err) => {
                error!(%err, "decoder creation failed");
                0
            }
        }
    }

    fn on_decode(&self, pic: &PictureParams<'_>) -> bool {
        let mut state = self.state.lock();
        let Some(hw) = state.hw.as_ref() else {
            warn!("decode callback before decoder creation");
            return false;
        };
        match hw.decode(pic) {
            Ok(()) => {
                state.stats.frames_decoded += 1;
                true
            }
            Err(err) => {
                // The decoder stays up; the next keyframe recovers.
                error!(%err, "decode submit failed");
                false
            }
        }
    }

    fn on_display(&self, disp: &DisplayInfo) -> bool {
        // Map first. This can fail transiently while all output surfaces
        // are in flight; retry with a short backoff.
        let mut attempts = 0u32;
        let surface = loop {
            if self.quit.load(Ordering::Acquire) {
                return false;
            }
            let state = self.state.lock();
            let Some(hw) = state.hw.as_ref() else {
                warn!("display callback before decoder creation");
                return false;
            };
            match hw.map(disp) {
                Ok(surface) => break surface,
                Err(err) if err.is_transient() && attempts < MAP_RETRY_LIMIT => {
                    drop(state);
                    attempts += 1;
                    std::thread::sleep(MAP_RETRY_WAIT);
                }
                Err(err) => {
                    error!(%err, pic = disp.picture_index, "mapping decoded frame failed");
                    return false;
                }
            }
        };

        // Queue under the output-queue lock, honoring the overflow policy.
        // The surface guard unmaps unconditionally on every exit path so
        // the driver's internal surfaces recycle.
        let mut state = self.state.lock();
        loop {
            if self.quit.load(Ordering::Acquire) {
                return false;
            }
            let full = state.queue.len() >= self.queue_len;
            // During the EOS flush the queue may briefly exceed its bound
            // so the trailing frames are never stranded in the driver.
            if !full || state.draining {
                match self.copy_into_pooled(&mut state, surface.as_ref()) {
                    Ok(frame) => {
                        state.queue.push_back(frame);
                        state.stats.frames_displayed += 1;
                        drop(state);
                        self.avail.notify_one();
                        return true;
                    }
                    Err(err) => {
                        error!(%err, "failed to retain decoded frame");
                        return false;
                    }
                }
            }
            match *self.strategy.lock() {
                QueueStrategy::Wait => {
                    self.space.wait_for(&mut state, Duration::from_millis(5));
                }
                QueueStrategy::DropOldest => {
                    // The popped frame's buffers return to the pools here.
                    state.queue.pop_front();
                    state.stats.frames_dropped += 1;
                }
                QueueStrategy::DropNewest => {
                    // Do not copy; the incoming frame is the casualty.
                    state.stats.frames_dropped += 1;
                    return true;
                }
            }
        }
    }
}

/// Hardware-backed implementation of [`VideoDecode`]. See module docs.
pub struct HardwareDecoder {
    core: Arc<DecoderCore>,
    parser: Mutex<Box<dyn HwParser>>,
}

impl HardwareDecoder {
    /// Create a decoder for one stream.
    ///
    /// When `shared_device_pool` is given, decoded frames are copied into
    /// it (the multi-stream configuration); otherwise the decoder creates
    /// its own VRAM pool. Parser creation failure is fatal to the stream.
    pub fn new(
        driver: Arc<dyn VideoDriver>,
        codec: Codec,
        config: &DecoderConfig,
        shared_device_pool: Option<Arc<DevicePool>>,
    ) -> Result<Self> {
        let memory = driver.memory();
        let device_pool = shared_device_pool.unwrap_or_else(|| {
            Arc::new(DevicePool::device(config.device_pool_size, memory.clone()))
        });
        let host_pool = Arc::new(HostPool::host(config.host_pool_size));
        let core = Arc::new(DecoderCore {
            driver: driver.clone(),
            memory,
            device_pool,
            host_pool,
            queue_len: config.queue_len.max(1),
            map_to_host: config.map_to_host,
            strategy: Mutex::new(config.strategy),
            state: Mutex::new(DecodeState {
                hw: None,
                format: None,
                queue: VecDeque::new(),
                epoch: 0,
                nominal: 400_000,
                draining: false,
                finished: false,
                stats: DecoderStats::default(),
            }),
            space: Condvar::new(),
            avail: Condvar::new(),
            quit: AtomicBool::new(false),
        });
        let parser = driver.create_parser(
            codec,
            SurfaceBudget::for_queue_len(core.queue_len),
            core.clone() as Arc<dyn ParserEvents>,
        )?;
        Ok(Self {
            core,
            parser: Mutex::new(parser),
        })
    }

    /// Stop accepting input and wake every waiter.
    pub fn shutdown(&self) {
        self.core.quit.store(true, Ordering::Release);
        self.core.space.notify_all();
        self.core.avail.notify_all();
    }

    pub fn stats(&self) -> DecoderStats {
        self.core.state.lock().stats
    }

    pub fn queue_depth(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    /// The VRAM pool decoded frames are copied into.
    pub fn device_pool(&self) -> Arc<DevicePool> {
        self.core.device_pool.clone()
    }

    fn map_frame_to_host(&self, frame: &mut DecodedFrame) {
        if frame.device.is_none() {
            return;
        }
        let pitch = host_pitch(frame.width);
        let len = nv12_size(pitch, frame.height);
        let host = match PooledHostBuffer::checkout(&self.core.host_pool, len, pitch) {
            Ok(host) => host,
            Err(err) => {
                warn!(%err, "host buffer allocation failed; frame stays device-only");
                return;
            }
        };
        let Some(src) = frame.device.as_ref().map(|b| b.device_ptr()) else {
            return;
        };
        if let Err(err) = self.core.memory.copy_device_to_host(
            src,
            frame.device_pitch,
            host.addr(),
            pitch,
            frame.width,
            frame.height * 3 / 2,
        ) {
            warn!(%err, "device-to-host copy failed; frame stays device-only");
            return;
        }
        frame.host = Some(host);
    }
}

impl VideoDecode for HardwareDecoder {
    fn input_stream(&self, data: &[u8], timestamp: i64) -> Result<()> {
        if self.core.quit.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }
        let mut parser = self.parser.lock();
        let eos = data.is_empty();
        if eos {
            // Lets the flush exceed the queue bound instead of stranding
            // trailing frames behind a full queue.
            self.core.state.lock().draining = true;
        }
        let fed = parser.feed(data, timestamp);
        if eos {
            let mut state = self.core.state.lock();
            match state.queue.back_mut() {
                Some(tail) => tail.last = true,
                // Consumer drained everything between callbacks: leave a
                // bare marker so it still observes the end of stream.
                None => state.queue.push_back(DecodedFrame::end_marker()),
            }
            state.finished = true;
            drop(state);
            self.core.avail.notify_all();
        }
        fed
    }

    fn get_frame(&self) -> Option<DecodedFrame> {
        let mut frame = {
            let mut state = self.core.state.lock();
            let frame = state.queue.pop_front()?;
            drop(state);
            self.core.space.notify_one();
            frame
        };
        if self.core.map_to_host {
            self.map_frame_to_host(&mut frame);
        }
        Some(frame)
    }

    fn wait_frame(&self, timeout: Duration) -> Option<DecodedFrame> {
        {
            let mut state = self.core.state.lock();
            while state.queue.is_empty() {
                if state.finished || self.core.quit.load(Ordering::Acquire) {
                    return None;
                }
                if self
                    .core
                    .avail
                    .wait_for(&mut state, timeout)
                    .timed_out()
                {
                    return None;
                }
            }
        }
        self.get_frame()
    }

    fn put_frame(&self, frame: DecodedFrame) {
        // Dropping returns both buffers through their pool backrefs.
        drop(frame);
    }

    fn set_strategy(&self, strategy: QueueStrategy) {
        *self.core.strategy.lock() = strategy;
    }

    fn is_finished(&self) -> bool {
        let state = self.core.state.lock();
        state.finished && state.queue.is_empty()
    }
}

impl Drop for HardwareDecoder {
    fn drop(&mut self) {
        self.shutdown();
        let mut state = self.core.state.lock();
        if !state.queue.is_empty() {
            debug!(
                queued = state.queue.len(),
                "decoder dropped with queued frames; returning their buffers"
            );
            state.queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::emulated::{clip_bytes, EmulatedDriver};

    fn decoder_with(config: DecoderConfig) -> (HardwareDecoder, Arc<EmulatedDriver>) {
        let driver = Arc::new(EmulatedDriver::new());
        let dec = HardwareDecoder::new(driver.clone(), Codec::H264, &config, None).expect("decoder");
        (dec, driver)
    }

    fn feed_clip(dec: &HardwareDecoder, clip: &[u8]) {
        for chunk in clip.chunks(1024) {
            dec.input_stream(chunk, 0).expect("feed");
        }
        dec.input_stream(&[], 0).expect("eos");
    }

    #[test]
    fn decodes_clip_and_marks_last() {
        let (dec, _driver) = decoder_with(DecoderConfig {
            queue_len: 64,
            ..DecoderConfig::default()
        });
        feed_clip(&dec, &clip_bytes(320, 240, 10));

        let mut frames = Vec::new();
        while let Some(f) = dec.get_frame() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 10);
        assert!(frames[9].last);
        assert!(frames[..9].iter().all(|f| !f.last));
        assert!(frames.iter().all(|f| f.device.is_some()));
        assert!(dec.is_finished());
    }

    #[test]
    fn timestamps_strictly_increase() {
        let (dec, _driver) = decoder_with(DecoderConfig {
            queue_len: 64,
            ..DecoderConfig::default()
        });
        feed_clip(&dec, &clip_bytes(320, 240, 30));
        let mut prev = None;
        while let Some(f) = dec.get_frame() {
            if let Some(p) = prev {
                assert!(f.timestamp > p, "{} !> {p}", f.timestamp);
            }
            prev = Some(f.timestamp);
        }
    }

    #[test]
    fn wait_strategy_bounds_the_queue() {
        let (dec, _driver) = decoder_with(DecoderConfig {
            queue_len: 4,
            strategy: QueueStrategy::Wait,
            ..DecoderConfig::default()
        });
        let dec = Arc::new(dec);
        let feeder = {
            let dec = dec.clone();
            std::thread::spawn(move || feed_clip(&dec, &clip_bytes(320, 240, 20)))
        };
        let mut seen = 0;
        while let Some(_f) = dec.wait_frame(Duration::from_secs(2)) {
            assert!(dec.queue_depth() <= 5, "queue ran past its bound");
            seen += 1;
            std::thread::sleep(Duration::from_millis(1));
        }
        feeder.join().expect("feeder");
        assert_eq!(seen, 20, "wait strategy loses nothing");
    }

    #[test]
    fn drop_oldest_keeps_newest_frames() {
        let (dec, _driver) = decoder_with(DecoderConfig {
            queue_len: 4,
            strategy: QueueStrategy::DropOldest,
            ..DecoderConfig::default()
        });
        feed_clip(&dec, &clip_bytes(320, 240, 12));
        let mut timestamps = Vec::new();
        while let Some(f) = dec.get_frame() {
            timestamps.push(f.timestamp);
        }
        // 4 retained from 12 decoded, strictly increasing, from the tail.
        assert_eq!(timestamps.len(), 4);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(dec.stats().frames_dropped, 8);
    }

    #[test]
    fn drop_newest_keeps_earliest_frames() {
        let (dec, _driver) = decoder_with(DecoderConfig {
            queue_len: 4,
            strategy: QueueStrategy::DropNewest,
            ..DecoderConfig::default()
        });
        feed_clip(&dec, &clip_bytes(320, 240, 12));
        let mut count = 0;
        let mut prev = 0u64;
        while let Some(f) = dec.get_frame() {
            assert!(f.timestamp >= prev);
            prev = f.timestamp;
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(dec.stats().frames_dropped, 8);
    }

    #[test]
    fn sequence_change_recreates_decoder() {
        let (dec, _driver) = decoder_with(DecoderConfig {
            queue_len: 16,
            ..DecoderConfig::default()
        });
        let mut clip = clip_bytes(320, 240, 5);
        clip.extend_from_slice(&clip_bytes(640, 480, 5));
        feed_clip(&dec, &clip);

        let mut widths = Vec::new();
        while let Some(f) = dec.get_frame() {
            widths.push(f.width);
        }
        assert_eq!(widths, [320, 320, 320, 320, 320, 640, 640, 640, 640, 640]);
        assert_eq!(dec.stats().sequence_changes, 2);
    }

    #[test]
    fn map_to_host_attaches_host_copy() {
        let (dec, _driver) = decoder_with(DecoderConfig {
            queue_len: 8,
            map_to_host: true,
            ..DecoderConfig::default()
        });
        feed_clip(&dec, &clip_bytes(64, 32, 2));
        let frame = dec.get_frame().expect("frame");
        let (ptr, pitch) = frame.host_view().expect("host copy");
        assert_eq!(pitch, host_pitch(64));
        // First decoded frame carries the pattern for counter 0.
        let first = unsafe { *ptr };
        assert_eq!(first, 0);
        let second = dec.get_frame().expect("frame 2");
        let (ptr, _) = second.host_view().expect("host copy");
        assert_eq!(unsafe { *ptr }, 1);
    }

    #[test]
    fn empty_queue_at_eos_yields_bare_marker() {
        let (dec, _driver) = decoder_with(DecoderConfig::default());
        // EOS with nothing ever decoded.
        dec.input_stream(&[], 0).expect("eos");
        let frame = dec.get_frame().expect("marker");
        assert!(frame.last);
        assert!(frame.device.is_none());
        assert!(dec.is_finished());
    }

    #[test]
    fn steady_state_reuses_device_buffers() {
        let (dec, driver) = decoder_with(DecoderConfig {
            queue_len: 2,
            strategy: QueueStrategy::Wait,
            ..DecoderConfig::default()
        });
        let dec = Arc::new(dec);
        let memory = driver.emulated_memory();
        let feeder = {
            let dec = dec.clone();
            std::thread::spawn(move || feed_clip(&dec, &clip_bytes(320, 240, 50)))
        };
        let mut seen = 0;
        while let Some(f) = dec.wait_frame(Duration::from_secs(2)) {
            dec.put_frame(f);
            seen += 1;
        }
        feeder.join().expect("feeder");
        assert_eq!(seen, 50);
        // Pool reuse keeps the allocator traffic far below frame count.
        assert!(
            memory.total_allocs() <= 8,
            "expected pooled reuse, saw {} allocations",
            memory.total_allocs()
        );
        assert_eq!(dec.device_pool().busy_len(), 0);
    }
}
