// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Deterministic in-process decode driver.
//!
//! Implements the full driver contract (sequence / decode / display
//! callbacks, surface map/unmap accounting, EOS flush, mid-stream format
//! changes) over a trivial length-prefixed pseudo bitstream, so the decode
//! and batching machinery can be exercised end to end on machines without a
//! video engine. This emulates the driver, it does not decode H.264.
//!
//! Clip format, little endian, one record per frame:
//!
//! ```text
//! magic "FBC1" | width u16 | height u16 | flags u32 | payload_len u32 | payload...
//! ```
//!
//! The parser rescans for the magic after garbage, the way a hardware
//! parser recovers NAL-unit boundaries from arbitrary chunking.

use std::collections::HashMap;
use std::io::{self, Write};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::core::alloc::{device_pitch, nv12_size, BufAddr};
use crate::core::driver::{
    Codec, DeviceMemory, DevicePtr, DisplayInfo, HwDecoder, HwParser, MappedSurface,
    ParserEvents, PictureParams, SurfaceBudget, VideoDriver, VideoFormat,
};
use crate::core::{PipelineError, Result};

/// Record magic for the pseudo bitstream.
pub const CLIP_MAGIC: [u8; 4] = *b"FBC1";
/// Fixed header size in bytes.
pub const CLIP_HEADER_LEN: usize = 16;
/// Frame rate every emulated stream reports.
pub const CLIP_FRAME_RATE: (u32, u32) = (25, 1);

/// Serialize one frame record.
pub fn write_clip_frame(mut w: impl Write, width: u16, height: u16) -> io::Result<()> {
    w.write_all(&CLIP_MAGIC)?;
    w.write_all(&width.to_le_bytes())?;
    w.write_all(&height.to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?; // flags, reserved
    w.write_all(&0u32.to_le_bytes())?; // payload_len
    Ok(())
}

/// Serialize a whole clip of `(width, height)` frames.
pub fn write_clip(mut w: impl Write, frames: impl IntoIterator<Item = (u16, u16)>) -> io::Result<()> {
    for (width, height) in frames {
        write_clip_frame(&mut w, width, height)?;
    }
    Ok(())
}

/// A clip of `count` same-resolution frames, in memory.
pub fn clip_bytes(width: u16, height: u16, count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(count * CLIP_HEADER_LEN);
    write_clip(&mut out, std::iter::repeat_n((width, height), count)).expect("in-memory write");
    out
}

// ---------------------------------------------------------------------------
// Device memory
// ---------------------------------------------------------------------------

/// Host-backed stand-in for VRAM. Allocations are tracked so tests can
/// assert nothing leaks across a run.
#[derive(Default)]
pub struct EmulatedMemory {
    allocations: Mutex<HashMap<u64, Box<[u8]>>>,
    total_allocs: AtomicU64,
}

impl EmulatedMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live allocation count.
    pub fn outstanding(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Allocations performed over the lifetime of this memory.
    pub fn total_allocs(&self) -> u64 {
        self.total_allocs.load(Ordering::Relaxed)
    }

    /// Pitched copy between raw addresses. Both sides are host memory here.
    ///
    /// SAFETY: callers pass addresses obtained from this memory or from a
    /// live mapped surface; sizes are bounded by the allocation sizes the
    /// same callers computed them from.
    unsafe fn copy_pitched(
        src: u64,
        src_pitch: u32,
        dst: u64,
        dst_pitch: u32,
        width_bytes: u32,
        rows: u32,
    ) {
        for row in 0..rows as usize {
            let s = (src as usize + row * src_pitch as usize) as *const u8;
            let d = (dst as usize + row * dst_pitch as usize) as *mut u8;
            unsafe { ptr::copy_nonoverlapping(s, d, width_bytes as usize) };
        }
    }
}

impl DeviceMemory for EmulatedMemory {
    fn alloc(&self, len: usize) -> Result<BufAddr> {
        let buf = vec![0u8; len].into_boxed_slice();
        let addr = buf.as_ptr() as usize as u64;
        self.allocations.lock().insert(addr, buf);
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(BufAddr(addr))
    }

    fn free(&self, addr: BufAddr, _len: usize) -> Result<()> {
        match self.allocations.lock().remove(&addr.0) {
            Some(_) => Ok(()),
            None => Err(PipelineError::UnknownBuffer(addr.0)),
        }
    }

    fn copy_device_to_device(
        &self,
        src: DevicePtr,
        src_pitch: u32,
        dst: BufAddr,
        dst_pitch: u32,
        width_bytes: u32,
        rows: u32,
    ) -> Result<()> {
        // SAFETY: see copy_pitched.
        unsafe { Self::copy_pitched(src.0, src_pitch, dst.0, dst_pitch, width_bytes, rows) };
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        src: DevicePtr,
        src_pitch: u32,
        dst: BufAddr,
        dst_pitch: u32,
        width_bytes: u32,
        rows: u32,
    ) -> Result<()> {
        // SAFETY: see copy_pitched.
        unsafe { Self::copy_pitched(src.0, src_pitch, dst.0, dst_pitch, width_bytes, rows) };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// One decode surface: stable NV12 storage plus a mapped flag.
struct SurfaceSlot {
    data: Mutex<Box<[u8]>>,
    base: u64,
    pitch: u32,
}

struct DecoderShared {
    surfaces: Vec<Arc<SurfaceSlot>>,
    mapped: AtomicU32,
    output_limit: u32,
}

/// Emulated hardware decoder for one stream format.
///
/// `decode` fills the addressed surface with a deterministic pattern;
/// `map` hands the surface out while enforcing the output-surface budget
/// the way the real driver does (transient failure when exhausted).
pub struct EmulatedDecoder {
    shared: Arc<DecoderShared>,
    width: u32,
    height: u32,
    decode_count: AtomicU64,
}

impl EmulatedDecoder {
    fn new(format: &VideoFormat, surfaces: SurfaceBudget) -> Self {
        let pitch = device_pitch(format.coded_width);
        let len = nv12_size(pitch, format.coded_height);
        let slots = (0..surfaces.decode_surfaces.max(1))
            .map(|_| {
                let data = vec![0u8; len].into_boxed_slice();
                let base = data.as_ptr() as usize as u64;
                Arc::new(SurfaceSlot {
                    base,
                    pitch,
                    data: Mutex::new(data),
                })
            })
            .collect();
        Self {
            shared: Arc::new(DecoderShared {
                surfaces: slots,
                mapped: AtomicU32::new(0),
                output_limit: surfaces.output_surfaces.max(1),
            }),
            width: format.coded_width,
            height: format.coded_height,
            decode_count: AtomicU64::new(0),
        }
    }
}

struct EmulatedMapped {
    slot: Arc<SurfaceSlot>,
    shared: Arc<DecoderShared>,
}

impl MappedSurface for EmulatedMapped {
    fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.slot.base)
    }

    fn pitch(&self) -> u32 {
        self.slot.pitch
    }
}

impl Drop for EmulatedMapped {
    fn drop(&mut self) {
        self.shared.mapped.fetch_sub(1, Ordering::AcqRel);
    }
}

impl HwDecoder for EmulatedDecoder {
    fn decode(&self, pic: &PictureParams<'_>) -> Result<()> {
        let slot = self
            .shared
            .surfaces
            .get(pic.picture_index as usize)
            .ok_or_else(|| {
                PipelineError::DriverFatal(format!("picture index {} out of range", pic.picture_index))
            })?;
        let n = self.decode_count.fetch_add(1, Ordering::Relaxed);
        let mut data = slot.data.lock();
        // Deterministic NV12 content: Y keyed to the decode counter, UV neutral.
        let y_len = slot.pitch as usize * self.height as usize;
        data[..y_len].fill((n % 251) as u8);
        data[y_len..].fill(128);
        trace!(pic = pic.picture_index, n, "emulated decode");
        Ok(())
    }

    fn map(&self, disp: &DisplayInfo) -> Result<Box<dyn MappedSurface>> {
        let slot = self
            .shared
            .surfaces
            .get(disp.picture_index as usize)
            .ok_or_else(|| {
                PipelineError::DriverFatal(format!("picture index {} out of range", disp.picture_index))
            })?;
        // Respect the output-surface budget: map fails transiently while
        // every output surface is in flight, exactly like the real driver.
        let mut current = self.shared.mapped.load(Ordering::Acquire);
        loop {
            if current >= self.shared.output_limit {
                return Err(PipelineError::DriverTransient(
                    "all output surfaces mapped".into(),
                ));
            }
            match self.shared.mapped.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        Ok(Box::new(EmulatedMapped {
            slot: slot.clone(),
            shared: self.shared.clone(),
        }))
    }
}

impl EmulatedDecoder {
    pub fn coded_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Emulated bitstream parser.
///
/// Accumulates fed bytes, resynchronizes on the record magic, and drives
/// the three callbacks synchronously from within `feed`, mirroring how the
/// hardware parser invokes them from `parse` on its own thread.
pub struct EmulatedParser {
    codec: Codec,
    events: Arc<dyn ParserEvents>,
    buffer: Vec<u8>,
    current: Option<(u16, u16)>,
    decode_surfaces: u32,
    next_slot: u32,
    frames_parsed: u64,
}

impl EmulatedParser {
    fn parse_available(&mut self) -> Result<()> {
        loop {
            // Resynchronize: drop bytes preceding the next magic.
            let Some(start) = find_magic(&self.buffer) else {
                if self.buffer.len() >= CLIP_MAGIC.len() {
                    let keep = self.buffer.len() - (CLIP_MAGIC.len() - 1);
                    self.buffer.drain(..keep);
                }
                return Ok(());
            };
            if start > 0 {
                warn!(skipped = start, "emulated parser resynchronized");
                self.buffer.drain(..start);
            }
            if self.buffer.len() < CLIP_HEADER_LEN {
                return Ok(());
            }

            let width = u16::from_le_bytes([self.buffer[4], self.buffer[5]]);
            let height = u16::from_le_bytes([self.buffer[6], self.buffer[7]]);
            let payload_len = u32::from_le_bytes([
                self.buffer[12],
                self.buffer[13],
                self.buffer[14],
                self.buffer[15],
            ]) as usize;
            if self.buffer.len() < CLIP_HEADER_LEN + payload_len {
                return Ok(());
            }
            self.buffer.drain(..CLIP_HEADER_LEN + payload_len);

            if width == 0 || height == 0 {
                warn!(width, height, "dropping degenerate frame record");
                continue;
            }

            if self.current != Some((width, height)) {
                let format = VideoFormat {
                    codec: self.codec,
                    coded_width: u32::from(width),
                    coded_height: u32::from(height),
                    min_decode_surfaces: self.decode_surfaces,
                    frame_rate: Some(CLIP_FRAME_RATE),
                };
                debug!(width, height, "emulated sequence change");
                let surfaces = self.events.on_sequence(&format);
                if surfaces == 0 {
                    return Err(PipelineError::DriverFatal("sequence callback rejected format".into()));
                }
                self.decode_surfaces = surfaces;
                self.current = Some((width, height));
                self.next_slot = 0;
            }

            let index = (self.next_slot % self.decode_surfaces.max(1)) as i32;
            self.next_slot = self.next_slot.wrapping_add(1);

            let pic = PictureParams::new(index, ptr::null());
            if !self.events.on_decode(&pic) {
                return Err(PipelineError::DriverFatal("decode callback failed".into()));
            }

            let disp = DisplayInfo {
                picture_index: index,
                timestamp: self.frames_parsed as i64,
                progressive_frame: true,
                top_field_first: false,
            };
            self.frames_parsed += 1;
            if !self.events.on_display(&disp) {
                return Err(PipelineError::DriverFatal("display callback failed".into()));
            }
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(CLIP_MAGIC.len()).position(|w| w == CLIP_MAGIC)
}

impl HwParser for EmulatedParser {
    fn feed(&mut self, data: &[u8], _timestamp: i64) -> Result<()> {
        if data.is_empty() {
            // End of stream: everything parseable was already delivered;
            // discard any trailing partial record.
            if !self.buffer.is_empty() {
                debug!(trailing = self.buffer.len(), "discarding partial record at EOS");
                self.buffer.clear();
            }
            return Ok(());
        }
        self.buffer.extend_from_slice(data);
        self.parse_available()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The emulated [`VideoDriver`].
pub struct EmulatedDriver {
    memory: Arc<EmulatedMemory>,
}

impl EmulatedDriver {
    pub fn new() -> Self {
        Self {
            memory: EmulatedMemory::new(),
        }
    }

    /// The backing memory, for leak assertions in tests.
    pub fn emulated_memory(&self) -> Arc<EmulatedMemory> {
        self.memory.clone()
    }
}

impl Default for EmulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDriver for EmulatedDriver {
    fn memory(&self) -> Arc<dyn DeviceMemory> {
        self.memory.clone()
    }

    fn create_parser(
        &self,
        codec: Codec,
        surfaces: SurfaceBudget,
        events: Arc<dyn ParserEvents>,
    ) -> Result<Box<dyn HwParser>> {
        Ok(Box::new(EmulatedParser {
            codec,
            events,
            buffer: Vec::with_capacity(4096),
            current: None,
            decode_surfaces: surfaces.decode_surfaces.max(1),
            next_slot: 0,
            frames_parsed: 0,
        }))
    }

    fn create_decoder(
        &self,
        format: &VideoFormat,
        surfaces: SurfaceBudget,
    ) -> Result<Box<dyn HwDecoder>> {
        Ok(Box::new(EmulatedDecoder::new(format, surfaces)))
    }
}
