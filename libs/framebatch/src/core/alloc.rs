// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Raw allocation primitives shared by the host and device buffer pools.
//!
//! Buffers are tracked as opaque `{address, capacity}` records so one pool
//! implementation serves both memory kinds. Host buffers come from the libc
//! allocator; device buffers come from whatever [`DeviceMemory`] the active
//! driver exposes.
//!
//! [`DeviceMemory`]: crate::core::driver::DeviceMemory

use crate::core::{PipelineError, Result};

/// Device rows are aligned the way the hardware decoder pitches them.
pub const DEVICE_PITCH_ALIGN: u32 = 512;
/// Host rows only need word alignment.
pub const HOST_PITCH_ALIGN: u32 = 4;

/// Round `width` bytes up to the device pitch alignment.
#[inline]
pub const fn device_pitch(width: u32) -> u32 {
    width.next_multiple_of(DEVICE_PITCH_ALIGN)
}

/// Round `width` bytes up to the host pitch alignment.
#[inline]
pub const fn host_pitch(width: u32) -> u32 {
    width.next_multiple_of(HOST_PITCH_ALIGN)
}

/// NV12 byte size for a `pitch`-strided image: full-resolution Y plane
/// followed by an interleaved half-resolution UV plane.
#[inline]
pub const fn nv12_size(pitch: u32, height: u32) -> usize {
    (pitch as usize * height as usize) * 3 / 2
}

/// Opaque buffer address. Host pointers and device pointers share this
/// representation; only the pool that handed an address out knows which
/// allocator it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufAddr(pub u64);

impl BufAddr {
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// View as a raw host pointer.
    ///
    /// Only meaningful for addresses produced by a host allocator.
    #[inline]
    pub fn as_host_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

/// Allocator a [`BufferPool`](crate::core::pool::BufferPool) is built over.
///
/// `free` receives the capacity the address was allocated with, because
/// neither libc nor the device allocator can be asked for it afterwards.
pub trait RawAllocator: Send + Sync + 'static {
    fn alloc(&self, len: usize) -> Result<BufAddr>;
    fn free(&self, addr: BufAddr, len: usize) -> Result<()>;

    /// Resize a buffer. The default is free-then-allocate, which is the
    /// only option for device memory; content is not preserved.
    fn realloc(&self, addr: BufAddr, old_len: usize, new_len: usize) -> Result<BufAddr> {
        self.free(addr, old_len)?;
        self.alloc(new_len)
    }
}

/// Host RAM allocator over libc `malloc`/`free`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl RawAllocator for HostAllocator {
    fn alloc(&self, len: usize) -> Result<BufAddr> {
        debug_assert!(len > 0);
        // SAFETY: malloc with a non-zero length; the pointer is released via
        // libc::free in `free` below and nowhere else.
        let ptr = unsafe { libc::malloc(len) };
        if ptr.is_null() {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "host allocation of {len} bytes failed"
            )));
        }
        Ok(BufAddr(ptr as usize as u64))
    }

    fn free(&self, addr: BufAddr, _len: usize) -> Result<()> {
        debug_assert!(!addr.is_null());
        // SAFETY: the address was produced by `alloc` above and is freed
        // exactly once; the owning pool enforces that.
        unsafe { libc::free(addr.as_host_ptr() as *mut libc::c_void) };
        Ok(())
    }

    fn realloc(&self, addr: BufAddr, _old_len: usize, new_len: usize) -> Result<BufAddr> {
        debug_assert!(!addr.is_null() && new_len > 0);
        // SAFETY: `addr` came from `alloc`/`realloc` on this allocator and
        // is relinquished here either way.
        let ptr = unsafe { libc::realloc(addr.as_host_ptr() as *mut libc::c_void, new_len) };
        if ptr.is_null() {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "host reallocation to {new_len} bytes failed"
            )));
        }
        Ok(BufAddr(ptr as usize as u64))
    }
}
