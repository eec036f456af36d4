// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pool of reference-counted frame handles.
//!
//! Frame metadata records are recycled through a bounded pool so handle
//! lifetime is decoupled from buffer lifetime: downstream stages clone
//! [`SmartFrame`]s freely, and only the last release returns the device
//! buffer (through its weak pool backref) and the record itself.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::core::alloc::nv12_size;
use crate::core::driver::DevicePtr;
use crate::core::pool::{PooledDeviceBuffer, PooledHostBuffer};
use crate::core::{PipelineError, Result};

/// Identifier of the producing stream, assigned when a stream is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// One decoded picture: metadata plus pooled device (and optionally host)
/// NV12 storage. Dropping the buffers returns them to their pools.
#[derive(Debug, Default)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row stride of the device buffer in bytes.
    pub device_pitch: u32,
    /// Synthesized monotonic timestamp in 100 ns ticks.
    pub timestamp: u64,
    /// End-of-stream sentinel: no further frames follow from this stream.
    pub last: bool,
    /// Per-producer monotonic index.
    pub frame_no: u64,
    pub stream: StreamId,
    pub(crate) device: Option<PooledDeviceBuffer>,
    pub(crate) host: Option<PooledHostBuffer>,
}

impl Frame {
    /// NV12 device pointer, when the frame carries device data.
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        self.device.as_ref().map(|b| b.device_ptr())
    }

    /// Host copy (address and pitch), present only when the producing
    /// decoder ran with `map_to_host`.
    pub fn host_view(&self) -> Option<(*const u8, u32)> {
        self.host
            .as_ref()
            .map(|b| (b.addr().as_host_ptr() as *const u8, b.pitch()))
    }

    /// Byte length of the device NV12 image.
    pub fn nv12_len(&self) -> usize {
        nv12_size(self.device_pitch, self.height)
    }

    /// Return buffers to their pools and clear all metadata.
    fn reset(&mut self) {
        *self = Frame::default();
    }
}

struct PoolState {
    free: Vec<Frame>,
    busy: usize,
    quit: bool,
}

struct PoolShared {
    capacity: usize,
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl PoolShared {
    fn put(&self, mut frame: Frame) {
        // Buffers go back to their pools before the record is recycled.
        frame.reset();
        let mut state = self.state.lock();
        state.busy = state.busy.saturating_sub(1);
        if !state.quit {
            state.free.push(frame);
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// Bounded pool of [`Frame`] records. See the module docs.
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity: capacity.max(1),
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    busy: 0,
                    quit: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Check a frame record out, waiting while the pool is saturated.
    ///
    /// `stream` is recorded on the frame for diagnostics. Fails with
    /// [`PipelineError::ShuttingDown`] once [`shutdown`](Self::shutdown)
    /// has been called.
    pub fn get(&self, stream: StreamId) -> Result<PooledFrame> {
        let mut state = self.shared.state.lock();
        loop {
            if state.quit {
                return Err(PipelineError::ShuttingDown);
            }
            let frame = if let Some(mut frame) = state.free.pop() {
                frame.stream = stream;
                Some(frame)
            } else if state.free.len() + state.busy < self.shared.capacity {
                Some(Frame {
                    stream,
                    ..Frame::default()
                })
            } else {
                None
            };
            if let Some(frame) = frame {
                state.busy += 1;
                return Ok(PooledFrame {
                    frame: Some(frame),
                    shared: Arc::downgrade(&self.shared),
                });
            }
            self.shared.changed.wait_for(&mut state, Duration::from_millis(100));
        }
    }

    /// Stop handing out records. Outstanding handles keep draining.
    pub fn shutdown(&self) {
        self.shared.state.lock().quit = true;
        self.shared.changed.notify_all();
    }

    pub fn free_len(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    pub fn busy_len(&self) -> usize {
        self.shared.state.lock().busy
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        self.shutdown();
        let mut state = self.shared.state.lock();
        let mut waited = Duration::ZERO;
        while state.busy > 0 {
            self.shared
                .changed
                .wait_for(&mut state, Duration::from_millis(100));
            waited += Duration::from_millis(100);
            if waited == Duration::from_secs(1) {
                warn!(busy = state.busy, "frame pool teardown waiting for handles");
            }
            if waited >= Duration::from_secs(5) {
                error!(
                    busy = state.busy,
                    "frame pool teardown gave up waiting; leaking pinned handles"
                );
                break;
            }
        }
        // Free records drop here; any buffers they still held return first.
        state.free.clear();
    }
}

/// A frame record checked out of a [`FramePool`].
///
/// Populate it through `DerefMut`, then convert into a [`SmartFrame`] for
/// distribution. Dropping it unconverted returns the record immediately.
pub struct PooledFrame {
    frame: Option<Frame>,
    shared: Weak<PoolShared>,
}

impl PooledFrame {
    /// Wrap into a shareable handle. From here on the record returns to the
    /// pool when the last handle clone drops.
    pub fn into_handle(mut self) -> SmartFrame {
        let frame = self.frame.take().expect("frame record already taken");
        SmartFrame {
            cell: Arc::new(FrameCell {
                frame,
                pool: self.shared.clone(),
            }),
        }
    }
}

impl Deref for PooledFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        self.frame.as_ref().expect("frame record already taken")
    }
}

impl DerefMut for PooledFrame {
    fn deref_mut(&mut self) -> &mut Frame {
        self.frame.as_mut().expect("frame record already taken")
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            if let Some(shared) = self.shared.upgrade() {
                shared.put(frame);
            }
        }
    }
}

struct FrameCell {
    frame: Frame,
    pool: Weak<PoolShared>,
}

impl Drop for FrameCell {
    // Runs exactly once, on the release of the last handle clone: the
    // frame's buffers return to their pools, then the record itself.
    fn drop(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        if let Some(shared) = self.pool.upgrade() {
            shared.put(frame);
        }
        // Pool gone: the record drops here and its buffers still return
        // through their own backrefs.
    }
}

/// Cheap-to-clone owning handle to a pooled [`Frame`].
///
/// The refcount is the `Arc` strong count; the release hook is the cell's
/// drop, which only the last clone triggers.
#[derive(Clone)]
pub struct SmartFrame {
    cell: Arc<FrameCell>,
}

impl SmartFrame {
    /// Current reference count, for diagnostics and tests.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }
}

impl Deref for SmartFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.cell.frame
    }
}

impl std::fmt::Debug for SmartFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartFrame")
            .field("stream", &self.stream)
            .field("frame_no", &self.frame_no)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("last", &self.last)
            .field("refs", &self.ref_count())
            .finish()
    }
}
