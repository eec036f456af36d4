// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Typed dedicated memory pools: size-bucketed buffer pools for host RAM
//! and device VRAM, plus the pool of reference-counted frame handles.

mod buffer_pool;
mod frame_pool;

pub use buffer_pool::{
    BufferPool, DeviceAllocator, DevicePool, HostPool, PooledDeviceBuffer, PooledHostBuffer,
    POOL_MAX, POOL_MIN,
};
pub use frame_pool::{Frame, FramePool, PooledFrame, SmartFrame, StreamId};
