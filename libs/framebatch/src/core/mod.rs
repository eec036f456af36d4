// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod alloc;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod source;

pub use batch::{BatchCallback, BatchPipe, CircularBatch, ClosedBatch, FrameBatchCallback};
pub use config::{BatchConfig, DecoderConfig, QueueStrategy, StageConfig};
pub use coordinator::Coordinator;
pub use decode::{DecodedFrame, DecoderStats, HardwareDecoder, VideoDecode};
pub use error::{PipelineError, Result};
pub use pipeline::{PipelineStages, StageWork};
pub use pool::{
    BufferPool, DevicePool, Frame, FramePool, HostPool, PooledDeviceBuffer, PooledFrame,
    PooledHostBuffer, SmartFrame, StreamId,
};
pub use source::{ElementaryStreamSource, MediaSource};
