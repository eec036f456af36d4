// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Configuration structs for the decode and batching components.

use serde::{Deserialize, Serialize};

/// Overflow policy for a decoder's output queue.
///
/// Applied by the display handler when a decoded frame arrives while the
/// queue already holds `queue_len` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Block the display handler until the consumer pops a frame.
    #[default]
    Wait,
    /// Pop the oldest queued frame to make room for the incoming one.
    DropOldest,
    /// Discard the incoming frame and keep the queue as is.
    DropNewest,
}

/// Per-stream decoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// GPU ordinal the decoder runs on.
    pub device_index: u32,
    /// Output queue bound. Also sizes the driver's decode/display surfaces
    /// (decode surfaces = 2x, output surfaces = 1x).
    pub queue_len: usize,
    /// Copy each popped frame into a pooled host buffer as well.
    pub map_to_host: bool,
    /// Initial overflow policy; switchable at runtime.
    pub strategy: QueueStrategy,
    /// Bound for the decoder's host buffer pool.
    pub host_pool_size: usize,
    /// Bound for the decoder's own device pool, used only when no shared
    /// pool is injected.
    pub device_pool_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            queue_len: 4,
            map_to_host: false,
            strategy: QueueStrategy::default(),
            host_pool_size: 16,
            device_pool_size: 512,
        }
    }
}

/// Configuration for the cross-stream batch pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Frames per emitted batch.
    pub batch_size: usize,
    /// Number of batch-sized slices in the ring.
    pub batch_count: usize,
    /// Partial-batch flush interval in milliseconds, clamped to `[1, 50]`.
    pub timeout_ms: u64,
    /// Bound for the frame-handle pool shared by every stream of the pipe.
    pub frame_pool_size: usize,
    /// Initial bound for the shared device pool; grows with each stream.
    pub device_pool_size: usize,
    /// Decoder settings applied to every stream the pipe starts.
    pub decoder: DecoderConfig,
    /// Restart elementary-stream inputs from the beginning on EOF.
    pub loop_playback: bool,
}

impl BatchConfig {
    /// Flush interval with the `[1, 50]` ms bound applied.
    pub fn bounded_timeout_ms(&self) -> u64 {
        self.timeout_ms.clamp(1, 50)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            batch_count: 4,
            timeout_ms: 40,
            frame_pool_size: 1024,
            device_pool_size: 512,
            decoder: DecoderConfig::default(),
            loop_playback: false,
        }
    }
}

/// Configuration for the downstream stage chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of stages in the chain.
    pub stages: usize,
    /// Worker threads per stage.
    pub workers: usize,
    /// Bound of the handle queue feeding each stage.
    pub queue_depth: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            stages: 3,
            workers: 2,
            queue_depth: 64,
        }
    }
}
