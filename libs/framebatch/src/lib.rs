// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Multi-source GPU video decoding and cross-stream frame batching.
//!
//! Encoded inputs (raw H.264 elementary streams and container media) are
//! driven through hardware video decoders; the decoded NV12 frames stay in
//! device memory and are assembled into fixed-size cross-source batches for
//! downstream GPU inference. Many concurrent streams share one GPU, one
//! VRAM pool, and one batch ring.
//!
//! The hardware decode API itself is an external collaborator behind the
//! [`core::driver`] traits; the NVDEC implementation is feature-gated
//! (`backend-nvdec`), and an emulated driver covers tests and GPU-less
//! machines.

pub mod core;

#[cfg(feature = "backend-nvdec")]
pub mod nvdec;

pub use core::{
    BatchConfig, BatchPipe, Coordinator, DecodedFrame, DecoderConfig, DecoderStats,
    ElementaryStreamSource, Frame, FramePool, HardwareDecoder, MediaSource, PipelineError,
    PipelineStages, QueueStrategy, Result, SmartFrame, StageConfig, StageWork, StreamId,
    VideoDecode,
};
