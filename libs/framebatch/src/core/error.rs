// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Error types for framebatch
//!
//! Defines the core error types used throughout the pipeline. Backend
//! crates/features map their native error codes into these variants.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Context / parser / decoder creation failed. Aborts the stream.
    #[error("driver error: {0}")]
    DriverFatal(String),

    /// Map or decode-submit failed in a way the driver may recover from.
    /// Callers retry with backoff.
    #[error("transient driver error: {0}")]
    DriverTransient(String),

    /// A buffer handed back to a pool was never handed out by it.
    #[error("buffer {0:#x} does not belong to this pool")]
    UnknownBuffer(u64),

    /// Media source could not be opened. Aborts the stream.
    #[error("failed to open media source: {0}")]
    SourceOpen(String),

    /// Packet read failed mid-stream. The stream terminates with an EOS
    /// marker so the decoder drains cleanly.
    #[error("media read failed: {0}")]
    SourceRead(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The component has been asked to quit; no new work is accepted.
    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether a caller should retry after a short backoff instead of
    /// aborting the stream.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::DriverTransient(_))
    }
}

/// Result type that uses PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;
