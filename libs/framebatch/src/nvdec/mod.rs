// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! NVDEC hardware backend (feature `backend-nvdec`).
//!
//! CUDA context + VRAM via cudarc, parser/decoder via runtime-loaded
//! nvcuvid. Both libraries resolve at runtime, so this builds on machines
//! without a CUDA toolkit and fails gracefully at startup when no NVIDIA
//! driver is present.

mod driver;
pub mod ffi;

pub use driver::NvdecDriver;
