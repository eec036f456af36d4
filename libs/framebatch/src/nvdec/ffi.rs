// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Minimal nvcuvid ABI surface.
//!
//! There is no maintained binding crate for the parser/decoder half of the
//! NVDEC API, so the handful of entry points this backend needs are declared
//! here and resolved from `libnvcuvid.so` at runtime, the same way cudarc
//! resolves `libcuda.so`. Only the leading fields of each struct are named;
//! trailing ABI space is covered by reserved arrays sized to the current
//! `cuviddec.h` / `nvcuvid.h` layouts.

#![allow(non_snake_case, non_camel_case_types)]

use std::ffi::{c_int, c_ulong, c_void};

use crate::core::{PipelineError, Result};

pub type CUresult = c_int;
pub const CUDA_SUCCESS: CUresult = 0;

pub type CUvideoparser = *mut c_void;
pub type CUvideodecoder = *mut c_void;
pub type CUvideoctxlock = *mut c_void;
pub type CUcontext = cudarc::driver::sys::CUcontext;
pub type CUdeviceptr = u64;

/// cudaVideoCodec
pub mod codec_type {
    pub const H264: i32 = 4;
    pub const HEVC: i32 = 8;
}

/// cudaVideoChromaFormat
pub const CHROMA_FORMAT_420: i32 = 1;
/// cudaVideoSurfaceFormat
pub const SURFACE_FORMAT_NV12: i32 = 0;
/// cudaVideoDeinterlaceMode
pub const DEINTERLACE_ADAPTIVE: i32 = 2;
/// cudaVideoCreate flags
pub const CREATE_PREFER_CUVID: c_ulong = 0x04;

/// CUVID_PKT_* packet flags
pub mod packet_flags {
    use std::ffi::c_ulong;
    pub const ENDOFSTREAM: c_ulong = 0x01;
    pub const TIMESTAMP: c_ulong = 0x02;
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CuvidFrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CuvidRect {
    pub left: c_int,
    pub top: c_int,
    pub right: c_int,
    pub bottom: c_int,
}

/// CUVIDEOFORMAT, through the fields this backend reads.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CuVideoFormat {
    pub codec: c_int,
    pub frame_rate: CuvidFrameRate,
    pub progressive_sequence: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub min_num_decode_surfaces: u8,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_area: CuvidRect,
    pub chroma_format: c_int,
    pub bitrate: u32,
    pub display_aspect_ratio: [c_int; 2],
    pub video_signal_description: u32,
    pub seqhdr_data_length: u32,
}

/// CUVIDPICPARAMS. Only the leading fields are named; the parser fills the
/// rest and the struct travels through untouched.
#[repr(C)]
pub struct CuvidPicParams {
    pub PicWidthInMbs: c_int,
    pub FrameHeightInMbs: c_int,
    pub CurrPicIdx: c_int,
    // Codec-specific payload follows; never constructed on this side.
    _opaque: [u8; 0],
}

/// CUVIDPARSERDISPINFO
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CuvidParserDispInfo {
    pub picture_index: c_int,
    pub progressive_frame: c_int,
    pub top_field_first: c_int,
    pub repeat_first_field: c_int,
    pub timestamp: i64,
}

pub type SequenceCallback = unsafe extern "C" fn(*mut c_void, *mut CuVideoFormat) -> c_int;
pub type DecodeCallback = unsafe extern "C" fn(*mut c_void, *mut CuvidPicParams) -> c_int;
pub type DisplayCallback = unsafe extern "C" fn(*mut c_void, *mut CuvidParserDispInfo) -> c_int;

/// CUVIDPARSERPARAMS
#[repr(C)]
pub struct CuvidParserParams {
    pub CodecType: c_int,
    pub ulMaxNumDecodeSurfaces: u32,
    pub ulClockRate: u32,
    pub ulErrorThreshold: u32,
    pub ulMaxDisplayDelay: u32,
    /// bAnnexb:1 plus reserved bits.
    pub uFlags: u32,
    pub uReserved1: [u32; 4],
    pub pUserData: *mut c_void,
    pub pfnSequenceCallback: Option<SequenceCallback>,
    pub pfnDecodePicture: Option<DecodeCallback>,
    pub pfnDisplayPicture: Option<DisplayCallback>,
    pub pfnGetOperatingPoint: *mut c_void,
    pub pfnGetSEIMsg: *mut c_void,
    pub pvReserved2: [*mut c_void; 5],
    pub pExtVideoInfo: *mut c_void,
}

impl Default for CuvidParserParams {
    fn default() -> Self {
        Self {
            CodecType: 0,
            ulMaxNumDecodeSurfaces: 0,
            ulClockRate: 0,
            ulErrorThreshold: 0,
            ulMaxDisplayDelay: 0,
            uFlags: 0,
            uReserved1: [0; 4],
            pUserData: std::ptr::null_mut(),
            pfnSequenceCallback: None,
            pfnDecodePicture: None,
            pfnDisplayPicture: None,
            pfnGetOperatingPoint: std::ptr::null_mut(),
            pfnGetSEIMsg: std::ptr::null_mut(),
            pvReserved2: [std::ptr::null_mut(); 5],
            pExtVideoInfo: std::ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct CuvidShortRect {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
}

/// CUVIDDECODECREATEINFO
#[repr(C)]
pub struct CuvidDecodeCreateInfo {
    pub ulWidth: c_ulong,
    pub ulHeight: c_ulong,
    pub ulNumDecodeSurfaces: c_ulong,
    pub CodecType: c_int,
    pub ChromaFormat: c_int,
    pub ulCreationFlags: c_ulong,
    pub bitDepthMinus8: c_ulong,
    pub ulIntraDecodeOnly: c_ulong,
    pub ulMaxWidth: c_ulong,
    pub ulMaxHeight: c_ulong,
    pub Reserved1: c_ulong,
    pub display_area: CuvidShortRect,
    pub OutputFormat: c_int,
    pub DeinterlaceMode: c_int,
    pub ulTargetWidth: c_ulong,
    pub ulTargetHeight: c_ulong,
    pub ulNumOutputSurfaces: c_ulong,
    pub vidLock: CUvideoctxlock,
    pub target_rect: CuvidShortRect,
    pub enableHistogram: c_ulong,
    pub Reserved2: [c_ulong; 4],
}

impl Default for CuvidDecodeCreateInfo {
    fn default() -> Self {
        // SAFETY: all-zero is the documented initial state for this struct
        // (plain integers, null handles).
        unsafe { std::mem::zeroed() }
    }
}

/// CUVIDSOURCEDATAPACKET
#[repr(C)]
pub struct CuvidSourceDataPacket {
    pub flags: c_ulong,
    pub payload_size: c_ulong,
    pub payload: *const u8,
    pub timestamp: i64,
}

/// CUVIDPROCPARAMS
#[repr(C)]
pub struct CuvidProcParams {
    pub progressive_frame: c_int,
    pub second_field: c_int,
    pub top_field_first: c_int,
    pub unpaired_field: c_int,
    pub reserved_flags: u32,
    pub reserved_zero: u32,
    pub raw_input_dptr: u64,
    pub raw_input_pitch: u32,
    pub raw_input_format: u32,
    pub raw_output_dptr: u64,
    pub raw_output_pitch: u32,
    pub Reserved1: u32,
    pub output_stream: *mut c_void,
    pub Reserved: [u32; 46],
    pub histogram_dptr: *mut u64,
    pub Reserved2: [*mut c_void; 1],
}

impl Default for CuvidProcParams {
    fn default() -> Self {
        // SAFETY: as above, zeroed is the initial state.
        unsafe { std::mem::zeroed() }
    }
}

macro_rules! load_symbol {
    ($lib:expr, $name:literal) => {{
        // SAFETY: the symbol signature matches the nvcuvid export.
        let symbol = unsafe { $lib.get($name) }.map_err(|err| {
            PipelineError::DriverFatal(format!(
                "libnvcuvid is missing {}: {err}",
                String::from_utf8_lossy($name)
            ))
        })?;
        *symbol
    }};
}

/// The nvcuvid entry points, resolved at runtime.
pub struct NvcuvidLibrary {
    pub cuvidCreateVideoParser:
        unsafe extern "C" fn(*mut CUvideoparser, *mut CuvidParserParams) -> CUresult,
    pub cuvidParseVideoData:
        unsafe extern "C" fn(CUvideoparser, *mut CuvidSourceDataPacket) -> CUresult,
    pub cuvidDestroyVideoParser: unsafe extern "C" fn(CUvideoparser) -> CUresult,
    pub cuvidCreateDecoder:
        unsafe extern "C" fn(*mut CUvideodecoder, *mut CuvidDecodeCreateInfo) -> CUresult,
    pub cuvidDestroyDecoder: unsafe extern "C" fn(CUvideodecoder) -> CUresult,
    pub cuvidDecodePicture: unsafe extern "C" fn(CUvideodecoder, *mut CuvidPicParams) -> CUresult,
    pub cuvidMapVideoFrame64: unsafe extern "C" fn(
        CUvideodecoder,
        c_int,
        *mut CUdeviceptr,
        *mut u32,
        *mut CuvidProcParams,
    ) -> CUresult,
    pub cuvidUnmapVideoFrame64: unsafe extern "C" fn(CUvideodecoder, CUdeviceptr) -> CUresult,
    pub cuvidCtxLockCreate: unsafe extern "C" fn(*mut CUvideoctxlock, CUcontext) -> CUresult,
    pub cuvidCtxLockDestroy: unsafe extern "C" fn(CUvideoctxlock) -> CUresult,
    pub cuvidCtxLock: unsafe extern "C" fn(CUvideoctxlock, u32) -> CUresult,
    pub cuvidCtxUnlock: unsafe extern "C" fn(CUvideoctxlock, u32) -> CUresult,
    // Keeps the symbols above alive; must drop last.
    _library: libloading::Library,
}

impl NvcuvidLibrary {
    pub fn load() -> Result<Self> {
        let library = ["libnvcuvid.so.1", "libnvcuvid.so"]
            .iter()
            .find_map(|name| {
                // SAFETY: loading a system library with no init sections we
                // depend on beyond dlopen semantics.
                unsafe { libloading::Library::new(name) }.ok()
            })
            .ok_or_else(|| {
                PipelineError::DriverFatal(
                    "libnvcuvid.so not found; is the NVIDIA driver installed?".into(),
                )
            })?;
        Ok(Self {
            cuvidCreateVideoParser: load_symbol!(library, b"cuvidCreateVideoParser"),
            cuvidParseVideoData: load_symbol!(library, b"cuvidParseVideoData"),
            cuvidDestroyVideoParser: load_symbol!(library, b"cuvidDestroyVideoParser"),
            cuvidCreateDecoder: load_symbol!(library, b"cuvidCreateDecoder"),
            cuvidDestroyDecoder: load_symbol!(library, b"cuvidDestroyDecoder"),
            cuvidDecodePicture: load_symbol!(library, b"cuvidDecodePicture"),
            cuvidMapVideoFrame64: load_symbol!(library, b"cuvidMapVideoFrame64"),
            cuvidUnmapVideoFrame64: load_symbol!(library, b"cuvidUnmapVideoFrame64"),
            cuvidCtxLockCreate: load_symbol!(library, b"cuvidCtxLockCreate"),
            cuvidCtxLockDestroy: load_symbol!(library, b"cuvidCtxLockDestroy"),
            cuvidCtxLock: load_symbol!(library, b"cuvidCtxLock"),
            cuvidCtxUnlock: load_symbol!(library, b"cuvidCtxUnlock"),
            _library: library,
        })
    }
}

/// Map a cuvid return code onto the error taxonomy.
pub fn check(result: CUresult, what: &str) -> Result<()> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(PipelineError::DriverFatal(format!("{what}: error {result}")))
    }
}
