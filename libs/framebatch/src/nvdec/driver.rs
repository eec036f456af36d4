// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! NVDEC implementation of the driver traits.
//!
//! CUDA context and device memory go through cudarc's driver bindings; the
//! parser/decoder half goes through the runtime-loaded nvcuvid entry points
//! in [`super::ffi`]. The parser's plain C callbacks dispatch through three
//! static trampolines and an opaque context pointer back into the core's
//! [`ParserEvents`], so the trampoline pattern never leaks past this module.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::{Arc, OnceLock};

use cudarc::driver::result as cu;
use cudarc::driver::sys as cusys;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::ffi::{self, NvcuvidLibrary};
use crate::core::alloc::BufAddr;
use crate::core::driver::{
    Codec, DeviceMemory, DevicePtr, DisplayInfo, HwDecoder, HwParser, MappedSurface,
    ParserEvents, PictureParams, SurfaceBudget, VideoDriver, VideoFormat,
};
use crate::core::{PipelineError, Result};

fn cuda_err(what: &str, err: cu::DriverError) -> PipelineError {
    PipelineError::DriverFatal(format!("{what}: {err:?}"))
}

fn codec_id(codec: Codec) -> c_int {
    match codec {
        Codec::H264 => ffi::codec_type::H264,
        Codec::Hevc => ffi::codec_type::HEVC,
    }
}

/// RAII guard for the CUvideoctxlock shared by every GPU call of one
/// context (decode submit, map, copies).
struct CtxLockGuard<'a> {
    lib: &'a NvcuvidLibrary,
    lock: ffi::CUvideoctxlock,
}

impl<'a> CtxLockGuard<'a> {
    fn acquire(lib: &'a NvcuvidLibrary, lock: ffi::CUvideoctxlock) -> Result<Self> {
        // SAFETY: the lock handle stays valid for the driver's lifetime.
        ffi::check(unsafe { (lib.cuvidCtxLock)(lock, 0) }, "cuvidCtxLock")?;
        Ok(Self { lib, lock })
    }
}

impl Drop for CtxLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: paired with the successful acquire above.
        let result = unsafe { (self.lib.cuvidCtxUnlock)(self.lock, 0) };
        if result != ffi::CUDA_SUCCESS {
            warn!(code = result, "cuvidCtxUnlock failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Device memory
// ---------------------------------------------------------------------------

struct NvdecMemory {
    cu_ctx: cusys::CUcontext,
    lib: Arc<NvcuvidLibrary>,
    ctx_lock: ffi::CUvideoctxlock,
}

// SAFETY: the raw context handle is immutable after creation and every use
// re-binds it to the calling thread; cross-thread use is what the CUDA
// driver API is specified for.
unsafe impl Send for NvdecMemory {}
unsafe impl Sync for NvdecMemory {}

impl NvdecMemory {
    fn bind(&self) -> Result<()> {
        // SAFETY: the context was created at driver init and outlives us.
        unsafe { cu::ctx::set_current(self.cu_ctx) }
            .map_err(|err| cuda_err("bind CUDA context", err))
    }
}

impl DeviceMemory for NvdecMemory {
    fn alloc(&self, len: usize) -> Result<BufAddr> {
        self.bind()?;
        // SAFETY: context bound; len is non-zero by pool contract.
        let ptr = unsafe { cu::malloc_sync(len) }.map_err(|err| cuda_err("cuMemAlloc", err))?;
        Ok(BufAddr(ptr))
    }

    fn free(&self, addr: BufAddr, _len: usize) -> Result<()> {
        self.bind()?;
        // SAFETY: the address came from `alloc` and is released exactly
        // once by the owning pool.
        unsafe { cu::free_sync(addr.0) }.map_err(|err| cuda_err("cuMemFree", err))
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
        self.bind()?;
        let _lock = CtxLockGuard::acquire(&self.lib, self.ctx_lock)?;
        if src_pitch == dst_pitch && src_pitch == width_bytes {
            // SAFETY: both regions cover pitch * rows bytes of device
            // memory owned by the caller.
            unsafe { cu::memcpy_dtod_sync(dst.0, src.0, src_pitch as usize * rows as usize) }
                .map_err(|err| cuda_err("cuMemcpyDtoD", err))?;
            return Ok(());
        }
        for row in 0..rows as u64 {
            let s = src.0 + row * u64::from(src_pitch);
            let d = dst.0 + row * u64::from(dst_pitch);
            // SAFETY: row-bounded device copy within both allocations.
            unsafe { cu::memcpy_dtod_sync(d, s, width_bytes as usize) }
                .map_err(|err| cuda_err("cuMemcpyDtoD", err))?;
        }
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
        self.bind()?;
        let _lock = CtxLockGuard::acquire(&self.lib, self.ctx_lock)?;
        for row in 0..rows as u64 {
            let s = src.0 + row * u64::from(src_pitch);
            let d = (dst.0 + row * u64::from(dst_pitch)) as *mut u8;
            // SAFETY: the host buffer spans dst_pitch * rows bytes and the
            // device row fits width_bytes <= both pitches.
            let host = unsafe { std::slice::from_raw_parts_mut(d, width_bytes as usize) };
            unsafe { cu::memcpy_dtoh_sync(host, s) }
                .map_err(|err| cuda_err("cuMemcpyDtoH", err))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parser (trampolines + context pointer)
// ---------------------------------------------------------------------------

struct CallbackContext {
    events: Arc<dyn ParserEvents>,
}

unsafe extern "C" fn sequence_trampoline(
    user_data: *mut c_void,
    format: *mut ffi::CuVideoFormat,
) -> c_int {
    // SAFETY: user_data is the Box<CallbackContext> owned by NvdecParser,
    // alive for the parser's lifetime; format is valid for this call.
    let ctx = unsafe { &*(user_data as *const CallbackContext) };
    let fmt = unsafe { &*format };

    let codec = match fmt.codec {
        ffi::codec_type::H264 => Codec::H264,
        ffi::codec_type::HEVC => Codec::Hevc,
        other => {
            error!(codec = other, "unsupported codec in sequence callback");
            return 0;
        }
    };
    let frame_rate = (fmt.frame_rate.numerator > 0 && fmt.frame_rate.denominator > 0)
        .then_some((fmt.frame_rate.numerator, fmt.frame_rate.denominator));
    let format = VideoFormat {
        codec,
        coded_width: fmt.coded_width,
        coded_height: fmt.coded_height,
        min_decode_surfaces: u32::from(fmt.min_num_decode_surfaces),
        frame_rate,
    };
    ctx.events.on_sequence(&format) as c_int
}

unsafe extern "C" fn decode_trampoline(
    user_data: *mut c_void,
    pic_params: *mut ffi::CuvidPicParams,
) -> c_int {
    // SAFETY: as above; pic_params is valid for this call only, which the
    // PictureParams lifetime encodes.
    let ctx = unsafe { &*(user_data as *const CallbackContext) };
    let index = unsafe { (*pic_params).CurrPicIdx };
    let pic = PictureParams::new(index, pic_params as *const c_void);
    i32::from(ctx.events.on_decode(&pic))
}

unsafe extern "C" fn display_trampoline(
    user_data: *mut c_void,
    disp_info: *mut ffi::CuvidParserDispInfo,
) -> c_int {
    let ctx = unsafe { &*(user_data as *const CallbackContext) };
    if disp_info.is_null() {
        // Null display info is the end-of-stream / flush signal.
        return 1;
    }
    // SAFETY: non-null disp_info is valid for this call.
    let info = unsafe { &*disp_info };
    let disp = DisplayInfo {
        picture_index: info.picture_index,
        timestamp: info.timestamp,
        progressive_frame: info.progressive_frame != 0,
        top_field_first: info.top_field_first != 0,
    };
    i32::from(ctx.events.on_display(&disp))
}

struct NvdecParser {
    lib: Arc<NvcuvidLibrary>,
    handle: ffi::CUvideoparser,
    /// Boxed so the trampoline context pointer stays stable.
    _context: Box<CallbackContext>,
}

// SAFETY: the parser handle is only used from the feeding thread; nvcuvid
// allows handle use from any single thread at a time.
unsafe impl Send for NvdecParser {}

impl HwParser for NvdecParser {
    fn feed(&mut self, data: &[u8], timestamp: i64) -> Result<()> {
        let eos = data.is_empty();
        let mut packet = ffi::CuvidSourceDataPacket {
            flags: if eos {
                ffi::packet_flags::ENDOFSTREAM
            } else {
                ffi::packet_flags::TIMESTAMP
            },
            payload_size: data.len() as _,
            payload: if eos { ptr::null() } else { data.as_ptr() },
            timestamp,
        };
        // SAFETY: packet points at borrowed data which outlives the call;
        // the parser processes it synchronously.
        ffi::check(
            unsafe { (self.lib.cuvidParseVideoData)(self.handle, &mut packet) },
            "cuvidParseVideoData",
        )
    }
}

impl Drop for NvdecParser {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle from cuvidCreateVideoParser, destroyed once.
            let result = unsafe { (self.lib.cuvidDestroyVideoParser)(self.handle) };
            if result != ffi::CUDA_SUCCESS {
                warn!(code = result, "cuvidDestroyVideoParser failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

struct NvdecDecoder {
    lib: Arc<NvcuvidLibrary>,
    handle: ffi::CUvideodecoder,
    ctx_lock: ffi::CUvideoctxlock,
}

// SAFETY: nvcuvid decoder handles are safe to use from multiple threads
// when GPU calls are serialized through the context lock, which every call
// in this impl is.
unsafe impl Send for NvdecDecoder {}
unsafe impl Sync for NvdecDecoder {}

impl HwDecoder for NvdecDecoder {
    fn decode(&self, pic: &PictureParams<'_>) -> Result<()> {
        let raw = pic.raw() as *mut ffi::CuvidPicParams;
        if raw.is_null() {
            return Err(PipelineError::DriverFatal(
                "decode submitted without picture parameters".into(),
            ));
        }
        let _lock = CtxLockGuard::acquire(&self.lib, self.ctx_lock)?;
        // SAFETY: raw comes from the in-flight decode callback; the parser
        // keeps it valid until the callback returns.
        ffi::check(
            unsafe { (self.lib.cuvidDecodePicture)(self.handle, raw) },
            "cuvidDecodePicture",
        )
    }

    fn map(&self, disp: &DisplayInfo) -> Result<Box<dyn MappedSurface>> {
        let mut params = ffi::CuvidProcParams {
            progressive_frame: i32::from(disp.progressive_frame),
            second_field: 0,
            top_field_first: i32::from(disp.top_field_first),
            unpaired_field: i32::from(disp.progressive_frame),
            ..ffi::CuvidProcParams::default()
        };
        let mut dev_ptr: ffi::CUdeviceptr = 0;
        let mut pitch: u32 = 0;
        // SAFETY: handle is live; out-pointers are local.
        let result = unsafe {
            (self.lib.cuvidMapVideoFrame64)(
                self.handle,
                disp.picture_index,
                &mut dev_ptr,
                &mut pitch,
                &mut params,
            )
        };
        if result != ffi::CUDA_SUCCESS {
            // Mapping contends for a bounded set of output surfaces; the
            // caller retries with backoff.
            return Err(PipelineError::DriverTransient(format!(
                "cuvidMapVideoFrame64: error {result}"
            )));
        }
        Ok(Box::new(NvdecMapped {
            lib: self.lib.clone(),
            decoder: self.handle,
            dev_ptr,
            pitch,
        }))
    }
}

impl Drop for NvdecDecoder {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle from cuvidCreateDecoder, destroyed once.
            let result = unsafe { (self.lib.cuvidDestroyDecoder)(self.handle) };
            if result != ffi::CUDA_SUCCESS {
                warn!(code = result, "cuvidDestroyDecoder failed");
            }
        }
    }
}

struct NvdecMapped {
    lib: Arc<NvcuvidLibrary>,
    decoder: ffi::CUvideodecoder,
    dev_ptr: ffi::CUdeviceptr,
    pitch: u32,
}

// SAFETY: the mapped pointer is a device address; unmap is valid from any
// thread under the same context.
unsafe impl Send for NvdecMapped {}

impl MappedSurface for NvdecMapped {
    fn device_ptr(&self) -> DevicePtr {
        DevicePtr(self.dev_ptr)
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }
}

impl Drop for NvdecMapped {
    fn drop(&mut self) {
        // Unmapping is what lets the driver recycle the surface; failure is
        // logged and ignored.
        // SAFETY: paired with the successful map that produced dev_ptr.
        let result = unsafe { (self.lib.cuvidUnmapVideoFrame64)(self.decoder, self.dev_ptr) };
        if result != ffi::CUDA_SUCCESS {
            warn!(code = result, ptr = self.dev_ptr, "cuvidUnmapVideoFrame64 failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// NVDEC [`VideoDriver`], one per GPU. Obtain through [`NvdecDriver::get`]
/// so context creation happens once per device per process.
pub struct NvdecDriver {
    cu_ctx: cusys::CUcontext,
    lib: Arc<NvcuvidLibrary>,
    ctx_lock: ffi::CUvideoctxlock,
    memory: Arc<NvdecMemory>,
    device_index: u32,
}

// SAFETY: see NvdecMemory; the same raw handles with the same usage rules.
unsafe impl Send for NvdecDriver {}
unsafe impl Sync for NvdecDriver {}

static DRIVERS: OnceLock<Mutex<HashMap<u32, Arc<NvdecDriver>>>> = OnceLock::new();

impl NvdecDriver {
    /// The process-wide driver instance for `device_index`, created on
    /// first use. Initialization is serialized; decoders receive an
    /// already-initialized context.
    pub fn get(device_index: u32) -> Result<Arc<Self>> {
        let registry = DRIVERS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock();
        if let Some(driver) = registry.get(&device_index) {
            return Ok(driver.clone());
        }
        let driver = Arc::new(Self::create(device_index)?);
        registry.insert(device_index, driver.clone());
        Ok(driver)
    }

    fn create(device_index: u32) -> Result<Self> {
        cu::init().map_err(|err| cuda_err("cuInit", err))?;
        let device = cu::device::get(device_index as i32)
            .map_err(|err| cuda_err("cuDeviceGet", err))?;
        // SAFETY: device handle from cuDeviceGet; the primary context is
        // retained for the process lifetime.
        let cu_ctx = unsafe { cu::primary_ctx::retain(device) }
            .map_err(|err| cuda_err("cuDevicePrimaryCtxRetain", err))?;
        unsafe { cu::ctx::set_current(cu_ctx) }
            .map_err(|err| cuda_err("cuCtxSetCurrent", err))?;

        let lib = Arc::new(NvcuvidLibrary::load()?);
        let mut ctx_lock: ffi::CUvideoctxlock = ptr::null_mut();
        // SAFETY: context is current and valid.
        ffi::check(
            unsafe { (lib.cuvidCtxLockCreate)(&mut ctx_lock, cu_ctx) },
            "cuvidCtxLockCreate",
        )?;

        info!(device_index, "NVDEC driver initialized");
        let memory = Arc::new(NvdecMemory {
            cu_ctx,
            lib: lib.clone(),
            ctx_lock,
        });
        Ok(Self {
            cu_ctx,
            lib,
            ctx_lock,
            memory,
            device_index,
        })
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }
}

impl VideoDriver for NvdecDriver {
    fn memory(&self) -> Arc<dyn DeviceMemory> {
        self.memory.clone()
    }

    fn create_parser(
        &self,
        codec: Codec,
        surfaces: SurfaceBudget,
        events: Arc<dyn ParserEvents>,
    ) -> Result<Box<dyn HwParser>> {
        let context = Box::new(CallbackContext { events });
        let mut params = ffi::CuvidParserParams {
            CodecType: codec_id(codec),
            ulMaxNumDecodeSurfaces: surfaces.decode_surfaces,
            ulMaxDisplayDelay: 1,
            pUserData: &*context as *const CallbackContext as *mut c_void,
            pfnSequenceCallback: Some(sequence_trampoline),
            pfnDecodePicture: Some(decode_trampoline),
            pfnDisplayPicture: Some(display_trampoline),
            ..ffi::CuvidParserParams::default()
        };
        let mut handle: ffi::CUvideoparser = ptr::null_mut();
        // SAFETY: params is fully initialized; the context pointer stays
        // stable because the Box lives in the returned parser.
        ffi::check(
            unsafe { (self.lib.cuvidCreateVideoParser)(&mut handle, &mut params) },
            "cuvidCreateVideoParser",
        )?;
        debug!(?codec, "video parser created");
        Ok(Box::new(NvdecParser {
            lib: self.lib.clone(),
            handle,
            _context: context,
        }))
    }

    fn create_decoder(
        &self,
        format: &VideoFormat,
        surfaces: SurfaceBudget,
    ) -> Result<Box<dyn HwDecoder>> {
        let decode_surfaces = surfaces.decode_surfaces.max(format.min_decode_surfaces);
        let mut info = ffi::CuvidDecodeCreateInfo {
            ulWidth: format.coded_width as _,
            ulHeight: format.coded_height as _,
            ulNumDecodeSurfaces: decode_surfaces as _,
            CodecType: codec_id(format.codec),
            ChromaFormat: ffi::CHROMA_FORMAT_420,
            ulCreationFlags: ffi::CREATE_PREFER_CUVID,
            ulMaxWidth: format.coded_width as _,
            ulMaxHeight: format.coded_height as _,
            OutputFormat: ffi::SURFACE_FORMAT_NV12,
            DeinterlaceMode: ffi::DEINTERLACE_ADAPTIVE,
            ulTargetWidth: format.coded_width as _,
            ulTargetHeight: format.coded_height as _,
            ulNumOutputSurfaces: surfaces.output_surfaces as _,
            vidLock: self.ctx_lock,
            ..ffi::CuvidDecodeCreateInfo::default()
        };
        // SAFETY: context bound at driver creation; info fully initialized.
        unsafe { cu::ctx::set_current(self.cu_ctx) }
            .map_err(|err| cuda_err("cuCtxSetCurrent", err))?;
        let mut handle: ffi::CUvideodecoder = ptr::null_mut();
        ffi::check(
            unsafe { (self.lib.cuvidCreateDecoder)(&mut handle, &mut info) },
            "cuvidCreateDecoder",
        )?;
        info!(
            width = format.coded_width,
            height = format.coded_height,
            decode_surfaces,
            "hardware decoder created"
        );
        Ok(Box::new(NvdecDecoder {
            lib: self.lib.clone(),
            handle,
            ctx_lock: self.ctx_lock,
        }))
    }
}
