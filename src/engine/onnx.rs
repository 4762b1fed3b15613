// ============================================================================
// ONNX Runtime backend — dynamic binding via libloading
// ============================================================================
//
// Loads onnxruntime.dll / libonnxruntime.so at runtime so the binary has NO
// compile-time dependency on ONNX Runtime. The OrtApi is a C struct of
// function pointers; we load the whole blob once and index into it by field
// offset. Every Ort object acquired for a single call is wrapped in a guard
// that releases it on every exit path.

#![allow(unsafe_op_in_unsafe_fn)]

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::{Component, Path};
use std::sync::{Arc, Mutex};

use crate::engine::{
    EngineError, ExecutionConfig, InferenceBackend, InferenceSession, OptimizationLevel, Tensor,
    TensorData,
};
use crate::{log_info, log_warn};

// -- ONNX Runtime C API types -------------------------------------------
// Opaque handles (never dereferenced in Rust — used as `*mut` pointers only)

#[repr(C)]
struct OrtEnv {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSession {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSessionOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtValue {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtMemoryInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtStatus {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtRunOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtAllocator {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTensorTypeAndShapeInfo {
    _private: [u8; 0],
}

/// ORT API version we target (compatible with ONNX Runtime 1.14+)
const ORT_API_VERSION: u32 = 18;

/// Minimum supported ONNX Runtime version (1.16.0).
/// Versions older than this used a different vtable layout for API version 18.
const ORT_MIN_VERSION: (u32, u32) = (1, 16);

#[allow(dead_code)]
#[repr(u32)]
enum OrtLoggingLevel {
    Verbose = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
}

#[allow(dead_code)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
enum ONNXTensorElementDataType {
    Undefined = 0,
    Float = 1,
    UInt8 = 2,
    Int8 = 3,
    UInt16 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    String = 8,
    Bool = 9,
    Float16 = 10,
    Double = 11,
    UInt32 = 12,
    UInt64 = 13,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtAllocatorType {
    Invalid = -1,
    DeviceAllocator = 0,
    ArenaAllocator = 1,
}

#[repr(i32)]
#[allow(dead_code)]
enum OrtMemType {
    CpuInput = -2,
    CpuOutput = -1,
    Default = 0,
}

// Function pointer type aliases (C calling convention)

type CreateEnvFn = unsafe extern "C" fn(
    log_level: OrtLoggingLevel,
    logid: *const std::ffi::c_char,
    out: *mut *mut OrtEnv,
) -> *mut OrtStatus;

type CreateSessionOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtSessionOptions) -> *mut OrtStatus;

type CreateSessionFromArrayFn = unsafe extern "C" fn(
    env: *const OrtEnv,
    model_data: *const std::ffi::c_void,
    model_data_length: usize,
    options: *const OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> *mut OrtStatus;

type CreateTensorWithDataAsOrtValueFn = unsafe extern "C" fn(
    info: *const OrtMemoryInfo,
    data: *mut std::ffi::c_void,
    data_len: usize,
    shape: *const i64,
    shape_len: usize,
    element_type: ONNXTensorElementDataType,
    out: *mut *mut OrtValue,
) -> *mut OrtStatus;

type CreateCpuMemoryInfoFn = unsafe extern "C" fn(
    alloc_type: OrtAllocatorType,
    mem_type: OrtMemType,
    out: *mut *mut OrtMemoryInfo,
) -> *mut OrtStatus;

type RunFn = unsafe extern "C" fn(
    session: *mut OrtSession,
    run_options: *const OrtRunOptions,
    input_names: *const *const std::ffi::c_char,
    inputs: *const *const OrtValue,
    input_count: usize,
    output_names: *const *const std::ffi::c_char,
    output_count: usize,
    outputs: *mut *mut OrtValue,
) -> *mut OrtStatus;

type GetTensorMutableDataFn =
    unsafe extern "C" fn(value: *mut OrtValue, out: *mut *mut std::ffi::c_void) -> *mut OrtStatus;

type GetTensorTypeAndShapeFn = unsafe extern "C" fn(
    value: *const OrtValue,
    out: *mut *mut OrtTensorTypeAndShapeInfo,
) -> *mut OrtStatus;

type GetTensorElementTypeFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    out: *mut ONNXTensorElementDataType,
) -> *mut OrtStatus;

type GetDimensionsCountFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut usize) -> *mut OrtStatus;

type GetDimensionsFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    dim_values: *mut i64,
    dim_values_length: usize,
) -> *mut OrtStatus;

type ReleaseEnvFn = unsafe extern "C" fn(env: *mut OrtEnv);
type ReleaseSessionFn = unsafe extern "C" fn(session: *mut OrtSession);
type ReleaseSessionOptionsFn = unsafe extern "C" fn(options: *mut OrtSessionOptions);
type ReleaseValueFn = unsafe extern "C" fn(value: *mut OrtValue);
type ReleaseMemoryInfoFn = unsafe extern "C" fn(info: *mut OrtMemoryInfo);
type ReleaseTensorTypeAndShapeInfoFn = unsafe extern "C" fn(info: *mut OrtTensorTypeAndShapeInfo);
type ReleaseStatusFn = unsafe extern "C" fn(status: *mut OrtStatus);
type GetErrorMessageFn = unsafe extern "C" fn(status: *const OrtStatus) -> *const std::ffi::c_char;

type SetIntraOpNumThreadsFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, n: i32) -> *mut OrtStatus;
type SetInterOpNumThreadsFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, n: i32) -> *mut OrtStatus;
type SetSessionGraphOptimizationLevelFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, level: u32) -> *mut OrtStatus;

type SessionGetInputCountFn =
    unsafe extern "C" fn(session: *const OrtSession, out: *mut usize) -> *mut OrtStatus;
type SessionGetOutputCountFn =
    unsafe extern "C" fn(session: *const OrtSession, out: *mut usize) -> *mut OrtStatus;

type SessionGetOutputNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut std::ffi::c_char,
) -> *mut OrtStatus;

type GetAllocatorWithDefaultOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtAllocator) -> *mut OrtStatus;

type AllocatorFreeFn = unsafe extern "C" fn(
    allocator: *mut OrtAllocator,
    ptr: *mut std::ffi::c_void,
) -> *mut OrtStatus;

/// OrtApiBase — the entry point struct returned by OrtGetApiBase()
#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const std::ffi::c_void,
    get_version_string: unsafe extern "C" fn() -> *const std::ffi::c_char,
}

/// Legacy per-provider append functions exported as plain symbols, e.g.
/// OrtSessionOptionsAppendExecutionProvider_Nnapi. Probed with lib.get();
/// absence means CPU-only, which is fine.
type AppendProviderFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, flags: u32) -> *mut OrtStatus;

/// The subset of the OrtApi vtable we actually use, accessed by field index.
///
/// OrtApi function indices (from onnxruntime_c_api.h). The real struct has
/// ~200 function pointers; each pointer is 8 bytes on 64-bit targets.
/// Indices used here, carefully counted from the official header:
///
///  2: GetErrorMessage           3: CreateEnv
///  8: CreateSessionFromArray    9: Run
/// 10: CreateSessionOptions     23: SetSessionGraphOptimizationLevel
/// 24: SetIntraOpNumThreads     25: SetInterOpNumThreads
/// 30: SessionGetInputCount     31: SessionGetOutputCount
/// 37: SessionGetOutputName     49: CreateTensorWithDataAsOrtValue
/// 51: GetTensorMutableData     60: GetTensorElementType
/// 61: GetDimensionsCount       62: GetDimensions
/// 65: GetTensorTypeAndShape    69: CreateCpuMemoryInfo
/// 76: AllocatorFree            78: GetAllocatorWithDefaultOptions
/// 92: ReleaseEnv               93: ReleaseStatus
/// 94: ReleaseMemoryInfo        95: ReleaseSession
/// 96: ReleaseValue             99: ReleaseTensorTypeAndShapeInfo
/// 100: ReleaseSessionOptions
struct OrtApi {
    raw: *const std::ffi::c_void,
}

impl OrtApi {
    /// Get a function pointer from the API vtable by index.
    unsafe fn get_fn<T>(&self, index: usize) -> T {
        let ptr = self.raw as *const *const std::ffi::c_void;
        let fn_ptr = *ptr.add(index);
        std::mem::transmute_copy(&fn_ptr)
    }

    fn get_error_message(&self) -> GetErrorMessageFn {
        unsafe { self.get_fn(2) }
    }
    fn create_env(&self) -> CreateEnvFn {
        unsafe { self.get_fn(3) }
    }
    fn create_session_from_array(&self) -> CreateSessionFromArrayFn {
        unsafe { self.get_fn(8) }
    }
    fn run(&self) -> RunFn {
        unsafe { self.get_fn(9) }
    }
    fn create_session_options(&self) -> CreateSessionOptionsFn {
        unsafe { self.get_fn(10) }
    }
    fn set_session_graph_optimization_level(&self) -> SetSessionGraphOptimizationLevelFn {
        unsafe { self.get_fn(23) }
    }
    fn set_intra_op_num_threads(&self) -> SetIntraOpNumThreadsFn {
        unsafe { self.get_fn(24) }
    }
    fn set_inter_op_num_threads(&self) -> SetInterOpNumThreadsFn {
        unsafe { self.get_fn(25) }
    }
    fn session_get_input_count(&self) -> SessionGetInputCountFn {
        unsafe { self.get_fn(30) }
    }
    fn session_get_output_count(&self) -> SessionGetOutputCountFn {
        unsafe { self.get_fn(31) }
    }
    fn session_get_output_name(&self) -> SessionGetOutputNameFn {
        unsafe { self.get_fn(37) }
    }
    fn create_tensor_with_data(&self) -> CreateTensorWithDataAsOrtValueFn {
        unsafe { self.get_fn(49) }
    }
    fn get_tensor_mutable_data(&self) -> GetTensorMutableDataFn {
        unsafe { self.get_fn(51) }
    }
    fn get_tensor_element_type(&self) -> GetTensorElementTypeFn {
        unsafe { self.get_fn(60) }
    }
    fn get_dimensions_count(&self) -> GetDimensionsCountFn {
        unsafe { self.get_fn(61) }
    }
    fn get_dimensions(&self) -> GetDimensionsFn {
        unsafe { self.get_fn(62) }
    }
    fn get_tensor_type_and_shape(&self) -> GetTensorTypeAndShapeFn {
        unsafe { self.get_fn(65) }
    }
    fn create_cpu_memory_info(&self) -> CreateCpuMemoryInfoFn {
        unsafe { self.get_fn(69) }
    }
    fn allocator_free(&self) -> AllocatorFreeFn {
        unsafe { self.get_fn(76) }
    }
    fn get_allocator_with_default_options(&self) -> GetAllocatorWithDefaultOptionsFn {
        unsafe { self.get_fn(78) }
    }
    fn release_env(&self) -> ReleaseEnvFn {
        unsafe { self.get_fn(92) }
    }
    fn release_status(&self) -> ReleaseStatusFn {
        unsafe { self.get_fn(93) }
    }
    fn release_memory_info(&self) -> ReleaseMemoryInfoFn {
        unsafe { self.get_fn(94) }
    }
    fn release_session(&self) -> ReleaseSessionFn {
        unsafe { self.get_fn(95) }
    }
    fn release_value(&self) -> ReleaseValueFn {
        unsafe { self.get_fn(96) }
    }
    fn release_tensor_type_and_shape_info(&self) -> ReleaseTensorTypeAndShapeInfoFn {
        unsafe { self.get_fn(99) }
    }
    fn release_session_options(&self) -> ReleaseSessionOptionsFn {
        unsafe { self.get_fn(100) }
    }
}

/// Extract error message from an OrtStatus pointer. Returns Ok(()) if status
/// is null (success).
unsafe fn status_to_result(api: &OrtApi, status: *mut OrtStatus) -> Result<(), String> {
    if status.is_null() {
        Ok(())
    } else {
        let msg_ptr = (api.get_error_message())(status);
        let msg = if msg_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(msg_ptr).to_string_lossy().into_owned()
        };
        (api.release_status())(status);
        Err(msg)
    }
}

// -- Path validation ----------------------------------------------------

/// Validate that a runtime library path is safe to load:
/// - Must be an absolute path (no relative traversal)
/// - Must not contain `..` components (path traversal guard)
/// - Must have a shared-library extension
pub fn validate_runtime_path(path: &str) -> Result<(), EngineError> {
    let p = Path::new(path);

    if path.is_empty() {
        return Err(EngineError::RuntimeNotFound("Path is empty".to_string()));
    }
    if !p.is_absolute() {
        return Err(EngineError::RuntimeLoadFailed(
            "Runtime path must be an absolute path".to_string(),
        ));
    }
    for component in p.components() {
        if component == Component::ParentDir {
            return Err(EngineError::RuntimeLoadFailed(
                "Runtime path must not contain '..' components".to_string(),
            ));
        }
    }
    let ext = p
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !["dll", "so", "dylib"].contains(&ext.as_str()) {
        return Err(EngineError::RuntimeLoadFailed(format!(
            "Expected a .dll/.so/.dylib file, got '.{}'",
            ext
        )));
    }
    Ok(())
}

/// Parse a version string like "1.18.0" into a (major, minor) tuple.
fn parse_ort_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

// -- Runtime handle -----------------------------------------------------

/// A loaded ONNX Runtime library: the dlopen handle, the resolved OrtApi
/// vtable, and one OrtEnv shared by every session.
struct Runtime {
    // Field order matters: env must be released before the library unloads.
    env: *mut OrtEnv,
    api: OrtApi,
    _lib: libloading::Library,
}

// The OrtEnv and OrtApi are documented thread-safe; the raw pointers are
// never handed out.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.env.is_null() {
            unsafe { (self.api.release_env())(self.env) };
            self.env = std::ptr::null_mut();
        }
    }
}

/// Production [`InferenceBackend`] over a dynamically loaded ONNX Runtime.
pub struct OnnxBackend {
    rt: Arc<Runtime>,
    version: String,
}

impl OnnxBackend {
    /// Load the runtime library, resolve the API vtable, enforce the minimum
    /// version, and create the shared environment.
    pub fn load(lib_path: &str) -> Result<Self, EngineError> {
        validate_runtime_path(lib_path)?;
        if !Path::new(lib_path).exists() {
            return Err(EngineError::RuntimeNotFound(lib_path.to_string()));
        }

        unsafe {
            let lib = libloading::Library::new(lib_path)
                .map_err(|e| EngineError::RuntimeLoadFailed(format!("{}", e)))?;

            // Scope the Symbol borrow so `lib` can move into the Runtime below.
            let api_base = {
                let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> =
                    lib.get(b"OrtGetApiBase").map_err(|e| {
                        EngineError::RuntimeLoadFailed(format!(
                            "Symbol OrtGetApiBase not found: {}",
                            e
                        ))
                    })?;
                get_api_base()
            };
            if api_base.is_null() {
                return Err(EngineError::ApiInitFailed(
                    "OrtGetApiBase returned null".to_string(),
                ));
            }

            let version_ptr = ((*api_base).get_version_string)();
            let version = if version_ptr.is_null() {
                "unknown".to_string()
            } else {
                CStr::from_ptr(version_ptr).to_string_lossy().into_owned()
            };

            // Enforce minimum version — older builds have incompatible vtable layouts
            if let Some((major, minor)) = parse_ort_version(&version) {
                let (min_major, min_minor) = ORT_MIN_VERSION;
                let too_old = major < min_major || (major == min_major && minor < min_minor);
                if too_old {
                    return Err(EngineError::ApiInitFailed(format!(
                        "ONNX Runtime {} is too old. Minimum supported version is {}.{}",
                        version, min_major, min_minor
                    )));
                }
            }

            let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
            if api_ptr.is_null() {
                return Err(EngineError::ApiInitFailed(format!(
                    "OrtGetApi({}) returned null — runtime version {} may be too old",
                    ORT_API_VERSION, version
                )));
            }
            let api = OrtApi { raw: api_ptr };

            let mut env: *mut OrtEnv = std::ptr::null_mut();
            let log_id = CString::new("RetouchFE").unwrap();
            status_to_result(
                &api,
                (api.create_env())(OrtLoggingLevel::Warning, log_id.as_ptr(), &mut env),
            )
            .map_err(EngineError::ApiInitFailed)?;

            log_info!("ONNX Runtime {} loaded from {}", version, lib_path);
            Ok(OnnxBackend {
                rt: Arc::new(Runtime {
                    env,
                    api,
                    _lib: lib,
                }),
                version,
            })
        }
    }

    /// Runtime version string reported by the library.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Try to attach a hardware-acceleration execution provider to the
    /// session options. Absence of the provider symbols or a provider error
    /// downgrades to CPU with a warning.
    unsafe fn try_append_accelerator(&self, options: *mut OrtSessionOptions) {
        for symbol in [
            &b"OrtSessionOptionsAppendExecutionProvider_Nnapi"[..],
            &b"OrtSessionOptionsAppendExecutionProvider_CUDA"[..],
        ] {
            let name = String::from_utf8_lossy(symbol).into_owned();
            if let Ok(append) = self.rt._lib.get::<AppendProviderFn>(symbol) {
                match status_to_result(&self.rt.api, append(options, 0)) {
                    Ok(()) => {
                        log_info!("Execution provider enabled: {}", name);
                        return;
                    }
                    Err(e) => log_warn!("Provider {} unavailable, using CPU: {}", name, e),
                }
            }
        }
    }
}

impl InferenceBackend for OnnxBackend {
    fn create_session(
        &self,
        model_bytes: &[u8],
        config: &ExecutionConfig,
    ) -> Result<Box<dyn InferenceSession>, EngineError> {
        let rt = &self.rt;
        unsafe {
            let mut options_ptr: *mut OrtSessionOptions = std::ptr::null_mut();
            status_to_result(&rt.api, (rt.api.create_session_options())(&mut options_ptr))
                .map_err(EngineError::SessionCreateFailed)?;
            let options = SessionOptionsGuard {
                rt,
                ptr: options_ptr,
            };

            let _ = status_to_result(
                &rt.api,
                (rt.api.set_intra_op_num_threads())(options.ptr, config.intra_threads),
            );
            let _ = status_to_result(
                &rt.api,
                (rt.api.set_inter_op_num_threads())(options.ptr, config.inter_threads),
            );
            // ORT levels: 0 = disable, 1 = basic, 99 = all
            let level = match config.optimization {
                OptimizationLevel::None => 0,
                OptimizationLevel::Basic => 1,
                OptimizationLevel::All => 99,
            };
            let _ = status_to_result(
                &rt.api,
                (rt.api.set_session_graph_optimization_level())(options.ptr, level),
            );
            if config.use_accelerator {
                self.try_append_accelerator(options.ptr);
            }

            let mut session: *mut OrtSession = std::ptr::null_mut();
            status_to_result(
                &rt.api,
                (rt.api.create_session_from_array())(
                    rt.env,
                    model_bytes.as_ptr() as *const std::ffi::c_void,
                    model_bytes.len(),
                    options.ptr,
                    &mut session,
                ),
            )
            .map_err(EngineError::SessionCreateFailed)?;

            // Cache output names once; Run wants them on every call.
            let output_names = match collect_output_names(rt, session) {
                Ok(names) => names,
                Err(e) => {
                    (rt.api.release_session())(session);
                    return Err(e);
                }
            };

            let mut input_count: usize = 0;
            let _ = status_to_result(
                &rt.api,
                (rt.api.session_get_input_count())(session as *const _, &mut input_count),
            );
            log_info!(
                "Session created: {} input(s), {} output(s) [{:?}]",
                input_count,
                output_names.len(),
                output_names
            );

            Ok(Box::new(OnnxSession {
                rt: Arc::clone(&self.rt),
                session,
                output_names,
                run_lock: Mutex::new(()),
            }))
        }
    }
}

unsafe fn collect_output_names(
    rt: &Runtime,
    session: *mut OrtSession,
) -> Result<Vec<String>, EngineError> {
    let mut allocator: *mut OrtAllocator = std::ptr::null_mut();
    status_to_result(
        &rt.api,
        (rt.api.get_allocator_with_default_options())(&mut allocator),
    )
    .map_err(|e| EngineError::SessionCreateFailed(format!("Get allocator: {}", e)))?;

    let mut output_count: usize = 0;
    status_to_result(
        &rt.api,
        (rt.api.session_get_output_count())(session as *const _, &mut output_count),
    )
    .map_err(|e| EngineError::SessionCreateFailed(format!("Get output count: {}", e)))?;

    let mut names = Vec::with_capacity(output_count);
    for i in 0..output_count {
        let mut name_ptr: *mut std::ffi::c_char = std::ptr::null_mut();
        status_to_result(
            &rt.api,
            (rt.api.session_get_output_name())(session as *const _, i, allocator, &mut name_ptr),
        )
        .map_err(|e| EngineError::SessionCreateFailed(format!("Get output name: {}", e)))?;
        if name_ptr.is_null() {
            names.push(format!("output_{}", i));
        } else {
            names.push(CStr::from_ptr(name_ptr).to_string_lossy().into_owned());
            let _ = (rt.api.allocator_free())(allocator, name_ptr as *mut std::ffi::c_void);
        }
    }
    Ok(names)
}

// -- RAII guards --------------------------------------------------------
// Every Ort object acquired for a single call is released through one of
// these on every exit path (success, early return, error).

struct SessionOptionsGuard<'a> {
    rt: &'a Runtime,
    ptr: *mut OrtSessionOptions,
}
impl Drop for SessionOptionsGuard<'_> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.rt.api.release_session_options())(self.ptr) };
        }
    }
}

struct MemoryInfoGuard<'a> {
    rt: &'a Runtime,
    ptr: *mut OrtMemoryInfo,
}
impl Drop for MemoryInfoGuard<'_> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.rt.api.release_memory_info())(self.ptr) };
        }
    }
}

struct ValueGuard<'a> {
    rt: &'a Runtime,
    ptr: *mut OrtValue,
}
impl Drop for ValueGuard<'_> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.rt.api.release_value())(self.ptr) };
        }
    }
}

struct ShapeInfoGuard<'a> {
    rt: &'a Runtime,
    ptr: *mut OrtTensorTypeAndShapeInfo,
}
impl Drop for ShapeInfoGuard<'_> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.rt.api.release_tensor_type_and_shape_info())(self.ptr) };
        }
    }
}

// -- Session ------------------------------------------------------------

struct OnnxSession {
    rt: Arc<Runtime>,
    session: *mut OrtSession,
    output_names: Vec<String>,
    /// Sessions are not assumed safe for concurrent Run calls.
    run_lock: Mutex<()>,
}

unsafe impl Send for OnnxSession {}
unsafe impl Sync for OnnxSession {}

impl Drop for OnnxSession {
    fn drop(&mut self) {
        if !self.session.is_null() {
            unsafe { (self.rt.api.release_session())(self.session) };
            self.session = std::ptr::null_mut();
        }
    }
}

impl InferenceSession for OnnxSession {
    fn run(&self, inputs: &[(&str, &Tensor)]) -> Result<HashMap<String, Tensor>, EngineError> {
        let _serial = self.run_lock.lock().unwrap_or_else(|p| p.into_inner());
        let rt = &*self.rt;

        unsafe {
            let mut memory_info_ptr: *mut OrtMemoryInfo = std::ptr::null_mut();
            status_to_result(
                &rt.api,
                (rt.api.create_cpu_memory_info())(
                    OrtAllocatorType::ArenaAllocator,
                    OrtMemType::Default,
                    &mut memory_info_ptr,
                ),
            )
            .map_err(|e| EngineError::InferenceFailed(format!("Create memory info: {}", e)))?;
            let memory_info = MemoryInfoGuard {
                rt,
                ptr: memory_info_ptr,
            };

            // Input tensors borrow the callers' buffers; the `inputs` slice
            // keeps them alive for the whole Run call.
            let mut input_name_cstrings = Vec::with_capacity(inputs.len());
            let mut input_values: Vec<ValueGuard> = Vec::with_capacity(inputs.len());
            for (name, tensor) in inputs {
                input_name_cstrings.push(CString::new(*name).map_err(|_| {
                    EngineError::InferenceFailed(format!("Input name '{}' contains NUL", name))
                })?);

                let (data_ptr, data_len, elem) = match tensor.data() {
                    TensorData::F32(v) => (
                        v.as_ptr() as *mut std::ffi::c_void,
                        std::mem::size_of_val(v.as_slice()),
                        ONNXTensorElementDataType::Float,
                    ),
                    TensorData::I64(v) => (
                        v.as_ptr() as *mut std::ffi::c_void,
                        std::mem::size_of_val(v.as_slice()),
                        ONNXTensorElementDataType::Int64,
                    ),
                };

                let mut value: *mut OrtValue = std::ptr::null_mut();
                status_to_result(
                    &rt.api,
                    (rt.api.create_tensor_with_data())(
                        memory_info.ptr,
                        data_ptr,
                        data_len,
                        tensor.shape().as_ptr(),
                        tensor.shape().len(),
                        elem,
                        &mut value,
                    ),
                )
                .map_err(|e| {
                    EngineError::InferenceFailed(format!("Create tensor '{}': {}", name, e))
                })?;
                input_values.push(ValueGuard { rt, ptr: value });
            }

            let input_name_ptrs: Vec<*const std::ffi::c_char> =
                input_name_cstrings.iter().map(|c| c.as_ptr()).collect();
            let input_value_ptrs: Vec<*const OrtValue> =
                input_values.iter().map(|g| g.ptr as *const OrtValue).collect();

            let output_name_cstrings: Vec<CString> = self
                .output_names
                .iter()
                .map(|n| CString::new(n.as_str()).unwrap())
                .collect();
            let output_name_ptrs: Vec<*const std::ffi::c_char> =
                output_name_cstrings.iter().map(|c| c.as_ptr()).collect();

            let mut raw_outputs: Vec<*mut OrtValue> =
                vec![std::ptr::null_mut(); self.output_names.len()];
            let run_status = (rt.api.run())(
                self.session,
                std::ptr::null(),
                input_name_ptrs.as_ptr(),
                input_value_ptrs.as_ptr(),
                inputs.len(),
                output_name_ptrs.as_ptr(),
                self.output_names.len(),
                raw_outputs.as_mut_ptr(),
            );
            // Wrap outputs in guards before inspecting the status so they are
            // released even on a failed run.
            let outputs: Vec<ValueGuard> = raw_outputs
                .into_iter()
                .map(|ptr| ValueGuard { rt, ptr })
                .collect();
            status_to_result(&rt.api, run_status).map_err(EngineError::InferenceFailed)?;

            let mut result = HashMap::with_capacity(outputs.len());
            for (name, value) in self.output_names.iter().zip(outputs.iter()) {
                if value.ptr.is_null() {
                    continue;
                }
                result.insert(name.clone(), extract_tensor(rt, value.ptr, name)?);
            }
            Ok(result)
        }
    }
}

/// Copy an OrtValue out into an owned [`Tensor`].
unsafe fn extract_tensor(
    rt: &Runtime,
    value: *mut OrtValue,
    name: &str,
) -> Result<Tensor, EngineError> {
    let mut info_ptr: *mut OrtTensorTypeAndShapeInfo = std::ptr::null_mut();
    status_to_result(
        &rt.api,
        (rt.api.get_tensor_type_and_shape())(value as *const _, &mut info_ptr),
    )
    .map_err(|e| EngineError::InvalidOutput(format!("Shape of '{}': {}", name, e)))?;
    let info = ShapeInfoGuard { rt, ptr: info_ptr };

    let mut elem = ONNXTensorElementDataType::Undefined;
    status_to_result(
        &rt.api,
        (rt.api.get_tensor_element_type())(info.ptr, &mut elem),
    )
    .map_err(|e| EngineError::InvalidOutput(format!("Element type of '{}': {}", name, e)))?;

    let mut dim_count: usize = 0;
    status_to_result(&rt.api, (rt.api.get_dimensions_count())(info.ptr, &mut dim_count))
        .map_err(|e| EngineError::InvalidOutput(format!("Dim count of '{}': {}", name, e)))?;
    let mut dims = vec![0i64; dim_count];
    status_to_result(
        &rt.api,
        (rt.api.get_dimensions())(info.ptr, dims.as_mut_ptr(), dim_count),
    )
    .map_err(|e| EngineError::InvalidOutput(format!("Dims of '{}': {}", name, e)))?;

    let total: i64 = dims.iter().product();
    if total < 0 {
        return Err(EngineError::InvalidOutput(format!(
            "Output '{}' has dynamic dims {:?}",
            name, dims
        )));
    }
    let total = total as usize;
    if total == 0 {
        return match elem {
            ONNXTensorElementDataType::Int64 => Ok(Tensor::i64(dims, Vec::new())),
            _ => Ok(Tensor::f32(dims, Vec::new())),
        };
    }

    let mut data_ptr: *mut std::ffi::c_void = std::ptr::null_mut();
    status_to_result(&rt.api, (rt.api.get_tensor_mutable_data())(value, &mut data_ptr))
        .map_err(|e| EngineError::InvalidOutput(format!("Data of '{}': {}", name, e)))?;
    if data_ptr.is_null() && total > 0 {
        return Err(EngineError::InvalidOutput(format!(
            "Output '{}' has null data",
            name
        )));
    }

    match elem {
        ONNXTensorElementDataType::Float => {
            let slice = std::slice::from_raw_parts(data_ptr as *const f32, total);
            Ok(Tensor::f32(dims, slice.to_vec()))
        }
        ONNXTensorElementDataType::Int64 => {
            let slice = std::slice::from_raw_parts(data_ptr as *const i64, total);
            Ok(Tensor::i64(dims, slice.to_vec()))
        }
        other => Err(EngineError::InvalidOutput(format!(
            "Output '{}' has unsupported element type {:?}",
            name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_runtime_path() {
        assert!(validate_runtime_path("onnxruntime.so").is_err());
        assert!(validate_runtime_path("/opt/../lib/libonnxruntime.so").is_err());
        assert!(validate_runtime_path("/opt/ort/notalib.txt").is_err());
        assert!(validate_runtime_path("/opt/ort/libonnxruntime.so").is_ok());
    }

    #[test]
    fn version_parse() {
        assert_eq!(parse_ort_version("1.18.0"), Some((1, 18)));
        assert_eq!(parse_ort_version("1.16"), Some((1, 16)));
        assert_eq!(parse_ort_version("garbage"), None);
    }

    #[test]
    fn load_fails_for_missing_library() {
        let err = OnnxBackend::load("/nonexistent/libonnxruntime.so");
        assert!(matches!(err, Err(EngineError::RuntimeNotFound(_))));
    }
}
