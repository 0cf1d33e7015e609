//! NVML and CUDA driver entry points overridden through `LD_PRELOAD`.
//!
//! Each export forwards to the next definition of the same symbol and then
//! maps the answer through the view resolved at load time: device counts and
//! indices use the environment's local index space, memory totals are
//! narrowed to its limit. Before a view is installed every call passes
//! through untouched.

#![allow(non_snake_case)]

use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::sync::OnceLock;

use crate::MemoryInfo;
use crate::ResolvedView;

type NvmlReturnT = c_uint;
type NvmlDeviceT = *mut c_void;
type CuResult = c_int;

const NVML_SUCCESS: NvmlReturnT = 0;
const NVML_ERROR_INVALID_ARGUMENT: NvmlReturnT = 2;
const NVML_ERROR_NOT_FOUND: NvmlReturnT = 6;
const NVML_ERROR_FUNCTION_NOT_FOUND: NvmlReturnT = 13;
const CUDA_SUCCESS: CuResult = 0;
const CUDA_ERROR_NOT_FOUND: CuResult = 500;

#[repr(C)]
pub(crate) struct NvmlMemoryT {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

#[repr(C)]
pub(crate) struct NvmlMemoryV2T {
    pub version: u32,
    pub total: u64,
    pub reserved: u64,
    pub free: u64,
    pub used: u64,
}

static VIEW: OnceLock<ResolvedView> = OnceLock::new();

/// Installs the view every interposed call maps through. Only the first
/// call has an effect.
pub(crate) fn install(view: ResolvedView) {
    if VIEW.set(view).is_err() {
        tracing::warn!("device view already installed");
    }
}

/// Next definition of `$name` after this library, `None` when nothing else
/// defines it.
macro_rules! next_symbol {
    ($name:literal, $ty:ty) => {{
        static ADDRESS: OnceLock<usize> = OnceLock::new();
        let address = *ADDRESS.get_or_init(|| {
            let name = concat!($name, "\0");
            // SAFETY: `name` is NUL terminated and outlives the call
            unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast()) as usize }
        });
        if address == 0 {
            tracing::error!(symbol = $name, "no next definition to forward to");
            None
        } else {
            // SAFETY: the symbol was resolved by name and has the C signature `$ty`
            Some(unsafe { std::mem::transmute::<usize, $ty>(address) })
        }
    }};
}

type GetCountFn = unsafe extern "C" fn(*mut c_uint) -> NvmlReturnT;
type GetHandleFn = unsafe extern "C" fn(c_uint, *mut NvmlDeviceT) -> NvmlReturnT;
type GetIndexFn = unsafe extern "C" fn(NvmlDeviceT, *mut c_uint) -> NvmlReturnT;
type GetMemoryFn = unsafe extern "C" fn(NvmlDeviceT, *mut NvmlMemoryT) -> NvmlReturnT;
type GetMemoryV2Fn = unsafe extern "C" fn(NvmlDeviceT, *mut NvmlMemoryV2T) -> NvmlReturnT;
type CuMemGetInfoFn = unsafe extern "C" fn(*mut usize, *mut usize) -> CuResult;

unsafe fn device_count(real: Option<GetCountFn>, count: *mut c_uint) -> NvmlReturnT {
    let Some(real) = real else {
        return NVML_ERROR_FUNCTION_NOT_FOUND;
    };
    let result = real(count);
    if result == NVML_SUCCESS && !count.is_null() {
        if let Some(view) = VIEW.get() {
            *count = view.device_count(*count);
        }
    }
    result
}

unsafe fn handle_by_index(
    real: Option<GetHandleFn>,
    index: c_uint,
    device: *mut NvmlDeviceT,
) -> NvmlReturnT {
    let Some(real) = real else {
        return NVML_ERROR_FUNCTION_NOT_FOUND;
    };
    let physical = match VIEW.get() {
        Some(view) => match view.physical_index(index) {
            Some(physical) => physical,
            None => return NVML_ERROR_INVALID_ARGUMENT,
        },
        None => index,
    };
    real(physical, device)
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetCount(count: *mut c_uint) -> NvmlReturnT {
    device_count(next_symbol!("nvmlDeviceGetCount", GetCountFn), count)
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetCount_v2(count: *mut c_uint) -> NvmlReturnT {
    device_count(next_symbol!("nvmlDeviceGetCount_v2", GetCountFn), count)
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetHandleByIndex(
    index: c_uint,
    device: *mut NvmlDeviceT,
) -> NvmlReturnT {
    handle_by_index(
        next_symbol!("nvmlDeviceGetHandleByIndex", GetHandleFn),
        index,
        device,
    )
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetHandleByIndex_v2(
    index: c_uint,
    device: *mut NvmlDeviceT,
) -> NvmlReturnT {
    handle_by_index(
        next_symbol!("nvmlDeviceGetHandleByIndex_v2", GetHandleFn),
        index,
        device,
    )
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetIndex(device: NvmlDeviceT, index: *mut c_uint) -> NvmlReturnT {
    let Some(real) = next_symbol!("nvmlDeviceGetIndex", GetIndexFn) else {
        return NVML_ERROR_FUNCTION_NOT_FOUND;
    };
    let result = real(device, index);
    if result != NVML_SUCCESS || index.is_null() {
        return result;
    }
    if let Some(view) = VIEW.get() {
        match view.local_index(*index) {
            Some(local) => *index = local,
            None => return NVML_ERROR_NOT_FOUND,
        }
    }
    NVML_SUCCESS
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetMemoryInfo(
    device: NvmlDeviceT,
    memory: *mut NvmlMemoryT,
) -> NvmlReturnT {
    let Some(real) = next_symbol!("nvmlDeviceGetMemoryInfo", GetMemoryFn) else {
        return NVML_ERROR_FUNCTION_NOT_FOUND;
    };
    let result = real(device, memory);
    if result != NVML_SUCCESS || memory.is_null() {
        return result;
    }
    if let Some(view) = VIEW.get() {
        let memory = &mut *memory;
        let info = view.virtualize_memory(MemoryInfo {
            total: memory.total,
            free: memory.free,
            used: memory.used,
        });
        memory.total = info.total;
        memory.free = info.free;
        memory.used = info.used;
    }
    NVML_SUCCESS
}

#[no_mangle]
pub unsafe extern "C" fn nvmlDeviceGetMemoryInfo_v2(
    device: NvmlDeviceT,
    memory: *mut NvmlMemoryV2T,
) -> NvmlReturnT {
    let Some(real) = next_symbol!("nvmlDeviceGetMemoryInfo_v2", GetMemoryV2Fn) else {
        return NVML_ERROR_FUNCTION_NOT_FOUND;
    };
    let result = real(device, memory);
    if result != NVML_SUCCESS || memory.is_null() {
        return result;
    }
    if let Some(view) = VIEW.get() {
        let memory = &mut *memory;
        let info = view.virtualize_memory(MemoryInfo {
            total: memory.total,
            free: memory.free,
            used: memory.used,
        });
        memory.total = info.total;
        memory.free = info.free;
        memory.used = info.used;
    }
    NVML_SUCCESS
}

#[no_mangle]
pub unsafe extern "C" fn cuMemGetInfo_v2(free: *mut usize, total: *mut usize) -> CuResult {
    let Some(real) = next_symbol!("cuMemGetInfo_v2", CuMemGetInfoFn) else {
        return CUDA_ERROR_NOT_FOUND;
    };
    let result = real(free, total);
    if result != CUDA_SUCCESS || free.is_null() || total.is_null() {
        return result;
    }
    if let Some(view) = VIEW.get() {
        let (physical_total, physical_free) = (*total as u64, *free as u64);
        let info = view.virtualize_memory(MemoryInfo {
            total: physical_total,
            free: physical_free,
            used: physical_total.saturating_sub(physical_free),
        });
        *total = info.total as usize;
        *free = info.free as usize;
    }
    CUDA_SUCCESS
}
