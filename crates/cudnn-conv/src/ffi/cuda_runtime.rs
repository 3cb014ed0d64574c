//! CUDA runtime API bindings (libcudart).
//!
//! Only the stream, memory and device-selection entry points convolution
//! setup needs.

use std::ffi::c_void;
use std::os::raw::c_int;

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// Runtime error code. 0 = success.
pub type cudaError_t = c_int;

/// Opaque stream handle.
pub type cudaStream_t = *mut c_void;

// =============================================================================
// RESULT CODES
// =============================================================================

pub const cudaSuccess: cudaError_t = 0;

/// Out of device memory.
pub const cudaErrorMemoryAllocation: cudaError_t = 2;

pub const cudaErrorNoDevice: cudaError_t = 100;

// =============================================================================
// FFI DECLARATIONS
// =============================================================================

#[link(name = "cudart")]
extern "C" {
    /// Select the device subsequent calls on this thread target.
    pub fn cudaSetDevice(device: c_int) -> cudaError_t;

    pub fn cudaStreamCreate(stream: *mut cudaStream_t) -> cudaError_t;

    pub fn cudaStreamDestroy(stream: cudaStream_t) -> cudaError_t;

    pub fn cudaMalloc(ptr: *mut *mut c_void, size: usize) -> cudaError_t;

    pub fn cudaFree(ptr: *mut c_void) -> cudaError_t;

    /// Free and total memory on the current device, in bytes.
    pub fn cudaMemGetInfo(free: *mut usize, total: *mut usize) -> cudaError_t;
}

#[inline]
#[must_use]
pub const fn is_cuda_success(result: cudaError_t) -> bool {
    result == cudaSuccess
}
