//! cuDNN bindings (libcudnn).
//!
//! Descriptor management, the ranked `*_v7` algorithm queries and the
//! workspace-size queries. The budget-limited queries were removed in
//! cuDNN 8 and are only declared with the `cudnn-legacy` feature.

use std::ffi::c_void;
use std::os::raw::c_int;

use super::cuda_runtime::cudaStream_t;

// =============================================================================
// TYPE ALIASES
// =============================================================================

pub type cudnnStatus_t = c_int;
pub type cudnnHandle_t = *mut c_void;
pub type cudnnTensorDescriptor_t = *mut c_void;
pub type cudnnFilterDescriptor_t = *mut c_void;
pub type cudnnConvolutionDescriptor_t = *mut c_void;

pub type cudnnDataType_t = c_int;
pub type cudnnTensorFormat_t = c_int;
pub type cudnnConvolutionMode_t = c_int;

/// Forward, backward-filter and backward-data algorithm enums share this
/// representation.
pub type cudnnConvolutionAlgo_t = c_int;

// =============================================================================
// CONSTANTS
// =============================================================================

pub const CUDNN_STATUS_SUCCESS: cudnnStatus_t = 0;
pub const CUDNN_STATUS_NOT_INITIALIZED: cudnnStatus_t = 1;
pub const CUDNN_STATUS_ALLOC_FAILED: cudnnStatus_t = 2;
pub const CUDNN_STATUS_BAD_PARAM: cudnnStatus_t = 3;
pub const CUDNN_STATUS_NOT_SUPPORTED: cudnnStatus_t = 9;

pub const CUDNN_DATA_FLOAT: cudnnDataType_t = 0;
pub const CUDNN_TENSOR_NCHW: cudnnTensorFormat_t = 0;
pub const CUDNN_CROSS_CORRELATION: cudnnConvolutionMode_t = 1;

/// `CUDNN_CONVOLUTION_*_SPECIFY_WORKSPACE_LIMIT`, same value for all three ops.
#[cfg(feature = "cudnn-legacy")]
pub const CUDNN_SPECIFY_WORKSPACE_LIMIT: c_int = 2;

/// `cudnnConvolution{Fwd,BwdFilter,BwdData}AlgoPerf_t` (cuDNN 7+ layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct cudnnConvolutionAlgoPerf_t {
    pub algo: cudnnConvolutionAlgo_t,
    pub status: cudnnStatus_t,
    pub time: f32,
    pub memory: usize,
    pub determinism: c_int,
    pub math_type: c_int,
    pub reserved: [c_int; 3],
}

// =============================================================================
// FFI DECLARATIONS
// =============================================================================

#[link(name = "cudnn")]
extern "C" {
    /// Encoded as `major * 1000 + minor * 100 + patch`.
    pub fn cudnnGetVersion() -> usize;

    pub fn cudnnCreate(handle: *mut cudnnHandle_t) -> cudnnStatus_t;
    pub fn cudnnDestroy(handle: cudnnHandle_t) -> cudnnStatus_t;
    pub fn cudnnSetStream(handle: cudnnHandle_t, stream: cudaStream_t) -> cudnnStatus_t;

    pub fn cudnnCreateTensorDescriptor(desc: *mut cudnnTensorDescriptor_t) -> cudnnStatus_t;
    pub fn cudnnDestroyTensorDescriptor(desc: cudnnTensorDescriptor_t) -> cudnnStatus_t;
    pub fn cudnnSetTensor4dDescriptorEx(
        desc: cudnnTensorDescriptor_t,
        data_type: cudnnDataType_t,
        n: c_int,
        c: c_int,
        h: c_int,
        w: c_int,
        n_stride: c_int,
        c_stride: c_int,
        h_stride: c_int,
        w_stride: c_int,
    ) -> cudnnStatus_t;

    pub fn cudnnCreateFilterDescriptor(desc: *mut cudnnFilterDescriptor_t) -> cudnnStatus_t;
    pub fn cudnnDestroyFilterDescriptor(desc: cudnnFilterDescriptor_t) -> cudnnStatus_t;
    pub fn cudnnSetFilter4dDescriptor(
        desc: cudnnFilterDescriptor_t,
        data_type: cudnnDataType_t,
        format: cudnnTensorFormat_t,
        k: c_int,
        c: c_int,
        h: c_int,
        w: c_int,
    ) -> cudnnStatus_t;

    pub fn cudnnCreateConvolutionDescriptor(
        desc: *mut cudnnConvolutionDescriptor_t,
    ) -> cudnnStatus_t;
    pub fn cudnnDestroyConvolutionDescriptor(desc: cudnnConvolutionDescriptor_t) -> cudnnStatus_t;
    pub fn cudnnSetConvolution2dDescriptor(
        desc: cudnnConvolutionDescriptor_t,
        pad_h: c_int,
        pad_w: c_int,
        stride_h: c_int,
        stride_w: c_int,
        dilation_h: c_int,
        dilation_w: c_int,
        mode: cudnnConvolutionMode_t,
        compute_type: cudnnDataType_t,
    ) -> cudnnStatus_t;

    // =========================================================================
    // RANKED QUERIES (cuDNN 7+)
    // =========================================================================

    pub fn cudnnGetConvolutionForwardAlgorithm_v7(
        handle: cudnnHandle_t,
        x_desc: cudnnTensorDescriptor_t,
        w_desc: cudnnFilterDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        y_desc: cudnnTensorDescriptor_t,
        requested: c_int,
        returned: *mut c_int,
        perf: *mut cudnnConvolutionAlgoPerf_t,
    ) -> cudnnStatus_t;

    pub fn cudnnGetConvolutionBackwardFilterAlgorithm_v7(
        handle: cudnnHandle_t,
        x_desc: cudnnTensorDescriptor_t,
        dy_desc: cudnnTensorDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        dw_desc: cudnnFilterDescriptor_t,
        requested: c_int,
        returned: *mut c_int,
        perf: *mut cudnnConvolutionAlgoPerf_t,
    ) -> cudnnStatus_t;

    pub fn cudnnGetConvolutionBackwardDataAlgorithm_v7(
        handle: cudnnHandle_t,
        w_desc: cudnnFilterDescriptor_t,
        dy_desc: cudnnTensorDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        dx_desc: cudnnTensorDescriptor_t,
        requested: c_int,
        returned: *mut c_int,
        perf: *mut cudnnConvolutionAlgoPerf_t,
    ) -> cudnnStatus_t;

    // =========================================================================
    // WORKSPACE SIZE
    // =========================================================================

    pub fn cudnnGetConvolutionForwardWorkspaceSize(
        handle: cudnnHandle_t,
        x_desc: cudnnTensorDescriptor_t,
        w_desc: cudnnFilterDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        y_desc: cudnnTensorDescriptor_t,
        algo: cudnnConvolutionAlgo_t,
        size: *mut usize,
    ) -> cudnnStatus_t;

    pub fn cudnnGetConvolutionBackwardFilterWorkspaceSize(
        handle: cudnnHandle_t,
        x_desc: cudnnTensorDescriptor_t,
        dy_desc: cudnnTensorDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        dw_desc: cudnnFilterDescriptor_t,
        algo: cudnnConvolutionAlgo_t,
        size: *mut usize,
    ) -> cudnnStatus_t;

    pub fn cudnnGetConvolutionBackwardDataWorkspaceSize(
        handle: cudnnHandle_t,
        w_desc: cudnnFilterDescriptor_t,
        dy_desc: cudnnTensorDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        dx_desc: cudnnTensorDescriptor_t,
        algo: cudnnConvolutionAlgo_t,
        size: *mut usize,
    ) -> cudnnStatus_t;
}

// =============================================================================
// BUDGET-LIMITED QUERIES (cuDNN < 8)
// =============================================================================

#[cfg(feature = "cudnn-legacy")]
#[link(name = "cudnn")]
extern "C" {
    pub fn cudnnGetConvolutionForwardAlgorithm(
        handle: cudnnHandle_t,
        x_desc: cudnnTensorDescriptor_t,
        w_desc: cudnnFilterDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        y_desc: cudnnTensorDescriptor_t,
        preference: c_int,
        memory_limit: usize,
        algo: *mut cudnnConvolutionAlgo_t,
    ) -> cudnnStatus_t;

    pub fn cudnnGetConvolutionBackwardFilterAlgorithm(
        handle: cudnnHandle_t,
        x_desc: cudnnTensorDescriptor_t,
        dy_desc: cudnnTensorDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        dw_desc: cudnnFilterDescriptor_t,
        preference: c_int,
        memory_limit: usize,
        algo: *mut cudnnConvolutionAlgo_t,
    ) -> cudnnStatus_t;

    pub fn cudnnGetConvolutionBackwardDataAlgorithm(
        handle: cudnnHandle_t,
        w_desc: cudnnFilterDescriptor_t,
        dy_desc: cudnnTensorDescriptor_t,
        conv_desc: cudnnConvolutionDescriptor_t,
        dx_desc: cudnnTensorDescriptor_t,
        preference: c_int,
        memory_limit: usize,
        algo: *mut cudnnConvolutionAlgo_t,
    ) -> cudnnStatus_t;
}

#[inline]
#[must_use]
pub const fn is_cudnn_success(status: cudnnStatus_t) -> bool {
    status == CUDNN_STATUS_SUCCESS
}

#[must_use]
pub fn cudnn_status_to_string(status: cudnnStatus_t) -> String {
    match status {
        CUDNN_STATUS_SUCCESS => "CUDNN_STATUS_SUCCESS (0)".to_string(),
        CUDNN_STATUS_NOT_INITIALIZED => "CUDNN_STATUS_NOT_INITIALIZED (1)".to_string(),
        CUDNN_STATUS_ALLOC_FAILED => "CUDNN_STATUS_ALLOC_FAILED (2)".to_string(),
        CUDNN_STATUS_BAD_PARAM => "CUDNN_STATUS_BAD_PARAM (3)".to_string(),
        CUDNN_STATUS_NOT_SUPPORTED => "CUDNN_STATUS_NOT_SUPPORTED (9)".to_string(),
        code => format!("CUDNN_STATUS_UNKNOWN ({})", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert!(is_cudnn_success(CUDNN_STATUS_SUCCESS));
        assert!(!is_cudnn_success(CUDNN_STATUS_BAD_PARAM));
        assert_eq!(cudnn_status_to_string(9), "CUDNN_STATUS_NOT_SUPPORTED (9)");
        assert_eq!(cudnn_status_to_string(42), "CUDNN_STATUS_UNKNOWN (42)");
    }

    #[test]
    fn test_perf_layout() {
        // algo, status, time, pad, memory, determinism, math_type, reserved[3]
        assert_eq!(std::mem::size_of::<cudnnConvolutionAlgoPerf_t>(), 48);
    }
}
