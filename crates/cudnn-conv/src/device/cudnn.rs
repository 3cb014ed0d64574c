//! [`DnnDevice`] over libcudart and libcudnn.
//!
//! Resources are thin newtypes over the raw handles. They carry no `Drop`:
//! the layer gives each one back through the matching `destroy_*`/`free`
//! call, which is where release errors are reported.
//!
//! # Thread Safety
//!
//! The raw handles are neither `Send` nor `Sync`; a `CudnnDevice` and the
//! resources it creates stay on the thread that created them.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr;

use tracing::{info, warn};

use super::{ConvQuery, DeviceBuffer, DeviceCapabilities, DevicePtr, DnnDevice, MemoryInfo};
use crate::algo::{AlgoPerf, AlgoStatus, Algorithm, ConvOp};
use crate::error::{ConvError, ConvResult};
use crate::ffi::cuda_runtime::{
    cudaError_t, cudaErrorNoDevice, cudaFree, cudaMalloc, cudaMemGetInfo, cudaSetDevice,
    cudaStreamCreate, cudaStreamDestroy, cudaStream_t, is_cuda_success,
};
use crate::ffi::cudnn::*;
use crate::shape::{ConvParams, FilterShape, TensorShape};

#[derive(Debug)]
pub struct CudaStream(cudaStream_t);

#[derive(Debug)]
pub struct CudnnHandle(cudnnHandle_t);

#[derive(Debug)]
pub struct CudnnTensorDesc(cudnnTensorDescriptor_t);

#[derive(Debug)]
pub struct CudnnFilterDesc(cudnnFilterDescriptor_t);

#[derive(Debug)]
pub struct CudnnConvDesc(cudnnConvolutionDescriptor_t);

#[derive(Debug)]
pub struct CudaBuffer {
    ptr: *mut c_void,
    len: usize,
}

impl DeviceBuffer for CudaBuffer {
    fn ptr(&self) -> DevicePtr {
        DevicePtr(self.ptr as u64)
    }

    fn len(&self) -> usize {
        self.len
    }
}

fn check_cuda(call: &'static str, status: cudaError_t) -> ConvResult<()> {
    if is_cuda_success(status) {
        Ok(())
    } else {
        Err(ConvError::DeviceCall { call, status })
    }
}

fn check_cudnn(call: &'static str, status: cudnnStatus_t) -> ConvResult<()> {
    if is_cudnn_success(status) {
        Ok(())
    } else {
        Err(ConvError::DeviceCall { call, status })
    }
}

fn dim(value: usize) -> ConvResult<c_int> {
    c_int::try_from(value)
        .map_err(|_| ConvError::ShapeMismatch(format!("dimension {} exceeds the cuDNN range", value)))
}

fn set_tensor(desc: cudnnTensorDescriptor_t, shape: &TensorShape) -> ConvResult<()> {
    let (n, c, h, w) = (dim(shape.n)?, dim(shape.c)?, dim(shape.h)?, dim(shape.w)?);
    let (ns, cs, hs, ws) = (
        dim(shape.n_stride)?,
        dim(shape.c_stride)?,
        dim(shape.h_stride)?,
        dim(shape.w_stride)?,
    );
    // SAFETY: desc is live
    check_cudnn("cudnnSetTensor4dDescriptorEx", unsafe {
        cudnnSetTensor4dDescriptorEx(desc, CUDNN_DATA_FLOAT, n, c, h, w, ns, cs, hs, ws)
    })
}

fn set_filter(desc: cudnnFilterDescriptor_t, shape: &FilterShape) -> ConvResult<()> {
    let (k, c) = (dim(shape.out_channels)?, dim(shape.in_channels)?);
    let (h, w) = (dim(shape.kernel_h)?, dim(shape.kernel_w)?);
    // SAFETY: desc is live
    check_cudnn("cudnnSetFilter4dDescriptor", unsafe {
        cudnnSetFilter4dDescriptor(desc, CUDNN_DATA_FLOAT, CUDNN_TENSOR_NCHW, k, c, h, w)
    })
}

fn set_conv(desc: cudnnConvolutionDescriptor_t, params: &ConvParams) -> ConvResult<()> {
    let (pad_h, pad_w) = (dim(params.pad_h)?, dim(params.pad_w)?);
    let (stride_h, stride_w) = (dim(params.stride_h)?, dim(params.stride_w)?);
    let (dil_h, dil_w) = (dim(params.dilation_h)?, dim(params.dilation_w)?);
    // SAFETY: desc is live
    check_cudnn("cudnnSetConvolution2dDescriptor", unsafe {
        cudnnSetConvolution2dDescriptor(
            desc,
            pad_h,
            pad_w,
            stride_h,
            stride_w,
            dil_h,
            dil_w,
            CUDNN_CROSS_CORRELATION,
            CUDNN_DATA_FLOAT,
        )
    })
}

/// Hand back `desc` if `set` succeeded; otherwise release it and return the
/// set error. A failed release is logged.
fn release_on_failure<T>(
    desc: T,
    set: ConvResult<()>,
    what: &str,
    release: impl FnOnce(T) -> ConvResult<()>,
) -> ConvResult<T> {
    match set {
        Ok(()) => Ok(desc),
        Err(e) => {
            if let Err(release_err) = release(desc) {
                warn!(
                    target: "cudnn_conv::device",
                    error = %release_err,
                    "Failed to destroy {} descriptor after a failed set",
                    what
                );
            }
            Err(e)
        }
    }
}

/// One CUDA device with cuDNN.
#[derive(Debug)]
pub struct CudnnDevice {
    ordinal: i32,
    capabilities: DeviceCapabilities,
}

impl CudnnDevice {
    /// Select device `ordinal` for this thread and read the cuDNN version.
    ///
    /// # Errors
    ///
    /// * `ConvError::NoDevice` - no CUDA device present
    /// * `ConvError::DeviceCall` - `cudaSetDevice` failed
    pub fn new(ordinal: i32) -> ConvResult<Self> {
        // SAFETY: plain value argument
        let status = unsafe { cudaSetDevice(ordinal) };
        if status == cudaErrorNoDevice {
            return Err(ConvError::NoDevice);
        }
        check_cuda("cudaSetDevice", status)?;

        // SAFETY: no preconditions
        let version = unsafe { cudnnGetVersion() };
        let mut capabilities = DeviceCapabilities::for_version(version as u32);
        capabilities.workspace_limit_queries &= cfg!(feature = "cudnn-legacy");

        info!(
            target: "cudnn_conv::device",
            ordinal,
            cudnn_version = version,
            ranked = capabilities.ranked_queries,
            workspace_limit = capabilities.workspace_limit_queries,
            "cuDNN device ready"
        );
        Ok(Self {
            ordinal,
            capabilities,
        })
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }
}

impl DnnDevice for CudnnDevice {
    type Stream = CudaStream;
    type Handle = CudnnHandle;
    type TensorDesc = CudnnTensorDesc;
    type FilterDesc = CudnnFilterDesc;
    type ConvDesc = CudnnConvDesc;
    type Buffer = CudaBuffer;

    fn name(&self) -> String {
        format!(
            "CUDA device {} (cuDNN {})",
            self.ordinal, self.capabilities.library_version
        )
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn memory_info(&self) -> ConvResult<MemoryInfo> {
        let mut free = 0usize;
        let mut total = 0usize;
        // SAFETY: both pointers are valid for writes
        check_cuda("cudaMemGetInfo", unsafe { cudaMemGetInfo(&mut free, &mut total) })?;
        Ok(MemoryInfo { free, total })
    }

    fn create_stream(&self) -> ConvResult<CudaStream> {
        let mut stream: cudaStream_t = ptr::null_mut();
        // SAFETY: stream is a valid out-pointer
        check_cuda("cudaStreamCreate", unsafe { cudaStreamCreate(&mut stream) })?;
        Ok(CudaStream(stream))
    }

    fn destroy_stream(&self, stream: CudaStream) -> ConvResult<()> {
        // SAFETY: stream came from cudaStreamCreate and is released once
        check_cuda("cudaStreamDestroy", unsafe { cudaStreamDestroy(stream.0) })
    }

    fn create_handle(&self, stream: &CudaStream) -> ConvResult<CudnnHandle> {
        let mut handle: cudnnHandle_t = ptr::null_mut();
        // SAFETY: handle is a valid out-pointer
        check_cudnn("cudnnCreate", unsafe { cudnnCreate(&mut handle) })?;
        // SAFETY: both handles are live
        let status = unsafe { cudnnSetStream(handle, stream.0) };
        if let Err(e) = check_cudnn("cudnnSetStream", status) {
            // SAFETY: handle was created above and is not used again
            let status = unsafe { cudnnDestroy(handle) };
            if let Err(release) = check_cudnn("cudnnDestroy", status) {
                warn!(target: "cudnn_conv::device", error = %release, "Failed to destroy orphaned handle");
            }
            return Err(e);
        }
        Ok(CudnnHandle(handle))
    }

    fn destroy_handle(&self, handle: CudnnHandle) -> ConvResult<()> {
        // SAFETY: handle came from cudnnCreate and is released once
        check_cudnn("cudnnDestroy", unsafe { cudnnDestroy(handle.0) })
    }

    fn create_tensor_desc(&self, shape: &TensorShape) -> ConvResult<CudnnTensorDesc> {
        let mut desc: cudnnTensorDescriptor_t = ptr::null_mut();
        // SAFETY: desc is a valid out-pointer
        check_cudnn("cudnnCreateTensorDescriptor", unsafe {
            cudnnCreateTensorDescriptor(&mut desc)
        })?;
        let desc = CudnnTensorDesc(desc);

        let set = set_tensor(desc.0, shape);
        release_on_failure(desc, set, "tensor", |d| self.destroy_tensor_desc(d))
    }

    fn destroy_tensor_desc(&self, desc: CudnnTensorDesc) -> ConvResult<()> {
        // SAFETY: desc was created by this device and is released once
        check_cudnn("cudnnDestroyTensorDescriptor", unsafe {
            cudnnDestroyTensorDescriptor(desc.0)
        })
    }

    fn create_filter_desc(&self, shape: &FilterShape) -> ConvResult<CudnnFilterDesc> {
        let mut desc: cudnnFilterDescriptor_t = ptr::null_mut();
        // SAFETY: desc is a valid out-pointer
        check_cudnn("cudnnCreateFilterDescriptor", unsafe {
            cudnnCreateFilterDescriptor(&mut desc)
        })?;
        let desc = CudnnFilterDesc(desc);

        let set = set_filter(desc.0, shape);
        release_on_failure(desc, set, "filter", |d| self.destroy_filter_desc(d))
    }

    fn destroy_filter_desc(&self, desc: CudnnFilterDesc) -> ConvResult<()> {
        // SAFETY: desc was created by this device and is released once
        check_cudnn("cudnnDestroyFilterDescriptor", unsafe {
            cudnnDestroyFilterDescriptor(desc.0)
        })
    }

    fn create_conv_desc(&self, params: &ConvParams) -> ConvResult<CudnnConvDesc> {
        let mut desc: cudnnConvolutionDescriptor_t = ptr::null_mut();
        // SAFETY: desc is a valid out-pointer
        check_cudnn("cudnnCreateConvolutionDescriptor", unsafe {
            cudnnCreateConvolutionDescriptor(&mut desc)
        })?;
        let desc = CudnnConvDesc(desc);

        let set = set_conv(desc.0, params);
        release_on_failure(desc, set, "convolution", |d| self.destroy_conv_desc(d))
    }

    fn destroy_conv_desc(&self, desc: CudnnConvDesc) -> ConvResult<()> {
        // SAFETY: desc was created by this device and is released once
        check_cudnn("cudnnDestroyConvolutionDescriptor", unsafe {
            cudnnDestroyConvolutionDescriptor(desc.0)
        })
    }

    fn alloc(&self, bytes: usize) -> ConvResult<CudaBuffer> {
        let mut ptr: *mut c_void = ptr::null_mut();
        // SAFETY: ptr is a valid out-pointer
        let status = unsafe { cudaMalloc(&mut ptr, bytes) };
        if !is_cuda_success(status) {
            return Err(ConvError::WorkspaceAllocation {
                requested: bytes,
                message: format!("cudaMalloc returned {}", status),
            });
        }
        Ok(CudaBuffer { ptr, len: bytes })
    }

    fn free(&self, buffer: CudaBuffer) -> ConvResult<()> {
        // SAFETY: buffer came from cudaMalloc and is released once
        check_cuda("cudaFree", unsafe { cudaFree(buffer.ptr) })
    }

    #[cfg(feature = "cudnn-legacy")]
    fn algorithm_within_limit(
        &self,
        handle: &CudnnHandle,
        op: ConvOp,
        query: ConvQuery<'_, Self>,
        limit_bytes: usize,
    ) -> ConvResult<Algorithm> {
        let mut raw: cudnnConvolutionAlgo_t = 0;
        // SAFETY: all descriptors are live; raw is a valid out-pointer
        let (call, status) = unsafe {
            match op {
                ConvOp::Forward => (
                    "cudnnGetConvolutionForwardAlgorithm",
                    cudnnGetConvolutionForwardAlgorithm(
                        handle.0,
                        query.input.0,
                        query.filter.0,
                        query.conv.0,
                        query.output.0,
                        CUDNN_SPECIFY_WORKSPACE_LIMIT,
                        limit_bytes,
                        &mut raw,
                    ),
                ),
                ConvOp::BackwardFilter => (
                    "cudnnGetConvolutionBackwardFilterAlgorithm",
                    cudnnGetConvolutionBackwardFilterAlgorithm(
                        handle.0,
                        query.input.0,
                        query.output.0,
                        query.conv.0,
                        query.filter.0,
                        CUDNN_SPECIFY_WORKSPACE_LIMIT,
                        limit_bytes,
                        &mut raw,
                    ),
                ),
                ConvOp::BackwardData => (
                    "cudnnGetConvolutionBackwardDataAlgorithm",
                    cudnnGetConvolutionBackwardDataAlgorithm(
                        handle.0,
                        query.filter.0,
                        query.output.0,
                        query.conv.0,
                        query.input.0,
                        CUDNN_SPECIFY_WORKSPACE_LIMIT,
                        limit_bytes,
                        &mut raw,
                    ),
                ),
            }
        };
        check_cudnn(call, status)?;
        u32::try_from(raw)
            .ok()
            .and_then(|raw| Algorithm::from_raw(op, raw))
            .ok_or_else(|| ConvError::Unsupported(format!("{} returned unknown algorithm {}", call, raw)))
    }

    #[cfg(not(feature = "cudnn-legacy"))]
    fn algorithm_within_limit(
        &self,
        _handle: &CudnnHandle,
        op: ConvOp,
        _query: ConvQuery<'_, Self>,
        _limit_bytes: usize,
    ) -> ConvResult<Algorithm> {
        Err(ConvError::Unsupported(format!(
            "budget-limited {} query needs the cudnn-legacy feature",
            op
        )))
    }

    fn workspace_size(
        &self,
        handle: &CudnnHandle,
        query: ConvQuery<'_, Self>,
        algorithm: Algorithm,
    ) -> ConvResult<usize> {
        let mut size = 0usize;
        let raw = algorithm.raw() as cudnnConvolutionAlgo_t;
        // SAFETY: all descriptors are live; size is a valid out-pointer
        let (call, status) = unsafe {
            match algorithm.op() {
                ConvOp::Forward => (
                    "cudnnGetConvolutionForwardWorkspaceSize",
                    cudnnGetConvolutionForwardWorkspaceSize(
                        handle.0,
                        query.input.0,
                        query.filter.0,
                        query.conv.0,
                        query.output.0,
                        raw,
                        &mut size,
                    ),
                ),
                ConvOp::BackwardFilter => (
                    "cudnnGetConvolutionBackwardFilterWorkspaceSize",
                    cudnnGetConvolutionBackwardFilterWorkspaceSize(
                        handle.0,
                        query.input.0,
                        query.output.0,
                        query.conv.0,
                        query.filter.0,
                        raw,
                        &mut size,
                    ),
                ),
                ConvOp::BackwardData => (
                    "cudnnGetConvolutionBackwardDataWorkspaceSize",
                    cudnnGetConvolutionBackwardDataWorkspaceSize(
                        handle.0,
                        query.filter.0,
                        query.output.0,
                        query.conv.0,
                        query.input.0,
                        raw,
                        &mut size,
                    ),
                ),
            }
        };
        check_cudnn(call, status)?;
        Ok(size)
    }

    fn ranked_algorithms(
        &self,
        handle: &CudnnHandle,
        op: ConvOp,
        query: ConvQuery<'_, Self>,
        max: usize,
    ) -> ConvResult<Vec<AlgoPerf>> {
        let requested = dim(max)?;
        let mut perf = vec![cudnnConvolutionAlgoPerf_t::default(); max];
        let mut returned: c_int = 0;

        // SAFETY: all descriptors are live; perf holds `requested` entries
        let (call, status) = unsafe {
            match op {
                ConvOp::Forward => (
                    "cudnnGetConvolutionForwardAlgorithm_v7",
                    cudnnGetConvolutionForwardAlgorithm_v7(
                        handle.0,
                        query.input.0,
                        query.filter.0,
                        query.conv.0,
                        query.output.0,
                        requested,
                        &mut returned,
                        perf.as_mut_ptr(),
                    ),
                ),
                ConvOp::BackwardFilter => (
                    "cudnnGetConvolutionBackwardFilterAlgorithm_v7",
                    cudnnGetConvolutionBackwardFilterAlgorithm_v7(
                        handle.0,
                        query.input.0,
                        query.output.0,
                        query.conv.0,
                        query.filter.0,
                        requested,
                        &mut returned,
                        perf.as_mut_ptr(),
                    ),
                ),
                ConvOp::BackwardData => (
                    "cudnnGetConvolutionBackwardDataAlgorithm_v7",
                    cudnnGetConvolutionBackwardDataAlgorithm_v7(
                        handle.0,
                        query.filter.0,
                        query.output.0,
                        query.conv.0,
                        query.input.0,
                        requested,
                        &mut returned,
                        perf.as_mut_ptr(),
                    ),
                ),
            }
        };
        check_cudnn(call, status)?;

        perf.truncate(usize::try_from(returned).unwrap_or(0).min(max));
        Ok(perf
            .into_iter()
            .filter_map(|p| {
                let algorithm = Algorithm::from_raw(op, u32::try_from(p.algo).ok()?)?;
                let status = if is_cudnn_success(p.status) {
                    AlgoStatus::Success
                } else {
                    AlgoStatus::Failed(p.status)
                };
                Some(AlgoPerf {
                    algorithm,
                    status,
                    memory: p.memory,
                    time_ms: p.time,
                })
            })
            .collect())
    }
}
