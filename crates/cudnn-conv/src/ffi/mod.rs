//! Raw CUDA runtime and cuDNN declarations.
//!
//! All `extern "C"` items of the crate live here; [`crate::device::CudnnDevice`]
//! is the only caller.
//!
//! # Safety
//!
//! Every function is unsafe FFI. Callers must pass handles and descriptors
//! that were created by the matching `*Create*` call and not yet destroyed.

#![allow(non_camel_case_types, non_upper_case_globals)]

pub mod cuda_runtime;
pub mod cudnn;
