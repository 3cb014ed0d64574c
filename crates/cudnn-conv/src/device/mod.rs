//! The device API seam.
//!
//! Everything the layer needs from the driver goes through [`DnnDevice`]:
//! stream/handle pairs, descriptors, memory queries, allocation and the
//! algorithm queries. Two implementations exist:
//!
//! - [`SimDevice`]: deterministic host-side device with call accounting and
//!   injectable failures, used for tests and benchmarks.
//! - [`CudnnDevice`] (feature `cuda`): libcudart + libcudnn.
//!
//! All calls are synchronous and block the calling thread.

use std::fmt;

use crate::algo::{AlgoPerf, Algorithm, ConvOp};
use crate::config::SelectionPolicy;
use crate::error::ConvResult;
use crate::shape::{ConvParams, FilterShape, TensorShape};

#[cfg(feature = "cuda")]
pub mod cudnn;
pub mod sim;

#[cfg(feature = "cuda")]
pub use cudnn::CudnnDevice;
pub use sim::{SimDevice, SimStats};

/// A device address. Zero is the null pointer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An owned device allocation.
pub trait DeviceBuffer {
    fn ptr(&self) -> DevicePtr;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Free and total device memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

/// Which algorithm queries the installed library offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Library version as `major * 1000 + minor * 100 + patch`.
    pub library_version: u32,
    /// Ranked candidate queries (`*_v7`).
    pub ranked_queries: bool,
    /// Ranked query for backward-filter; when absent a fixed algorithm is used.
    pub ranked_backward_filter: bool,
    /// Budget-limited single-answer queries (removed in cuDNN 8).
    pub workspace_limit_queries: bool,
}

impl DeviceCapabilities {
    /// Capability tier for a given library version.
    pub fn for_version(library_version: u32) -> Self {
        let ranked = library_version >= 7000;
        Self {
            library_version,
            ranked_queries: ranked,
            ranked_backward_filter: false,
            workspace_limit_queries: library_version < 8000,
        }
    }

    /// Policy `Auto` resolves to: budget-limited queries while the library
    /// still offers them, ranked queries from cuDNN 8 on.
    pub fn preferred_policy(&self) -> SelectionPolicy {
        if self.workspace_limit_queries {
            SelectionPolicy::WorkspaceLimit
        } else {
            SelectionPolicy::Ranked
        }
    }
}

/// Descriptors describing one input's convolution, borrowed for a query.
pub struct ConvQuery<'a, D: DnnDevice + ?Sized> {
    pub input: &'a D::TensorDesc,
    pub output: &'a D::TensorDesc,
    pub filter: &'a D::FilterDesc,
    pub conv: &'a D::ConvDesc,
}

impl<D: DnnDevice + ?Sized> Clone for ConvQuery<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: DnnDevice + ?Sized> Copy for ConvQuery<'_, D> {}

impl<D: DnnDevice + ?Sized> fmt::Debug for ConvQuery<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvQuery")
            .field("input", self.input)
            .field("output", self.output)
            .field("filter", self.filter)
            .field("conv", self.conv)
            .finish()
    }
}

/// Driver operations used by convolution setup.
///
/// Resources are returned by value and given back to the matching
/// `destroy_*`/`free` call; the device never releases them on its own.
pub trait DnnDevice {
    type Stream: fmt::Debug;
    type Handle: fmt::Debug;
    type TensorDesc: fmt::Debug;
    type FilterDesc: fmt::Debug;
    type ConvDesc: fmt::Debug;
    type Buffer: DeviceBuffer + fmt::Debug;

    fn name(&self) -> String;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Point-in-time free/total memory. Other users of the device may change
    /// it before any later allocation.
    fn memory_info(&self) -> ConvResult<MemoryInfo>;

    fn create_stream(&self) -> ConvResult<Self::Stream>;
    fn destroy_stream(&self, stream: Self::Stream) -> ConvResult<()>;

    /// Create a library handle bound to `stream`.
    fn create_handle(&self, stream: &Self::Stream) -> ConvResult<Self::Handle>;
    fn destroy_handle(&self, handle: Self::Handle) -> ConvResult<()>;

    fn create_tensor_desc(&self, shape: &TensorShape) -> ConvResult<Self::TensorDesc>;
    fn destroy_tensor_desc(&self, desc: Self::TensorDesc) -> ConvResult<()>;

    fn create_filter_desc(&self, shape: &FilterShape) -> ConvResult<Self::FilterDesc>;
    fn destroy_filter_desc(&self, desc: Self::FilterDesc) -> ConvResult<()>;

    fn create_conv_desc(&self, params: &ConvParams) -> ConvResult<Self::ConvDesc>;
    fn destroy_conv_desc(&self, desc: Self::ConvDesc) -> ConvResult<()>;

    fn alloc(&self, bytes: usize) -> ConvResult<Self::Buffer>;
    fn free(&self, buffer: Self::Buffer) -> ConvResult<()>;

    /// Single algorithm guaranteed to need at most `limit_bytes`.
    fn algorithm_within_limit(
        &self,
        handle: &Self::Handle,
        op: ConvOp,
        query: ConvQuery<'_, Self>,
        limit_bytes: usize,
    ) -> ConvResult<Algorithm>;

    /// Workspace bytes `algorithm` needs for `query`.
    fn workspace_size(
        &self,
        handle: &Self::Handle,
        query: ConvQuery<'_, Self>,
        algorithm: Algorithm,
    ) -> ConvResult<usize>;

    /// Up to `max` candidates for `op`, fastest first.
    fn ranked_algorithms(
        &self,
        handle: &Self::Handle,
        op: ConvOp,
        query: ConvQuery<'_, Self>,
        max: usize,
    ) -> ConvResult<Vec<AlgoPerf>>;
}
