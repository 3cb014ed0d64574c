//! Deterministic host-side device.
//!
//! `SimDevice` models the parts of a GPU that convolution setup observes:
//! free memory that shrinks with allocations, per-algorithm workspace
//! requirements derived from tensor sizes, ranked candidate lists, and
//! driver failures that can be injected at chosen points. Every call is
//! counted in [`SimStats`] so tests can assert exactly which resources were
//! created and released.
//!
//! Workspace model: with `unit` the byte size of the (per-group) input view,
//! an algorithm needs `unit * factor / 8` bytes, `factor` taken from a fixed
//! table. Zero-factor algorithms need no workspace.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use super::{
    ConvQuery, DeviceBuffer, DeviceCapabilities, DevicePtr, DnnDevice, MemoryInfo,
};
use crate::algo::{AlgoPerf, Algorithm, BwdDataAlgo, BwdFilterAlgo, ConvOp, FwdAlgo};
use crate::error::{ConvError, ConvResult};
use crate::shape::{ConvParams, FilterShape, TensorShape};

/// Bytes per element (f32).
const ELEMENT_BYTES: usize = 4;

/// First address handed out; allocations are 256-byte aligned above it.
const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;

/// `CUDNN_STATUS_NOT_SUPPORTED`
const STATUS_NOT_SUPPORTED: i32 = 9;
/// `cudaErrorMemoryAllocation`
const STATUS_MEMORY_ALLOCATION: i32 = 2;

/// Default simulated capacity: 16 GiB, all free.
const DEFAULT_TOTAL_MEMORY: usize = 16 * 1024 * 1024 * 1024;

// ============================================================================
// RESOURCE TYPES
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub struct SimStream {
    id: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SimHandle {
    id: u64,
    stream: u64,
}

impl SimHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the stream this handle was bound to.
    pub fn stream_id(&self) -> u64 {
        self.stream
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SimTensorDesc {
    id: u64,
    pub shape: TensorShape,
}

impl SimTensorDesc {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SimFilterDesc {
    id: u64,
    pub shape: FilterShape,
}

impl SimFilterDesc {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SimConvDesc {
    id: u64,
    pub params: ConvParams,
}

impl SimConvDesc {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SimBuffer {
    id: u64,
    ptr: DevicePtr,
    len: usize,
}

impl DeviceBuffer for SimBuffer {
    fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

// ============================================================================
// ACCOUNTING
// ============================================================================

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub streams_created: usize,
    pub streams_destroyed: usize,
    pub handles_created: usize,
    pub handles_destroyed: usize,
    pub descriptors_created: usize,
    pub descriptors_destroyed: usize,
    pub allocations: usize,
    pub failed_allocations: usize,
    pub frees: usize,
    pub memory_queries: usize,
    pub limit_queries: usize,
    pub ranked_queries: usize,
    pub workspace_queries: usize,
}

impl SimStats {
    /// Calls that give a resource back to the device.
    pub fn release_calls(&self) -> usize {
        self.streams_destroyed + self.handles_destroyed + self.descriptors_destroyed + self.frees
    }

    pub fn live_streams(&self) -> usize {
        self.streams_created - self.streams_destroyed
    }

    pub fn live_handles(&self) -> usize {
        self.handles_created - self.handles_destroyed
    }

    pub fn live_descriptors(&self) -> usize {
        self.descriptors_created - self.descriptors_destroyed
    }

    pub fn live_buffers(&self) -> usize {
        self.allocations - self.frees
    }
}

#[derive(Debug)]
struct SimState {
    next_id: u64,
    next_address: u64,
    free_memory: usize,
    alloc_limit: Option<usize>,
    fail_stream_at: Option<usize>,
    fail_handle_at: Option<usize>,
    fail_descriptors: bool,
    fail_descriptor_at: Option<usize>,
    scripted: HashMap<ConvOp, Vec<AlgoPerf>>,
    live_streams: HashSet<u64>,
    live_buffers: HashMap<u64, usize>,
    stats: SimStats,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

// ============================================================================
// DEVICE
// ============================================================================

/// Host-side model of a cuDNN-capable GPU.
///
/// # Example
///
/// ```
/// use cudnn_conv::device::{DnnDevice, SimDevice};
///
/// let device = SimDevice::new();
/// let stream = device.create_stream().unwrap();
/// let handle = device.create_handle(&stream).unwrap();
/// device.destroy_handle(handle).unwrap();
/// device.destroy_stream(stream).unwrap();
/// assert_eq!(device.stats().release_calls(), 2);
/// ```
#[derive(Debug)]
pub struct SimDevice {
    name: String,
    total_memory: usize,
    capabilities: DeviceCapabilities,
    state: Mutex<SimState>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// A cuDNN 8 class device: ranked queries, no ranked backward-filter.
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::for_version(8_200))
    }

    /// A cuDNN 6 class device offering budget-limited queries only.
    pub fn legacy() -> Self {
        Self::with_capabilities(DeviceCapabilities {
            library_version: 6_021,
            ranked_queries: false,
            ranked_backward_filter: false,
            workspace_limit_queries: true,
        })
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            name: format!("SimDevice (cuDNN {})", capabilities.library_version),
            total_memory: DEFAULT_TOTAL_MEMORY,
            capabilities,
            state: Mutex::new(SimState {
                next_id: 0,
                next_address: BASE_ADDRESS,
                free_memory: DEFAULT_TOTAL_MEMORY,
                alloc_limit: None,
                fail_stream_at: None,
                fail_handle_at: None,
                fail_descriptors: false,
                fail_descriptor_at: None,
                scripted: HashMap::new(),
                live_streams: HashSet::new(),
                live_buffers: HashMap::new(),
                stats: SimStats::default(),
            }),
        }
    }

    /// Set total capacity; free memory is reset to the same value.
    pub fn with_total_memory(mut self, bytes: usize) -> Self {
        self.total_memory = bytes;
        self.state.get_mut().free_memory = bytes;
        self
    }

    /// Override the free memory reported (and enforced) from now on.
    pub fn set_free_memory(&self, bytes: usize) {
        self.state.lock().free_memory = bytes.min(self.total_memory);
    }

    /// Make every allocation larger than `bytes` fail. `None` clears it.
    pub fn set_alloc_limit(&self, bytes: Option<usize>) {
        self.state.lock().alloc_limit = bytes;
    }

    /// Fail the `n`-th stream creation (zero-based, counted over the device's life).
    pub fn fail_stream_creation_at(&self, n: Option<usize>) {
        self.state.lock().fail_stream_at = n;
    }

    /// Fail the `n`-th handle creation (zero-based).
    pub fn fail_handle_creation_at(&self, n: Option<usize>) {
        self.state.lock().fail_handle_at = n;
    }

    /// Fail every descriptor creation while set.
    pub fn fail_descriptor_creation(&self, fail: bool) {
        self.state.lock().fail_descriptors = fail;
    }

    /// Fail the `n`-th descriptor creation of any kind (zero-based, counted
    /// over the device's life).
    pub fn fail_descriptor_creation_at(&self, n: Option<usize>) {
        self.state.lock().fail_descriptor_at = n;
    }

    /// Replace the ranked list returned for `op`.
    pub fn script_ranked(&self, op: ConvOp, candidates: Vec<AlgoPerf>) {
        self.state.lock().scripted.insert(op, candidates);
    }

    pub fn clear_scripts(&self) {
        self.state.lock().scripted.clear();
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }

    /// Free bytes right now, without counting a query.
    pub fn free_memory(&self) -> usize {
        self.state.lock().free_memory
    }

    /// Workspace the model assigns to `algorithm` for an input view of `input`.
    pub fn workspace_for(algorithm: Algorithm, input: &TensorShape) -> usize {
        let unit = input.count() * ELEMENT_BYTES;
        unit * workspace_factor(algorithm) / 8
    }

    /// Preference order reported by ranked queries, fastest first.
    pub fn rank_order(op: ConvOp) -> Vec<Algorithm> {
        match op {
            ConvOp::Forward => [
                FwdAlgo::WinogradNonfused,
                FwdAlgo::Fft,
                FwdAlgo::ImplicitPrecompGemm,
                FwdAlgo::Direct,
                FwdAlgo::Gemm,
                FwdAlgo::FftTiling,
                FwdAlgo::ImplicitGemm,
                FwdAlgo::Winograd,
            ]
            .into_iter()
            .map(Algorithm::Forward)
            .collect(),
            ConvOp::BackwardFilter => [
                BwdFilterAlgo::WinogradNonfused,
                BwdFilterAlgo::Algo1,
                BwdFilterAlgo::Fft,
                BwdFilterAlgo::Algo3,
                BwdFilterAlgo::Algo0,
                BwdFilterAlgo::FftTiling,
                BwdFilterAlgo::Winograd,
            ]
            .into_iter()
            .map(Algorithm::BackwardFilter)
            .collect(),
            ConvOp::BackwardData => [
                BwdDataAlgo::Winograd,
                BwdDataAlgo::WinogradNonfused,
                BwdDataAlgo::Algo1,
                BwdDataAlgo::Fft,
                BwdDataAlgo::FftTiling,
                BwdDataAlgo::Algo0,
            ]
            .into_iter()
            .map(Algorithm::BackwardData)
            .collect(),
        }
    }

    fn descriptor_created(&self) -> ConvResult<u64> {
        let mut state = self.state.lock();
        let attempt = state.stats.descriptors_created;
        if state.fail_descriptor_at == Some(attempt) {
            state.fail_descriptor_at = None;
            return Err(ConvError::DeviceCall {
                call: "cudnnCreateTensorDescriptor",
                status: STATUS_MEMORY_ALLOCATION,
            });
        }
        if state.fail_descriptors {
            return Err(ConvError::DeviceCall {
                call: "cudnnCreateTensorDescriptor",
                status: STATUS_NOT_SUPPORTED,
            });
        }
        state.stats.descriptors_created += 1;
        Ok(state.next_id())
    }

    fn descriptor_destroyed(&self) -> ConvResult<()> {
        self.state.lock().stats.descriptors_destroyed += 1;
        Ok(())
    }
}

/// Eighths of the input view an algorithm needs as workspace.
fn workspace_factor(algorithm: Algorithm) -> usize {
    match algorithm {
        Algorithm::Forward(a) => match a {
            FwdAlgo::ImplicitGemm | FwdAlgo::Direct => 0,
            FwdAlgo::ImplicitPrecompGemm => 1,
            FwdAlgo::Winograd => 4,
            FwdAlgo::WinogradNonfused => 6,
            FwdAlgo::Gemm => 8,
            FwdAlgo::FftTiling => 12,
            FwdAlgo::Fft => 16,
        },
        Algorithm::BackwardFilter(a) => match a {
            BwdFilterAlgo::Algo0 => 0,
            BwdFilterAlgo::Algo3 => 1,
            BwdFilterAlgo::Algo1 => 2,
            BwdFilterAlgo::Winograd => 4,
            BwdFilterAlgo::WinogradNonfused => 6,
            BwdFilterAlgo::FftTiling => 12,
            BwdFilterAlgo::Fft => 16,
        },
        Algorithm::BackwardData(a) => match a {
            BwdDataAlgo::Algo0 => 0,
            BwdDataAlgo::Algo1 => 2,
            BwdDataAlgo::Winograd => 4,
            BwdDataAlgo::WinogradNonfused => 6,
            BwdDataAlgo::FftTiling => 12,
            BwdDataAlgo::Fft => 16,
        },
    }
}

/// Algorithms the model reports as unsupported for every shape.
fn unsupported(algorithm: Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::Forward(FwdAlgo::Direct) | Algorithm::BackwardFilter(BwdFilterAlgo::Winograd)
    )
}

impl DnnDevice for SimDevice {
    type Stream = SimStream;
    type Handle = SimHandle;
    type TensorDesc = SimTensorDesc;
    type FilterDesc = SimFilterDesc;
    type ConvDesc = SimConvDesc;
    type Buffer = SimBuffer;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn memory_info(&self) -> ConvResult<MemoryInfo> {
        let mut state = self.state.lock();
        state.stats.memory_queries += 1;
        Ok(MemoryInfo {
            free: state.free_memory,
            total: self.total_memory,
        })
    }

    fn create_stream(&self) -> ConvResult<SimStream> {
        let mut state = self.state.lock();
        let attempt = state.stats.streams_created;
        if state.fail_stream_at == Some(attempt) {
            state.fail_stream_at = None;
            return Err(ConvError::DeviceCall {
                call: "cudaStreamCreate",
                status: STATUS_MEMORY_ALLOCATION,
            });
        }
        state.stats.streams_created += 1;
        let id = state.next_id();
        state.live_streams.insert(id);
        Ok(SimStream { id })
    }

    fn destroy_stream(&self, stream: SimStream) -> ConvResult<()> {
        let mut state = self.state.lock();
        state.live_streams.remove(&stream.id);
        state.stats.streams_destroyed += 1;
        Ok(())
    }

    fn create_handle(&self, stream: &SimStream) -> ConvResult<SimHandle> {
        let mut state = self.state.lock();
        if !state.live_streams.contains(&stream.id) {
            return Err(ConvError::DeviceCall {
                call: "cudnnSetStream",
                status: STATUS_NOT_SUPPORTED,
            });
        }
        let attempt = state.stats.handles_created;
        if state.fail_handle_at == Some(attempt) {
            state.fail_handle_at = None;
            return Err(ConvError::DeviceCall {
                call: "cudnnCreate",
                status: STATUS_MEMORY_ALLOCATION,
            });
        }
        state.stats.handles_created += 1;
        let id = state.next_id();
        Ok(SimHandle {
            id,
            stream: stream.id,
        })
    }

    fn destroy_handle(&self, _handle: SimHandle) -> ConvResult<()> {
        self.state.lock().stats.handles_destroyed += 1;
        Ok(())
    }

    fn create_tensor_desc(&self, shape: &TensorShape) -> ConvResult<SimTensorDesc> {
        let id = self.descriptor_created()?;
        Ok(SimTensorDesc { id, shape: *shape })
    }

    fn destroy_tensor_desc(&self, _desc: SimTensorDesc) -> ConvResult<()> {
        self.descriptor_destroyed()
    }

    fn create_filter_desc(&self, shape: &FilterShape) -> ConvResult<SimFilterDesc> {
        let id = self.descriptor_created()?;
        Ok(SimFilterDesc { id, shape: *shape })
    }

    fn destroy_filter_desc(&self, _desc: SimFilterDesc) -> ConvResult<()> {
        self.descriptor_destroyed()
    }

    fn create_conv_desc(&self, params: &ConvParams) -> ConvResult<SimConvDesc> {
        let id = self.descriptor_created()?;
        Ok(SimConvDesc {
            id,
            params: *params,
        })
    }

    fn destroy_conv_desc(&self, _desc: SimConvDesc) -> ConvResult<()> {
        self.descriptor_destroyed()
    }

    fn alloc(&self, bytes: usize) -> ConvResult<SimBuffer> {
        let mut state = self.state.lock();
        let over_limit = state.alloc_limit.is_some_and(|limit| bytes > limit);
        if over_limit || bytes > state.free_memory {
            state.stats.failed_allocations += 1;
            return Err(ConvError::WorkspaceAllocation {
                requested: bytes,
                message: format!("out of memory ({} bytes free)", state.free_memory),
            });
        }

        state.stats.allocations += 1;
        state.free_memory -= bytes;
        let id = state.next_id();
        let ptr = DevicePtr(state.next_address);
        let span = (bytes as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span;
        state.live_buffers.insert(id, bytes);
        Ok(SimBuffer { id, ptr, len: bytes })
    }

    fn free(&self, buffer: SimBuffer) -> ConvResult<()> {
        let mut state = self.state.lock();
        if let Some(bytes) = state.live_buffers.remove(&buffer.id) {
            state.free_memory = (state.free_memory + bytes).min(self.total_memory);
        }
        state.stats.frees += 1;
        Ok(())
    }

    fn algorithm_within_limit(
        &self,
        _handle: &SimHandle,
        op: ConvOp,
        query: ConvQuery<'_, Self>,
        limit_bytes: usize,
    ) -> ConvResult<Algorithm> {
        self.state.lock().stats.limit_queries += 1;
        if !self.capabilities.workspace_limit_queries {
            return Err(ConvError::Unsupported(format!(
                "budget-limited {} query removed in cuDNN {}",
                op, self.capabilities.library_version
            )));
        }

        let chosen = Self::rank_order(op)
            .into_iter()
            .filter(|a| !unsupported(*a))
            .find(|a| Self::workspace_for(*a, &query.input.shape) <= limit_bytes)
            .unwrap_or_else(|| Algorithm::default_for(op));
        Ok(chosen)
    }

    fn workspace_size(
        &self,
        _handle: &SimHandle,
        query: ConvQuery<'_, Self>,
        algorithm: Algorithm,
    ) -> ConvResult<usize> {
        self.state.lock().stats.workspace_queries += 1;
        if unsupported(algorithm) {
            return Err(ConvError::DeviceCall {
                call: "cudnnGetConvolutionWorkspaceSize",
                status: STATUS_NOT_SUPPORTED,
            });
        }
        Ok(Self::workspace_for(algorithm, &query.input.shape))
    }

    fn ranked_algorithms(
        &self,
        _handle: &SimHandle,
        op: ConvOp,
        query: ConvQuery<'_, Self>,
        max: usize,
    ) -> ConvResult<Vec<AlgoPerf>> {
        let mut state = self.state.lock();
        state.stats.ranked_queries += 1;
        if !self.capabilities.ranked_queries
            || (op == ConvOp::BackwardFilter && !self.capabilities.ranked_backward_filter)
        {
            return Err(ConvError::Unsupported(format!(
                "ranked {} query not offered by cuDNN {}",
                op, self.capabilities.library_version
            )));
        }

        if let Some(scripted) = state.scripted.get(&op) {
            return Ok(scripted.iter().take(max).copied().collect());
        }

        let ranked = Self::rank_order(op)
            .into_iter()
            .take(max)
            .map(|a| {
                if unsupported(a) {
                    AlgoPerf::failed(a, STATUS_NOT_SUPPORTED)
                } else {
                    AlgoPerf::success(a, Self::workspace_for(a, &query.input.shape))
                }
            })
            .collect();
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_parts(device: &SimDevice) -> (SimTensorDesc, SimTensorDesc, SimFilterDesc, SimConvDesc) {
        let input = device
            .create_tensor_desc(&TensorShape::packed(8, 3, 32, 32))
            .unwrap();
        let output = device
            .create_tensor_desc(&TensorShape::packed(8, 16, 32, 32))
            .unwrap();
        let filter = device
            .create_filter_desc(&FilterShape {
                out_channels: 16,
                in_channels: 3,
                kernel_h: 3,
                kernel_w: 3,
            })
            .unwrap();
        let conv = device
            .create_conv_desc(&ConvParams {
                pad_h: 1,
                pad_w: 1,
                stride_h: 1,
                stride_w: 1,
                dilation_h: 1,
                dilation_w: 1,
            })
            .unwrap();
        (input, output, filter, conv)
    }

    #[test]
    fn test_alloc_consumes_free_memory() {
        let device = SimDevice::new().with_total_memory(1 << 20);
        let buf = device.alloc(4096).unwrap();
        assert_eq!(device.free_memory(), (1 << 20) - 4096);
        assert_eq!(buf.ptr().0 % ALIGNMENT, 0);

        assert!(matches!(
            device.alloc(1 << 20),
            Err(ConvError::WorkspaceAllocation { .. })
        ));
        device.free(buf).unwrap();
        assert_eq!(device.free_memory(), 1 << 20);

        let stats = device.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.failed_allocations, 1);
        assert_eq!(stats.live_buffers(), 0);
        println!("[PASS] allocations consume and return free memory");
    }

    #[test]
    fn test_alloc_limit_forces_failure() {
        let device = SimDevice::new();
        device.set_alloc_limit(Some(1024));
        assert!(device.alloc(1024).is_ok());
        assert!(device.alloc(1025).is_err());
        device.set_alloc_limit(None);
        assert!(device.alloc(1025).is_ok());
    }

    #[test]
    fn test_stream_failure_is_one_shot() {
        let device = SimDevice::new();
        device.fail_stream_creation_at(Some(1));
        let first = device.create_stream().unwrap();
        assert!(device.create_stream().is_err());
        let second = device.create_stream().unwrap();
        assert_ne!(first, second);
        assert_eq!(device.stats().streams_created, 2);
    }

    #[test]
    fn test_ranked_forward_excludes_nothing_itself() {
        let device = SimDevice::new();
        let stream = device.create_stream().unwrap();
        let handle = device.create_handle(&stream).unwrap();
        let (input, output, filter, conv) = query_parts(&device);
        let query = ConvQuery::<SimDevice> {
            input: &input,
            output: &output,
            filter: &filter,
            conv: &conv,
        };

        let ranked = device
            .ranked_algorithms(&handle, ConvOp::Forward, query, 4)
            .unwrap();
        assert_eq!(ranked.len(), 4);
        assert_eq!(ranked[0].algorithm, Algorithm::Forward(FwdAlgo::WinogradNonfused));
        assert!(matches!(ranked[3].status, crate::algo::AlgoStatus::Failed(_)));

        // cuDNN 8 class device has no ranked backward-filter query
        assert!(matches!(
            device.ranked_algorithms(&handle, ConvOp::BackwardFilter, query, 4),
            Err(ConvError::Unsupported(_))
        ));
    }

    #[test]
    fn test_limit_query_respects_ceiling() {
        let device = SimDevice::legacy();
        let stream = device.create_stream().unwrap();
        let handle = device.create_handle(&stream).unwrap();
        let (input, output, filter, conv) = query_parts(&device);
        let query = ConvQuery::<SimDevice> {
            input: &input,
            output: &output,
            filter: &filter,
            conv: &conv,
        };

        for limit in [0usize, 10_000, 100_000, 1 << 30] {
            let algo = device
                .algorithm_within_limit(&handle, ConvOp::Forward, query, limit)
                .unwrap();
            let bytes = device.workspace_size(&handle, query, algo).unwrap();
            assert!(bytes <= limit, "{:?} needs {} > {}", algo, bytes, limit);
        }
    }
}
