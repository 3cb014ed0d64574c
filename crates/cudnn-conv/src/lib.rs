//! Setup, reshape and teardown for a grouped 2-D cuDNN convolution.
//!
//! This crate owns the host-side bookkeeping a convolution layer needs before
//! any kernel runs:
//! - choosing forward, backward-filter and backward-data algorithms per input
//! - sizing one shared workspace buffer and partitioning it per context
//! - creating the stream/handle pairs groups run on
//! - building group-partitioned tensor, filter and convolution descriptors
//!
//! Compute itself is out of scope.
//!
//! # Degraded Modes
//!
//! Two failures never abort a reshape. A ranked query with no acceptable
//! candidate keeps the zero-workspace default algorithm for that operation,
//! and a failed workspace allocation resets every operation to its default
//! and leaves every context without workspace. [`ReshapeReport`] tells the
//! caller which happened.
//!
//! # Feature Flags
//!
//! - `cuda`: link libcudart/libcudnn and expose [`device::CudnnDevice`]
//! - `cudnn-legacy`: budget-limited algorithm queries (cuDNN < 8)
//!
//! Without `cuda`, [`SimDevice`] is the only device.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cudnn_conv::{ConvolutionConfig, CudnnConvLayer, EngineConfig, SimDevice};
//!
//! let device = Arc::new(SimDevice::new());
//! let conv = ConvolutionConfig::new(16, 3).with_pad(1).with_group(2);
//! let mut layer = CudnnConvLayer::new(device, EngineConfig::default(), conv).unwrap();
//!
//! layer.setup(&[[8usize, 4, 32, 32]]).unwrap();
//! let report = layer.reshape(&[[8usize, 4, 32, 32]]).unwrap();
//!
//! assert_eq!(layer.context_count(), 2);
//! assert_eq!(layer.bias_offset(), 8);
//! assert_eq!(report.workspace_size, report.requested_workspace_bytes * 2);
//! ```

pub mod algo;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
#[cfg(feature = "cuda")]
pub mod ffi;
pub mod layer;
pub mod shape;
pub mod workspace;

pub use algo::{
    AlgoPerf, AlgoStatus, Algorithm, AlgorithmChoice, AlgorithmTable, ConvOp, InputAlgorithms,
    RankedCandidateStrategy, SelectionStrategy, WorkspaceLimitStrategy,
};
pub use config::{ConvolutionConfig, EngineConfig, SelectionPolicy};
pub use context::{ExecutionContext, ExecutionContextPool};
pub use descriptor::{DescriptorPlan, DescriptorSet};
#[cfg(feature = "cuda")]
pub use device::CudnnDevice;
pub use device::{DeviceCapabilities, DevicePtr, DnnDevice, MemoryInfo, SimDevice, SimStats};
pub use error::{ConvError, ConvResult};
pub use layer::{CudnnConvLayer, LifecycleState, ReshapeReport};
pub use shape::{ConvParams, FilterShape, GroupGeometry, InputShape, TensorShape};
pub use workspace::{WorkspaceArena, WorkspaceOutcome, WorkspaceRegion};
