//! Lifecycle controller.
//!
//! [`CudnnConvLayer`] sequences the other components:
//!
//! ```text
//! Uninitialized --setup--> HandlesReady --reshape--> Configured --reshape--> Configured
//!       |                        |                        |
//!       +--teardown (no-op)      +--------teardown--------+--> Destroyed (terminal)
//! ```
//!
//! Within one reshape the stages run strictly in order: descriptors,
//! algorithm selection, workspace sizing. Execution contexts are created once
//! at setup and reused by every reshape.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::algo::{strategy_for, AlgorithmTable, SelectionStrategy};
use crate::config::{ConvolutionConfig, EngineConfig};
use crate::context::ExecutionContextPool;
use crate::descriptor::{DescriptorPlan, DescriptorSet};
use crate::device::{DevicePtr, DnnDevice};
use crate::error::{ConvError, ConvResult};
use crate::shape::{GroupGeometry, InputShape};
use crate::workspace::{WorkspaceArena, WorkspaceOutcome, WorkspaceRegion};

/// Where a layer is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Uninitialized,
    HandlesReady,
    Configured,
    Destroyed,
}

impl LifecycleState {
    /// Whether device resources may be held.
    pub fn holds_resources(&self) -> bool {
        matches!(self, LifecycleState::HandlesReady | LifecycleState::Configured)
    }
}

/// What a reshape did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReshapeReport {
    /// Full output shape `[N, M, Ho, Wo]`.
    pub output_shape: [usize; 4],
    /// Largest per-context workspace the selected algorithms asked for. In
    /// degraded mode this is the request that failed; the table itself has
    /// been reset to zero-workspace defaults.
    pub requested_workspace_bytes: usize,
    pub workspace: WorkspaceOutcome,
    /// Recorded workspace buffer size after this reshape.
    pub workspace_size: usize,
    /// Operations left on the default algorithm.
    pub fallbacks: usize,
}

impl ReshapeReport {
    pub fn is_degraded(&self) -> bool {
        self.workspace.is_degraded()
    }
}

/// Setup/reshape/teardown of one grouped 2-D convolution.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use cudnn_conv::{ConvolutionConfig, CudnnConvLayer, EngineConfig, LifecycleState, SimDevice};
///
/// let device = Arc::new(SimDevice::new());
/// let conv = ConvolutionConfig::new(16, 3).with_pad(1);
/// let mut layer = CudnnConvLayer::new(device, EngineConfig::default(), conv).unwrap();
///
/// layer.setup(&[[8usize, 3, 32, 32]]).unwrap();
/// let report = layer.reshape(&[[8usize, 3, 32, 32]]).unwrap();
/// assert_eq!(report.output_shape, [8, 16, 32, 32]);
/// assert_eq!(layer.state(), LifecycleState::Configured);
///
/// layer.teardown();
/// assert_eq!(layer.state(), LifecycleState::Destroyed);
/// ```
pub struct CudnnConvLayer<D: DnnDevice> {
    device: Arc<D>,
    engine: EngineConfig,
    conv: ConvolutionConfig,
    strategy: Box<dyn SelectionStrategy<D>>,
    state: LifecycleState,
    channels: usize,
    contexts: Option<ExecutionContextPool<D>>,
    descriptors: Option<DescriptorSet<D>>,
    algorithms: AlgorithmTable,
    workspace: WorkspaceArena<D::Buffer>,
}

impl<D: DnnDevice> CudnnConvLayer<D> {
    /// Validate both configs and resolve the selection strategy for `device`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for bad parameters, `Unsupported` when the requested
    /// selection policy is not offered by the device.
    pub fn new(device: Arc<D>, engine: EngineConfig, conv: ConvolutionConfig) -> ConvResult<Self> {
        engine.validate()?;
        conv.validate()?;
        let strategy = strategy_for::<D>(&engine, &device.capabilities())?;

        Ok(Self {
            device,
            engine,
            conv,
            strategy,
            state: LifecycleState::Uninitialized,
            channels: 0,
            contexts: None,
            descriptors: None,
            algorithms: AlgorithmTable::default(),
            workspace: WorkspaceArena::new(),
        })
    }

    /// Create `group * streams_per_group` execution contexts and record the
    /// channel count every later reshape must match.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the layer is uninitialized; shape errors for
    /// unusable inputs; `ContextCreation` if the device runs out of streams or
    /// handles. A failed setup holds no device resources.
    pub fn setup<S: AsRef<[usize]>>(&mut self, inputs: &[S]) -> ConvResult<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(ConvError::InvalidState {
                operation: "setup",
                state: self.state,
            });
        }

        let shape = Self::common_shape(inputs)?;
        self.conv.validate_channels(shape.channels)?;

        let count = self.conv.group * self.engine.streams_per_group;
        let pool = ExecutionContextPool::create(&*self.device, count)?;

        self.contexts = Some(pool);
        self.channels = shape.channels;
        self.algorithms = AlgorithmTable::defaults(inputs.len());
        self.state = LifecycleState::HandlesReady;

        info!(
            target: "cudnn_conv::layer",
            contexts = count,
            group = self.conv.group,
            channels = shape.channels,
            inputs = inputs.len(),
            strategy = self.strategy.name(),
            "Convolution layer set up"
        );
        Ok(())
    }

    /// Rebuild descriptors, algorithm choices and workspace for new input
    /// shapes.
    ///
    /// Selection that finds no usable algorithm and workspace allocation
    /// failure do not fail the reshape; both show up in the report.
    ///
    /// # Errors
    ///
    /// `InvalidState` before setup or after teardown; shape errors;
    /// `DescriptorCreation` and device call failures.
    pub fn reshape<S: AsRef<[usize]>>(&mut self, inputs: &[S]) -> ConvResult<ReshapeReport> {
        if !self.state.holds_resources() {
            return Err(ConvError::InvalidState {
                operation: "reshape",
                state: self.state,
            });
        }

        let shape = Self::common_shape(inputs)?;
        if shape.channels != self.channels {
            return Err(ConvError::ShapeMismatch(format!(
                "input has {} channels, layer was set up with {}",
                shape.channels, self.channels
            )));
        }
        let plan = DescriptorPlan::new(&self.conv, &shape, inputs.len())?;

        let device = &*self.device;
        if let Some(old) = self.descriptors.take() {
            old.release(device);
        }
        let descriptors = self.descriptors.insert(DescriptorSet::build(device, plan)?);

        let contexts = self.contexts.as_ref().ok_or(ConvError::InvalidState {
            operation: "reshape",
            state: self.state,
        })?;
        let handle = contexts.handle(0).ok_or(ConvError::InvalidState {
            operation: "reshape",
            state: self.state,
        })?;

        // the current buffer is freed before any reallocation
        let reusable = self.workspace.size();
        let mut table = self
            .strategy
            .select(device, handle, &descriptors.queries(), reusable)?;
        let requested_workspace_bytes = table.max_workspace();

        let outcome = self.workspace.ensure(device, requested_workspace_bytes, contexts.len());
        if outcome.is_degraded() {
            table.reset_to_defaults();
        }
        let fallbacks = table.fallback_count();
        self.algorithms = table;
        self.state = LifecycleState::Configured;

        let report = ReshapeReport {
            output_shape: plan.output_dims(self.conv.num_output),
            requested_workspace_bytes,
            workspace: outcome,
            workspace_size: self.workspace.size(),
            fallbacks,
        };
        debug!(
            target: "cudnn_conv::layer",
            input = ?shape.dims(),
            output = ?report.output_shape,
            requested_workspace_bytes,
            workspace_size = report.workspace_size,
            fallbacks,
            "Reshaped"
        );
        Ok(report)
    }

    /// Release workspace, descriptors and execution contexts.
    ///
    /// A no-op before a successful setup and after a previous teardown.
    /// Release failures are logged, never returned.
    pub fn teardown(&mut self) {
        if !self.state.holds_resources() {
            return;
        }

        let device = &*self.device;
        self.workspace.release(device);

        let mut failures = 0;
        if let Some(descriptors) = self.descriptors.take() {
            failures += descriptors.release(device);
        }
        if let Some(contexts) = self.contexts.take() {
            failures += contexts.destroy(device);
        }
        self.algorithms = AlgorithmTable::default();
        self.state = LifecycleState::Destroyed;

        if failures > 0 {
            warn!(target: "cudnn_conv::layer", failures, "Convolution layer torn down with release errors");
        } else {
            info!(target: "cudnn_conv::layer", "Convolution layer torn down");
        }
    }

    fn common_shape<S: AsRef<[usize]>>(inputs: &[S]) -> ConvResult<InputShape> {
        let (first, rest) = inputs
            .split_first()
            .ok_or_else(|| ConvError::ShapeMismatch("at least one input is required".to_string()))?;
        let shape = InputShape::from_dims(first.as_ref())?;
        for (index, other) in rest.iter().enumerate() {
            if other.as_ref() != first.as_ref() {
                return Err(ConvError::ShapeMismatch(format!(
                    "input {} has shape {:?}, expected {:?}",
                    index + 1,
                    other.as_ref(),
                    first.as_ref()
                )));
            }
        }
        Ok(shape)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn conv_config(&self) -> &ConvolutionConfig {
        &self.conv
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Number of live execution contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.as_ref().map_or(0, ExecutionContextPool::len)
    }

    pub fn contexts(&self) -> Option<&ExecutionContextPool<D>> {
        self.contexts.as_ref()
    }

    pub fn descriptors(&self) -> Option<&DescriptorSet<D>> {
        self.descriptors.as_ref()
    }

    /// Current choices, one entry per input.
    pub fn algorithms(&self) -> &AlgorithmTable {
        &self.algorithms
    }

    /// Workspace slice for context `index`; `None` when degraded.
    pub fn workspace_region(&self, index: usize) -> Option<WorkspaceRegion> {
        self.workspace.region(index)
    }

    /// Workspace base pointer for context `index`; null when degraded.
    pub fn workspace_ptr(&self, index: usize) -> DevicePtr {
        self.workspace.region_ptr(index)
    }

    pub fn workspace_size(&self) -> usize {
        self.workspace.size()
    }

    pub fn group_geometry(&self) -> Option<GroupGeometry> {
        self.descriptors.as_ref().map(|d| d.plan().geometry)
    }

    /// Per-group bias offset, fixed by the layer parameters.
    pub fn bias_offset(&self) -> usize {
        self.conv.outputs_per_group()
    }

    /// Output shape from the last reshape.
    pub fn output_shape(&self) -> Option<[usize; 4]> {
        self.descriptors
            .as_ref()
            .map(|d| d.plan().output_dims(self.conv.num_output))
    }
}

impl<D: DnnDevice> Drop for CudnnConvLayer<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: DnnDevice> fmt::Debug for CudnnConvLayer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudnnConvLayer")
            .field("device", &self.device.name())
            .field("strategy", &self.strategy.name())
            .field("state", &self.state)
            .field("conv", &self.conv)
            .field("contexts", &self.context_count())
            .field("workspace_size", &self.workspace.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDevice;

    fn layer(device: &Arc<SimDevice>, conv: ConvolutionConfig) -> CudnnConvLayer<SimDevice> {
        CudnnConvLayer::new(Arc::clone(device), EngineConfig::default(), conv).expect("layer")
    }

    #[test]
    fn test_state_transitions() {
        let device = Arc::new(SimDevice::new());
        let mut layer = layer(&device, ConvolutionConfig::new(16, 3).with_pad(1));
        assert_eq!(layer.state(), LifecycleState::Uninitialized);

        layer.setup(&[[2usize, 3, 8, 8]]).unwrap();
        assert_eq!(layer.state(), LifecycleState::HandlesReady);

        layer.reshape(&[[2usize, 3, 8, 8]]).unwrap();
        layer.reshape(&[[4usize, 3, 8, 8]]).unwrap();
        assert_eq!(layer.state(), LifecycleState::Configured);

        layer.teardown();
        assert_eq!(layer.state(), LifecycleState::Destroyed);
        layer.teardown();
        assert_eq!(layer.state(), LifecycleState::Destroyed);
        println!("[PASS] lifecycle follows Uninitialized -> HandlesReady -> Configured -> Destroyed");
    }

    #[test]
    fn test_misuse_is_rejected() {
        let device = Arc::new(SimDevice::new());
        let mut layer = layer(&device, ConvolutionConfig::new(4, 3));

        let err = layer.reshape(&[[1usize, 1, 8, 8]]).unwrap_err();
        assert!(matches!(err, ConvError::InvalidState { operation: "reshape", .. }));

        layer.setup(&[[1usize, 1, 8, 8]]).unwrap();
        let err = layer.setup(&[[1usize, 1, 8, 8]]).unwrap_err();
        assert!(matches!(err, ConvError::InvalidState { operation: "setup", .. }));

        layer.teardown();
        assert!(layer.setup(&[[1usize, 1, 8, 8]]).is_err());
        assert!(layer.reshape(&[[1usize, 1, 8, 8]]).is_err());
    }

    #[test]
    fn test_reshape_validates_inputs() {
        let device = Arc::new(SimDevice::new());
        let mut layer = layer(&device, ConvolutionConfig::new(4, 3));
        layer.setup(&[[1usize, 2, 8, 8]]).unwrap();

        let err = layer.reshape(&[[1usize, 3, 8, 8]]).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch(_)));

        let err = layer.reshape(&[vec![1usize, 2, 8, 8], vec![1usize, 2, 8, 9]]).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch(_)));

        let err = layer.reshape(&[vec![1usize, 2, 8, 8, 8]]).unwrap_err();
        assert!(matches!(err, ConvError::UnsupportedSpatialRank { axes: 3 }));

        let empty: [[usize; 4]; 0] = [];
        assert!(layer.reshape(&empty).is_err());
    }

    #[test]
    fn test_drop_releases_everything() {
        let device = Arc::new(SimDevice::new());
        {
            let mut layer = layer(&device, ConvolutionConfig::new(8, 3).with_group(2));
            layer.setup(&[[2usize, 4, 16, 16]]).unwrap();
            layer.reshape(&[[2usize, 4, 16, 16]]).unwrap();
        }
        let stats = device.stats();
        assert_eq!(stats.live_streams(), 0);
        assert_eq!(stats.live_handles(), 0);
        assert_eq!(stats.live_descriptors(), 0);
        assert_eq!(stats.live_buffers(), 0);
    }
}
