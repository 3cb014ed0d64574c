//! Algorithm selection.
//!
//! Two strategies implement [`SelectionStrategy`], matching the two query
//! styles cuDNN has offered:
//!
//! | Strategy | Query | Budget | Failure |
//! |----------|-------|--------|---------|
//! | [`WorkspaceLimitStrategy`] | one answer per op under a byte ceiling | configured limit | device error is fatal |
//! | [`RankedCandidateStrategy`] | ranked list, first acceptable wins | free device memory | logged, default algorithm kept |
//!
//! The strategy is chosen once per layer by [`strategy_for`], from the
//! configured [`SelectionPolicy`] and the device's capabilities.

mod limit;
mod ranked;
mod types;

use std::fmt;

use tracing::debug;

pub use limit::WorkspaceLimitStrategy;
pub use ranked::RankedCandidateStrategy;
pub use types::{
    AlgoPerf, AlgoStatus, Algorithm, AlgorithmChoice, AlgorithmTable, BwdDataAlgo, BwdFilterAlgo,
    ConvOp, FwdAlgo, InputAlgorithms,
};

use crate::config::{EngineConfig, SelectionPolicy};
use crate::device::{ConvQuery, DeviceCapabilities, DnnDevice};
use crate::error::{ConvError, ConvResult};

/// Chooses forward, backward-filter and backward-data algorithms for every input.
pub trait SelectionStrategy<D: DnnDevice>: fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Build a fresh table with one entry per query, in query order.
    ///
    /// `reusable_bytes` is device memory the caller already holds for
    /// workspace and frees before any reallocation; it counts as available.
    ///
    /// # Errors
    ///
    /// Device call failures. An operation without a usable candidate is not
    /// an error: its entry keeps the default algorithm.
    fn select(
        &self,
        device: &D,
        handle: &D::Handle,
        queries: &[ConvQuery<'_, D>],
        reusable_bytes: usize,
    ) -> ConvResult<AlgorithmTable>;
}

/// Resolve the strategy a layer will use for its whole life.
///
/// # Errors
///
/// `ConvError::Unsupported` when the configured policy needs a query the
/// device does not offer.
pub fn strategy_for<D: DnnDevice>(
    config: &EngineConfig,
    capabilities: &DeviceCapabilities,
) -> ConvResult<Box<dyn SelectionStrategy<D>>> {
    let policy = match config.selection {
        SelectionPolicy::Auto => capabilities.preferred_policy(),
        explicit => explicit,
    };

    let strategy: Box<dyn SelectionStrategy<D>> = match policy {
        SelectionPolicy::Ranked => {
            if !capabilities.ranked_queries {
                return Err(ConvError::Unsupported(format!(
                    "ranked algorithm queries need cuDNN 7 or newer, found {}",
                    capabilities.library_version
                )));
            }
            Box::new(RankedCandidateStrategy::new(
                config.max_ranked_candidates,
                config.bwd_filter_workspace_factor,
                capabilities.ranked_backward_filter,
            ))
        }
        SelectionPolicy::WorkspaceLimit | SelectionPolicy::Auto => {
            if !capabilities.workspace_limit_queries {
                return Err(ConvError::Unsupported(format!(
                    "budget-limited algorithm queries were removed in cuDNN 8, found {}",
                    capabilities.library_version
                )));
            }
            Box::new(WorkspaceLimitStrategy::new(config.workspace_limit_bytes))
        }
    };

    debug!(
        target: "cudnn_conv::algo",
        strategy = strategy.name(),
        library_version = capabilities.library_version,
        "Algorithm selection strategy resolved"
    );
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDevice;

    #[test]
    fn test_auto_follows_capabilities() {
        let config = EngineConfig::default();

        let ranked = strategy_for::<SimDevice>(&config, &SimDevice::new().capabilities())
            .expect("ranked tier");
        assert_eq!(ranked.name(), "ranked");

        let limit = strategy_for::<SimDevice>(&config, &SimDevice::legacy().capabilities())
            .expect("legacy tier");
        assert_eq!(limit.name(), "workspace-limit");
    }

    #[test]
    fn test_explicit_policy_must_be_supported() {
        let config = EngineConfig {
            selection: SelectionPolicy::Ranked,
            ..Default::default()
        };
        let err = strategy_for::<SimDevice>(&config, &SimDevice::legacy().capabilities())
            .unwrap_err();
        assert!(matches!(err, ConvError::Unsupported(_)));

        let config = EngineConfig {
            selection: SelectionPolicy::WorkspaceLimit,
            ..Default::default()
        };
        let err = strategy_for::<SimDevice>(&config, &DeviceCapabilities::for_version(8_000))
            .unwrap_err();
        assert!(matches!(err, ConvError::Unsupported(_)));

        // cuDNN 7 offers both
        let caps = DeviceCapabilities::for_version(7_600);
        assert_eq!(
            strategy_for::<SimDevice>(&config, &caps).unwrap().name(),
            "workspace-limit"
        );
    }
}
