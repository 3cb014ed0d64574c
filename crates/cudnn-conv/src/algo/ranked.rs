//! Ranked-candidate selection for cuDNN 7+ (`*_v7` queries).
//!
//! Free device memory is read once per call to `select` and, together with
//! the workspace the layer already owns, used as the budget for every input. It is a point-in-time value: another user of the
//! device can allocate between this query and the workspace allocation, in
//! which case the allocator's degraded path takes over.

use tracing::{debug, error};

use super::{
    AlgoPerf, AlgoStatus, Algorithm, AlgorithmChoice, AlgorithmTable, BwdFilterAlgo, ConvOp,
    InputAlgorithms, SelectionStrategy,
};
use crate::device::{ConvQuery, DnnDevice};
use crate::error::{ConvError, ConvResult};

/// Walks a short ranked list and takes the first candidate that succeeded,
/// is not a known-unstable Winograd variant, and needs strictly less
/// workspace than the device has free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedCandidateStrategy {
    max_candidates: usize,
    bwd_filter_factor: usize,
    ranked_backward_filter: bool,
}

impl RankedCandidateStrategy {
    /// `ranked_backward_filter = false` selects the fixed backward-filter
    /// fallback sized at `bwd_filter_factor` times the forward workspace.
    pub fn new(max_candidates: usize, bwd_filter_factor: usize, ranked_backward_filter: bool) -> Self {
        Self {
            max_candidates,
            bwd_filter_factor,
            ranked_backward_filter,
        }
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates
    }

    /// First acceptable candidate in rank order.
    pub fn pick(candidates: &[AlgoPerf], free_memory: usize) -> Option<AlgorithmChoice> {
        candidates
            .iter()
            .find(|perf| {
                perf.status == AlgoStatus::Success
                    && !perf.algorithm.is_known_unstable()
                    && perf.memory < free_memory
            })
            .map(|perf| AlgorithmChoice::selected(perf.algorithm, perf.memory))
    }

    fn choose<D: DnnDevice>(
        &self,
        device: &D,
        handle: &D::Handle,
        op: ConvOp,
        query: ConvQuery<'_, D>,
        input: usize,
        free_memory: usize,
    ) -> ConvResult<AlgorithmChoice> {
        let candidates = device.ranked_algorithms(handle, op, query, self.max_candidates)?;
        match Self::pick(&candidates, free_memory) {
            Some(choice) => Ok(choice),
            None => {
                let err = ConvError::NoSuitableAlgorithm { op, input };
                error!(
                    target: "cudnn_conv::algo",
                    error = %err,
                    candidates = candidates.len(),
                    free_memory,
                    "cuDNN did not return a suitable algorithm; using the zero-workspace default"
                );
                Ok(AlgorithmChoice::default_for(op))
            }
        }
    }
}

impl<D: DnnDevice> SelectionStrategy<D> for RankedCandidateStrategy {
    fn name(&self) -> &'static str {
        "ranked"
    }

    fn select(
        &self,
        device: &D,
        handle: &D::Handle,
        queries: &[ConvQuery<'_, D>],
        reusable_bytes: usize,
    ) -> ConvResult<AlgorithmTable> {
        let free_memory = device.memory_info()?.free.saturating_add(reusable_bytes);
        let mut inputs = Vec::with_capacity(queries.len());

        for (index, query) in queries.iter().enumerate() {
            let mut entry = InputAlgorithms {
                forward: self.choose(device, handle, ConvOp::Forward, *query, index, free_memory)?,
                ..InputAlgorithms::default()
            };

            entry.backward_filter = if self.ranked_backward_filter {
                self.choose(device, handle, ConvOp::BackwardFilter, *query, index, free_memory)?
            } else if entry.forward.found {
                // No ranked query for backward-filter on this library: fixed
                // algorithm, workspace sized from forward.
                AlgorithmChoice::selected(
                    Algorithm::BackwardFilter(BwdFilterAlgo::Algo1),
                    entry.forward.workspace_bytes.saturating_mul(self.bwd_filter_factor),
                )
            } else {
                AlgorithmChoice::default_for(ConvOp::BackwardFilter)
            };

            entry.backward_data =
                self.choose(device, handle, ConvOp::BackwardData, *query, index, free_memory)?;

            debug!(
                target: "cudnn_conv::algo",
                input = index,
                forward = ?entry.forward.algorithm,
                backward_filter = ?entry.backward_filter.algorithm,
                backward_data = ?entry.backward_data.algorithm,
                free_memory,
                "Selected ranked algorithms"
            );
            inputs.push(entry);
        }

        Ok(AlgorithmTable::from_inputs(inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{BwdDataAlgo, FwdAlgo};

    #[test]
    fn test_pick_skips_failed_unstable_and_oversized() {
        let candidates = [
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::WinogradNonfused), 10),
            AlgoPerf::failed(Algorithm::Forward(FwdAlgo::Direct), 9),
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::Fft), 5_000),
            AlgoPerf::success(Algorithm::Forward(FwdAlgo::Gemm), 400),
        ];
        let choice = RankedCandidateStrategy::pick(&candidates, 1_000).expect("gemm fits");
        assert_eq!(choice.algorithm, Algorithm::Forward(FwdAlgo::Gemm));
        assert_eq!(choice.workspace_bytes, 400);
        assert!(choice.found);
    }

    #[test]
    fn test_pick_requires_strictly_less_than_free() {
        let candidates = [AlgoPerf::success(Algorithm::Forward(FwdAlgo::Gemm), 1_000)];
        assert!(RankedCandidateStrategy::pick(&candidates, 1_000).is_none());
        assert!(RankedCandidateStrategy::pick(&candidates, 1_001).is_some());
    }

    #[test]
    fn test_pick_rejects_backward_data_winograd_family() {
        let candidates = [
            AlgoPerf::success(Algorithm::BackwardData(BwdDataAlgo::Winograd), 0),
            AlgoPerf::success(Algorithm::BackwardData(BwdDataAlgo::WinogradNonfused), 0),
        ];
        assert!(RankedCandidateStrategy::pick(&candidates, usize::MAX).is_none());
        assert!(RankedCandidateStrategy::pick(&[], usize::MAX).is_none());
    }
}
