//! Budget-limited selection for libraries before cuDNN 8.

use tracing::trace;

use super::{AlgorithmChoice, AlgorithmTable, ConvOp, InputAlgorithms, SelectionStrategy};
use crate::device::{ConvQuery, DnnDevice};
use crate::error::ConvResult;

/// Asks the library for the fastest algorithm that fits under a fixed
/// byte ceiling, then queries that algorithm's exact workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLimitStrategy {
    limit_bytes: usize,
}

impl WorkspaceLimitStrategy {
    pub fn new(limit_bytes: usize) -> Self {
        Self { limit_bytes }
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }
}

impl<D: DnnDevice> SelectionStrategy<D> for WorkspaceLimitStrategy {
    fn name(&self) -> &'static str {
        "workspace-limit"
    }

    fn select(
        &self,
        device: &D,
        handle: &D::Handle,
        queries: &[ConvQuery<'_, D>],
        _reusable_bytes: usize,
    ) -> ConvResult<AlgorithmTable> {
        let mut inputs = Vec::with_capacity(queries.len());

        for (index, query) in queries.iter().enumerate() {
            let mut entry = InputAlgorithms::default();
            for op in ConvOp::ALL {
                let algorithm =
                    device.algorithm_within_limit(handle, op, *query, self.limit_bytes)?;
                let workspace_bytes = device.workspace_size(handle, *query, algorithm)?;
                trace!(
                    target: "cudnn_conv::algo",
                    input = index,
                    op = %op,
                    ?algorithm,
                    workspace_bytes,
                    "Selected algorithm under workspace limit"
                );
                *entry.get_mut(op) = AlgorithmChoice::selected(algorithm, workspace_bytes);
            }
            inputs.push(entry);
        }

        Ok(AlgorithmTable::from_inputs(inputs))
    }
}
