//! Error taxonomy for convolution setup.
//!
//! # Error Categories
//!
//! | Category | Variants | Policy |
//! |----------|----------|--------|
//! | Configuration | InvalidConfig, UnsupportedSpatialRank, GroupDivisibility, ShapeMismatch | Fatal, surfaced from reshape/setup |
//! | Resource creation | ContextCreation, DescriptorCreation, NoDevice | Fatal, no retry |
//! | Device call | DeviceCall, Unsupported | Fatal |
//! | Selection | NoSuitableAlgorithm | Recoverable, logged, default algorithm kept |
//! | Workspace | WorkspaceAllocation | Recoverable, zero-workspace mode |
//! | Lifecycle | InvalidState | Fatal, caller misuse |

use thiserror::Error;

use crate::algo::ConvOp;
use crate::layer::LifecycleState;

/// Errors produced while configuring a convolution layer.
#[derive(Debug, Error)]
pub enum ConvError {
    /// Engine or convolution parameters failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Only two spatial axes (height, width) are supported.
    #[error("Convolution input must have 2 spatial axes (height and width), got {axes}")]
    UnsupportedSpatialRank { axes: usize },

    /// A channel count is not divisible by the group count.
    #[error("{what} ({count}) must be divisible by group ({group})")]
    GroupDivisibility {
        what: &'static str,
        count: usize,
        group: usize,
    },

    /// Inputs disagree with each other or with the shape seen at setup.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Stream or handle creation failed while building the context pool.
    #[error("Failed to create execution context {index}: {message}")]
    ContextCreation { index: usize, message: String },

    /// Tensor, filter or convolution descriptor creation failed.
    #[error("Descriptor creation failed: {0}")]
    DescriptorCreation(String),

    /// A device API call returned a non-success status.
    #[error("{call} failed with status {status}")]
    DeviceCall { call: &'static str, status: i32 },

    /// Device memory allocation failed.
    #[error("Workspace allocation of {requested} bytes failed: {message}")]
    WorkspaceAllocation { requested: usize, message: String },

    /// Ranked candidate search produced nothing usable.
    #[error("No suitable {op} algorithm for input {input}")]
    NoSuitableAlgorithm { op: ConvOp, input: usize },

    /// The device or driver does not offer the requested query.
    #[error("Unsupported by device: {0}")]
    Unsupported(String),

    /// No CUDA device is available.
    #[error("No CUDA device available")]
    NoDevice,

    /// Lifecycle entry point called in the wrong state.
    #[error("Cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },
}

impl ConvError {
    /// Whether the layer absorbs this error and continues in degraded mode.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConvError::NoSuitableAlgorithm { .. } | ConvError::WorkspaceAllocation { .. }
        )
    }

    /// Whether this error is a configuration problem rather than a device failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ConvError::InvalidConfig(_)
                | ConvError::UnsupportedSpatialRank { .. }
                | ConvError::GroupDivisibility { .. }
                | ConvError::ShapeMismatch(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type ConvResult<T> = Result<T, ConvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let err = ConvError::NoSuitableAlgorithm {
            op: ConvOp::Forward,
            input: 0,
        };
        assert!(err.is_recoverable());
        assert!(!err.is_configuration());

        let err = ConvError::WorkspaceAllocation {
            requested: 1024,
            message: "out of memory".to_string(),
        };
        assert!(err.is_recoverable());

        let err = ConvError::UnsupportedSpatialRank { axes: 3 };
        assert!(!err.is_recoverable());
        assert!(err.is_configuration());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = ConvError::GroupDivisibility {
            what: "num_output",
            count: 15,
            group: 2,
        };
        assert_eq!(err.to_string(), "num_output (15) must be divisible by group (2)");

        let err = ConvError::DeviceCall {
            call: "cudnnCreate",
            status: 4,
        };
        assert_eq!(err.to_string(), "cudnnCreate failed with status 4");
    }
}
