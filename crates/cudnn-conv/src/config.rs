//! Engine and convolution configuration.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use cudnn_conv::EngineConfig;
//!
//! // Load from file
//! let config = EngineConfig::from_file("cudnn_conv.toml")?;
//!
//! // Or defaults with environment overrides
//! let config = EngineConfig::default().with_env_overrides();
//! config.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! streams_per_group = 1
//! workspace_limit_bytes = 8388608
//! max_ranked_candidates = 4
//! selection = "auto"
//! bwd_filter_workspace_factor = 2
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CUDNN_CONV_STREAMS_PER_GROUP` | `streams_per_group` |
//! | `CUDNN_CONV_WORKSPACE_LIMIT_BYTES` | `workspace_limit_bytes` |
//! | `CUDNN_CONV_MAX_RANKED_CANDIDATES` | `max_ranked_candidates` |
//! | `CUDNN_CONV_SELECTION` | `selection` |
//! | `CUDNN_CONV_BWD_FILTER_WORKSPACE_FACTOR` | `bwd_filter_workspace_factor` |

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConvError, ConvResult};
use crate::shape::{ConvParams, GroupGeometry, InputShape};

/// Streams (and handles) created per group.
///
/// Three would let the backward pass compute bias, filter and data gradients
/// on separate streams; one is what the compute path currently consumes.
pub const DEFAULT_STREAMS_PER_GROUP: usize = 1;

/// Ceiling handed to budget-limited algorithm queries (8 MiB).
pub const DEFAULT_WORKSPACE_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Candidates requested from ranked algorithm queries.
pub const DEFAULT_MAX_RANKED_CANDIDATES: usize = 4;

/// Backward-filter workspace as a multiple of forward when it cannot be queried.
pub const DEFAULT_BWD_FILTER_WORKSPACE_FACTOR: usize = 2;

// ============================================================================
// SELECTION POLICY
// ============================================================================

/// Which algorithm selection strategy the layer uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Pick from device capabilities: budget-limited queries while the
    /// library offers them, ranked otherwise.
    #[default]
    Auto,
    /// Budget-limited single-answer queries.
    WorkspaceLimit,
    /// Ranked candidate lists filtered against free memory.
    Ranked,
}

impl SelectionPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "auto" => Some(Self::Auto),
            "workspace_limit" | "limit" => Some(Self::WorkspaceLimit),
            "ranked" => Some(Self::Ranked),
            _ => None,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Engine-wide knobs shared by every layer built with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution contexts created per group.
    #[serde(default = "default_streams_per_group")]
    pub streams_per_group: usize,

    /// Byte ceiling for the workspace-limit strategy.
    #[serde(default = "default_workspace_limit_bytes")]
    pub workspace_limit_bytes: usize,

    /// Number of ranked candidates requested per operation.
    #[serde(default = "default_max_ranked_candidates")]
    pub max_ranked_candidates: usize,

    /// Strategy override.
    #[serde(default)]
    pub selection: SelectionPolicy,

    /// Multiplier applied to the forward workspace for the fixed
    /// backward-filter fallback.
    #[serde(default = "default_bwd_filter_workspace_factor")]
    pub bwd_filter_workspace_factor: usize,
}

fn default_streams_per_group() -> usize {
    DEFAULT_STREAMS_PER_GROUP
}

fn default_workspace_limit_bytes() -> usize {
    DEFAULT_WORKSPACE_LIMIT_BYTES
}

fn default_max_ranked_candidates() -> usize {
    DEFAULT_MAX_RANKED_CANDIDATES
}

fn default_bwd_filter_workspace_factor() -> usize {
    DEFAULT_BWD_FILTER_WORKSPACE_FACTOR
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            streams_per_group: default_streams_per_group(),
            workspace_limit_bytes: default_workspace_limit_bytes(),
            max_ranked_candidates: default_max_ranked_candidates(),
            selection: SelectionPolicy::default(),
            bwd_filter_workspace_factor: default_bwd_filter_workspace_factor(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// `ConvError::InvalidConfig` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> ConvResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConvError::InvalidConfig(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_toml_str(&contents).map_err(|e| match e {
            ConvError::InvalidConfig(msg) => {
                ConvError::InvalidConfig(format!("{} (in '{}')", msg, path.display()))
            }
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> ConvResult<Self> {
        toml::from_str(contents)
            .map_err(|e| ConvError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    /// Apply `CUDNN_CONV_*` environment overrides.
    ///
    /// Unparseable values are ignored; call [`validate`](Self::validate)
    /// afterwards to reject out-of-range ones.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("CUDNN_CONV_STREAMS_PER_GROUP") {
            if let Ok(n) = val.parse::<usize>() {
                self.streams_per_group = n;
            }
        }
        if let Ok(val) = env::var("CUDNN_CONV_WORKSPACE_LIMIT_BYTES") {
            if let Ok(n) = val.parse::<usize>() {
                self.workspace_limit_bytes = n;
            }
        }
        if let Ok(val) = env::var("CUDNN_CONV_MAX_RANKED_CANDIDATES") {
            if let Ok(n) = val.parse::<usize>() {
                self.max_ranked_candidates = n;
            }
        }
        if let Ok(val) = env::var("CUDNN_CONV_SELECTION") {
            if let Some(policy) = SelectionPolicy::parse(&val) {
                self.selection = policy;
            }
        }
        if let Ok(val) = env::var("CUDNN_CONV_BWD_FILTER_WORKSPACE_FACTOR") {
            if let Ok(n) = val.parse::<usize>() {
                self.bwd_filter_workspace_factor = n;
            }
        }
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// `ConvError::InvalidConfig` if any count or factor is zero.
    pub fn validate(&self) -> ConvResult<()> {
        if self.streams_per_group == 0 {
            return Err(ConvError::InvalidConfig(
                "streams_per_group must be at least 1".to_string(),
            ));
        }
        if self.max_ranked_candidates == 0 {
            return Err(ConvError::InvalidConfig(
                "max_ranked_candidates must be at least 1".to_string(),
            ));
        }
        if self.bwd_filter_workspace_factor == 0 {
            return Err(ConvError::InvalidConfig(
                "bwd_filter_workspace_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CONVOLUTION CONFIG
// ============================================================================

/// Parameters of one convolution layer.
///
/// # Example
///
/// ```
/// use cudnn_conv::ConvolutionConfig;
///
/// let conv = ConvolutionConfig::new(16, 3).with_pad(1).with_group(2);
/// assert!(conv.validate().is_ok());
/// assert_eq!(conv.output_hw(32, 32), Some((32, 32)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolutionConfig {
    /// Output channel count (`M`).
    pub num_output: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    #[serde(default)]
    pub pad_h: usize,
    #[serde(default)]
    pub pad_w: usize,
    #[serde(default = "one")]
    pub stride_h: usize,
    #[serde(default = "one")]
    pub stride_w: usize,
    #[serde(default = "one")]
    pub dilation_h: usize,
    #[serde(default = "one")]
    pub dilation_w: usize,
    #[serde(default = "one")]
    pub group: usize,
    #[serde(default = "yes")]
    pub bias_term: bool,
}

fn one() -> usize {
    1
}

fn yes() -> bool {
    true
}

impl ConvolutionConfig {
    /// Square kernel, unit stride, no padding, one group, with bias.
    pub fn new(num_output: usize, kernel: usize) -> Self {
        Self {
            num_output,
            kernel_h: kernel,
            kernel_w: kernel,
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            group: 1,
            bias_term: true,
        }
    }

    pub fn with_kernel(mut self, kernel_h: usize, kernel_w: usize) -> Self {
        self.kernel_h = kernel_h;
        self.kernel_w = kernel_w;
        self
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad_h = pad;
        self.pad_w = pad;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride_h = stride;
        self.stride_w = stride;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation_h = dilation;
        self.dilation_w = dilation;
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_bias(mut self, bias_term: bool) -> Self {
        self.bias_term = bias_term;
        self
    }

    /// Validate layer parameters independent of any input shape.
    pub fn validate(&self) -> ConvResult<()> {
        let nonzero = [
            ("num_output", self.num_output),
            ("kernel_h", self.kernel_h),
            ("kernel_w", self.kernel_w),
            ("stride_h", self.stride_h),
            ("stride_w", self.stride_w),
            ("dilation_h", self.dilation_h),
            ("dilation_w", self.dilation_w),
            ("group", self.group),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConvError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.num_output % self.group != 0 {
            return Err(ConvError::GroupDivisibility {
                what: "num_output",
                count: self.num_output,
                group: self.group,
            });
        }
        Ok(())
    }

    /// Validate against an input channel count.
    pub fn validate_channels(&self, channels: usize) -> ConvResult<()> {
        if channels == 0 || channels % self.group != 0 {
            return Err(ConvError::GroupDivisibility {
                what: "input channels",
                count: channels,
                group: self.group,
            });
        }
        Ok(())
    }

    /// Output spatial size for an `height x width` input.
    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let h = crate::shape::output_dim(
            height,
            self.kernel_h,
            self.pad_h,
            self.stride_h,
            self.dilation_h,
        )?;
        let w = crate::shape::output_dim(
            width,
            self.kernel_w,
            self.pad_w,
            self.stride_w,
            self.dilation_w,
        )?;
        Some((h, w))
    }

    /// Output channels per group.
    #[inline]
    pub fn outputs_per_group(&self) -> usize {
        self.num_output / self.group
    }

    pub fn conv_params(&self) -> ConvParams {
        ConvParams {
            pad_h: self.pad_h,
            pad_w: self.pad_w,
            stride_h: self.stride_h,
            stride_w: self.stride_w,
            dilation_h: self.dilation_h,
            dilation_w: self.dilation_w,
        }
    }

    /// Per-group offsets for an input of `shape` producing `out_h x out_w`.
    pub fn group_geometry(&self, shape: &InputShape, out_h: usize, out_w: usize) -> GroupGeometry {
        let in_per_group = shape.channels / self.group;
        let out_per_group = self.outputs_per_group();
        GroupGeometry {
            bottom_offset: in_per_group * shape.height * shape.width,
            top_offset: out_per_group * out_h * out_w,
            weight_offset: out_per_group * in_per_group * self.kernel_h * self.kernel_w,
            bias_offset: out_per_group,
        }
    }
}
