//! Shapes and geometry shared by descriptors and the layer.
//!
//! Tensors are NCHW. Group-partitioned descriptors keep the strides of the
//! full tensor so that group `g` is addressed by adding `g * offset` to the
//! base pointer (see [`GroupGeometry`]).

use crate::error::{ConvError, ConvResult};

/// Number of spatial axes supported by the cuDNN 2-D path.
pub const SPATIAL_AXES: usize = 2;

/// Logical shape of one 4-D input blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputShape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    pub fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// Interpret `dims` as `[N, C, spatial...]`.
    ///
    /// # Errors
    ///
    /// `ConvError::UnsupportedSpatialRank` unless there are exactly two
    /// spatial axes. Higher-rank convolution is not handled here.
    pub fn from_dims(dims: &[usize]) -> ConvResult<Self> {
        let axes = dims.len().saturating_sub(2);
        if axes != SPATIAL_AXES {
            return Err(ConvError::UnsupportedSpatialRank { axes });
        }
        Ok(Self::new(dims[0], dims[1], dims[2], dims[3]))
    }

    /// Elements in one image (`C * H * W`).
    #[inline]
    pub fn image_dim(&self) -> usize {
        self.channels * self.height * self.width
    }

    #[inline]
    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }
}

/// A 4-D tensor descriptor payload: extents plus element strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub n_stride: usize,
    pub c_stride: usize,
    pub h_stride: usize,
    pub w_stride: usize,
}

impl TensorShape {
    /// Fully packed NCHW layout.
    pub fn packed(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self::strided(n, c, h, w, c * h * w, h * w, w, 1)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn strided(
        n: usize,
        c: usize,
        h: usize,
        w: usize,
        n_stride: usize,
        c_stride: usize,
        h_stride: usize,
        w_stride: usize,
    ) -> Self {
        Self {
            n,
            c,
            h,
            w,
            n_stride,
            c_stride,
            h_stride,
            w_stride,
        }
    }

    /// Number of logical elements described.
    #[inline]
    pub fn count(&self) -> usize {
        self.n * self.c * self.h * self.w
    }
}

/// Filter extents: `(K, C, kh, kw)` per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterShape {
    pub out_channels: usize,
    pub in_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
}

impl FilterShape {
    #[inline]
    pub fn count(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_h * self.kernel_w
    }
}

/// Convolution descriptor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvParams {
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
}

/// Per-group element offsets into the full input, output, weight and bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupGeometry {
    pub bottom_offset: usize,
    pub top_offset: usize,
    pub weight_offset: usize,
    pub bias_offset: usize,
}

/// Output extent along one spatial axis.
///
/// Returns `None` when the dilated kernel does not fit in the padded input,
/// or when either extent overflows `usize`.
pub fn output_dim(
    input: usize,
    kernel: usize,
    pad: usize,
    stride: usize,
    dilation: usize,
) -> Option<usize> {
    let extent = dilation.checked_mul(kernel.checked_sub(1)?)?.checked_add(1)?;
    let padded = pad.checked_mul(2)?.checked_add(input)?;
    if stride == 0 || padded < extent {
        return None;
    }
    Some((padded - extent) / stride + 1)
}
