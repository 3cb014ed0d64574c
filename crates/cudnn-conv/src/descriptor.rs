//! Descriptor management.
//!
//! A [`DescriptorPlan`] is the pure shape computation for one reshape; a
//! [`DescriptorSet`] is the device objects created from it. Sets are never
//! mutated: each reshape releases the previous set and builds a new one.

use std::fmt;

use tracing::warn;

use crate::config::ConvolutionConfig;
use crate::device::{ConvQuery, DnnDevice};
use crate::error::{ConvError, ConvResult};
use crate::shape::{ConvParams, FilterShape, GroupGeometry, InputShape, TensorShape};

/// Group-partitioned descriptor shapes for one reshape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPlan {
    pub num_inputs: usize,
    /// `(N, C/g, H, W)` with full-tensor strides.
    pub input: TensorShape,
    /// `(N, M/g, Ho, Wo)` with full-tensor strides.
    pub output: TensorShape,
    /// `(M/g, C/g, kh, kw)`
    pub filter: FilterShape,
    /// `(1, M/g, 1, 1)` when the layer has a bias.
    pub bias: Option<TensorShape>,
    pub conv: ConvParams,
    pub geometry: GroupGeometry,
}

impl DescriptorPlan {
    /// Compute descriptor shapes for `num_inputs` inputs of `shape`.
    ///
    /// # Errors
    ///
    /// Group divisibility violations and kernels that do not fit the
    /// padded input.
    pub fn new(conv: &ConvolutionConfig, shape: &InputShape, num_inputs: usize) -> ConvResult<Self> {
        conv.validate()?;
        conv.validate_channels(shape.channels)?;

        let (out_h, out_w) = conv.output_hw(shape.height, shape.width).ok_or_else(|| {
            ConvError::ShapeMismatch(format!(
                "kernel {}x{} (dilation {}x{}) does not fit input {}x{} with pad {}x{}",
                conv.kernel_h,
                conv.kernel_w,
                conv.dilation_h,
                conv.dilation_w,
                shape.height,
                shape.width,
                conv.pad_h,
                conv.pad_w
            ))
        })?;

        let group = conv.group;
        let in_per_group = shape.channels / group;
        let out_per_group = conv.outputs_per_group();
        let (h, w) = (shape.height, shape.width);
        let out_spatial = out_h * out_w;

        Ok(Self {
            num_inputs,
            input: TensorShape::strided(
                shape.batch,
                in_per_group,
                h,
                w,
                shape.channels * h * w,
                h * w,
                w,
                1,
            ),
            output: TensorShape::strided(
                shape.batch,
                out_per_group,
                out_h,
                out_w,
                conv.num_output * out_spatial,
                out_spatial,
                out_w,
                1,
            ),
            filter: FilterShape {
                out_channels: out_per_group,
                in_channels: in_per_group,
                kernel_h: conv.kernel_h,
                kernel_w: conv.kernel_w,
            },
            bias: conv
                .bias_term
                .then(|| TensorShape::packed(1, out_per_group, 1, 1)),
            conv: conv.conv_params(),
            geometry: conv.group_geometry(shape, out_h, out_w),
        })
    }

    /// Full (all-group) output shape `[N, M, Ho, Wo]`.
    pub fn output_dims(&self, num_output: usize) -> [usize; 4] {
        [self.output.n, num_output, self.output.h, self.output.w]
    }
}

/// Device descriptors for one reshape.
pub struct DescriptorSet<D: DnnDevice> {
    plan: DescriptorPlan,
    filter: D::FilterDesc,
    inputs: Vec<D::TensorDesc>,
    outputs: Vec<D::TensorDesc>,
    convs: Vec<D::ConvDesc>,
    bias: Option<D::TensorDesc>,
}

fn creation_failed(what: &'static str) -> impl Fn(ConvError) -> ConvError {
    move |e| ConvError::DescriptorCreation(format!("{} descriptor: {}", what, e))
}

impl<D: DnnDevice> DescriptorSet<D> {
    /// Create every descriptor in `plan`. Anything created before a failure
    /// is released before the error is returned.
    pub fn build(device: &D, plan: DescriptorPlan) -> ConvResult<Self> {
        let filter = device
            .create_filter_desc(&plan.filter)
            .map_err(creation_failed("filter"))?;

        let mut set = Self {
            plan,
            filter,
            inputs: Vec::with_capacity(plan.num_inputs),
            outputs: Vec::with_capacity(plan.num_inputs),
            convs: Vec::with_capacity(plan.num_inputs),
            bias: None,
        };

        if let Err(e) = set.populate(device) {
            set.release(device);
            return Err(e);
        }
        Ok(set)
    }

    fn populate(&mut self, device: &D) -> ConvResult<()> {
        for _ in 0..self.plan.num_inputs {
            self.inputs.push(
                device
                    .create_tensor_desc(&self.plan.input)
                    .map_err(creation_failed("input"))?,
            );
            self.outputs.push(
                device
                    .create_tensor_desc(&self.plan.output)
                    .map_err(creation_failed("output"))?,
            );
            self.convs.push(
                device
                    .create_conv_desc(&self.plan.conv)
                    .map_err(creation_failed("convolution"))?,
            );
        }
        if let Some(bias) = &self.plan.bias {
            self.bias = Some(
                device
                    .create_tensor_desc(bias)
                    .map_err(creation_failed("bias"))?,
            );
        }
        Ok(())
    }

    /// Release every descriptor. Returns the number of failed releases,
    /// which are logged and otherwise ignored.
    pub fn release(self, device: &D) -> usize {
        let mut failures = 0;
        let mut note = |what: &str, result: ConvResult<()>| {
            if let Err(e) = result {
                failures += 1;
                warn!(target: "cudnn_conv::descriptor", error = %e, "Failed to destroy {} descriptor", what);
            }
        };

        for desc in self.inputs {
            note("input", device.destroy_tensor_desc(desc));
        }
        for desc in self.outputs {
            note("output", device.destroy_tensor_desc(desc));
        }
        for desc in self.convs {
            note("convolution", device.destroy_conv_desc(desc));
        }
        if let Some(desc) = self.bias {
            note("bias", device.destroy_tensor_desc(desc));
        }
        note("filter", device.destroy_filter_desc(self.filter));
        failures
    }

    /// One query per input, in input order.
    pub fn queries(&self) -> Vec<ConvQuery<'_, D>> {
        (0..self.inputs.len())
            .map(|i| ConvQuery {
                input: &self.inputs[i],
                output: &self.outputs[i],
                filter: &self.filter,
                conv: &self.convs[i],
            })
            .collect()
    }

    pub fn plan(&self) -> &DescriptorPlan {
        &self.plan
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn input(&self, index: usize) -> Option<&D::TensorDesc> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&D::TensorDesc> {
        self.outputs.get(index)
    }

    pub fn conv(&self, index: usize) -> Option<&D::ConvDesc> {
        self.convs.get(index)
    }

    pub fn filter(&self) -> &D::FilterDesc {
        &self.filter
    }

    pub fn bias(&self) -> Option<&D::TensorDesc> {
        self.bias.as_ref()
    }
}

impl<D: DnnDevice> fmt::Debug for DescriptorSet<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("plan", &self.plan)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("convs", &self.convs)
            .field("filter", &self.filter)
            .field("bias", &self.bias)
            .finish()
    }
}
