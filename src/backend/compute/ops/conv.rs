//! Convolution and fully-connected kernels.
//!
//! Feature maps are addressed through [`FeatureAccess`]: the N/H/W/C dims of
//! the logical shape and the physical stride of each, which is where the
//! tensor's backend layout comes in.

use crate::backend::compute::ops::TensorRef;
use crate::backend::tensor::BackendTensor;
use crate::error::{ForgeError, ForgeResult};
use crate::exec::Function;
use crate::ir::{
    calculate_padding, feature_axes, Dilation, ExplicitPadding, FeatureShape, Padding, Shape,
    Stride,
};

/// Dims and physical strides of a rank-4 feature map
#[derive(Debug, Clone, Copy)]
pub struct FeatureAccess {
    pub shape: FeatureShape,
    /// Strides of N, H, W, C
    pub strides: [usize; 4],
}

impl FeatureAccess {
    pub fn of(tensor: &BackendTensor) -> ForgeResult<Self> {
        let dims = tensor.logical_dims()?;
        let shape = Shape::new(dims.clone()).as_feature(tensor.frontend_layout())?;
        let logical = tensor.axis_map()?.logical_strides(&dims);
        let axes = feature_axes(tensor.frontend_layout());
        Ok(Self {
            shape,
            strides: [
                logical[axes[0]],
                logical[axes[1]],
                logical[axes[2]],
                logical[axes[3]],
            ],
        })
    }

    pub fn offset(&self, n: usize, h: usize, w: usize, c: usize) -> usize {
        n * self.strides[0] + h * self.strides[1] + w * self.strides[2] + c * self.strides[3]
    }
}

/// Physical strides of a filter authored as `[O, KH, KW, I]`
#[derive(Debug, Clone, Copy)]
struct FilterAccess {
    dims: [usize; 4],
    strides: [usize; 4],
}

impl FilterAccess {
    fn of(tensor: &BackendTensor) -> ForgeResult<Self> {
        let dims = tensor.logical_dims()?;
        if dims.len() != 4 {
            return Err(ForgeError::InvariantViolation(format!(
                "filter operand {} must be rank 4, got rank {}",
                tensor.operand(),
                dims.len()
            )));
        }
        let s = tensor.axis_map()?.logical_strides(&dims);
        Ok(Self {
            dims: [dims[0], dims[1], dims[2], dims[3]],
            strides: [s[0], s[1], s[2], s[3]],
        })
    }

    fn offset(&self, o: usize, kh: usize, kw: usize, i: usize) -> usize {
        o * self.strides[0] + kh * self.strides[1] + kw * self.strides[2] + i * self.strides[3]
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    stride: Stride,
    dilation: Dilation,
    pad: ExplicitPadding,
}

impl Window {
    /// Input coordinate for output `o` and tap `k`, if inside the input
    fn source(&self, o: usize, k: usize, vertical: bool, limit: usize) -> Option<usize> {
        let (stride, dilation, before) = if vertical {
            (self.stride.vertical, self.dilation.height, self.pad.top)
        } else {
            (self.stride.horizontal, self.dilation.width, self.pad.left)
        };
        let pos = (o * stride + k * dilation) as isize - before as isize;
        if pos < 0 || pos as usize >= limit {
            None
        } else {
            Some(pos as usize)
        }
    }
}

fn read_bias(bias: &BackendTensor, expected: usize) -> ForgeResult<Vec<f32>> {
    let values = bias.read_logical_f32()?;
    if values.len() != expected {
        return Err(ForgeError::InvariantViolation(format!(
            "bias operand {} has {} values, expected {}",
            bias.operand(),
            values.len(),
            expected
        )));
    }
    Ok(values)
}

/// 2-D convolution. Filter is `[O, KH, KW, I]`.
pub struct Conv2DKernel {
    input: TensorRef,
    filter: TensorRef,
    bias: TensorRef,
    output: TensorRef,
    ifm: FeatureAccess,
    ofm: FeatureAccess,
    kernel: FilterAccess,
    window: Window,
}

impl Conv2DKernel {
    pub fn configure(
        input: TensorRef,
        filter: TensorRef,
        bias: TensorRef,
        output: TensorRef,
        stride: Stride,
        padding: Padding,
        dilation: Dilation,
    ) -> ForgeResult<Self> {
        let ifm = FeatureAccess::of(&input)?;
        let ofm = FeatureAccess::of(&output)?;
        let kernel = FilterAccess::of(&filter)?;
        if kernel.dims[3] != ifm.shape.c || kernel.dims[0] != ofm.shape.c {
            return Err(ForgeError::InvariantViolation(format!(
                "Conv2D filter {:?} does not fit {} -> {} channels",
                kernel.dims, ifm.shape.c, ofm.shape.c
            )));
        }
        let pad = calculate_padding(
            padding,
            ifm.shape,
            ofm.shape,
            stride,
            kernel.dims[2],
            kernel.dims[1],
            dilation,
        );
        Ok(Self {
            input,
            filter,
            bias,
            output,
            ifm,
            ofm,
            kernel,
            window: Window {
                stride,
                dilation,
                pad,
            },
        })
    }
}

impl Function for Conv2DKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let k = self.filter.read_f32()?;
        let b = read_bias(&self.bias, self.ofm.shape.c)?;
        let mut out = vec![0.0f32; self.output.num_elements()?];
        let (ifm, ofm, kd) = (self.ifm, self.ofm, self.kernel);

        for n in 0..ofm.shape.n {
            for oh in 0..ofm.shape.h {
                for ow in 0..ofm.shape.w {
                    for oc in 0..ofm.shape.c {
                        let mut acc = b[oc];
                        for kh in 0..kd.dims[1] {
                            let ih = match self.window.source(oh, kh, true, ifm.shape.h) {
                                Some(v) => v,
                                None => continue,
                            };
                            for kw in 0..kd.dims[2] {
                                let iw = match self.window.source(ow, kw, false, ifm.shape.w) {
                                    Some(v) => v,
                                    None => continue,
                                };
                                for ic in 0..ifm.shape.c {
                                    acc += x[ifm.offset(n, ih, iw, ic)] * k[kd.offset(oc, kh, kw, ic)];
                                }
                            }
                        }
                        out[ofm.offset(n, oh, ow, oc)] = acc;
                    }
                }
            }
        }
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        "Conv2D"
    }
}

/// Depthwise convolution. Filter is `[1, KH, KW, I * multiplier]`.
pub struct DepthwiseConv2DKernel {
    input: TensorRef,
    filter: TensorRef,
    bias: TensorRef,
    output: TensorRef,
    ifm: FeatureAccess,
    ofm: FeatureAccess,
    kernel: FilterAccess,
    window: Window,
    multiplier: usize,
}

impl DepthwiseConv2DKernel {
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        input: TensorRef,
        filter: TensorRef,
        bias: TensorRef,
        output: TensorRef,
        stride: Stride,
        padding: Padding,
        dilation: Dilation,
        multiplier: usize,
    ) -> ForgeResult<Self> {
        let ifm = FeatureAccess::of(&input)?;
        let ofm = FeatureAccess::of(&output)?;
        let kernel = FilterAccess::of(&filter)?;
        if multiplier == 0 || ofm.shape.c != ifm.shape.c * multiplier || kernel.dims[3] != ofm.shape.c {
            return Err(ForgeError::InvariantViolation(format!(
                "DepthwiseConv2D filter {:?} with multiplier {} does not fit {} -> {} channels",
                kernel.dims, multiplier, ifm.shape.c, ofm.shape.c
            )));
        }
        let pad = calculate_padding(
            padding,
            ifm.shape,
            ofm.shape,
            stride,
            kernel.dims[2],
            kernel.dims[1],
            dilation,
        );
        Ok(Self {
            input,
            filter,
            bias,
            output,
            ifm,
            ofm,
            kernel,
            window: Window {
                stride,
                dilation,
                pad,
            },
            multiplier,
        })
    }
}

impl Function for DepthwiseConv2DKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let k = self.filter.read_f32()?;
        let b = read_bias(&self.bias, self.ofm.shape.c)?;
        let mut out = vec![0.0f32; self.output.num_elements()?];
        let (ifm, ofm, kd) = (self.ifm, self.ofm, self.kernel);

        for n in 0..ofm.shape.n {
            for oh in 0..ofm.shape.h {
                for ow in 0..ofm.shape.w {
                    for oc in 0..ofm.shape.c {
                        let ic = oc / self.multiplier;
                        let mut acc = b[oc];
                        for kh in 0..kd.dims[1] {
                            let ih = match self.window.source(oh, kh, true, ifm.shape.h) {
                                Some(v) => v,
                                None => continue,
                            };
                            for kw in 0..kd.dims[2] {
                                if let Some(iw) = self.window.source(ow, kw, false, ifm.shape.w) {
                                    acc += x[ifm.offset(n, ih, iw, ic)] * k[kd.offset(0, kh, kw, oc)];
                                }
                            }
                        }
                        out[ofm.offset(n, oh, ow, oc)] = acc;
                    }
                }
            }
        }
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        "DepthwiseConv2D"
    }
}

/// `output = input . weights^T + bias` over the logical view.
/// Input is flattened to `[batch, in_features]`.
pub struct FullyConnectedKernel {
    input: TensorRef,
    weights: TensorRef,
    bias: Option<TensorRef>,
    output: TensorRef,
    batch: usize,
    in_features: usize,
    out_features: usize,
}

impl FullyConnectedKernel {
    pub fn configure(
        input: TensorRef,
        weights: TensorRef,
        bias: Option<TensorRef>,
        output: TensorRef,
    ) -> ForgeResult<Self> {
        let w = weights.logical_dims()?;
        if w.len() != 2 {
            return Err(ForgeError::InvariantViolation(format!(
                "FullyConnected weights must be rank 2, got {:?}",
                w
            )));
        }
        let (out_features, in_features) = (w[0], w[1]);
        let elements = input.num_elements()?;
        if in_features == 0 || elements % in_features != 0 {
            return Err(ForgeError::InvariantViolation(format!(
                "FullyConnected input of {} elements is not a multiple of {}",
                elements, in_features
            )));
        }
        let batch = elements / in_features;
        if output.num_elements()? != batch * out_features {
            return Err(ForgeError::InvariantViolation(format!(
                "FullyConnected output must hold {}x{} elements",
                batch, out_features
            )));
        }
        Ok(Self {
            input,
            weights,
            bias,
            output,
            batch,
            in_features,
            out_features,
        })
    }
}

impl Function for FullyConnectedKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_logical_f32()?;
        let w = self.weights.read_logical_f32()?;
        let b = match &self.bias {
            Some(bias) => read_bias(bias, self.out_features)?,
            None => vec![0.0; self.out_features],
        };
        let mut out = vec![0.0f32; self.batch * self.out_features];
        for n in 0..self.batch {
            let row = &x[n * self.in_features..(n + 1) * self.in_features];
            for o in 0..self.out_features {
                let weights = &w[o * self.in_features..(o + 1) * self.in_features];
                out[n * self.out_features + o] =
                    b[o] + row.iter().zip(weights).map(|(a, b)| a * b).sum::<f32>();
            }
        }
        self.output.write_logical_f32(&out)
    }

    fn name(&self) -> &str {
        "FullyConnected"
    }
}
