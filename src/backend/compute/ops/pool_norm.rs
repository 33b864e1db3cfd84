//! Pooling and instance normalization.

use crate::backend::compute::ops::conv::FeatureAccess;
use crate::backend::compute::ops::TensorRef;
use crate::error::{ForgeError, ForgeResult};
use crate::exec::Function;
use crate::ir::{calculate_padding, Dilation, ExplicitPadding, Padding, PoolType, Stride};

pub struct Pool2DKernel {
    input: TensorRef,
    output: TensorRef,
    ifm: FeatureAccess,
    ofm: FeatureAccess,
    op: PoolType,
    kh: usize,
    kw: usize,
    stride: Stride,
    pad: ExplicitPadding,
}

impl Pool2DKernel {
    pub fn configure(
        input: TensorRef,
        output: TensorRef,
        op: PoolType,
        kh: usize,
        kw: usize,
        stride: Stride,
        padding: Padding,
    ) -> ForgeResult<Self> {
        let ifm = FeatureAccess::of(&input)?;
        let ofm = FeatureAccess::of(&output)?;
        if ifm.shape.c != ofm.shape.c || kh == 0 || kw == 0 {
            return Err(ForgeError::InvariantViolation(format!(
                "Pool2D {}x{} window from {} to {} channels",
                kh, kw, ifm.shape.c, ofm.shape.c
            )));
        }
        let pad = calculate_padding(padding, ifm.shape, ofm.shape, stride, kw, kh, Dilation::default());
        Ok(Self {
            input,
            output,
            ifm,
            ofm,
            op,
            kh,
            kw,
            stride,
            pad,
        })
    }
}

impl Function for Pool2DKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let mut out = vec![0.0f32; self.output.num_elements()?];
        let (ifm, ofm) = (self.ifm, self.ofm);

        for n in 0..ofm.shape.n {
            for oh in 0..ofm.shape.h {
                let h0 = (oh * self.stride.vertical) as isize - self.pad.top as isize;
                for ow in 0..ofm.shape.w {
                    let w0 = (ow * self.stride.horizontal) as isize - self.pad.left as isize;
                    for c in 0..ofm.shape.c {
                        let mut max = f32::NEG_INFINITY;
                        let mut sum = 0.0;
                        let mut count = 0usize;
                        for dh in 0..self.kh as isize {
                            let ih = h0 + dh;
                            if ih < 0 || ih as usize >= ifm.shape.h {
                                continue;
                            }
                            for dw in 0..self.kw as isize {
                                let iw = w0 + dw;
                                if iw < 0 || iw as usize >= ifm.shape.w {
                                    continue;
                                }
                                let v = x[ifm.offset(n, ih as usize, iw as usize, c)];
                                max = max.max(v);
                                sum += v;
                                count += 1;
                            }
                        }
                        out[ofm.offset(n, oh, ow, c)] = match self.op {
                            PoolType::Max => max,
                            PoolType::Avg if count > 0 => sum / count as f32,
                            PoolType::Avg => 0.0,
                        };
                    }
                }
            }
        }
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        match self.op {
            PoolType::Max => "MaxPool2D",
            PoolType::Avg => "AvgPool2D",
        }
    }
}

/// Per-(batch, channel) normalization over the spatial dims
pub struct InstanceNormKernel {
    input: TensorRef,
    gamma: TensorRef,
    beta: TensorRef,
    output: TensorRef,
    ifm: FeatureAccess,
    ofm: FeatureAccess,
    epsilon: f32,
}

impl InstanceNormKernel {
    pub fn configure(
        input: TensorRef,
        gamma: TensorRef,
        beta: TensorRef,
        output: TensorRef,
        epsilon: f32,
    ) -> ForgeResult<Self> {
        let ifm = FeatureAccess::of(&input)?;
        let ofm = FeatureAccess::of(&output)?;
        if ifm.shape != ofm.shape {
            return Err(ForgeError::InvariantViolation(format!(
                "InstanceNorm changes shape {:?} -> {:?}",
                ifm.shape, ofm.shape
            )));
        }
        Ok(Self {
            input,
            gamma,
            beta,
            output,
            ifm,
            ofm,
            epsilon,
        })
    }
}

impl Function for InstanceNormKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let gamma = self.gamma.read_logical_f32()?;
        let beta = self.beta.read_logical_f32()?;
        let shape = self.ifm.shape;
        let param = |values: &[f32], c: usize| values.get(c).or(values.first()).copied().unwrap_or(0.0);
        let mut out = vec![0.0f32; x.len()];
        let spatial = (shape.h * shape.w).max(1) as f32;

        for n in 0..shape.n {
            for c in 0..shape.c {
                let mut mean = 0.0;
                for h in 0..shape.h {
                    for w in 0..shape.w {
                        mean += x[self.ifm.offset(n, h, w, c)];
                    }
                }
                mean /= spatial;
                let mut var = 0.0;
                for h in 0..shape.h {
                    for w in 0..shape.w {
                        let d = x[self.ifm.offset(n, h, w, c)] - mean;
                        var += d * d;
                    }
                }
                var /= spatial;
                let scale = param(&gamma, c) / (var + self.epsilon).sqrt();
                for h in 0..shape.h {
                    for w in 0..shape.w {
                        out[self.ofm.offset(n, h, w, c)] =
                            (x[self.ifm.offset(n, h, w, c)] - mean) * scale + param(&beta, c);
                    }
                }
            }
        }
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        "InstanceNorm"
    }
}
