//! Elementwise kernels: broadcast binaries, unaries, activations and the
//! single-axis normalizations (softmax, L2).

use tracing::trace;

use crate::backend::compute::ops::{require_same_elements, split_at_axis, TensorRef};
use crate::backend::layout_remap::broadcast_offsets;
use crate::error::{ForgeError, ForgeResult};
use crate::exec::Function;
use crate::ir::{Activation, ElementwiseActivation, ElementwiseActivationType};

pub type BinaryOp = fn(f32, f32) -> f32;
pub type UnaryOp = fn(f32) -> f32;

/// Two-input elementwise kernel with numpy-style broadcasting
pub struct BinaryKernel {
    name: &'static str,
    lhs: TensorRef,
    rhs: TensorRef,
    output: TensorRef,
    lhs_offsets: Vec<usize>,
    rhs_offsets: Vec<usize>,
    op: BinaryOp,
    activation: Activation,
}

impl BinaryKernel {
    pub fn configure(
        name: &'static str,
        lhs: TensorRef,
        rhs: TensorRef,
        output: TensorRef,
        op: BinaryOp,
        activation: Activation,
    ) -> ForgeResult<Self> {
        let out_dims = output.logical_dims()?;
        let out_map = output.axis_map()?;
        let lhs_offsets = broadcast_offsets(&out_dims, &out_map, &lhs.logical_dims()?, &lhs.axis_map()?)?;
        let rhs_offsets = broadcast_offsets(&out_dims, &out_map, &rhs.logical_dims()?, &rhs.axis_map()?)?;
        trace!(kernel = name, output = %output.operand(), "configured binary kernel");
        Ok(Self {
            name,
            lhs,
            rhs,
            output,
            lhs_offsets,
            rhs_offsets,
            op,
            activation,
        })
    }
}

impl Function for BinaryKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let l = self.lhs.read_f32()?;
        let r = self.rhs.read_f32()?;
        let mut out = Vec::with_capacity(self.lhs_offsets.len());
        for (&lo, &ro) in self.lhs_offsets.iter().zip(&self.rhs_offsets) {
            let (a, b) = match (l.get(lo), r.get(ro)) {
                (Some(a), Some(b)) => (*a, *b),
                _ => {
                    return Err(ForgeError::KernelFailed(format!(
                        "{}: broadcast offset out of range",
                        self.name
                    )))
                }
            };
            out.push(self.activation.apply((self.op)(a, b)));
        }
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        self.name
    }
}

pub fn add(a: f32, b: f32) -> f32 {
    a + b
}

pub fn sub(a: f32, b: f32) -> f32 {
    a - b
}

pub fn mul(a: f32, b: f32) -> f32 {
    a * b
}

pub fn div(a: f32, b: f32) -> f32 {
    a / b
}

pub fn floor_div(a: f32, b: f32) -> f32 {
    (a / b).floor()
}

pub fn squared_difference(a: f32, b: f32) -> f32 {
    (a - b) * (a - b)
}

pub fn prelu(x: f32, alpha: f32) -> f32 {
    if x < 0.0 {
        alpha * x
    } else {
        x
    }
}

fn truth(v: bool) -> f32 {
    if v {
        1.0
    } else {
        0.0
    }
}

pub fn logical_and(a: f32, b: f32) -> f32 {
    truth(a != 0.0 && b != 0.0)
}

pub fn logical_or(a: f32, b: f32) -> f32 {
    truth(a != 0.0 || b != 0.0)
}

pub fn equal(a: f32, b: f32) -> f32 {
    truth(a == b)
}

pub fn not_equal(a: f32, b: f32) -> f32 {
    truth(a != b)
}

pub fn greater(a: f32, b: f32) -> f32 {
    truth(a > b)
}

pub fn greater_equal(a: f32, b: f32) -> f32 {
    truth(a >= b)
}

pub fn less(a: f32, b: f32) -> f32 {
    truth(a < b)
}

pub fn less_equal(a: f32, b: f32) -> f32 {
    truth(a <= b)
}

pub fn logical_not(x: f32) -> f32 {
    truth(x == 0.0)
}

pub fn rsqrt(x: f32) -> f32 {
    1.0 / x.sqrt()
}

pub fn neg(x: f32) -> f32 {
    -x
}

pub fn identity(x: f32) -> f32 {
    x
}

/// One-input elementwise kernel; element types may differ (Cast, Dequantize)
pub struct UnaryKernel {
    name: &'static str,
    input: TensorRef,
    output: TensorRef,
    op: UnaryOp,
}

impl UnaryKernel {
    pub fn configure(
        name: &'static str,
        input: TensorRef,
        output: TensorRef,
        op: UnaryOp,
    ) -> ForgeResult<Self> {
        require_same_elements(&input, &output, name)?;
        Ok(Self {
            name,
            input,
            output,
            op,
        })
    }
}

impl Function for UnaryKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let values: Vec<f32> = self.input.read_f32()?.into_iter().map(self.op).collect();
        self.output.write_f32(&values)
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Activation function applied by [`ActivationKernel`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationFn {
    Fused(Activation),
    Elementwise(ElementwiseActivation),
}

impl ActivationFn {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationFn::Fused(act) => act.apply(x),
            ActivationFn::Elementwise(p) => match p.op {
                ElementwiseActivationType::Relu => x.max(p.beta).min(p.alpha),
                ElementwiseActivationType::Tanh => x.tanh(),
                ElementwiseActivationType::Logistic => 1.0 / (1.0 + (-x).exp()),
                ElementwiseActivationType::LeakyRelu => {
                    if x < 0.0 {
                        p.alpha * x
                    } else {
                        x
                    }
                }
                ElementwiseActivationType::Elu => {
                    if x < 0.0 {
                        p.alpha * (x.exp() - 1.0)
                    } else {
                        x
                    }
                }
            },
        }
    }
}

/// Activation over a tensor; `input` and `output` may be the same tensor
pub struct ActivationKernel {
    input: TensorRef,
    output: TensorRef,
    function: ActivationFn,
}

impl ActivationKernel {
    pub fn configure(input: TensorRef, output: TensorRef, function: ActivationFn) -> ForgeResult<Self> {
        require_same_elements(&input, &output, "Activation")?;
        Ok(Self {
            input,
            output,
            function,
        })
    }

    pub fn in_place(tensor: TensorRef, function: ActivationFn) -> ForgeResult<Self> {
        Self::configure(tensor.clone(), tensor, function)
    }
}

impl Function for ActivationKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let f = self.function;
        let values: Vec<f32> = self.input.read_f32()?.into_iter().map(|x| f.apply(x)).collect();
        self.output.write_f32(&values)
    }

    fn name(&self) -> &str {
        "Activation"
    }
}

/// Softmax along one backend axis
pub struct SoftmaxKernel {
    input: TensorRef,
    output: TensorRef,
    axis: usize,
    beta: f32,
}

impl SoftmaxKernel {
    pub fn configure(input: TensorRef, output: TensorRef, axis: usize, beta: f32) -> ForgeResult<Self> {
        require_same_elements(&input, &output, "Softmax")?;
        Ok(Self {
            input,
            output,
            axis,
            beta,
        })
    }
}

impl Function for SoftmaxKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let (outer, extent, inner) = split_at_axis(&self.input.dims()?, self.axis);
        let mut out = vec![0.0; x.len()];
        for o in 0..outer {
            for i in 0..inner {
                let at = |a: usize| o * extent * inner + a * inner + i;
                let max = (0..extent).map(|a| x[at(a)]).fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for a in 0..extent {
                    let e = ((x[at(a)] - max) * self.beta).exp();
                    out[at(a)] = e;
                    sum += e;
                }
                for a in 0..extent {
                    out[at(a)] /= sum;
                }
            }
        }
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        "Softmax"
    }
}

/// L2 normalization along one backend axis
pub struct L2NormKernel {
    input: TensorRef,
    output: TensorRef,
    axis: usize,
}

impl L2NormKernel {
    pub fn configure(input: TensorRef, output: TensorRef, axis: usize) -> ForgeResult<Self> {
        require_same_elements(&input, &output, "L2Normalization")?;
        Ok(Self {
            input,
            output,
            axis,
        })
    }
}

impl Function for L2NormKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let (outer, extent, inner) = split_at_axis(&self.input.dims()?, self.axis);
        let mut out = vec![0.0; x.len()];
        for o in 0..outer {
            for i in 0..inner {
                let at = |a: usize| o * extent * inner + a * inner + i;
                let norm = (0..extent)
                    .map(|a| x[at(a)] * x[at(a)])
                    .sum::<f32>()
                    .sqrt()
                    .max(1e-6);
                for a in 0..extent {
                    out[at(a)] = x[at(a)] / norm;
                }
            }
        }
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        "L2Normalization"
    }
}
