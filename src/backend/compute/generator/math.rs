//! Lowering of arithmetic, convolution, pooling, normalization and
//! reduction kinds.

use crate::backend::compute::ops::conv::{Conv2DKernel, DepthwiseConv2DKernel, FullyConnectedKernel};
use crate::backend::compute::ops::elementwise::{
    self as ew, ActivationFn, ActivationKernel, BinaryKernel, BinaryOp, L2NormKernel,
    SoftmaxKernel, UnaryKernel, UnaryOp,
};
use crate::backend::compute::ops::movement::CopyKernel;
use crate::backend::compute::ops::pool_norm::{InstanceNormKernel, Pool2DKernel};
use crate::backend::compute::ops::reduce::{ArgMaxKernel, ReduceKernel};
use crate::backend::layout_remap::axes_to_backend;
use crate::error::ForgeResult;
use crate::ir::{
    Activation, ArgMax, ArithmeticType, BinaryArithmetic, Comparison, ComparisonType, Conv2D,
    DataType, DepthwiseConv2D, ElementwiseActivation, ElementwiseBinary, ElementwiseBinaryType,
    ElementwiseUnary, ElementwiseUnaryType, FullyConnected, InstanceNorm, OpKind, Operation,
    PReLU, Pool2D, Reduce, Softmax, SquaredDifference,
};

use super::{KernelGenerator, Lowered, SeqContext};

impl KernelGenerator<'_> {
    fn binary(
        &self,
        op: &Operation,
        name: &'static str,
        (lhs, rhs): (usize, usize),
        f: BinaryOp,
        activation: Activation,
    ) -> ForgeResult<Lowered> {
        let lhs = self.input(op, lhs)?;
        let rhs = self.input(op, rhs)?;
        if lhs.type_info().dtype == DataType::Bool8 && name != "LogicalAnd" && name != "LogicalOr" {
            return Err(self.unsupported(op, "arithmetic on bool8 operands"));
        }
        Ok(Lowered::new(BinaryKernel::configure(
            name,
            lhs,
            rhs,
            self.output(op, 0)?,
            f,
            activation,
        )?))
    }

    pub(super) fn binary_arithmetic(&self, op: &Operation, p: &BinaryArithmetic) -> ForgeResult<Lowered> {
        let (name, f): (_, BinaryOp) = match p.op {
            ArithmeticType::Add => ("Add", ew::add),
            ArithmeticType::Sub => ("Sub", ew::sub),
            ArithmeticType::Mul => ("Mul", ew::mul),
            ArithmeticType::Div => ("Div", ew::div),
        };
        self.binary(op, name, (BinaryArithmetic::LHS, BinaryArithmetic::RHS), f, p.activation)
    }

    pub(super) fn conv2d(&self, op: &Operation, p: &Conv2D) -> ForgeResult<Lowered> {
        Ok(Lowered::new(Conv2DKernel::configure(
            self.input(op, Conv2D::INPUT)?,
            self.input(op, Conv2D::KERNEL)?,
            self.input(op, Conv2D::BIAS)?,
            self.output(op, 0)?,
            p.stride,
            p.padding,
            p.dilation,
        )?))
    }

    pub(super) fn depthwise_conv2d(&self, op: &Operation, p: &DepthwiseConv2D) -> ForgeResult<Lowered> {
        Ok(Lowered::new(DepthwiseConv2DKernel::configure(
            self.input(op, DepthwiseConv2D::INPUT)?,
            self.input(op, DepthwiseConv2D::KERNEL)?,
            self.input(op, DepthwiseConv2D::BIAS)?,
            self.output(op, 0)?,
            p.stride,
            p.padding,
            p.dilation,
            p.multiplier,
        )?))
    }

    pub(super) fn fully_connected(&self, op: &Operation) -> ForgeResult<Lowered> {
        let bias = match op.input(FullyConnected::BIAS) {
            Some(id) => Some(self.tensor(id)?),
            None => None,
        };
        Ok(Lowered::new(FullyConnectedKernel::configure(
            self.input(op, FullyConnected::INPUT)?,
            self.input(op, FullyConnected::WEIGHT)?,
            bias,
            self.output(op, 0)?,
        )?))
    }

    pub(super) fn pool2d(&self, op: &Operation, p: &Pool2D) -> ForgeResult<Lowered> {
        Ok(Lowered::new(Pool2DKernel::configure(
            self.input(op, Pool2D::INPUT)?,
            self.output(op, 0)?,
            p.op,
            p.kh,
            p.kw,
            p.stride,
            p.padding,
        )?))
    }

    pub(super) fn instance_norm(&self, op: &Operation, p: &InstanceNorm) -> ForgeResult<Lowered> {
        Ok(Lowered::new(InstanceNormKernel::configure(
            self.input(op, InstanceNorm::INPUT)?,
            self.input(op, InstanceNorm::GAMMA)?,
            self.input(op, InstanceNorm::BETA)?,
            self.output(op, 0)?,
            p.epsilon,
        )?))
    }

    /// Backend axis of the last logical axis of `op`'s input
    fn innermost_axis(&self, op: &Operation) -> ForgeResult<usize> {
        let input = self.input(op, 0)?;
        let rank = input.logical_rank()?;
        if rank == 0 {
            return Err(self.unsupported(op, "scalar input"));
        }
        Ok(input.axis_map()?.to_backend(rank - 1))
    }

    pub(super) fn softmax(&self, op: &Operation, p: &Softmax) -> ForgeResult<Lowered> {
        let axis = self.innermost_axis(op)?;
        Ok(Lowered::new(SoftmaxKernel::configure(
            self.input(op, Softmax::INPUT)?,
            self.output(op, 0)?,
            axis,
            p.beta,
        )?))
    }

    pub(super) fn l2_normalization(&self, op: &Operation) -> ForgeResult<Lowered> {
        let axis = self.innermost_axis(op)?;
        Ok(Lowered::new(L2NormKernel::configure(
            self.input(op, 0)?,
            self.output(op, 0)?,
            axis,
        )?))
    }

    pub(super) fn elementwise_activation(&self, op: &Operation, p: &ElementwiseActivation) -> ForgeResult<Lowered> {
        Ok(Lowered::new(ActivationKernel::configure(
            self.input(op, ElementwiseActivation::INPUT)?,
            self.output(op, 0)?,
            ActivationFn::Elementwise(*p),
        )?))
    }

    pub(super) fn elementwise_binary(&self, op: &Operation, p: &ElementwiseBinary) -> ForgeResult<Lowered> {
        let (name, f): (_, BinaryOp) = match p.op {
            ElementwiseBinaryType::Max => ("Max", f32::max),
            ElementwiseBinaryType::Min => ("Min", f32::min),
            ElementwiseBinaryType::LogicalAnd => ("LogicalAnd", ew::logical_and),
            ElementwiseBinaryType::LogicalOr => ("LogicalOr", ew::logical_or),
            ElementwiseBinaryType::FloorDiv => ("FloorDiv", ew::floor_div),
        };
        self.binary(
            op,
            name,
            (ElementwiseBinary::LHS, ElementwiseBinary::RHS),
            f,
            Activation::None,
        )
    }

    pub(super) fn elementwise_unary(&self, op: &Operation, p: &ElementwiseUnary) -> ForgeResult<Lowered> {
        let input = self.input(op, ElementwiseUnary::INPUT)?;
        let output = self.output(op, 0)?;
        let (name, f): (_, UnaryOp) = match p.op {
            ElementwiseUnaryType::Abs => ("Abs", f32::abs),
            ElementwiseUnaryType::Cast => {
                if input.type_info() == output.type_info() {
                    return Ok(Lowered::new(CopyKernel::physical("Cast", input, output)?));
                }
                ("Cast", ew::identity)
            }
            ElementwiseUnaryType::Dequantize => {
                if !input.type_info().dtype.is_quantized() || output.type_info().dtype != DataType::Float32 {
                    return Err(self.unsupported(op, "dequantize expects a quantized input and a float32 output"));
                }
                ("Dequantize", ew::identity)
            }
            ElementwiseUnaryType::Exp => ("Exp", f32::exp),
            ElementwiseUnaryType::Floor => ("Floor", f32::floor),
            ElementwiseUnaryType::LogicalNot => ("LogicalNot", ew::logical_not),
            ElementwiseUnaryType::Neg => ("Neg", ew::neg),
            ElementwiseUnaryType::Rsqrt => ("Rsqrt", ew::rsqrt),
            ElementwiseUnaryType::Sqrt => ("Sqrt", f32::sqrt),
            ElementwiseUnaryType::Sin => ("Sin", f32::sin),
        };
        Ok(Lowered::new(UnaryKernel::configure(name, input, output, f)?))
    }

    pub(super) fn comparison(&self, op: &Operation, p: &Comparison) -> ForgeResult<Lowered> {
        let (name, f): (_, BinaryOp) = match p.op {
            ComparisonType::Equal => ("Equal", ew::equal),
            ComparisonType::NotEqual => ("NotEqual", ew::not_equal),
            ComparisonType::Greater => ("Greater", ew::greater),
            ComparisonType::GreaterEqual => ("GreaterEqual", ew::greater_equal),
            ComparisonType::Less => ("Less", ew::less),
            ComparisonType::LessEqual => ("LessEqual", ew::less_equal),
        };
        self.binary(op, name, (Comparison::INPUT0, Comparison::INPUT1), f, Activation::None)
    }

    pub(super) fn squared_difference(&self, op: &Operation) -> ForgeResult<Lowered> {
        self.binary(
            op,
            "SquaredDifference",
            (SquaredDifference::LHS, SquaredDifference::RHS),
            ew::squared_difference,
            Activation::None,
        )
    }

    pub(super) fn prelu(&self, op: &Operation) -> ForgeResult<Lowered> {
        self.binary(op, "PReLU", (PReLU::INPUT, PReLU::ALPHA), ew::prelu, Activation::None)
    }

    pub(super) fn reduce(&self, ctx: &SeqContext, op: &Operation, p: &Reduce) -> ForgeResult<Lowered> {
        let input = self.input(op, Reduce::INPUT)?;
        let axes = self.constant_i32s(op, Reduce::AXES)?;
        let rank = input.logical_rank()?;
        let backend_axes = axes_to_backend(&axes, rank, ctx.layout, ctx.physical)?;
        Ok(Lowered::new(ReduceKernel::configure(
            input,
            self.output(op, 0)?,
            p.op,
            &backend_axes,
            p.keep_dims,
        )?))
    }

    pub(super) fn arg_max(&self, op: &Operation) -> ForgeResult<Lowered> {
        let input = self.input(op, ArgMax::INPUT)?;
        let axis = self.constant_i32(op, ArgMax::AXIS)?;
        let backend_axis = input.axis_map()?.backend_axis(axis)?;
        let output = self.output(op, 0)?;
        if !matches!(output.type_info().dtype, DataType::Int32 | DataType::Int64) {
            return Err(self.unsupported(op, "output must be int32 or int64"));
        }
        Ok(Lowered::new(ArgMaxKernel::configure(input, output, backend_axis)?))
    }

    pub(super) fn convert_fp(&self, op: &Operation) -> ForgeResult<Lowered> {
        if !self.config.support_fp16() {
            return Err(self.unsupported(op, "float16 is not enabled on this backend"));
        }
        let (from, to, name) = match op.kind {
            OpKind::ConvertFp16ToFp32 => (DataType::Float16, DataType::Float32, "ConvertFp16ToFp32"),
            _ => (DataType::Float32, DataType::Float16, "ConvertFp32ToFp16"),
        };
        let input = self.input(op, 0)?;
        let output = self.output(op, 0)?;
        if input.type_info().dtype != from || output.type_info().dtype != to {
            return Err(self.unsupported(op, format!("expects {} to {}", from.name(), to.name())));
        }
        Ok(Lowered::new(UnaryKernel::configure(name, input, output, ew::identity)?))
    }
}
