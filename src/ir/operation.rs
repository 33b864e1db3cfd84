//! Operations: the closed set of node kinds and their parameters.
//!
//! Each parameter struct doubles as the namespace for its input slot
//! positions (`Conv2D::KERNEL`, `StridedSlice::ENDS`, ...). Slot order is
//! part of a kind's contract and never varies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::{Dilation, OperandId, Padding, PermuteType, Stride};

/// Fused activation applied to an operation's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    None,
    Relu,
    /// Clamp to [-1, 1]
    Relu1,
    Relu6,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn is_identity(self) -> bool {
        self == Activation::None
    }

    /// Clamp range for the piecewise-linear activations
    pub fn clamp_range(self) -> Option<(f32, f32)> {
        match self {
            Activation::Relu => Some((0.0, f32::INFINITY)),
            Activation::Relu1 => Some((-1.0, 1.0)),
            Activation::Relu6 => Some((0.0, 6.0)),
            Activation::None | Activation::Tanh | Activation::Sigmoid => None,
        }
    }

    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Relu | Activation::Relu1 | Activation::Relu6 => {
                let (lo, hi) = self.clamp_range().unwrap_or((f32::NEG_INFINITY, f32::INFINITY));
                x.max(lo).min(hi)
            }
        }
    }
}

/// Number of operands a slot list accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Between(lo, hi) => n >= lo && n <= hi,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(k) => write!(f, "exactly {}", k),
            Arity::AtLeast(k) => write!(f, "at least {}", k),
            Arity::Between(lo, hi) => write!(f, "{} to {}", lo, hi),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticType {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryArithmetic {
    pub op: ArithmeticType,
    pub activation: Activation,
}

impl BinaryArithmetic {
    pub const LHS: usize = 0;
    pub const RHS: usize = 1;
}

/// Kernel operand is `[out_channels, kh, kw, in_channels]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conv2D {
    pub stride: Stride,
    pub padding: Padding,
    pub dilation: Dilation,
    pub activation: Activation,
}

impl Conv2D {
    pub const INPUT: usize = 0;
    pub const KERNEL: usize = 1;
    pub const BIAS: usize = 2;
}

/// Kernel operand is `[1, kh, kw, in_channels * multiplier]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthwiseConv2D {
    pub stride: Stride,
    pub padding: Padding,
    pub dilation: Dilation,
    pub multiplier: usize,
    pub activation: Activation,
}

impl DepthwiseConv2D {
    pub const INPUT: usize = 0;
    pub const KERNEL: usize = 1;
    pub const BIAS: usize = 2;
}

/// Weights operand is `[out_features, in_features]`; bias is optional
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FullyConnected {
    pub activation: Activation,
}

impl FullyConnected {
    pub const INPUT: usize = 0;
    pub const WEIGHT: usize = 1;
    pub const BIAS: usize = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolType {
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pool2D {
    pub op: PoolType,
    pub kh: usize,
    pub kw: usize,
    pub stride: Stride,
    pub padding: Padding,
    pub activation: Activation,
}

impl Pool2D {
    pub const INPUT: usize = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceNorm {
    pub epsilon: f32,
    pub activation: Activation,
}

impl InstanceNorm {
    pub const INPUT: usize = 0;
    pub const GAMMA: usize = 1;
    pub const BETA: usize = 2;
}

/// Variadic inputs, concatenated along `axis`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concat {
    pub axis: i32,
}

/// Optional second input is a constant target shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reshape;

impl Reshape {
    pub const INPUT: usize = 0;
    pub const SHAPE: usize = 1;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Squeeze {
    pub dims: Vec<i32>,
}

impl Squeeze {
    pub const INPUT: usize = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpandDims;

impl ExpandDims {
    pub const INPUT: usize = 0;
    pub const AXIS: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Softmax {
    pub beta: f32,
}

impl Softmax {
    pub const INPUT: usize = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Slice;

impl Slice {
    pub const INPUT: usize = 0;
    pub const BEGINS: usize = 1;
    pub const SIZES: usize = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StridedSlice {
    pub begin_mask: u32,
    pub end_mask: u32,
    pub shrink_axis_mask: u32,
}

impl StridedSlice {
    pub const INPUT: usize = 0;
    pub const STARTS: usize = 1;
    pub const ENDS: usize = 2;
    pub const STRIDES: usize = 3;
}

/// An empty permutation operand means "reverse all axes"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transpose;

impl Transpose {
    pub const INPUT: usize = 0;
    pub const PERMUTATION: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementwiseActivationType {
    /// Clamp to `[beta, alpha]`
    Relu,
    Tanh,
    Logistic,
    LeakyRelu,
    Elu,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementwiseActivation {
    pub op: ElementwiseActivationType,
    pub alpha: f32,
    pub beta: f32,
}

impl ElementwiseActivation {
    pub const INPUT: usize = 0;

    pub fn relu() -> Self {
        Self {
            op: ElementwiseActivationType::Relu,
            alpha: f32::INFINITY,
            beta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementwiseBinaryType {
    Max,
    Min,
    LogicalAnd,
    LogicalOr,
    FloorDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementwiseBinary {
    pub op: ElementwiseBinaryType,
}

impl ElementwiseBinary {
    pub const LHS: usize = 0;
    pub const RHS: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementwiseUnaryType {
    Abs,
    Cast,
    Dequantize,
    Exp,
    Floor,
    LogicalNot,
    Neg,
    Rsqrt,
    Sqrt,
    Sin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementwiseUnary {
    pub op: ElementwiseUnaryType,
}

impl ElementwiseUnary {
    pub const INPUT: usize = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonType {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub op: ComparisonType,
}

impl Comparison {
    pub const INPUT0: usize = 0;
    pub const INPUT1: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SquaredDifference;

impl SquaredDifference {
    pub const LHS: usize = 0;
    pub const RHS: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PReLU;

impl PReLU {
    pub const INPUT: usize = 0;
    pub const ALPHA: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceType {
    Sum,
    Mean,
    Max,
    Min,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduce {
    pub op: ReduceType,
    pub keep_dims: bool,
}

impl Reduce {
    pub const INPUT: usize = 0;
    pub const AXES: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArgMax;

impl ArgMax {
    pub const INPUT: usize = 0;
    pub const AXIS: usize = 1;
}

/// Variadic inputs stacked along a new `axis`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    pub axis: i32,
}

/// One output per slice along `axis`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unpack {
    pub axis: i32,
}

impl Unpack {
    pub const INPUT: usize = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gather {
    pub axis: i32,
}

impl Gather {
    pub const INPUT: usize = 0;
    pub const INDICES: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub num_splits: usize,
}

impl Split {
    pub const INPUT: usize = 0;
    pub const AXIS: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitV {
    pub num_splits: usize,
}

impl SplitV {
    pub const INPUT: usize = 0;
    pub const SIZE_SPLITS: usize = 1;
    pub const SPLIT_DIM: usize = 2;
}

/// Pad operand is `[rank, 2]` int32 (before, after) pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pad;

impl Pad {
    pub const INPUT: usize = 0;
    pub const PAD: usize = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneHot {
    pub axis: i32,
}

impl OneHot {
    pub const INDICES: usize = 0;
    pub const DEPTH: usize = 1;
    pub const ON_VALUE: usize = 2;
    pub const OFF_VALUE: usize = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthToSpace {
    pub block_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceToDepth {
    pub block_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct L2Normalization;

/// Layout conversion or backend transfer; logical contents are preserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permute {
    pub permute_type: PermuteType,
}

/// Gradient of a mean reduction. Training only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeanGrad;

impl MeanGrad {
    pub const INCOMING: usize = 0;
}

/// Every operation kind with its parameter record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    BinaryArithmetic(BinaryArithmetic),
    Conv2D(Conv2D),
    DepthwiseConv2D(DepthwiseConv2D),
    FullyConnected(FullyConnected),
    Pool2D(Pool2D),
    InstanceNorm(InstanceNorm),
    Concat(Concat),
    Reshape(Reshape),
    Squeeze(Squeeze),
    ExpandDims(ExpandDims),
    Softmax(Softmax),
    Slice(Slice),
    StridedSlice(StridedSlice),
    Transpose(Transpose),
    ElementwiseActivation(ElementwiseActivation),
    ElementwiseBinary(ElementwiseBinary),
    ElementwiseUnary(ElementwiseUnary),
    Comparison(Comparison),
    SquaredDifference(SquaredDifference),
    PReLU(PReLU),
    Reduce(Reduce),
    ArgMax(ArgMax),
    Pack(Pack),
    Unpack(Unpack),
    Gather(Gather),
    Split(Split),
    SplitV(SplitV),
    Pad(Pad),
    OneHot(OneHot),
    DepthToSpace(DepthToSpace),
    SpaceToDepth(SpaceToDepth),
    L2Normalization(L2Normalization),
    Permute(Permute),
    ConvertFp32ToFp16,
    ConvertFp16ToFp32,
    MeanGrad(MeanGrad),
}

/// Parameter-free tag of an [`OpKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    BinaryArithmetic,
    Conv2D,
    DepthwiseConv2D,
    FullyConnected,
    Pool2D,
    InstanceNorm,
    Concat,
    Reshape,
    Squeeze,
    ExpandDims,
    Softmax,
    Slice,
    StridedSlice,
    Transpose,
    ElementwiseActivation,
    ElementwiseBinary,
    ElementwiseUnary,
    Comparison,
    SquaredDifference,
    PReLU,
    Reduce,
    ArgMax,
    Pack,
    Unpack,
    Gather,
    Split,
    SplitV,
    Pad,
    OneHot,
    DepthToSpace,
    SpaceToDepth,
    L2Normalization,
    Permute,
    ConvertFp32ToFp16,
    ConvertFp16ToFp32,
    MeanGrad,
}

impl OpCode {
    pub const ALL: [OpCode; 36] = [
        OpCode::BinaryArithmetic,
        OpCode::Conv2D,
        OpCode::DepthwiseConv2D,
        OpCode::FullyConnected,
        OpCode::Pool2D,
        OpCode::InstanceNorm,
        OpCode::Concat,
        OpCode::Reshape,
        OpCode::Squeeze,
        OpCode::ExpandDims,
        OpCode::Softmax,
        OpCode::Slice,
        OpCode::StridedSlice,
        OpCode::Transpose,
        OpCode::ElementwiseActivation,
        OpCode::ElementwiseBinary,
        OpCode::ElementwiseUnary,
        OpCode::Comparison,
        OpCode::SquaredDifference,
        OpCode::PReLU,
        OpCode::Reduce,
        OpCode::ArgMax,
        OpCode::Pack,
        OpCode::Unpack,
        OpCode::Gather,
        OpCode::Split,
        OpCode::SplitV,
        OpCode::Pad,
        OpCode::OneHot,
        OpCode::DepthToSpace,
        OpCode::SpaceToDepth,
        OpCode::L2Normalization,
        OpCode::Permute,
        OpCode::ConvertFp32ToFp16,
        OpCode::ConvertFp16ToFp32,
        OpCode::MeanGrad,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OpCode::BinaryArithmetic => "BinaryArithmetic",
            OpCode::Conv2D => "Conv2D",
            OpCode::DepthwiseConv2D => "DepthwiseConv2D",
            OpCode::FullyConnected => "FullyConnected",
            OpCode::Pool2D => "Pool2D",
            OpCode::InstanceNorm => "InstanceNorm",
            OpCode::Concat => "Concat",
            OpCode::Reshape => "Reshape",
            OpCode::Squeeze => "Squeeze",
            OpCode::ExpandDims => "ExpandDims",
            OpCode::Softmax => "Softmax",
            OpCode::Slice => "Slice",
            OpCode::StridedSlice => "StridedSlice",
            OpCode::Transpose => "Transpose",
            OpCode::ElementwiseActivation => "ElementwiseActivation",
            OpCode::ElementwiseBinary => "ElementwiseBinary",
            OpCode::ElementwiseUnary => "ElementwiseUnary",
            OpCode::Comparison => "Comparison",
            OpCode::SquaredDifference => "SquaredDifference",
            OpCode::PReLU => "PReLU",
            OpCode::Reduce => "Reduce",
            OpCode::ArgMax => "ArgMax",
            OpCode::Pack => "Pack",
            OpCode::Unpack => "Unpack",
            OpCode::Gather => "Gather",
            OpCode::Split => "Split",
            OpCode::SplitV => "SplitV",
            OpCode::Pad => "Pad",
            OpCode::OneHot => "OneHot",
            OpCode::DepthToSpace => "DepthToSpace",
            OpCode::SpaceToDepth => "SpaceToDepth",
            OpCode::L2Normalization => "L2Normalization",
            OpCode::Permute => "Permute",
            OpCode::ConvertFp32ToFp16 => "ConvertFp32ToFp16",
            OpCode::ConvertFp16ToFp32 => "ConvertFp16ToFp32",
            OpCode::MeanGrad => "MeanGrad",
        }
    }

    pub fn from_name(name: &str) -> Option<OpCode> {
        OpCode::ALL.iter().copied().find(|code| code.name() == name)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl OpKind {
    pub fn code(&self) -> OpCode {
        match self {
            OpKind::BinaryArithmetic(_) => OpCode::BinaryArithmetic,
            OpKind::Conv2D(_) => OpCode::Conv2D,
            OpKind::DepthwiseConv2D(_) => OpCode::DepthwiseConv2D,
            OpKind::FullyConnected(_) => OpCode::FullyConnected,
            OpKind::Pool2D(_) => OpCode::Pool2D,
            OpKind::InstanceNorm(_) => OpCode::InstanceNorm,
            OpKind::Concat(_) => OpCode::Concat,
            OpKind::Reshape(_) => OpCode::Reshape,
            OpKind::Squeeze(_) => OpCode::Squeeze,
            OpKind::ExpandDims(_) => OpCode::ExpandDims,
            OpKind::Softmax(_) => OpCode::Softmax,
            OpKind::Slice(_) => OpCode::Slice,
            OpKind::StridedSlice(_) => OpCode::StridedSlice,
            OpKind::Transpose(_) => OpCode::Transpose,
            OpKind::ElementwiseActivation(_) => OpCode::ElementwiseActivation,
            OpKind::ElementwiseBinary(_) => OpCode::ElementwiseBinary,
            OpKind::ElementwiseUnary(_) => OpCode::ElementwiseUnary,
            OpKind::Comparison(_) => OpCode::Comparison,
            OpKind::SquaredDifference(_) => OpCode::SquaredDifference,
            OpKind::PReLU(_) => OpCode::PReLU,
            OpKind::Reduce(_) => OpCode::Reduce,
            OpKind::ArgMax(_) => OpCode::ArgMax,
            OpKind::Pack(_) => OpCode::Pack,
            OpKind::Unpack(_) => OpCode::Unpack,
            OpKind::Gather(_) => OpCode::Gather,
            OpKind::Split(_) => OpCode::Split,
            OpKind::SplitV(_) => OpCode::SplitV,
            OpKind::Pad(_) => OpCode::Pad,
            OpKind::OneHot(_) => OpCode::OneHot,
            OpKind::DepthToSpace(_) => OpCode::DepthToSpace,
            OpKind::SpaceToDepth(_) => OpCode::SpaceToDepth,
            OpKind::L2Normalization(_) => OpCode::L2Normalization,
            OpKind::Permute(_) => OpCode::Permute,
            OpKind::ConvertFp32ToFp16 => OpCode::ConvertFp32ToFp16,
            OpKind::ConvertFp16ToFp32 => OpCode::ConvertFp16ToFp32,
            OpKind::MeanGrad(_) => OpCode::MeanGrad,
        }
    }

    pub fn name(&self) -> &'static str {
        self.code().name()
    }

    /// Activation of the kinds that always end in a fusion epilogue
    pub fn fused_activation(&self) -> Option<Activation> {
        match self {
            OpKind::Conv2D(p) => Some(p.activation),
            OpKind::DepthwiseConv2D(p) => Some(p.activation),
            OpKind::FullyConnected(p) => Some(p.activation),
            OpKind::Pool2D(p) => Some(p.activation),
            OpKind::InstanceNorm(p) => Some(p.activation),
            _ => None,
        }
    }

    /// Accepted (input, output) counts
    pub fn arity(&self) -> (Arity, Arity) {
        use Arity::*;
        match self {
            OpKind::BinaryArithmetic(_)
            | OpKind::ElementwiseBinary(_)
            | OpKind::Comparison(_)
            | OpKind::SquaredDifference(_)
            | OpKind::PReLU(_)
            | OpKind::Reduce(_)
            | OpKind::ArgMax(_)
            | OpKind::Gather(_)
            | OpKind::ExpandDims(_)
            | OpKind::Transpose(_)
            | OpKind::Pad(_) => (Exactly(2), Exactly(1)),
            OpKind::Conv2D(_) | OpKind::DepthwiseConv2D(_) | OpKind::InstanceNorm(_) => {
                (Exactly(3), Exactly(1))
            }
            OpKind::FullyConnected(_) => (Between(2, 3), Exactly(1)),
            OpKind::Reshape(_) => (Between(1, 2), Exactly(1)),
            OpKind::Slice(_) => (Exactly(3), Exactly(1)),
            OpKind::StridedSlice(_) => (Exactly(4), Exactly(1)),
            OpKind::OneHot(_) => (Exactly(4), Exactly(1)),
            OpKind::Concat(_) | OpKind::Pack(_) => (AtLeast(1), Exactly(1)),
            OpKind::Unpack(_) => (Exactly(1), AtLeast(1)),
            OpKind::Split(p) => (Exactly(2), Exactly(p.num_splits)),
            OpKind::SplitV(p) => (Exactly(3), Exactly(p.num_splits)),
            OpKind::Pool2D(_)
            | OpKind::Squeeze(_)
            | OpKind::Softmax(_)
            | OpKind::ElementwiseActivation(_)
            | OpKind::ElementwiseUnary(_)
            | OpKind::DepthToSpace(_)
            | OpKind::SpaceToDepth(_)
            | OpKind::L2Normalization(_)
            | OpKind::Permute(_)
            | OpKind::ConvertFp32ToFp16
            | OpKind::ConvertFp16ToFp32
            | OpKind::MeanGrad(_) => (Exactly(1), Exactly(1)),
        }
    }
}

/// A graph node
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub inputs: Vec<OperandId>,
    pub outputs: Vec<OperandId>,
}

impl Operation {
    pub fn new(kind: OpKind, inputs: Vec<OperandId>, outputs: Vec<OperandId>) -> Self {
        Self {
            kind,
            inputs,
            outputs,
        }
    }

    pub fn code(&self) -> OpCode {
        self.kind.code()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Input in slot `slot`
    pub fn input(&self, slot: usize) -> Option<OperandId> {
        self.inputs.get(slot).copied()
    }

    pub fn output(&self, slot: usize) -> Option<OperandId> {
        self.outputs.get(slot).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_names_round_trip() {
        for code in OpCode::ALL {
            assert_eq!(OpCode::from_name(code.name()), Some(code));
        }
        assert_eq!(OpCode::from_name("Frobnicate"), None);
    }

    #[test]
    fn test_activation_apply() {
        assert_eq!(Activation::Relu.apply(-2.0), 0.0);
        assert_eq!(Activation::Relu6.apply(7.5), 6.0);
        assert_eq!(Activation::Relu1.apply(-3.0), -1.0);
        assert_eq!(Activation::None.apply(-3.0), -3.0);
        assert!((Activation::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_fused_activation_kinds() {
        let conv = OpKind::Conv2D(Conv2D {
            stride: Stride::default(),
            padding: Padding::Valid,
            dilation: Dilation::default(),
            activation: Activation::Relu,
        });
        assert_eq!(conv.fused_activation(), Some(Activation::Relu));

        let add = OpKind::BinaryArithmetic(BinaryArithmetic {
            op: ArithmeticType::Add,
            activation: Activation::Relu,
        });
        assert_eq!(add.fused_activation(), None);
    }

    #[test]
    fn test_arity() {
        let split = OpKind::Split(Split { num_splits: 3 });
        let (ins, outs) = split.arity();
        assert!(ins.accepts(2));
        assert!(outs.accepts(3));
        assert!(!outs.accepts(2));
        assert!(OpKind::Reshape(Reshape).arity().0.accepts(1));
    }
}
