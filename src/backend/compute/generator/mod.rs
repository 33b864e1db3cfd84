//! Kernel generator of the compute backend.
//!
//! Lowers one [`OperationSequence`] into a [`FunctionSequence`]. Every
//! operation kind has an arm in [`KernelGenerator::lower`]; there is no
//! catch-all, so a new kind does not compile until it is accepted or
//! rejected here.
//!
//! Axis-like parameters are remapped to backend coordinates before a
//! kernel sees them. Tensors a kernel must index at full rank are widened
//! with a [`DimCorrectionGuard`] for the duration of configuration.

mod math;
mod movement;

use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::compute::ActivationBuilder;
use crate::backend::shape_guard::ShapeEffect;
use crate::backend::tensor::BackendTensor;
use crate::backend::{BackendConfig, GeneratedSequence, OperationSequence, TensorRegistry};
use crate::error::{ForgeError, ForgeResult};
use crate::exec::{Function, FunctionSequence};
use crate::ir::{Activation, Graph, Layout, OpKind, Operand, OperandId, Operation};

/// Layout state of the sequence being generated, passed to every lowering
/// call instead of living on the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqContext {
    /// Layout operation parameters are expressed in
    pub layout: Layout,
    /// Layout of the tensors this sequence works on
    pub physical: Layout,
}

/// Result of lowering one operation
pub(crate) struct Lowered {
    function: Box<dyn Function>,
    effects: Vec<ShapeEffect>,
}

impl Lowered {
    fn new(function: impl Function + 'static) -> Self {
        Self {
            function: Box::new(function),
            effects: Vec::new(),
        }
    }

    fn boxed(function: Box<dyn Function>) -> Self {
        Self {
            function,
            effects: Vec::new(),
        }
    }

    fn with_effect(mut self, effect: ShapeEffect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Single-use generator for one operation sequence
pub struct KernelGenerator<'a> {
    config: &'a dyn BackendConfig,
    graph: &'a Graph,
    registry: &'a TensorRegistry,
}

impl<'a> KernelGenerator<'a> {
    pub fn new(config: &'a dyn BackendConfig, graph: &'a Graph, registry: &'a TensorRegistry) -> Self {
        Self {
            config,
            graph,
            registry,
        }
    }

    pub fn backend_id(&self) -> &str {
        self.config.id()
    }

    /// Lower every operation of `sequence`, in order
    pub fn generate(self, sequence: &OperationSequence) -> ForgeResult<GeneratedSequence> {
        if sequence.backend != self.backend_id() {
            return Err(ForgeError::InvariantViolation(format!(
                "sequence for backend {} handed to {}",
                sequence.backend,
                self.backend_id()
            )));
        }
        let ctx = SeqContext {
            layout: sequence.layout,
            physical: sequence.physical_layout,
        };
        let mut functions = FunctionSequence::new();
        let mut left_widened = Vec::new();
        for &id in &sequence.operations {
            let op = self.graph.operation(id)?;
            let lowered = self.lower(&ctx, op)?;
            trace!(operation = %id, kind = op.name(), unit = lowered.function.name(), "lowered");
            for effect in lowered.effects {
                let ShapeEffect::LeftWidened { operand } = effect;
                debug!(operand = %operand, kind = op.name(), "tensor left at widened rank");
                left_widened.push(operand);
            }
            functions.push(lowered.function);
        }
        Ok(GeneratedSequence {
            sequence: functions,
            left_widened,
        })
    }

    fn lower(&self, ctx: &SeqContext, op: &Operation) -> ForgeResult<Lowered> {
        let primary = match &op.kind {
            OpKind::BinaryArithmetic(p) => self.binary_arithmetic(op, p)?,
            OpKind::Conv2D(p) => self.conv2d(op, p)?,
            OpKind::DepthwiseConv2D(p) => self.depthwise_conv2d(op, p)?,
            OpKind::FullyConnected(_) => self.fully_connected(op)?,
            OpKind::Pool2D(p) => self.pool2d(op, p)?,
            OpKind::InstanceNorm(p) => self.instance_norm(op, p)?,
            OpKind::Concat(p) => self.concat(ctx, op, p)?,
            OpKind::Reshape(_) => self.reshape(ctx, op)?,
            OpKind::Squeeze(_) => self.squeeze(op)?,
            OpKind::ExpandDims(_) => self.expand_dims(op)?,
            OpKind::Softmax(p) => self.softmax(op, p)?,
            OpKind::Slice(_) => self.slice(ctx, op)?,
            OpKind::StridedSlice(p) => self.strided_slice(ctx, op, p)?,
            OpKind::Transpose(_) => self.transpose(ctx, op)?,
            OpKind::ElementwiseActivation(p) => self.elementwise_activation(op, p)?,
            OpKind::ElementwiseBinary(p) => self.elementwise_binary(op, p)?,
            OpKind::ElementwiseUnary(p) => self.elementwise_unary(op, p)?,
            OpKind::Comparison(p) => self.comparison(op, p)?,
            OpKind::SquaredDifference(_) => self.squared_difference(op)?,
            OpKind::PReLU(_) => self.prelu(op)?,
            OpKind::Reduce(p) => self.reduce(ctx, op, p)?,
            OpKind::ArgMax(_) => self.arg_max(op)?,
            OpKind::Pack(p) => self.pack(op, p)?,
            OpKind::Unpack(p) => self.unpack(op, p)?,
            OpKind::Gather(p) => self.gather(op, p)?,
            OpKind::Split(p) => self.split(op, p)?,
            OpKind::SplitV(p) => self.split_v(op, p)?,
            OpKind::Pad(_) => self.pad(ctx, op)?,
            OpKind::OneHot(p) => self.one_hot(op, p)?,
            OpKind::DepthToSpace(p) => self.depth_to_space(op, p.block_size)?,
            OpKind::SpaceToDepth(p) => self.space_to_depth(op, p.block_size)?,
            OpKind::L2Normalization(_) => self.l2_normalization(op)?,
            OpKind::Permute(_) => self.permute(op)?,
            OpKind::ConvertFp32ToFp16 | OpKind::ConvertFp16ToFp32 => self.convert_fp(op)?,
            OpKind::MeanGrad(_) => {
                return Err(self.unsupported(op, "gradient operations have no inference kernel"))
            }
        };

        match op.kind.fused_activation() {
            Some(activation) => {
                let fused = self.fuse(op, primary.function, activation)?;
                Ok(Lowered {
                    function: Box::new(fused),
                    effects: primary.effects,
                })
            }
            None => Ok(primary),
        }
    }

    /// Primary unit followed by its activation epilogue, both bound to
    /// output 0
    fn fuse(
        &self,
        op: &Operation,
        primary: Box<dyn Function>,
        activation: Activation,
    ) -> ForgeResult<FunctionSequence> {
        let output = self.output(op, 0)?;
        let epilogue = ActivationBuilder::generate(activation, &output)?;
        Ok(FunctionSequence::fused(primary, epilogue))
    }

    // ---- operand access ----

    fn tensor(&self, operand: OperandId) -> ForgeResult<Arc<BackendTensor>> {
        self.registry.get(operand)
    }

    fn input_id(&self, op: &Operation, slot: usize) -> ForgeResult<OperandId> {
        op.input(slot).ok_or_else(|| {
            ForgeError::InvariantViolation(format!("{} has no input in slot {}", op.name(), slot))
        })
    }

    fn input(&self, op: &Operation, slot: usize) -> ForgeResult<Arc<BackendTensor>> {
        self.tensor(self.input_id(op, slot)?)
    }

    fn output(&self, op: &Operation, slot: usize) -> ForgeResult<Arc<BackendTensor>> {
        let id = op.output(slot).ok_or_else(|| {
            ForgeError::InvariantViolation(format!("{} has no output in slot {}", op.name(), slot))
        })?;
        self.tensor(id)
    }

    fn inputs(&self, op: &Operation) -> ForgeResult<Vec<Arc<BackendTensor>>> {
        op.inputs.iter().map(|&id| self.tensor(id)).collect()
    }

    fn outputs(&self, op: &Operation) -> ForgeResult<Vec<Arc<BackendTensor>>> {
        op.outputs.iter().map(|&id| self.tensor(id)).collect()
    }

    /// The operand in `slot`, which this backend needs as a constant
    fn constant(&self, op: &Operation, slot: usize) -> ForgeResult<&Operand> {
        let id = self.input_id(op, slot)?;
        let operand = self.graph.operand(id)?;
        if !operand.is_constant() {
            return Err(ForgeError::NonConstantOperand {
                backend: self.backend_id().to_string(),
                op: op.name().to_string(),
                operand: id,
            });
        }
        Ok(operand)
    }

    fn constant_i32s(&self, op: &Operation, slot: usize) -> ForgeResult<Vec<i32>> {
        self.constant(op, slot)?
            .as_i32_vec()
            .ok_or_else(|| self.unsupported(op, format!("slot {} must be an int32 constant", slot)))
    }

    fn constant_i32(&self, op: &Operation, slot: usize) -> ForgeResult<i32> {
        self.constant(op, slot)?
            .as_i32_scalar()
            .ok_or_else(|| self.unsupported(op, format!("slot {} must be an int32 scalar", slot)))
    }

    fn unsupported(&self, op: &Operation, reason: impl Into<String>) -> ForgeError {
        ForgeError::unsupported(self.backend_id(), op.name(), reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::compute::ComputeBackend;
    use crate::backend::{Backend, TensorBuilder};
    use crate::ir::{
        bytes_to_f32, ArithmeticType, BinaryArithmetic, Conv2D, DataType, DepthwiseConv2D, Dilation,
        FullyConnected, InstanceNorm, OpCode, OperandInfo, OperationId, Padding, Pool2D, PoolType, Stride,
    };

    const FUSABLE: [OpCode; 5] = [
        OpCode::Conv2D,
        OpCode::DepthwiseConv2D,
        OpCode::FullyConnected,
        OpCode::Pool2D,
        OpCode::InstanceNorm,
    ];

    fn registry_for(backend: &ComputeBackend, graph: &Graph, physical: Layout) -> TensorRegistry {
        let mut builder = TensorBuilder::new(backend.config());
        for (id, operand) in graph.operands() {
            let info = operand.info().clone();
            match operand.shared_data() {
                Some(data) => builder
                    .register_constant(id, info, data, graph.layout(), physical)
                    .unwrap(),
                None => builder.register(id, info, graph.layout(), physical).unwrap(),
            }
        }
        builder.build().unwrap()
    }

    fn ctx() -> SeqContext {
        SeqContext {
            layout: Layout::Nhwc,
            physical: Layout::Nchw,
        }
    }

    fn f32_info(dims: &[usize]) -> OperandInfo {
        OperandInfo::of(dims, DataType::Float32)
    }

    /// One fusable operation over a [1, 3, 3, 2] map. Channel 0 of the
    /// weighted kinds ends up negative and channel 1 positive, so an
    /// epilogue that does nothing is visible.
    fn fusable_graph(code: OpCode, activation: Activation) -> (Graph, OperandId, OperandId) {
        let mut graph = Graph::with_layout(Layout::Nhwc);
        let x = graph.add_operand(f32_info(&[1, 3, 3, 2]));
        graph.add_input(x).unwrap();
        let small = |n: usize, scale: f32| -> Vec<f32> {
            (0..n).map(|i| ((i as f32) * 0.9).sin() * scale).collect()
        };

        let (kind, mut inputs, out_dims) = match code {
            OpCode::Conv2D => {
                let k = graph.add_constant_f32(&[2, 2, 2, 2], &small(16, 0.1)).unwrap();
                let b = graph.add_constant_f32(&[2], &[-1.0, 1.0]).unwrap();
                let p = Conv2D {
                    stride: Stride::default(),
                    padding: Padding::Valid,
                    dilation: Dilation::default(),
                    activation,
                };
                (OpKind::Conv2D(p), vec![k, b], vec![1, 2, 2, 2])
            }
            OpCode::DepthwiseConv2D => {
                let k = graph.add_constant_f32(&[1, 2, 2, 2], &small(8, 0.1)).unwrap();
                let b = graph.add_constant_f32(&[2], &[-1.0, 1.0]).unwrap();
                let p = DepthwiseConv2D {
                    stride: Stride::default(),
                    padding: Padding::Valid,
                    dilation: Dilation::default(),
                    multiplier: 1,
                    activation,
                };
                (OpKind::DepthwiseConv2D(p), vec![k, b], vec![1, 2, 2, 2])
            }
            OpCode::FullyConnected => {
                let w = graph.add_constant_f32(&[4, 18], &small(72, 0.05)).unwrap();
                let b = graph.add_constant_f32(&[4], &[-1.0, 1.0, -1.0, 1.0]).unwrap();
                (OpKind::FullyConnected(FullyConnected { activation }), vec![w, b], vec![1, 4])
            }
            OpCode::Pool2D => {
                let p = Pool2D {
                    op: PoolType::Avg,
                    kh: 2,
                    kw: 2,
                    stride: Stride::default(),
                    padding: Padding::Valid,
                    activation,
                };
                (OpKind::Pool2D(p), vec![], vec![1, 2, 2, 2])
            }
            OpCode::InstanceNorm => {
                let gamma = graph.add_constant_f32(&[2], &[1.0, 0.5]).unwrap();
                let beta = graph.add_constant_f32(&[2], &[0.0, 0.1]).unwrap();
                let p = InstanceNorm {
                    epsilon: 1e-5,
                    activation,
                };
                (OpKind::InstanceNorm(p), vec![gamma, beta], vec![1, 3, 3, 2])
            }
            other => panic!("{} takes no epilogue", other.name()),
        };
        inputs.insert(0, x);
        let y = graph.add_operand(f32_info(&out_dims));
        graph.add_operation(kind, inputs, vec![y]).unwrap();
        (graph, x, y)
    }

    /// The primary unit of a fusable operation, without its epilogue
    fn primary(generator: &KernelGenerator<'_>, op: &Operation) -> Lowered {
        match &op.kind {
            OpKind::Conv2D(p) => generator.conv2d(op, p),
            OpKind::DepthwiseConv2D(p) => generator.depthwise_conv2d(op, p),
            OpKind::FullyConnected(_) => generator.fully_connected(op),
            OpKind::Pool2D(p) => generator.pool2d(op, p),
            OpKind::InstanceNorm(p) => generator.instance_norm(op, p),
            _ => panic!("{} takes no epilogue", op.name()),
        }
        .unwrap()
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Stages {
        PrimaryOnly,
        Lowered,
    }

    /// Output bytes of one run, plus the unit names of the fused sequence
    /// when the epilogue was built
    fn run_fusable(code: OpCode, activation: Activation, stages: Stages) -> (Vec<u8>, Vec<String>) {
        let (graph, x, y) = fusable_graph(code, activation);
        let backend = ComputeBackend::new("gpu_cl", Layout::Nchw);
        let registry = registry_for(&backend, &graph, Layout::Nchw);
        let values: Vec<f32> = (0..18).map(|i| (i as f32 - 9.0) * 0.1).collect();
        registry.get(x).unwrap().write_logical_f32(&values).unwrap();

        let generator = KernelGenerator::new(backend.config(), &graph, &registry);
        let op = graph.operation(OperationId(0)).unwrap();
        let mut units = Vec::new();
        match stages {
            Stages::PrimaryOnly => primary(&generator, op).function.run().unwrap(),
            Stages::Lowered => {
                let first = primary(&generator, op).function;
                let mut fused = generator.fuse(op, first, activation).unwrap();
                units = fused.describe();
                fused.run().unwrap();

                // the path the generator actually takes must agree
                let mut lowered = generator.lower(&ctx(), op).unwrap();
                assert_eq!(lowered.function.name(), "FunctionSequence");
                registry.get(x).unwrap().write_logical_f32(&values).unwrap();
                lowered.function.run().unwrap();
            }
        }
        (registry.get(y).unwrap().read_bytes().unwrap(), units)
    }

    #[test]
    fn test_identity_epilogue_is_bit_exact_for_every_fusable_kind() {
        for code in FUSABLE {
            let (plain, _) = run_fusable(code, Activation::None, Stages::PrimaryOnly);
            let (fused, units) = run_fusable(code, Activation::None, Stages::Lowered);
            assert_eq!(fused, plain, "{}", code.name());
            assert_eq!(units.len(), 2, "{}", code.name());
            assert_eq!(units[1], "Nop", "{}", code.name());
        }
    }

    #[test]
    fn test_relu_epilogue_clamps_every_fusable_kind() {
        for code in FUSABLE {
            let (plain, _) = run_fusable(code, Activation::Relu, Stages::PrimaryOnly);
            let (fused, units) = run_fusable(code, Activation::Relu, Stages::Lowered);
            let plain = bytes_to_f32(&plain);
            assert!(plain.iter().any(|&v| v < 0.0), "{}: {:?}", code.name(), plain);
            assert!(plain.iter().any(|&v| v > 0.0), "{}: {:?}", code.name(), plain);

            let expected: Vec<f32> = plain.iter().map(|&v| v.max(0.0)).collect();
            assert_eq!(bytes_to_f32(&fused), expected, "{}", code.name());
            assert_eq!(units[1], "Activation", "{}", code.name());
        }
    }

    #[test]
    fn test_binary_arithmetic_applies_activation_without_epilogue() {
        let (graph, x, y) = add_graph(Activation::Relu);
        assert!(graph.operation(OperationId(0)).unwrap().kind.fused_activation().is_none());

        let backend = ComputeBackend::new("gpu_cl", Layout::Nchw);
        let registry = registry_for(&backend, &graph, Layout::Nchw);
        let values: Vec<f32> = (0..12).map(|v| v as f32 - 4.0).collect();
        registry.get(x).unwrap().write_logical_f32(&values).unwrap();
        let generator = KernelGenerator::new(backend.config(), &graph, &registry);
        let mut lowered = generator.lower(&ctx(), graph.operation(OperationId(0)).unwrap()).unwrap();
        assert_eq!(lowered.function.name(), "Add");
        lowered.function.run().unwrap();

        // x + c = 1.5 i - 7, clamped at zero
        let expected: Vec<f32> = (0..12).map(|i| (1.5 * i as f32 - 7.0).max(0.0)).collect();
        assert_eq!(registry.get(y).unwrap().read_logical_f32().unwrap(), expected);
    }

    /// x + c on a [1, 2, 2, 3] map
    fn add_graph(activation: Activation) -> (Graph, OperandId, OperandId) {
        let mut graph = Graph::with_layout(Layout::Nhwc);
        let info = f32_info(&[1, 2, 2, 3]);
        let x = graph.add_operand(info.clone());
        let c: Vec<f32> = (0..12).map(|v| v as f32 * 0.5 - 3.0).collect();
        let c = graph.add_constant_f32(&[1, 2, 2, 3], &c).unwrap();
        let y = graph.add_operand(info);
        graph.add_input(x).unwrap();
        let kind = OpKind::BinaryArithmetic(BinaryArithmetic {
            op: ArithmeticType::Add,
            activation,
        });
        graph.add_operation(kind, vec![x, c], vec![y]).unwrap();
        (graph, x, y)
    }

    #[test]
    fn test_sequence_for_other_backend_is_rejected() {
        let (graph, _, _) = add_graph(Activation::None);
        let backend = ComputeBackend::new("gpu_cl", Layout::Nchw);
        let registry = registry_for(&backend, &graph, Layout::Nchw);
        let sequence = OperationSequence {
            backend: "cpu_neon".to_string(),
            layout: Layout::Nhwc,
            physical_layout: Layout::Nchw,
            operations: vec![OperationId(0)],
        };
        let err = KernelGenerator::new(backend.config(), &graph, &registry)
            .generate(&sequence)
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Internal);
    }
}
