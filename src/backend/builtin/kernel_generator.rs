use tracing::debug;

use crate::backend::builtin::{PermuteLayer, BUILTIN_BACKEND_ID};
use crate::backend::{GeneratedSequence, OperationSequence, TensorRegistries};
use crate::error::{ForgeError, ForgeResult};
use crate::exec::{Function, FunctionSequence};
use crate::ir::{Graph, OpKind, Operation};

/// Generator for sequences assigned to the builtin backend.
///
/// Only Permute has a builtin kernel. Its operands are looked up across
/// every registry since the two sides usually belong to different backends.
pub struct BuiltinKernelGenerator<'a> {
    graph: &'a Graph,
    registries: &'a TensorRegistries,
}

impl<'a> BuiltinKernelGenerator<'a> {
    pub fn new(graph: &'a Graph, registries: &'a TensorRegistries) -> Self {
        Self { graph, registries }
    }

    pub fn generate(self, sequence: &OperationSequence) -> ForgeResult<GeneratedSequence> {
        let mut functions = FunctionSequence::new();
        functions.enable_dynamic_shape_check(true);
        for &id in &sequence.operations {
            let op = self.graph.operation(id)?;
            functions.push(self.lower(op)?);
        }
        debug!(units = functions.len(), "generated builtin sequence");
        Ok(GeneratedSequence {
            sequence: functions,
            left_widened: Vec::new(),
        })
    }

    fn lower(&self, op: &Operation) -> ForgeResult<Box<dyn Function>> {
        let reject = || -> ForgeResult<Box<dyn Function>> {
            Err(ForgeError::unsupported(
                BUILTIN_BACKEND_ID,
                op.name(),
                "the builtin backend only runs Permute",
            ))
        };
        match &op.kind {
            OpKind::Permute(_) => {
                let (input, output) = match (op.input(0), op.output(0)) {
                    (Some(i), Some(o)) => (i, o),
                    _ => return Err(crate::invariant!("Permute without operands")),
                };
                Ok(Box::new(PermuteLayer::configure(
                    self.registries.find(input)?,
                    self.registries.find(output)?,
                )?))
            }
            OpKind::BinaryArithmetic(_)
            | OpKind::Conv2D(_)
            | OpKind::DepthwiseConv2D(_)
            | OpKind::FullyConnected(_)
            | OpKind::Pool2D(_)
            | OpKind::InstanceNorm(_)
            | OpKind::Concat(_)
            | OpKind::Reshape(_)
            | OpKind::Squeeze(_)
            | OpKind::ExpandDims(_)
            | OpKind::Softmax(_)
            | OpKind::Slice(_)
            | OpKind::StridedSlice(_)
            | OpKind::Transpose(_)
            | OpKind::ElementwiseActivation(_)
            | OpKind::ElementwiseBinary(_)
            | OpKind::ElementwiseUnary(_)
            | OpKind::Comparison(_)
            | OpKind::SquaredDifference(_)
            | OpKind::PReLU(_)
            | OpKind::Reduce(_)
            | OpKind::ArgMax(_)
            | OpKind::Pack(_)
            | OpKind::Unpack(_)
            | OpKind::Gather(_)
            | OpKind::Split(_)
            | OpKind::SplitV(_)
            | OpKind::Pad(_)
            | OpKind::OneHot(_)
            | OpKind::DepthToSpace(_)
            | OpKind::SpaceToDepth(_)
            | OpKind::L2Normalization(_)
            | OpKind::ConvertFp32ToFp16
            | OpKind::ConvertFp16ToFp32
            | OpKind::MeanGrad(_) => reject(),
        }
    }
}
