//! Shared graph builders and run helpers for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use graphforge::backend::{Backend, BackendShape, ComputeBackend, TensorBuilder, TensorRegistry};
use graphforge::exec::IoDescription;
use graphforge::ir::{
    bytes_to_f32, f32_to_bytes, Activation, ArithmeticType, BinaryArithmetic, DataType, Graph, Layout,
    OpKind, OperandId, OperandInfo,
};
use graphforge::CompiledSubgraph;

pub fn add(activation: Activation) -> OpKind {
    OpKind::BinaryArithmetic(BinaryArithmetic {
        op: ArithmeticType::Add,
        activation,
    })
}

pub fn f32_operand(graph: &mut Graph, dims: &[usize]) -> OperandId {
    graph.add_operand(OperandInfo::of(dims, DataType::Float32))
}

/// 0, 1, 2, ... scaled by `scale`
pub fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|v| v as f32 * scale).collect()
}

/// Run `compiled` on float inputs, returning every output as floats
pub fn run_f32(compiled: &CompiledSubgraph, inputs: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let input_bytes: Vec<Vec<u8>> = inputs.iter().map(|v| f32_to_bytes(v)).collect();
    let mut output_bytes: Vec<Vec<u8>> = (0..compiled.output_count())
        .map(|i| vec![0u8; compiled.output_info(i).unwrap().byte_size()])
        .collect();
    {
        let mut io = IoDescription::new();
        for bytes in &input_bytes {
            io = io.with_input(bytes);
        }
        for bytes in output_bytes.iter_mut() {
            io = io.with_output(bytes);
        }
        compiled.execute(&mut io).unwrap();
    }
    output_bytes.iter().map(|b| bytes_to_f32(b)).collect()
}

/// Registry holding every operand of `graph` on a compute backend
pub fn compute_registry(backend: &ComputeBackend, graph: &Graph, physical: Layout) -> TensorRegistry {
    let mut builder = TensorBuilder::new(backend.config());
    for (id, operand) in graph.operands() {
        let info = operand.info().clone();
        match operand.data() {
            Some(data) => builder
                .register_constant(id, info, data.to_vec().into(), graph.layout(), physical)
                .unwrap(),
            None => builder.register(id, info, graph.layout(), physical).unwrap(),
        }
    }
    builder.build().unwrap()
}

/// Reported backend shape of every tensor in `registry`
pub fn shape_snapshot(registry: &TensorRegistry) -> BTreeMap<OperandId, BackendShape> {
    registry
        .iter()
        .map(|(&id, tensor)| (id, tensor.shape_info().unwrap()))
        .collect()
}
