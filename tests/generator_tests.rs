//! Compute-backend generator behaviour observed through the public API:
//! reported ranks around generation, constant requirements and sub-tensor
//! elimination.

mod common;

use std::collections::BTreeMap;

use common::{add, compute_registry, f32_operand, ramp, run_f32, shape_snapshot};
use graphforge::backend::{Backend, ComputeBackend, OperationSequence, TensorRegistries};
use graphforge::ir::{
    Activation, Concat, DataType, Gather, Graph, Layout, MeanGrad, OneHot, OpKind, OperandId,
    OperandInfo, OperationId, Pack, Pad, Reduce, ReduceType, Reshape, Softmax, Split, SplitV,
    StridedSlice, Transpose, Unpack,
};
use graphforge::{compile, CompilerOptions, ErrorCategory, ForgeError, ForgeResult};

// ============================================================
// Helpers
// ============================================================

fn gpu() -> ComputeBackend {
    ComputeBackend::new("gpu_cl", Layout::Nchw)
}

fn nhwc_graph() -> Graph {
    Graph::with_layout(Layout::Nhwc)
}

/// Generate the single operation of `graph` on gpu_cl and report the
/// shapes before and after, plus the tensors left widened.
struct Generated {
    before: BTreeMap<OperandId, graphforge::backend::BackendShape>,
    after: BTreeMap<OperandId, graphforge::backend::BackendShape>,
    left_widened: Vec<OperandId>,
}

fn generate_first(graph: &Graph) -> ForgeResult<Generated> {
    let backend = gpu();
    let registry = compute_registry(&backend, graph, Layout::Nchw);
    let before = shape_snapshot(&registry);
    let mut registries = TensorRegistries::new();
    registries.insert(registry);

    let sequence = OperationSequence {
        backend: "gpu_cl".to_string(),
        layout: Layout::Nhwc,
        physical_layout: Layout::Nchw,
        operations: vec![OperationId(0)],
    };
    let generated = backend.generate(graph, &registries, &sequence)?;
    let after = shape_snapshot(registries.get("gpu_cl")?);
    Ok(Generated {
        before,
        after,
        left_widened: generated.left_widened,
    })
}

fn assert_restored(name: &str, graph: &Graph) {
    let generated = generate_first(graph).unwrap_or_else(|e| panic!("{}: {}", name, e));
    assert!(generated.left_widened.is_empty(), "{} left tensors widened", name);
    assert_eq!(generated.before, generated.after, "{} changed a reported shape", name);
}

// ============================================================
// Reported rank is restored after generation
// ============================================================

#[test]
fn test_add_restores_ranks() {
    let mut graph = nhwc_graph();
    let a = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let b = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let c = f32_operand(&mut graph, &[1, 1, 2, 3]);
    graph.add_operation(add(Activation::Relu), vec![a, b], vec![c]).unwrap();
    assert_restored("Add", &graph);
}

#[test]
fn test_softmax_restores_ranks() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 1, 4]);
    let y = f32_operand(&mut graph, &[1, 1, 1, 4]);
    graph
        .add_operation(OpKind::Softmax(Softmax { beta: 1.0 }), vec![x], vec![y])
        .unwrap();
    assert_restored("Softmax", &graph);
}

#[test]
fn test_reduce_restores_ranks() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let axes = graph.add_constant_i32(&[1], &[3]).unwrap();
    let y = f32_operand(&mut graph, &[1, 1, 2, 1]);
    let kind = OpKind::Reduce(Reduce {
        op: ReduceType::Sum,
        keep_dims: true,
    });
    graph.add_operation(kind, vec![x, axes], vec![y]).unwrap();
    assert_restored("Reduce", &graph);
}

#[test]
fn test_pack_and_unpack_restore_ranks() {
    let mut graph = nhwc_graph();
    let a = f32_operand(&mut graph, &[1, 3]);
    let b = f32_operand(&mut graph, &[1, 3]);
    let packed = f32_operand(&mut graph, &[2, 1, 3]);
    graph
        .add_operation(OpKind::Pack(Pack { axis: 0 }), vec![a, b], vec![packed])
        .unwrap();
    assert_restored("Pack", &graph);

    let mut graph = nhwc_graph();
    let packed = f32_operand(&mut graph, &[2, 1, 3]);
    let a = f32_operand(&mut graph, &[1, 3]);
    let b = f32_operand(&mut graph, &[1, 3]);
    graph
        .add_operation(OpKind::Unpack(Unpack { axis: 0 }), vec![packed], vec![a, b])
        .unwrap();
    assert_restored("Unpack", &graph);
}

#[test]
fn test_gather_restores_ranks() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 4]);
    let indices = graph.add_constant_i32(&[2], &[3, 0]).unwrap();
    let y = f32_operand(&mut graph, &[1, 1, 2]);
    graph
        .add_operation(OpKind::Gather(Gather { axis: 2 }), vec![x, indices], vec![y])
        .unwrap();
    assert_restored("Gather", &graph);
}

#[test]
fn test_split_and_split_v_restore_ranks() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 4]);
    let axis = graph.add_scalar_i32(2).unwrap();
    let a = f32_operand(&mut graph, &[1, 1, 2]);
    let b = f32_operand(&mut graph, &[1, 1, 2]);
    graph
        .add_operation(OpKind::Split(Split { num_splits: 2 }), vec![x, axis], vec![a, b])
        .unwrap();
    assert_restored("Split", &graph);

    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 4]);
    let sizes = graph.add_constant_i32(&[2], &[1, 3]).unwrap();
    let dim = graph.add_scalar_i32(2).unwrap();
    let a = f32_operand(&mut graph, &[1, 1, 1]);
    let b = f32_operand(&mut graph, &[1, 1, 3]);
    graph
        .add_operation(OpKind::SplitV(SplitV { num_splits: 2 }), vec![x, sizes, dim], vec![a, b])
        .unwrap();
    assert_restored("SplitV", &graph);
}

#[test]
fn test_strided_slice_restores_ranks() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let starts = graph.add_constant_i32(&[4], &[0, 0, 0, 0]).unwrap();
    let ends = graph.add_constant_i32(&[4], &[1, 1, 2, 3]).unwrap();
    let strides = graph.add_constant_i32(&[4], &[1, 1, 1, 2]).unwrap();
    let y = f32_operand(&mut graph, &[1, 1, 2, 2]);
    graph
        .add_operation(
            OpKind::StridedSlice(StridedSlice::default()),
            vec![x, starts, ends, strides],
            vec![y],
        )
        .unwrap();
    assert_restored("StridedSlice", &graph);
}

#[test]
fn test_strided_slice_beyond_mask_width_is_unsupported() {
    let mut graph = nhwc_graph();
    let mut dims = vec![1; 33];
    dims[32] = 2;
    let x = f32_operand(&mut graph, &dims);
    let starts = graph.add_constant_i32(&[33], &[0; 33]).unwrap();
    let ends = graph.add_constant_i32(&[33], &[1; 33]).unwrap();
    let strides = graph.add_constant_i32(&[33], &[1; 33]).unwrap();
    let y = f32_operand(&mut graph, &[1; 33]);
    let slice = StridedSlice {
        begin_mask: 1,
        end_mask: 0,
        shrink_axis_mask: 0,
    };
    graph
        .add_operation(OpKind::StridedSlice(slice), vec![x, starts, ends, strides], vec![y])
        .unwrap();

    match generate_first(&graph) {
        Err(err @ ForgeError::Unsupported { .. }) => assert!(err.to_string().contains("rank 33")),
        other => panic!("expected Unsupported, got {:?}", other.err()),
    }
}

#[test]
fn test_transpose_and_concat_restore_ranks() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let perm = graph.add_constant_i32(&[4], &[0, 3, 1, 2]).unwrap();
    let y = f32_operand(&mut graph, &[1, 3, 1, 2]);
    graph
        .add_operation(OpKind::Transpose(Transpose), vec![x, perm], vec![y])
        .unwrap();
    assert_restored("Transpose", &graph);

    let mut graph = nhwc_graph();
    let a = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let b = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let y = f32_operand(&mut graph, &[1, 1, 2, 6]);
    graph
        .add_operation(OpKind::Concat(Concat { axis: 3 }), vec![a, b], vec![y])
        .unwrap();
    assert_restored("Concat", &graph);
}

#[test]
fn test_one_hot_restores_ranks() {
    let mut graph = nhwc_graph();
    let indices = graph.add_operand(OperandInfo::of(&[1, 2], DataType::Int32));
    let depth = graph.add_scalar_i32(3).unwrap();
    let on = graph.add_constant_f32(&[1], &[1.0]).unwrap();
    let off = graph.add_constant_f32(&[1], &[0.0]).unwrap();
    let y = f32_operand(&mut graph, &[1, 2, 3]);
    graph
        .add_operation(
            OpKind::OneHot(OneHot { axis: -1 }),
            vec![indices, depth, on, off],
            vec![y],
        )
        .unwrap();
    assert_restored("OneHot", &graph);
}

#[test]
fn test_pad_leaves_input_widened() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 1, 2, 3]);
    let pads = graph
        .add_constant_i32(&[4, 2], &[0, 0, 0, 0, 1, 1, 0, 0])
        .unwrap();
    let y = f32_operand(&mut graph, &[1, 1, 4, 3]);
    graph.add_operation(OpKind::Pad(Pad), vec![x, pads], vec![y]).unwrap();

    let generated = generate_first(&graph).unwrap();
    assert_eq!(generated.left_widened, vec![x]);

    // NCHW backend dims of (1,1,2,3) are [2,1,3,1]; correction reports 3
    assert_eq!(generated.before[&x].num_dimensions(), 3);
    assert_eq!(generated.after[&x].num_dimensions(), 4);
    assert_eq!(generated.after[&x].dims, vec![2, 1, 3, 1]);

    // nothing else moved
    for (id, shape) in &generated.before {
        if *id != x {
            assert_eq!(&generated.after[id], shape, "operand {} changed", id);
        }
    }
}

// ============================================================
// Rejections
// ============================================================

#[test]
fn test_gradient_kind_is_unsupported() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 4]);
    let y = f32_operand(&mut graph, &[1, 4]);
    graph.add_operation(OpKind::MeanGrad(MeanGrad), vec![x], vec![y]).unwrap();

    let err = generate_first(&graph).err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Unsupported);
    assert!(err.is_recoverable());
}

#[test]
fn test_reshape_needs_constant_shape() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[2, 6]);
    let shape = graph.add_operand(OperandInfo::of(&[2], DataType::Int32));
    let y = f32_operand(&mut graph, &[3, 4]);
    graph
        .add_operation(OpKind::Reshape(Reshape), vec![x, shape], vec![y])
        .unwrap();

    match generate_first(&graph) {
        Err(ForgeError::NonConstantOperand { operand, .. }) => assert_eq!(operand, shape),
        other => panic!("expected NonConstantOperand, got {:?}", other.err()),
    }
}

#[test]
fn test_rank4_reshape_across_layouts_is_unsupported() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[1, 2, 2, 3]);
    let shape = graph.add_constant_i32(&[2], &[1, 12]).unwrap();
    let y = f32_operand(&mut graph, &[1, 12]);
    graph
        .add_operation(OpKind::Reshape(Reshape), vec![x, shape], vec![y])
        .unwrap();

    let err = generate_first(&graph).err().unwrap();
    assert!(matches!(err, ForgeError::Unsupported { .. }), "{}", err);
}

#[test]
fn test_rank2_reshape_across_layouts_is_a_copy() {
    let mut graph = nhwc_graph();
    let x = f32_operand(&mut graph, &[2, 6]);
    let shape = graph.add_constant_i32(&[2], &[3, 4]).unwrap();
    let y = f32_operand(&mut graph, &[3, 4]);
    graph
        .add_operation(OpKind::Reshape(Reshape), vec![x, shape], vec![y])
        .unwrap();
    assert_restored("Reshape", &graph);
}

// ============================================================
// Sub-tensor elimination
// ============================================================

/// concat(a + b, a + a) along channels, on gpu_cl
fn concat_graph() -> Graph {
    let mut graph = nhwc_graph();
    let a = f32_operand(&mut graph, &[1, 2, 2, 3]);
    let b = f32_operand(&mut graph, &[1, 2, 2, 3]);
    let x = f32_operand(&mut graph, &[1, 2, 2, 3]);
    let y = f32_operand(&mut graph, &[1, 2, 2, 3]);
    let z = f32_operand(&mut graph, &[1, 2, 2, 6]);
    graph.add_input(a).unwrap();
    graph.add_input(b).unwrap();
    graph.add_operation(add(Activation::None), vec![a, b], vec![x]).unwrap();
    graph.add_operation(add(Activation::None), vec![a, a], vec![y]).unwrap();
    graph
        .add_operation(OpKind::Concat(Concat { axis: 3 }), vec![x, y], vec![z])
        .unwrap();
    graph.add_output(z).unwrap();
    graph
}

fn unit_names(compiled: &graphforge::CompiledSubgraph) -> Vec<String> {
    (0..compiled.sequence_count())
        .flat_map(|i| compiled.describe_sequence(i).unwrap())
        .collect()
}

#[test]
fn test_sub_tensor_concat_matches_explicit_copy() {
    let graph = concat_graph();
    let options = CompilerOptions::new().with_backends(["gpu_cl"]);
    let aliased = compile(&graph, options.clone().with_sub_tensors(true)).unwrap();
    let copied = compile(&graph, options.with_sub_tensors(false)).unwrap();

    let inputs = vec![ramp(12, 1.0), ramp(12, 0.5)];
    let with_alias = run_f32(&aliased, &inputs);
    let without = run_f32(&copied, &inputs);
    assert_eq!(with_alias, without);

    // pixel 0: channels (a+b)[0..3] then (a+a)[0..3]
    assert_eq!(&with_alias[0][..6], &[0.0, 1.5, 3.0, 0.0, 2.0, 4.0]);

    assert!(unit_names(&aliased).iter().any(|n| n == "Nop"));
    assert!(!unit_names(&copied).iter().any(|n| n == "Nop"));
    assert!(unit_names(&copied).iter().any(|n| n == "Concat"));
}
