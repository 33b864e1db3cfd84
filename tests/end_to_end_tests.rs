//! Whole graphs compiled and run on each compute backend. The gpu_cl
//! backend keeps tensors in NCHW and cpu_neon in NHWC, so equal logical
//! results mean axis remapping held up through every kind involved.

mod common;

use common::{f32_operand, ramp};
use graphforge::ir::{
    bytes_to_f32, bytes_to_i32, f32_to_bytes, Activation, ArgMax, Conv2D, DataType, DepthwiseConv2D,
    Dilation, FullyConnected, Graph, InstanceNorm, Layout, OpCode, OpKind, OperandInfo, OperationId, Padding,
    Pool2D, PoolType, Reduce, ReduceType, Softmax, Stride,
};
use graphforge::{compile, CompiledSubgraph, CompilerOptions, ForgeError, IoDescription};

// ============================================================
// Helpers
// ============================================================

/// Raw output bytes of one run
fn run_bytes(compiled: &CompiledSubgraph, input: &[f32]) -> Vec<Vec<u8>> {
    let input = f32_to_bytes(input);
    let mut outputs: Vec<Vec<u8>> = (0..compiled.output_count())
        .map(|i| vec![0u8; compiled.output_info(i).unwrap().byte_size()])
        .collect();
    {
        let mut io = IoDescription::new().with_input(&input);
        for buffer in outputs.iter_mut() {
            io = io.with_output(buffer);
        }
        compiled.execute(&mut io).unwrap();
    }
    outputs
}

fn on(backend: &str) -> CompilerOptions {
    CompilerOptions::new()
        .with_backends(["gpu_cl", "cpu_neon"])
        .with_backend_for_all(backend)
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-5, "element {}: {} vs {}", i, a, e);
    }
}

/// x (1,2,2,3) -> channel sum, softmax, channel argmax, spatial mean
fn reductions_graph() -> Graph {
    let mut graph = Graph::with_layout(Layout::Nhwc);
    let x = f32_operand(&mut graph, &[1, 2, 2, 3]);
    graph.add_input(x).unwrap();

    let channel = graph.add_constant_i32(&[1], &[3]).unwrap();
    let sum = f32_operand(&mut graph, &[1, 2, 2]);
    let kind = OpKind::Reduce(Reduce {
        op: ReduceType::Sum,
        keep_dims: false,
    });
    graph.add_operation(kind, vec![x, channel], vec![sum]).unwrap();

    let soft = f32_operand(&mut graph, &[1, 2, 2, 3]);
    graph
        .add_operation(OpKind::Softmax(Softmax { beta: 1.0 }), vec![x], vec![soft])
        .unwrap();

    let axis = graph.add_scalar_i32(-1).unwrap();
    let arg = graph.add_operand(OperandInfo::of(&[1, 2, 2], DataType::Int32));
    graph.add_operation(OpKind::ArgMax(ArgMax), vec![x, axis], vec![arg]).unwrap();

    let spatial = graph.add_constant_i32(&[2], &[1, 2]).unwrap();
    let mean = f32_operand(&mut graph, &[1, 1, 1, 3]);
    let kind = OpKind::Reduce(Reduce {
        op: ReduceType::Mean,
        keep_dims: true,
    });
    graph.add_operation(kind, vec![x, spatial], vec![mean]).unwrap();

    for output in [sum, soft, arg, mean] {
        graph.add_output(output).unwrap();
    }
    graph
}

fn check_reductions(outputs: &[Vec<u8>]) {
    // pixel p holds channels (3p, 3p+1, 3p+2)
    assert_close(&bytes_to_f32(&outputs[0]), &[3.0, 12.0, 21.0, 30.0]);

    let e: Vec<f32> = [0.0f32, 1.0, 2.0].iter().map(|v| v.exp()).collect();
    let total: f32 = e.iter().sum();
    let row: Vec<f32> = e.iter().map(|v| v / total).collect();
    let expected: Vec<f32> = row.iter().cycle().take(12).copied().collect();
    assert_close(&bytes_to_f32(&outputs[1]), &expected);

    assert_eq!(bytes_to_i32(&outputs[2]), vec![2, 2, 2, 2]);
    assert_close(&bytes_to_f32(&outputs[3]), &[4.5, 5.5, 6.5]);
}

// ============================================================
// Same graph, different physical layouts
// ============================================================

#[test]
fn test_reductions_agree_across_backends() {
    let graph = reductions_graph();
    let input = ramp(12, 1.0);

    let gpu = run_bytes(&compile(&graph, on("gpu_cl")).unwrap(), &input);
    let cpu = run_bytes(&compile(&graph, on("cpu_neon")).unwrap(), &input);

    check_reductions(&gpu);
    check_reductions(&cpu);
    assert_eq!(gpu, cpu);
}

#[test]
fn test_mixed_backend_assignment() {
    let graph = reductions_graph();
    let input = ramp(12, 1.0);

    // softmax by opcode, argmax by index, everything else on gpu_cl
    let options = on("gpu_cl")
        .with_opcode_backend(OpCode::Softmax, "cpu_neon")
        .with_index_backend(OperationId(2), "cpu_neon");
    let compiled = compile(&graph, options).unwrap();
    assert!(compiled.sequence_count() > 2);

    let outputs = run_bytes(&compiled, &input);
    check_reductions(&outputs);
}

#[test]
fn test_default_backend_is_first_in_list() {
    let graph = reductions_graph();
    let options = CompilerOptions::new().with_backends(["cpu_neon"]);
    let outputs = run_bytes(&compile(&graph, options).unwrap(), &ramp(12, 1.0));
    check_reductions(&outputs);
}

// ============================================================
// Fused convolution
// ============================================================

/// 1x1 convolution with a relu epilogue
fn pointwise_conv_graph() -> Graph {
    let mut graph = Graph::with_layout(Layout::Nhwc);
    let x = f32_operand(&mut graph, &[1, 2, 2, 3]);
    graph.add_input(x).unwrap();
    // out0 = c0, out1 = c1 + c2
    let kernel = graph
        .add_constant_f32(&[2, 1, 1, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0])
        .unwrap();
    let bias = graph.add_constant_f32(&[2], &[0.5, -10.0]).unwrap();
    let y = f32_operand(&mut graph, &[1, 2, 2, 2]);
    let kind = OpKind::Conv2D(Conv2D {
        stride: Stride::default(),
        padding: Padding::Valid,
        dilation: Dilation::default(),
        activation: Activation::Relu,
    });
    graph.add_operation(kind, vec![x, kernel, bias], vec![y]).unwrap();
    graph.add_output(y).unwrap();
    graph
}

#[test]
fn test_fused_conv_agrees_across_backends() {
    let graph = pointwise_conv_graph();
    let input = ramp(12, 1.0);
    // pixel p: (3p + 0.5, relu(6p + 3 - 10))
    let expected = [0.5, 0.0, 3.5, 0.0, 6.5, 5.0, 9.5, 11.0];

    for backend in ["gpu_cl", "cpu_neon"] {
        let compiled = compile(&graph, on(backend)).unwrap();
        let outputs = run_bytes(&compiled, &input);
        assert_close(&bytes_to_f32(&outputs[0]), &expected);

        let units: Vec<String> = (0..compiled.sequence_count())
            .flat_map(|i| compiled.describe_sequence(i).unwrap())
            .collect();
        // the convolution and its epilogue form one nested unit
        assert!(units.iter().any(|u| u == "FunctionSequence"), "{}: {:?}", backend, units);
    }
}

/// One fusable operation on a (1,3,3,2) map; weighted kinds get a
/// negative bias on channel 0 and a positive one on channel 1
fn fusable_graph(code: OpCode, activation: Activation) -> Graph {
    let mut graph = Graph::with_layout(Layout::Nhwc);
    let x = f32_operand(&mut graph, &[1, 3, 3, 2]);
    graph.add_input(x).unwrap();
    let weights = |n: usize, scale: f32| -> Vec<f32> { (0..n).map(|i| (i as f32 * 1.3).cos() * scale).collect() };

    let (kind, extra, out_dims): (OpKind, Vec<_>, Vec<usize>) = match code {
        OpCode::Conv2D => (
            OpKind::Conv2D(Conv2D {
                stride: Stride::default(),
                padding: Padding::Valid,
                dilation: Dilation::default(),
                activation,
            }),
            vec![
                graph.add_constant_f32(&[2, 2, 2, 2], &weights(16, 0.1)).unwrap(),
                graph.add_constant_f32(&[2], &[-1.0, 1.0]).unwrap(),
            ],
            vec![1, 2, 2, 2],
        ),
        OpCode::DepthwiseConv2D => (
            OpKind::DepthwiseConv2D(DepthwiseConv2D {
                stride: Stride::default(),
                padding: Padding::Valid,
                dilation: Dilation::default(),
                multiplier: 1,
                activation,
            }),
            vec![
                graph.add_constant_f32(&[1, 2, 2, 2], &weights(8, 0.1)).unwrap(),
                graph.add_constant_f32(&[2], &[-1.0, 1.0]).unwrap(),
            ],
            vec![1, 2, 2, 2],
        ),
        OpCode::FullyConnected => (
            OpKind::FullyConnected(FullyConnected { activation }),
            vec![
                graph.add_constant_f32(&[3, 18], &weights(54, 0.05)).unwrap(),
                graph.add_constant_f32(&[3], &[-1.0, 1.0, -1.0]).unwrap(),
            ],
            vec![1, 3],
        ),
        OpCode::Pool2D => (
            OpKind::Pool2D(Pool2D {
                op: PoolType::Avg,
                kh: 2,
                kw: 2,
                stride: Stride::default(),
                padding: Padding::Valid,
                activation,
            }),
            vec![],
            vec![1, 2, 2, 2],
        ),
        OpCode::InstanceNorm => (
            OpKind::InstanceNorm(InstanceNorm {
                epsilon: 1e-5,
                activation,
            }),
            vec![
                graph.add_constant_f32(&[2], &[2.0, 0.5]).unwrap(),
                graph.add_constant_f32(&[2], &[0.0, 0.25]).unwrap(),
            ],
            vec![1, 3, 3, 2],
        ),
        other => panic!("{} takes no epilogue", other.name()),
    };
    let y = f32_operand(&mut graph, &out_dims);
    let mut inputs = vec![x];
    inputs.extend(extra);
    graph.add_operation(kind, inputs, vec![y]).unwrap();
    graph.add_output(y).unwrap();
    graph
}

#[test]
fn test_every_fusable_kind_applies_its_epilogue_on_both_layouts() {
    // (1,3,3,2) values in [-0.9, 0.8]
    let input: Vec<f32> = (0..18).map(|i| (i as f32 - 9.0) * 0.1).collect();
    let cases = [
        (OpCode::Conv2D, Activation::Relu),
        (OpCode::DepthwiseConv2D, Activation::Relu),
        (OpCode::FullyConnected, Activation::Relu),
        (OpCode::Pool2D, Activation::Relu6),
        (OpCode::InstanceNorm, Activation::Relu1),
    ];

    for (code, activation) in cases {
        let mut per_backend = Vec::new();
        for backend in ["gpu_cl", "cpu_neon"] {
            let plain = compile(&fusable_graph(code, Activation::None), on(backend)).unwrap();
            let fused = compile(&fusable_graph(code, activation), on(backend)).unwrap();
            for compiled in [&plain, &fused] {
                let units: Vec<String> = (0..compiled.sequence_count())
                    .flat_map(|i| compiled.describe_sequence(i).unwrap())
                    .collect();
                assert!(units.iter().any(|u| u == "FunctionSequence"), "{}: {:?}", code.name(), units);
            }

            let plain = bytes_to_f32(&run_bytes(&plain, &input)[0]);
            let fused = run_bytes(&fused, &input).remove(0);
            let (lo, hi) = activation.clamp_range().unwrap();
            assert!(plain.iter().any(|&v| v < lo || v > hi), "{} on {}: {:?}", code.name(), backend, plain);
            let expected: Vec<f32> = plain.iter().map(|&v| activation.apply(v)).collect();
            assert_eq!(bytes_to_f32(&fused), expected, "{} on {}", code.name(), backend);
            per_backend.push(bytes_to_f32(&fused));
        }
        assert_close(&per_backend[0], &per_backend[1]);
    }
}

// ============================================================
// Half precision
// ============================================================

/// x -> fp16 -> fp32, with the fp16 intermediate exposed as a second output
fn fp16_round_trip_graph() -> Graph {
    let mut graph = Graph::with_layout(Layout::Nhwc);
    let x = f32_operand(&mut graph, &[1, 2, 2, 3]);
    let half = graph.add_operand(OperandInfo::of(&[1, 2, 2, 3], DataType::Float16));
    let y = f32_operand(&mut graph, &[1, 2, 2, 3]);
    graph.add_input(x).unwrap();
    graph
        .add_operation(OpKind::ConvertFp32ToFp16, vec![x], vec![half])
        .unwrap();
    graph
        .add_operation(OpKind::ConvertFp16ToFp32, vec![half], vec![y])
        .unwrap();
    graph.add_output(y).unwrap();
    graph.add_output(half).unwrap();
    graph
}

#[test]
fn test_fp16_conversions_run_when_enabled() {
    let input: Vec<f32> = (0..12).map(|i| i as f32 / 3.0 - 1.7).collect();
    let rounded: Vec<f32> = input.iter().map(|&v| half::f16::from_f32(v).to_f32()).collect();
    let half_bytes: Vec<u8> = input
        .iter()
        .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
        .collect();
    assert_ne!(rounded, input);

    for backend in ["gpu_cl", "cpu_neon"] {
        let options = on(backend).with_fp16_backend(backend);
        let compiled = compile(&fp16_round_trip_graph(), options).unwrap();
        assert_eq!(compiled.output_info(1).unwrap().byte_size(), 24);

        let outputs = run_bytes(&compiled, &input);
        assert_eq!(bytes_to_f32(&outputs[0]), rounded, "{}", backend);
        assert_eq!(outputs[1], half_bytes, "{}", backend);
    }
}

#[test]
fn test_fp16_operands_rejected_without_opt_in() {
    // fp16 on the other backend does not help this one
    let options = on("gpu_cl").with_fp16_backend("cpu_neon");
    let err = compile(&fp16_round_trip_graph(), options).unwrap_err();
    match &err {
        ForgeError::Unsupported { backend, op, .. } => {
            assert_eq!(backend, "gpu_cl");
            assert_eq!(op, "ConvertFp32ToFp16");
        }
        other => panic!("expected Unsupported, got {}", other),
    }
    assert!(err.is_recoverable());
}
