//! Executor Benchmark Suite
//!
//! Compile and execute timings for a small convolution block:
//! - compile time per backend
//! - execute time, linear vs parallel executor
//! - cost of the layout transfers around a non-NHWC backend
//!
//! Run with: `cargo bench --bench executor_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use graphforge::ir::{
    f32_to_bytes, Activation, ArithmeticType, BinaryArithmetic, Concat, Conv2D, DataType, Dilation, Graph,
    Layout, OpKind, OperandInfo, OperationId, Padding, Stride,
};
use graphforge::{compile, CompiledSubgraph, CompilerOptions, ExecutionMode, IoDescription};

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run_time<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        if self.durations.is_empty() {
            println!("\n=== {} === (no samples)", self.name);
            return;
        }
        let mut sorted = self.durations.clone();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let avg = total / sorted.len() as u32;
        let p50 = sorted[sorted.len() / 2];
        let p95 = sorted[(sorted.len() * 95) / 100];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", sorted.len());
        println!("Average: {:?} ({:.3} ms)", avg, avg.as_secs_f64() * 1000.0);
        println!("Min:     {:?}", sorted[0]);
        println!("Max:     {:?}", sorted[sorted.len() - 1]);
        println!("P50:     {:?}", p50);
        println!("P95:     {:?}", p95);
    }
}

// ============================================================================
// Test Graph
// ============================================================================

const HW: usize = 16;
const CHANNELS: usize = 8;

/// Two 3x3 convolution branches over one input, concatenated and summed
/// with the input
fn conv_block() -> Graph {
    let mut graph = Graph::with_layout(Layout::Nhwc);
    let feature = |c| OperandInfo::of(&[1, HW, HW, c], DataType::Float32);
    let x = graph.add_operand(feature(CHANNELS));
    graph.add_input(x).expect("input");

    let half = CHANNELS / 2;
    let mut branches = Vec::new();
    for branch in 0..2 {
        let weights: Vec<f32> = (0..half * 9 * CHANNELS)
            .map(|i| ((i + branch) as f32 * 0.37).sin() * 0.1)
            .collect();
        let kernel = graph
            .add_constant_f32(&[half, 3, 3, CHANNELS], &weights)
            .expect("kernel");
        let bias = graph.add_constant_f32(&[half], &vec![0.01; half]).expect("bias");
        let out = graph.add_operand(feature(half));
        let conv = OpKind::Conv2D(Conv2D {
            stride: Stride::default(),
            padding: Padding::Same,
            dilation: Dilation::default(),
            activation: Activation::Relu,
        });
        graph.add_operation(conv, vec![x, kernel, bias], vec![out]).expect("conv");
        branches.push(out);
    }

    let joined = graph.add_operand(feature(CHANNELS));
    graph
        .add_operation(OpKind::Concat(Concat { axis: 3 }), branches, vec![joined])
        .expect("concat");
    let y = graph.add_operand(feature(CHANNELS));
    let add = OpKind::BinaryArithmetic(BinaryArithmetic {
        op: ArithmeticType::Add,
        activation: Activation::None,
    });
    graph.add_operation(add, vec![joined, x], vec![y]).expect("add");
    graph.add_output(y).expect("output");
    graph
}

fn input_bytes() -> Vec<u8> {
    let values: Vec<f32> = (0..HW * HW * CHANNELS).map(|i| (i as f32 * 0.01).cos()).collect();
    f32_to_bytes(&values)
}

fn execute_once(compiled: &CompiledSubgraph, input: &[u8], output: &mut [u8]) {
    let mut io = IoDescription::new().with_input(input).with_output(output);
    if let Err(e) = compiled.execute(&mut io) {
        eprintln!("execute failed: {}", e);
    }
}

// ============================================================================
// Benchmarks
// ============================================================================

fn benchmark_compile() {
    println!("\n[Compile]");
    println!("=========");

    let graph = conv_block();
    for backend in ["gpu_cl", "cpu_neon"] {
        let options = CompilerOptions::new().with_backends([backend]);
        let bench = Benchmark::new(&format!("compile on {}", backend), 50);
        let result = bench.run_time(|| compile(&graph, options.clone()).is_ok());
        result.report();
    }
}

fn benchmark_execute() {
    println!("\n[Execute]");
    println!("=========");

    let graph = conv_block();
    let input = input_bytes();
    let mut output = vec![0u8; HW * HW * CHANNELS * 4];

    let cases = [
        ("cpu_neon, linear", CompilerOptions::new().with_backends(["cpu_neon"])),
        ("gpu_cl, linear", CompilerOptions::new().with_backends(["gpu_cl"])),
        (
            "gpu_cl, no sub-tensors",
            CompilerOptions::new().with_backends(["gpu_cl"]).with_sub_tensors(false),
        ),
        (
            "branches split across backends, parallel",
            CompilerOptions::new()
                .with_backends(["gpu_cl", "cpu_neon"])
                .with_index_backend(OperationId(1), "cpu_neon")
                .with_executor(ExecutionMode::Parallel),
        ),
    ];

    for (name, options) in cases {
        let compiled = match compile(&graph, options) {
            Ok(c) => c,
            Err(e) => {
                println!("{}: compile failed: {}", name, e);
                continue;
            }
        };
        let bench = Benchmark::new(name, 100);
        let result = bench.run_time(|| execute_once(&compiled, &input, &mut output));
        result.report();
        println!("Sequences: {}, levels: {}", compiled.sequence_count(), compiled.levels().len());
    }
}

fn main() {
    println!("graphforge executor benchmarks");
    println!("input: 1x{}x{}x{}", HW, HW, CHANNELS);

    benchmark_compile();
    benchmark_execute();
}
