//! Compute backend: a GPU-style backend with a fixed physical layout.
//!
//! Buffers use reversed coordinates and dimension correction, Concat inputs
//! may alias their output, and every kernel runs on host memory.

pub mod generator;
pub mod ops;

pub use generator::{KernelGenerator, SeqContext};

use std::sync::Arc;

use tracing::debug;

use crate::backend::compute::ops::elementwise::{ActivationFn, ActivationKernel};
use crate::backend::tensor::BackendTensor;
use crate::backend::{Backend, BackendConfig, GeneratedSequence, OperationSequence, TensorRegistries};
use crate::error::ForgeResult;
use crate::exec::{Function, NopFunction};
use crate::ir::{Activation, Graph, Layout, Operation};
use crate::profiling::{CpuTimer, Timer};

#[derive(Debug, Clone)]
pub struct ComputeConfig {
    id: String,
    layout: Layout,
    fp16: bool,
}

impl BackendConfig for ComputeConfig {
    fn id(&self) -> &str {
        &self.id
    }

    fn support_layout(&self, _op: &Operation, _frontend: Layout) -> Layout {
        self.layout
    }

    fn support_permutation(&self) -> bool {
        true
    }

    fn support_dynamic_tensor(&self) -> bool {
        false
    }

    fn support_fp16(&self) -> bool {
        self.fp16
    }

    fn apply_dim_correction(&self) -> bool {
        true
    }

    fn timer(&self) -> Box<dyn Timer> {
        Box::new(CpuTimer::new())
    }
}

/// Compute backend instance
#[derive(Debug, Clone)]
pub struct ComputeBackend {
    config: ComputeConfig,
}

impl ComputeBackend {
    pub fn new(id: impl Into<String>, layout: Layout) -> Self {
        Self {
            config: ComputeConfig {
                id: id.into(),
                layout,
                fp16: false,
            },
        }
    }

    /// Allow Float16 operands and the fp16 conversion operations
    pub fn with_fp16(mut self, enabled: bool) -> Self {
        self.config.fp16 = enabled;
        self
    }
}

impl Backend for ComputeBackend {
    fn config(&self) -> &dyn BackendConfig {
        &self.config
    }

    fn generate(
        &self,
        graph: &Graph,
        registries: &TensorRegistries,
        sequence: &OperationSequence,
    ) -> ForgeResult<GeneratedSequence> {
        let registry = registries.get(&self.config.id)?;
        debug!(
            backend = %self.config.id,
            operations = sequence.operations.len(),
            layout = %sequence.layout,
            physical = %sequence.physical_layout,
            "generating sequence"
        );
        KernelGenerator::new(&self.config, graph, registry).generate(sequence)
    }
}

/// Builds the epilogue stage of a fused operation
pub struct ActivationBuilder;

impl ActivationBuilder {
    /// A no-op for the identity activation, otherwise an in-place
    /// activation over `tensor`.
    pub fn generate(activation: Activation, tensor: &Arc<BackendTensor>) -> ForgeResult<Box<dyn Function>> {
        if activation.is_identity() {
            return Ok(Box::new(NopFunction));
        }
        Ok(Box::new(ActivationKernel::in_place(
            tensor.clone(),
            ActivationFn::Fused(activation),
        )?))
    }
}
