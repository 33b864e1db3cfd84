//! Builtin backend.
//!
//! Holds the graph's input and output tensors in the graph's own layout and
//! runs the Permute operations that move data between backends and layouts.

mod kernel_generator;
mod permute;

pub use kernel_generator::BuiltinKernelGenerator;
pub use permute::PermuteLayer;

use crate::backend::{Backend, BackendConfig, GeneratedSequence, OperationSequence, TensorRegistries};
use crate::error::ForgeResult;
use crate::ir::{Graph, Layout, Operation};
use crate::profiling::{CpuTimer, Timer};

pub const BUILTIN_BACKEND_ID: &str = "builtin";

#[derive(Debug, Clone, Default)]
pub struct BuiltinConfig;

impl BackendConfig for BuiltinConfig {
    fn id(&self) -> &str {
        BUILTIN_BACKEND_ID
    }

    fn support_layout(&self, _op: &Operation, frontend: Layout) -> Layout {
        frontend
    }

    fn support_permutation(&self) -> bool {
        false
    }

    fn support_dynamic_tensor(&self) -> bool {
        true
    }

    fn support_fp16(&self) -> bool {
        false
    }

    fn apply_dim_correction(&self) -> bool {
        false
    }

    fn timer(&self) -> Box<dyn Timer> {
        Box::new(CpuTimer::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuiltinBackend {
    config: BuiltinConfig,
}

impl BuiltinBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for BuiltinBackend {
    fn config(&self) -> &dyn BackendConfig {
        &self.config
    }

    fn generate(
        &self,
        graph: &Graph,
        registries: &TensorRegistries,
        sequence: &OperationSequence,
    ) -> ForgeResult<GeneratedSequence> {
        BuiltinKernelGenerator::new(graph, registries).generate(sequence)
    }
}
