//! Backend contract and shared backend machinery.
//!
//! A backend is two things: a [`BackendConfig`] advertising what it can do,
//! and a [`Backend::generate`] that lowers one [`OperationSequence`] into a
//! [`FunctionSequence`] bound to that backend's tensors.

pub mod builtin;
pub mod compute;
pub mod layout_remap;
pub mod registry;
pub mod shape_guard;
pub mod tensor;

pub use builtin::{BuiltinBackend, BUILTIN_BACKEND_ID};
pub use compute::ComputeBackend;
pub use registry::{TensorBuilder, TensorRegistries, TensorRegistry};
pub use shape_guard::{DimCorrectionGuard, ShapeEffect};
pub use tensor::{BackendShape, BackendTensor};

use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::exec::FunctionSequence;
use crate::ir::{Graph, Layout, OperandId, Operation, OperationId};
use crate::profiling::Timer;

/// Capability flags of a backend
pub trait BackendConfig: Send + Sync {
    /// Stable backend id
    fn id(&self) -> &str;

    /// Physical layout this backend runs `op` in, given the graph's layout
    fn support_layout(&self, op: &Operation, frontend: Layout) -> Layout;

    /// Whether operands may alias regions of other operands (sub-tensors)
    fn support_permutation(&self) -> bool;

    /// Whether shapes may stay unknown until run time
    fn support_dynamic_tensor(&self) -> bool;

    fn support_fp16(&self) -> bool;

    /// Whether buffers elide outer unit dims from their reported rank
    fn apply_dim_correction(&self) -> bool;

    /// Fresh timer for profiling one sequence
    fn timer(&self) -> Box<dyn Timer>;
}

/// Backend-homogeneous run of operations
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSequence {
    pub backend: String,
    /// Layout the operation parameters are expressed in
    pub layout: Layout,
    /// Layout of every tensor this sequence's operations produce
    pub physical_layout: Layout,
    pub operations: Vec<OperationId>,
}

/// Output of one generator pass
pub struct GeneratedSequence {
    pub sequence: FunctionSequence,
    /// Tensors deliberately left at their widened rank
    pub left_widened: Vec<OperandId>,
}

impl std::fmt::Debug for GeneratedSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedSequence")
            .field("functions", &self.sequence.len())
            .field("left_widened", &self.left_widened)
            .finish()
    }
}

pub trait Backend: Send + Sync {
    fn config(&self) -> &dyn BackendConfig;

    /// Lower `sequence` into executable units.
    ///
    /// Fails with an Unsupported error when any operation cannot be lowered
    /// here; the caller may reassign the sequence and try again.
    fn generate(
        &self,
        graph: &Graph,
        registries: &TensorRegistries,
        sequence: &OperationSequence,
    ) -> ForgeResult<GeneratedSequence>;
}

/// Instantiate a backend by id
pub fn create_backend(id: &str) -> ForgeResult<Arc<dyn Backend>> {
    create_backend_with_fp16(id, false)
}

/// Instantiate a backend by id, with Float16 operands allowed on compute
/// backends when `fp16` is set. Builtin only copies bytes and ignores it.
pub fn create_backend_with_fp16(id: &str, fp16: bool) -> ForgeResult<Arc<dyn Backend>> {
    match id {
        BUILTIN_BACKEND_ID => Ok(Arc::new(BuiltinBackend::new())),
        "gpu_cl" => Ok(Arc::new(ComputeBackend::new("gpu_cl", Layout::Nchw).with_fp16(fp16))),
        "cpu_neon" => Ok(Arc::new(ComputeBackend::new("cpu_neon", Layout::Nhwc).with_fp16(fp16))),
        other => Err(ForgeError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backend() {
        let gpu = create_backend("gpu_cl").unwrap();
        assert_eq!(gpu.config().id(), "gpu_cl");
        assert!(gpu.config().support_permutation());
        assert!(!gpu.config().support_dynamic_tensor());

        let builtin = create_backend(BUILTIN_BACKEND_ID).unwrap();
        assert!(builtin.config().support_dynamic_tensor());
        assert!(!builtin.config().apply_dim_correction());

        assert!(!gpu.config().support_fp16());
        assert!(create_backend_with_fp16("cpu_neon", true).unwrap().config().support_fp16());

        assert!(matches!(
            create_backend("npu"),
            Err(ForgeError::UnknownBackend(_))
        ));
    }
}
