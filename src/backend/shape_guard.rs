//! Scoped dimension-correction override.

use std::sync::Arc;

use tracing::trace;

use crate::backend::tensor::BackendTensor;
use crate::error::ForgeResult;
use crate::ir::OperandId;

/// Reports the full logical rank for a tensor while alive; the corrected
/// rank comes back on drop, on every exit path.
#[derive(Debug)]
#[must_use = "the widened rank is restored as soon as the guard drops"]
pub struct DimCorrectionGuard {
    tensor: Arc<BackendTensor>,
    saved: usize,
    restore: bool,
}

/// What a generator did to a tensor's reported rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeEffect {
    /// The tensor keeps reporting the widened rank after generation
    LeftWidened { operand: OperandId },
}

impl DimCorrectionGuard {
    pub fn widen(tensor: &Arc<BackendTensor>, rank: usize) -> ForgeResult<Self> {
        let saved = tensor.set_num_dimensions(rank.max(1))?;
        trace!(
            operand = %tensor.operand(),
            from = saved,
            to = rank,
            "widened backend rank"
        );
        Ok(Self {
            tensor: tensor.clone(),
            saved,
            restore: true,
        })
    }

    /// Widen every tensor in `tensors` to its own logical rank
    pub fn widen_all(tensors: &[Arc<BackendTensor>]) -> ForgeResult<Vec<Self>> {
        tensors
            .iter()
            .map(|t| Self::widen(t, t.logical_rank()?))
            .collect()
    }

    /// Keep the widened rank after this guard is gone
    pub fn leave_widened(mut self) -> ShapeEffect {
        self.restore = false;
        ShapeEffect::LeftWidened {
            operand: self.tensor.operand(),
        }
    }
}

impl Drop for DimCorrectionGuard {
    fn drop(&mut self) {
        if self.restore {
            self.tensor.restore_num_dimensions(self.saved);
        }
    }
}
