use std::sync::Arc;

use tracing::trace;

use crate::backend::tensor::BackendTensor;
use crate::error::{ForgeError, ForgeResult};
use crate::exec::Function;

/// Copies one operand into another through the logical view.
///
/// Source and destination may live on different backends, with different
/// physical layouts and dimension-correction settings.
pub struct PermuteLayer {
    input: Arc<BackendTensor>,
    output: Arc<BackendTensor>,
}

impl PermuteLayer {
    pub fn configure(input: Arc<BackendTensor>, output: Arc<BackendTensor>) -> ForgeResult<Self> {
        if input.type_info().dtype != output.type_info().dtype {
            return Err(ForgeError::InvariantViolation(format!(
                "Permute from {} to {} changes element type",
                input.operand(),
                output.operand()
            )));
        }
        if !output.is_dynamic() && input.num_elements()? != output.num_elements()? {
            return Err(ForgeError::InvariantViolation(format!(
                "Permute from {} to {} changes element count",
                input.operand(),
                output.operand()
            )));
        }
        Ok(Self { input, output })
    }
}

impl Function for PermuteLayer {
    fn run(&mut self) -> ForgeResult<()> {
        let bytes = self.input.read_logical_bytes()?;
        trace!(
            from = %self.input.operand(),
            to = %self.output.operand(),
            src = %self.input.backend_layout(),
            dst = %self.output.backend_layout(),
            bytes = bytes.len(),
            "permute"
        );
        self.output.write_logical_bytes(&bytes)
    }

    /// Dynamic outputs follow the input's current shape
    fn validate_shapes(&mut self) -> ForgeResult<()> {
        let dims = self.input.logical_dims()?;
        if self.output.is_dynamic() {
            if self.output.logical_dims()? != dims {
                self.output.resize(&dims)?;
            }
        } else if self.output.logical_dims()? != dims {
            return Err(ForgeError::KernelFailed(format!(
                "Permute input {} now has shape {:?}, output {} is fixed at {:?}",
                self.input.operand(),
                dims,
                self.output.operand(),
                self.output.logical_dims()?
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "Permute"
    }
}
