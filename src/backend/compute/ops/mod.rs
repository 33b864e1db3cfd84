//! Reference kernels of the compute backend.
//!
//! Kernels are configured against backend tensors and address them in
//! backend coordinates: axis parameters arrive already remapped, and data is
//! read in physical order unless a kernel explicitly goes through the
//! logical view.

pub mod conv;
pub mod elementwise;
pub mod movement;
pub mod pool_norm;
pub mod reduce;

use std::sync::Arc;

use crate::backend::tensor::BackendTensor;
use crate::error::{ForgeError, ForgeResult};

pub(crate) type TensorRef = Arc<BackendTensor>;

/// `(outer, extent, inner)` element counts around backend `axis`
pub(crate) fn split_at_axis(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let inner = dims[..axis.min(dims.len())].iter().product();
    let extent = dims.get(axis).copied().unwrap_or(1);
    let outer = dims.get(axis + 1..).map_or(1, |d| d.iter().product());
    (outer, extent, inner)
}

/// A kernel that indexes with the full logical rank needs the backend to
/// report that rank, not the corrected one.
pub(crate) fn require_full_rank(tensor: &BackendTensor, kernel: &str) -> ForgeResult<()> {
    let reported = tensor.num_dimensions()?;
    let rank = tensor.logical_rank()?.max(1);
    if reported != rank {
        return Err(ForgeError::InvariantViolation(format!(
            "{} needs operand {} at rank {}, backend reports {}",
            kernel,
            tensor.operand(),
            rank,
            reported
        )));
    }
    Ok(())
}

pub(crate) fn require_same_elements(
    a: &BackendTensor,
    b: &BackendTensor,
    kernel: &str,
) -> ForgeResult<()> {
    let (na, nb) = (a.num_elements()?, b.num_elements()?);
    if na != nb {
        return Err(ForgeError::InvariantViolation(format!(
            "{}: operand {} has {} elements, operand {} has {}",
            kernel,
            a.operand(),
            na,
            b.operand(),
            nb
        )));
    }
    Ok(())
}

/// Copy element `src[s]` to `dst[d]` for each offset pair
pub(crate) fn copy_elements(
    src: &[u8],
    src_offsets: &[usize],
    dst: &mut [u8],
    dst_offsets: &[usize],
    element_size: usize,
) -> ForgeResult<()> {
    if src_offsets.len() != dst_offsets.len() {
        return Err(ForgeError::InvariantViolation(format!(
            "{} source offsets for {} destinations",
            src_offsets.len(),
            dst_offsets.len()
        )));
    }
    for (&s, &d) in src_offsets.iter().zip(dst_offsets) {
        let from = src
            .get(s * element_size..(s + 1) * element_size)
            .ok_or_else(|| ForgeError::KernelFailed(format!("source element {} out of range", s)))?;
        dst.get_mut(d * element_size..(d + 1) * element_size)
            .ok_or_else(|| {
                ForgeError::KernelFailed(format!("destination element {} out of range", d))
            })?
            .copy_from_slice(from);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_at_axis() {
        assert_eq!(split_at_axis(&[3, 2, 4], 1), (4, 2, 3));
        assert_eq!(split_at_axis(&[3, 2, 4], 0), (8, 3, 1));
        assert_eq!(split_at_axis(&[3, 2, 4], 2), (1, 4, 6));
    }
}
