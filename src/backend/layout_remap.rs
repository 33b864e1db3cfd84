//! Logical-to-backend axis algebra.
//!
//! Backend buffers use reversed coordinates: backend axis 0 is the innermost
//! (fastest varying) axis of the physical layout. A logical axis therefore
//! goes through two steps on its way to the backend:
//!
//! 1. rank-4 layout permutation (`NHWC` <-> `NCHW`), a no-op for other ranks
//! 2. reversal, `rank - 1 - axis`
//!
//! Every axis-like parameter (axis, axes list, permutation, per-axis
//! begin/end/stride, bit masks) passes through this module before a kernel
//! is configured with it.

use crate::error::{ForgeError, ForgeResult};
use crate::ir::{permute_axis, permute_dims, Layout};

/// Normalize a possibly negative axis against `rank`.
///
/// Accepts `[-rank, rank - 1]`.
pub fn normalize_axis(axis: i32, rank: usize) -> ForgeResult<usize> {
    let r = rank as i64;
    let a = axis as i64;
    if a < -r || a >= r {
        return Err(ForgeError::InvariantViolation(format!(
            "axis {} out of range for rank {}",
            axis, rank
        )));
    }
    Ok(if a < 0 { (a + r) as usize } else { a as usize })
}

/// Backend axis of logical `axis`
pub fn to_backend_axis(rank: usize, axis: usize, frontend: Layout, backend: Layout) -> usize {
    if rank == 0 {
        return 0;
    }
    rank - 1 - permute_axis(rank, axis, frontend, backend)
}

/// Logical axis of backend `axis`; inverse of [`to_backend_axis`]
pub fn to_logical_axis(rank: usize, axis: usize, frontend: Layout, backend: Layout) -> usize {
    if rank == 0 {
        return 0;
    }
    permute_axis(rank, rank - 1 - axis, backend, frontend)
}

/// Remap a logical permutation vector into backend axes.
///
/// `pv[i]` names the input axis that becomes output axis `i`; the result
/// keeps that meaning in backend coordinates.
pub fn backend_permutation(
    rank: usize,
    pv: &[usize],
    frontend: Layout,
    backend: Layout,
) -> ForgeResult<Vec<usize>> {
    let mut seen = vec![false; rank];
    if pv.len() != rank {
        return Err(ForgeError::InvariantViolation(format!(
            "permutation of length {} for rank {}",
            pv.len(),
            rank
        )));
    }
    for &p in pv {
        if p >= rank || seen[p] {
            return Err(ForgeError::InvariantViolation(format!(
                "{:?} is not a permutation of 0..{}",
                pv, rank
            )));
        }
        seen[p] = true;
    }

    let mut remapped = vec![0; rank];
    for (i, &p) in pv.iter().enumerate() {
        remapped[to_backend_axis(rank, i, frontend, backend)] =
            to_backend_axis(rank, p, frontend, backend);
    }
    Ok(remapped)
}

/// Highest rank a per-axis `u32` bit mask can describe
pub const MAX_MASK_RANK: usize = u32::BITS as usize;

/// Move each set bit `i` of `mask` to the backend position of axis `i`.
pub fn reorder_bits(mask: u32, rank: usize, frontend: Layout, backend: Layout) -> ForgeResult<u32> {
    if rank > MAX_MASK_RANK {
        return Err(ForgeError::InvariantViolation(format!(
            "bit mask cannot address rank {}",
            rank
        )));
    }
    let mut out = 0;
    for axis in 0..rank {
        if mask & (1 << axis) != 0 {
            out |= 1 << to_backend_axis(rank, axis, frontend, backend);
        }
    }
    Ok(out)
}

/// Normalize, dedupe and remap an axes list; the result is sorted.
pub fn axes_to_backend(
    axes: &[i32],
    rank: usize,
    frontend: Layout,
    backend: Layout,
) -> ForgeResult<Vec<usize>> {
    let mut out = Vec::with_capacity(axes.len());
    for &axis in axes {
        let b = to_backend_axis(rank, normalize_axis(axis, rank)?, frontend, backend);
        if !out.contains(&b) {
            out.push(b);
        }
    }
    out.sort_unstable();
    Ok(out)
}

/// Backend-order dims of a logical shape; a scalar becomes `[1]`
pub fn backend_dims(logical: &[usize], frontend: Layout, backend: Layout) -> Vec<usize> {
    if logical.is_empty() {
        return vec![1];
    }
    let mut dims = permute_dims(logical, frontend, backend);
    dims.reverse();
    dims
}

/// Element strides of a dense buffer, axis 0 fastest
pub fn dense_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(dims.len());
    let mut acc = 1;
    for &d in dims {
        strides.push(acc);
        acc *= d;
    }
    strides
}

/// Offsets of every coordinate in `dims` (axis 0 fastest) under `strides`.
pub fn gather_offsets(dims: &[usize], strides: &[isize], base: isize) -> ForgeResult<Vec<usize>> {
    if dims.len() != strides.len() {
        return Err(ForgeError::InvariantViolation(format!(
            "{} dims but {} strides",
            dims.len(),
            strides.len()
        )));
    }
    let total: usize = dims.iter().product();
    let mut out = Vec::with_capacity(total);
    if total == 0 {
        return Ok(out);
    }

    let mut coord = vec![0usize; dims.len()];
    let mut offset = base;
    for _ in 0..total {
        let off = usize::try_from(offset).map_err(|_| {
            ForgeError::InvariantViolation(format!("negative element offset {}", offset))
        })?;
        out.push(off);
        for axis in 0..dims.len() {
            coord[axis] += 1;
            offset += strides[axis];
            if coord[axis] < dims[axis] {
                break;
            }
            offset -= strides[axis] * dims[axis] as isize;
            coord[axis] = 0;
        }
    }
    Ok(out)
}

/// Axis correspondence of one tensor: its logical rank and the layout pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisMap {
    rank: usize,
    frontend: Layout,
    backend: Layout,
}

impl AxisMap {
    /// Scalars are treated as rank 1
    pub fn new(rank: usize, frontend: Layout, backend: Layout) -> Self {
        Self {
            rank: rank.max(1),
            frontend,
            backend,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn to_backend(&self, axis: usize) -> usize {
        to_backend_axis(self.rank, axis, self.frontend, self.backend)
    }

    pub fn to_logical(&self, axis: usize) -> usize {
        to_logical_axis(self.rank, axis, self.frontend, self.backend)
    }

    /// Normalized then remapped
    pub fn backend_axis(&self, axis: i32) -> ForgeResult<usize> {
        Ok(self.to_backend(normalize_axis(axis, self.rank)?))
    }

    /// Physical element stride of each logical axis for a dense buffer
    pub fn logical_strides(&self, logical_dims: &[usize]) -> Vec<usize> {
        let dims = backend_dims(logical_dims, self.frontend, self.backend);
        let strides = dense_strides(&dims);
        (0..self.rank).map(|a| strides[self.to_backend(a)]).collect()
    }
}

/// Physical offset of each element, listed in logical row-major order.
pub fn physical_offsets(
    logical_dims: &[usize],
    frontend: Layout,
    backend: Layout,
) -> ForgeResult<Vec<usize>> {
    if logical_dims.is_empty() {
        return Ok(vec![0]);
    }
    let map = AxisMap::new(logical_dims.len(), frontend, backend);
    let strides = map.logical_strides(logical_dims);
    let dims: Vec<usize> = logical_dims.iter().rev().copied().collect();
    let strides: Vec<isize> = strides.iter().rev().map(|&s| s as isize).collect();
    gather_offsets(&dims, &strides, 0)
}

/// Source strides per output backend axis.
///
/// `correspond` maps an output logical axis to the source logical axis it
/// reads, or `None` when the output axis has no counterpart (stride 0).
pub fn projected_strides(
    out: &AxisMap,
    src: &AxisMap,
    src_logical_dims: &[usize],
    correspond: impl Fn(usize) -> Option<usize>,
) -> Vec<isize> {
    let src_strides = src.logical_strides(src_logical_dims);
    (0..out.rank())
        .map(|b| {
            correspond(out.to_logical(b))
                .and_then(|l| src_strides.get(l).copied())
                .map_or(0, |s| s as isize)
        })
        .collect()
}

/// Source offsets for a right-aligned numpy-style broadcast of `src` onto
/// `out`, in `out`'s physical order.
pub fn broadcast_offsets(
    out_dims: &[usize],
    out_map: &AxisMap,
    src_dims: &[usize],
    src_map: &AxisMap,
) -> ForgeResult<Vec<usize>> {
    let out_rank = out_dims.len();
    let src_rank = src_dims.len();
    if src_rank > out_rank {
        return Err(ForgeError::InvariantViolation(format!(
            "cannot broadcast rank {} onto rank {}",
            src_rank, out_rank
        )));
    }
    let lead = out_rank - src_rank;
    for (i, &d) in src_dims.iter().enumerate() {
        let o = out_dims[lead + i];
        if d != o && d != 1 {
            return Err(ForgeError::InvariantViolation(format!(
                "dim {} of size {} does not broadcast to {}",
                i, d, o
            )));
        }
    }

    let strides = projected_strides(out_map, src_map, src_dims, |l| {
        if l < lead || src_dims.get(l - lead) == Some(&1) {
            None
        } else {
            Some(l - lead)
        }
    });
    let dims = backend_dims(out_dims, out_map.frontend, out_map.backend);
    gather_offsets(&dims, &strides, 0)
}
