//! Lowering of data-movement kinds. Most of the layout remapping lives
//! here: axes, permutations, per-axis triplets, bit masks and pad lists all
//! leave this file in backend coordinates.

use tracing::debug;

use crate::backend::compute::ops::movement::{
    strided_range, AxisRange, ConcatKernel, CopyKernel, GatherKernel, OneHotKernel, PackKernel,
    PadKernel, SpaceDepthKernel, SplitKernel, SplitVKernel, StridedGatherKernel, UnpackKernel,
};
use crate::backend::layout_remap::{backend_permutation, normalize_axis, reorder_bits, AxisMap, MAX_MASK_RANK};
use crate::backend::shape_guard::DimCorrectionGuard;
use crate::error::ForgeResult;
use crate::exec::NopFunction;
use crate::ir::{
    Concat, DataType, Gather, OneHot, Operation, Pack, Pad, PermuteType, Reshape, Slice, Split,
    SplitV, StridedSlice, Transpose, Unpack,
};

use super::{KernelGenerator, Lowered, SeqContext};

impl KernelGenerator<'_> {
    pub(super) fn concat(&self, ctx: &SeqContext, op: &Operation, p: &Concat) -> ForgeResult<Lowered> {
        let output_id = op.outputs.first().copied();
        let output = self.output(op, 0)?;
        if let Some(id) = output_id {
            if self.registry.are_sub_tensors_of(id, &op.inputs) {
                debug!(output = %id, inputs = op.inputs.len(), "concat eliminated by sub-tensors");
                return Ok(Lowered::boxed(Box::new(NopFunction)));
            }
        }
        let inputs = self.inputs(op)?;
        if inputs.len() == 1 {
            let input = inputs[0].clone();
            return Ok(Lowered::new(CopyKernel::physical("Concat", input, output)?));
        }
        let rank = output.logical_rank()?;
        let axis = normalize_axis(p.axis, rank)?;
        let backend_axis = AxisMap::new(rank, ctx.layout, ctx.physical).to_backend(axis);
        Ok(Lowered::new(ConcatKernel::configure(inputs, output, backend_axis)?))
    }

    pub(super) fn reshape(&self, ctx: &SeqContext, op: &Operation) -> ForgeResult<Lowered> {
        if op.input(Reshape::SHAPE).is_some() {
            // target shape must be known now; the output dims already carry it
            self.constant(op, Reshape::SHAPE)?;
        }
        let input = self.input(op, Reshape::INPUT)?;
        let output = self.output(op, 0)?;
        let permuted = PermuteType::between(ctx.layout, ctx.physical) != PermuteType::Copy;
        if permuted && (input.logical_rank()? == 4 || output.logical_rank()? == 4) {
            return Err(self.unsupported(
                op,
                format!("rank-4 reshape between {} and {}", ctx.layout, ctx.physical),
            ));
        }
        Ok(Lowered::new(CopyKernel::physical("Reshape", input, output)?))
    }

    pub(super) fn squeeze(&self, op: &Operation) -> ForgeResult<Lowered> {
        Ok(Lowered::new(CopyKernel::logical(
            "Squeeze",
            self.input(op, 0)?,
            self.output(op, 0)?,
        )?))
    }

    pub(super) fn expand_dims(&self, op: &Operation) -> ForgeResult<Lowered> {
        Ok(Lowered::new(CopyKernel::logical(
            "ExpandDims",
            self.input(op, 0)?,
            self.output(op, 0)?,
        )?))
    }

    pub(super) fn slice(&self, ctx: &SeqContext, op: &Operation) -> ForgeResult<Lowered> {
        let input = self.input(op, Slice::INPUT)?;
        let begins = self.constant_i32s(op, Slice::BEGINS)?;
        let sizes = self.constant_i32s(op, Slice::SIZES)?;
        let logical = input.logical_dims()?;
        let rank = logical.len();
        if begins.len() != rank || sizes.len() != rank {
            return Err(self.unsupported(op, format!("begins/sizes must have {} entries", rank)));
        }
        let map = AxisMap::new(rank, ctx.layout, ctx.physical);
        let mut ranges = vec![AxisRange { start: 0, count: 1, step: 1 }; rank.max(1)];
        for axis in 0..rank {
            let dim = logical[axis] as i64;
            let begin = begins[axis] as i64;
            let size = if sizes[axis] == -1 { dim - begin } else { sizes[axis] as i64 };
            if begin < 0 || size < 0 || begin + size > dim {
                return Err(crate::invariant!(
                    "Slice window {}+{} exceeds dim {} on axis {}",
                    begin,
                    size,
                    dim,
                    axis
                ));
            }
            ranges[map.to_backend(axis)] = AxisRange {
                start: begin as isize,
                count: size as usize,
                step: 1,
            };
        }
        Ok(Lowered::new(StridedGatherKernel::slice(
            input,
            self.output(op, 0)?,
            &ranges,
        )?))
    }

    pub(super) fn strided_slice(&self, ctx: &SeqContext, op: &Operation, p: &StridedSlice) -> ForgeResult<Lowered> {
        let input = self.input(op, StridedSlice::INPUT)?;
        let starts = self.constant_i32s(op, StridedSlice::STARTS)?;
        let ends = self.constant_i32s(op, StridedSlice::ENDS)?;
        let strides = self.constant_i32s(op, StridedSlice::STRIDES)?;
        let rank = input.logical_rank()?;
        if starts.len() != rank || ends.len() != rank || strides.len() != rank {
            return Err(self.unsupported(op, format!("starts/ends/strides must have {} entries", rank)));
        }
        if rank > MAX_MASK_RANK {
            return Err(self.unsupported(
                op,
                format!("masks address at most {} axes, got rank {}", MAX_MASK_RANK, rank),
            ));
        }

        let map = AxisMap::new(rank, ctx.layout, ctx.physical);
        let begin_mask = reorder_bits(p.begin_mask, rank, ctx.layout, ctx.physical)?;
        let end_mask = reorder_bits(p.end_mask, rank, ctx.layout, ctx.physical)?;
        let shrink_mask = reorder_bits(p.shrink_axis_mask, rank, ctx.layout, ctx.physical)?;
        let dims = input.dims()?;
        let mut ranges = vec![AxisRange { start: 0, count: 1, step: 1 }; dims.len()];
        for axis in 0..rank {
            let b = map.to_backend(axis);
            let bit = |mask: u32| mask & (1 << b) != 0;
            ranges[b] = strided_range(
                dims[b],
                starts[axis],
                ends[axis],
                strides[axis],
                bit(begin_mask),
                bit(end_mask),
                bit(shrink_mask),
            )?;
        }

        let _widened = DimCorrectionGuard::widen(&input, rank)?;
        Ok(Lowered::new(StridedGatherKernel::strided_slice(
            input.clone(),
            self.output(op, 0)?,
            &ranges,
        )?))
    }

    pub(super) fn transpose(&self, ctx: &SeqContext, op: &Operation) -> ForgeResult<Lowered> {
        let input = self.input(op, Transpose::INPUT)?;
        let output = self.output(op, 0)?;
        let rank = input.logical_rank()?;
        let perm = self.constant_i32s(op, Transpose::PERMUTATION)?;
        if rank <= 1 {
            return Ok(Lowered::new(CopyKernel::physical("Transpose", input, output)?));
        }
        // empty permutation reverses the axes
        let pv: Vec<usize> = if perm.is_empty() {
            (0..rank).rev().collect()
        } else {
            perm.iter()
                .map(|&a| normalize_axis(a, rank))
                .collect::<ForgeResult<_>>()?
        };
        let backend = backend_permutation(rank, &pv, ctx.layout, ctx.physical)?;
        Ok(Lowered::new(StridedGatherKernel::transpose(input, output, &backend)?))
    }

    pub(super) fn pack(&self, op: &Operation, p: &Pack) -> ForgeResult<Lowered> {
        let output = self.output(op, 0)?;
        let map = output.axis_map()?;
        let axis = normalize_axis(p.axis, map.rank())?;
        let inputs = self.inputs(op)?;
        let _widened = DimCorrectionGuard::widen_all(&inputs)?;
        Ok(Lowered::new(PackKernel::configure(
            inputs.clone(),
            output,
            axis,
            map.to_backend(axis),
        )?))
    }

    pub(super) fn unpack(&self, op: &Operation, p: &Unpack) -> ForgeResult<Lowered> {
        let input = self.input(op, Unpack::INPUT)?;
        let map = input.axis_map()?;
        let axis = normalize_axis(p.axis, map.rank())?;
        let outputs = self.outputs(op)?;
        let _widened = DimCorrectionGuard::widen_all(&outputs)?;
        Ok(Lowered::new(UnpackKernel::configure(
            input,
            outputs.clone(),
            axis,
            map.to_backend(axis),
        )?))
    }

    pub(super) fn gather(&self, op: &Operation, p: &Gather) -> ForgeResult<Lowered> {
        let input = self.input(op, Gather::INPUT)?;
        let indices = self.input(op, Gather::INDICES)?;
        if !matches!(indices.type_info().dtype, DataType::Int32 | DataType::Int64) {
            return Err(self.unsupported(op, "indices must be int32 or int64"));
        }
        let axis = normalize_axis(p.axis, input.logical_rank()?)?;
        let _widened = DimCorrectionGuard::widen_all(&[input.clone(), indices.clone()])?;
        Ok(Lowered::new(GatherKernel::configure(
            input.clone(),
            indices.clone(),
            self.output(op, 0)?,
            axis,
        )?))
    }

    pub(super) fn split(&self, op: &Operation, p: &Split) -> ForgeResult<Lowered> {
        let input = self.input(op, Split::INPUT)?;
        let axis = self.constant_i32(op, Split::AXIS)?;
        let backend_axis = input.axis_map()?.backend_axis(axis)?;
        let outputs = self.outputs(op)?;
        if outputs.len() != p.num_splits {
            return Err(crate::invariant!(
                "Split declares {} splits but has {} outputs",
                p.num_splits,
                outputs.len()
            ));
        }
        Ok(Lowered::new(SplitKernel::configure(input, outputs, backend_axis)?))
    }

    pub(super) fn split_v(&self, op: &Operation, p: &SplitV) -> ForgeResult<Lowered> {
        let input = self.input(op, SplitV::INPUT)?;
        if op.outputs.len() != p.num_splits {
            return Err(crate::invariant!(
                "SplitV declares {} splits but has {} outputs",
                p.num_splits,
                op.outputs.len()
            ));
        }
        let split_dim = self.constant_i32(op, SplitV::SPLIT_DIM)?;
        let backend_axis = input.axis_map()?.backend_axis(split_dim)?;
        let _widened = DimCorrectionGuard::widen(&input, input.logical_rank()?)?;
        Ok(Lowered::new(SplitVKernel::configure(
            input.clone(),
            self.input(op, SplitV::SIZE_SPLITS)?,
            self.outputs(op)?,
            backend_axis,
        )?))
    }

    /// The one kind whose input stays widened: the pad kernel checks the
    /// reported rank again every time it runs.
    pub(super) fn pad(&self, ctx: &SeqContext, op: &Operation) -> ForgeResult<Lowered> {
        let input = self.input(op, Pad::INPUT)?;
        let rank = input.logical_rank()?;
        let pads = self.constant_i32s(op, Pad::PAD)?;
        if pads.len() != rank * 2 || pads.iter().any(|&v| v < 0) {
            return Err(self.unsupported(op, format!("pad list must be {}x2 non-negative values", rank)));
        }
        let map = AxisMap::new(rank, ctx.layout, ctx.physical);
        let mut backend_pads = vec![(0usize, 0usize); rank.max(1)];
        for axis in 0..rank {
            backend_pads[map.to_backend(axis)] = (pads[2 * axis] as usize, pads[2 * axis + 1] as usize);
        }
        let widened = DimCorrectionGuard::widen(&input, rank)?;
        let kernel = PadKernel::configure(input, self.output(op, 0)?, &backend_pads)?;
        Ok(Lowered::new(kernel).with_effect(widened.leave_widened()))
    }

    pub(super) fn one_hot(&self, op: &Operation, p: &OneHot) -> ForgeResult<Lowered> {
        let output = self.output(op, 0)?;
        let depth = self.constant_i32(op, OneHot::DEPTH)?;
        if depth <= 0 {
            return Err(self.unsupported(op, format!("depth {}", depth)));
        }
        let map = output.axis_map()?;
        let axis = if p.axis == -1 {
            map.rank() - 1
        } else {
            normalize_axis(p.axis, map.rank())?
        };
        let _widened = DimCorrectionGuard::widen(&output, map.rank())?;
        Ok(Lowered::new(OneHotKernel::configure(
            self.input(op, OneHot::INDICES)?,
            self.input(op, OneHot::ON_VALUE)?,
            self.input(op, OneHot::OFF_VALUE)?,
            output.clone(),
            axis,
            map.to_backend(axis),
            depth as usize,
        )?))
    }

    pub(super) fn depth_to_space(&self, op: &Operation, block_size: usize) -> ForgeResult<Lowered> {
        Ok(Lowered::new(SpaceDepthKernel::depth_to_space(
            self.input(op, 0)?,
            self.output(op, 0)?,
            block_size,
        )?))
    }

    pub(super) fn space_to_depth(&self, op: &Operation, block_size: usize) -> ForgeResult<Lowered> {
        Ok(Lowered::new(SpaceDepthKernel::space_to_depth(
            self.input(op, 0)?,
            self.output(op, 0)?,
            block_size,
        )?))
    }

    /// Layout conversion inside this backend's registry
    pub(super) fn permute(&self, op: &Operation) -> ForgeResult<Lowered> {
        Ok(Lowered::new(CopyKernel::logical(
            "Permute",
            self.input(op, 0)?,
            self.output(op, 0)?,
        )?))
    }
}
