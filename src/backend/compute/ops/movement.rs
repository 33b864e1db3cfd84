//! Data-movement kernels: copies, concat, slicing, transposition,
//! stacking, splitting, gathering, padding and depth/space shuffles.

use tracing::trace;

use crate::backend::compute::ops::conv::FeatureAccess;
use crate::backend::compute::ops::{copy_elements, require_full_rank, split_at_axis, TensorRef};
use crate::backend::layout_remap::{dense_strides, gather_offsets, physical_offsets, projected_strides};
use crate::error::{ForgeError, ForgeResult};
use crate::exec::Function;

/// Byte copy between two tensors of equal size.
///
/// A physical copy moves the buffer as is; a logical copy goes through the
/// logical view so source and destination may use different layouts.
pub struct CopyKernel {
    name: &'static str,
    input: TensorRef,
    output: TensorRef,
    logical: bool,
}

impl CopyKernel {
    fn configure(name: &'static str, input: TensorRef, output: TensorRef, logical: bool) -> ForgeResult<Self> {
        let (a, b) = (input.byte_size()?, output.byte_size()?);
        if a != b {
            return Err(ForgeError::InvariantViolation(format!(
                "{}: operand {} has {} bytes, operand {} has {}",
                name,
                input.operand(),
                a,
                output.operand(),
                b
            )));
        }
        Ok(Self {
            name,
            input,
            output,
            logical,
        })
    }

    pub fn physical(name: &'static str, input: TensorRef, output: TensorRef) -> ForgeResult<Self> {
        Self::configure(name, input, output, false)
    }

    pub fn logical(name: &'static str, input: TensorRef, output: TensorRef) -> ForgeResult<Self> {
        Self::configure(name, input, output, true)
    }
}

impl Function for CopyKernel {
    fn run(&mut self) -> ForgeResult<()> {
        if self.logical {
            let bytes = self.input.read_logical_bytes()?;
            self.output.write_logical_bytes(&bytes)
        } else {
            let bytes = self.input.read_bytes()?;
            self.output.write_bytes(&bytes)
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Concatenation along one backend axis
pub struct ConcatKernel {
    inputs: Vec<TensorRef>,
    output: TensorRef,
    axis: usize,
}

impl ConcatKernel {
    pub fn configure(inputs: Vec<TensorRef>, output: TensorRef, axis: usize) -> ForgeResult<Self> {
        let out_dims = output.dims()?;
        let mut covered = 0;
        for input in &inputs {
            let dims = input.dims()?;
            let matches = dims.len() == out_dims.len()
                && dims
                    .iter()
                    .zip(&out_dims)
                    .enumerate()
                    .all(|(b, (d, o))| b == axis || d == o);
            if !matches {
                return Err(ForgeError::InvariantViolation(format!(
                    "Concat input {} dims {:?} do not fit output {:?} on backend axis {}",
                    input.operand(),
                    dims,
                    out_dims,
                    axis
                )));
            }
            covered += dims[axis];
        }
        if covered != out_dims[axis] {
            return Err(ForgeError::InvariantViolation(format!(
                "Concat inputs cover {} of {} along backend axis {}",
                covered, out_dims[axis], axis
            )));
        }
        Ok(Self {
            inputs,
            output,
            axis,
        })
    }
}

impl Function for ConcatKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let size = self.output.element_size();
        let out_dims = self.output.dims()?;
        let (outer, out_extent, inner) = split_at_axis(&out_dims, self.axis);
        let mut out = vec![0u8; self.output.byte_size()?];
        let mut cursor = 0;
        for input in &self.inputs {
            let data = input.read_bytes()?;
            let extent = input.dims()?[self.axis];
            let chunk = extent * inner * size;
            for o in 0..outer {
                let src = o * chunk;
                let dst = (o * out_extent + cursor) * inner * size;
                out[dst..dst + chunk].copy_from_slice(&data[src..src + chunk]);
            }
            cursor += extent;
        }
        self.output.write_bytes(&out)
    }

    fn name(&self) -> &str {
        "Concat"
    }
}

/// Per backend axis: first index, element count and step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisRange {
    pub start: isize,
    pub count: usize,
    pub step: isize,
}

/// Resolve one axis of a strided slice against `dim`
pub fn strided_range(
    dim: usize,
    start: i32,
    end: i32,
    stride: i32,
    begin_masked: bool,
    end_masked: bool,
    shrink: bool,
) -> ForgeResult<AxisRange> {
    if stride == 0 {
        return Err(ForgeError::InvariantViolation(
            "StridedSlice stride of 0".to_string(),
        ));
    }
    let d = dim as isize;
    let wrap = |v: i32| {
        let v = v as isize;
        if v < 0 {
            v + d
        } else {
            v
        }
    };
    if shrink {
        let s = wrap(start);
        if s < 0 || s >= d {
            return Err(ForgeError::InvariantViolation(format!(
                "shrunk index {} out of range for dim {}",
                start, dim
            )));
        }
        return Ok(AxisRange {
            start: s,
            count: 1,
            step: 1,
        });
    }
    let step = stride as isize;
    let (lo, hi) = if step > 0 { (0, d) } else { (-1, d - 1) };
    let s = if begin_masked {
        if step > 0 {
            lo
        } else {
            hi
        }
    } else {
        wrap(start).clamp(lo, hi)
    };
    let e = if end_masked {
        if step > 0 {
            hi
        } else {
            lo
        }
    } else {
        wrap(end).clamp(lo, hi)
    };
    let span = if step > 0 { e - s } else { s - e };
    let magnitude = step.abs();
    let count = if span <= 0 {
        0
    } else {
        ((span + magnitude - 1) / magnitude) as usize
    };
    Ok(AxisRange {
        start: s,
        count,
        step,
    })
}

/// Copies a strided window of the input: Slice, StridedSlice and Transpose
pub struct StridedGatherKernel {
    name: &'static str,
    input: TensorRef,
    output: TensorRef,
    offsets: Vec<usize>,
    /// Present when the output's backend order differs from the window's
    logical_order: Option<Vec<usize>>,
}

impl StridedGatherKernel {
    /// Window given per backend axis, output keeps the input's rank
    pub fn slice(input: TensorRef, output: TensorRef, ranges: &[AxisRange]) -> ForgeResult<Self> {
        Self::windowed("Slice", input, output, ranges)
    }

    /// Window given per backend axis; shrunk axes have a count of 1 and are
    /// dropped from the output's rank.
    pub fn strided_slice(input: TensorRef, output: TensorRef, ranges: &[AxisRange]) -> ForgeResult<Self> {
        require_full_rank(&input, "StridedSlice")?;
        Self::windowed("StridedSlice", input, output, ranges)
    }

    fn windowed(
        name: &'static str,
        input: TensorRef,
        output: TensorRef,
        ranges: &[AxisRange],
    ) -> ForgeResult<Self> {
        let in_dims = input.dims()?;
        if ranges.len() != in_dims.len() {
            return Err(ForgeError::InvariantViolation(format!(
                "{}: {} ranges for backend rank {}",
                name,
                ranges.len(),
                in_dims.len()
            )));
        }
        let strides = dense_strides(&in_dims);
        let window: Vec<usize> = ranges.iter().map(|r| r.count).collect();
        let steps: Vec<isize> = ranges
            .iter()
            .zip(&strides)
            .map(|(r, &s)| r.step * s as isize)
            .collect();
        let base: isize = ranges
            .iter()
            .zip(&strides)
            .filter(|(r, _)| r.count > 0)
            .map(|(r, &s)| r.start * s as isize)
            .sum();
        let offsets = gather_offsets(&window, &steps, base)?;
        if output.num_elements()? != offsets.len() {
            return Err(ForgeError::InvariantViolation(format!(
                "{}: window of {} elements for output {} of {}",
                name,
                offsets.len(),
                output.operand(),
                output.num_elements()?
            )));
        }

        let logical_order = if output.dims()? == window && output.axis_map()? == input.axis_map()? {
            None
        } else {
            let map = input.axis_map()?;
            let mut logical = input.logical_dims()?;
            for (b, &count) in window.iter().enumerate() {
                if let Some(slot) = logical.get_mut(map.to_logical(b)) {
                    *slot = count;
                }
            }
            Some(physical_offsets(&logical, input.frontend_layout(), input.backend_layout())?)
        };
        trace!(kernel = name, elements = offsets.len(), "configured strided window");
        Ok(Self {
            name,
            input,
            output,
            offsets,
            logical_order,
        })
    }

    /// `perm[j]` is the input backend axis feeding output backend axis `j`
    pub fn transpose(input: TensorRef, output: TensorRef, perm: &[usize]) -> ForgeResult<Self> {
        let in_dims = input.dims()?;
        let out_dims = output.dims()?;
        if perm.len() != in_dims.len() || out_dims.len() != in_dims.len() {
            return Err(ForgeError::InvariantViolation(format!(
                "Transpose permutation {:?} for backend dims {:?}",
                perm, in_dims
            )));
        }
        let strides = dense_strides(&in_dims);
        let mut steps = Vec::with_capacity(perm.len());
        for (j, &p) in perm.iter().enumerate() {
            if in_dims.get(p) != Some(&out_dims[j]) {
                return Err(ForgeError::InvariantViolation(format!(
                    "Transpose output dims {:?} do not match input {:?} under {:?}",
                    out_dims, in_dims, perm
                )));
            }
            steps.push(strides[p] as isize);
        }
        Ok(Self {
            name: "Transpose",
            input,
            output,
            offsets: gather_offsets(&out_dims, &steps, 0)?,
            logical_order: None,
        })
    }
}

impl Function for StridedGatherKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let size = self.input.element_size();
        let data = self.input.read_bytes()?;
        let mut window = vec![0u8; self.offsets.len() * size];
        let dense: Vec<usize> = (0..self.offsets.len()).collect();
        copy_elements(&data, &self.offsets, &mut window, &dense, size)?;
        match &self.logical_order {
            None => self.output.write_bytes(&window),
            Some(order) => {
                let mut logical = vec![0u8; window.len()];
                copy_elements(&window, order, &mut logical, &dense, size)?;
                self.output.write_logical_bytes(&logical)
            }
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Offsets of the slab at `index` along backend `axis` of a dense tensor
fn slab_offsets(dims: &[usize], axis: usize, index: usize) -> ForgeResult<(Vec<usize>, Vec<usize>)> {
    let strides = dense_strides(dims);
    let mut slab = dims.to_vec();
    slab[axis] = 1;
    let steps: Vec<isize> = strides.iter().map(|&s| s as isize).collect();
    let offsets = gather_offsets(&slab, &steps, (index * strides[axis]) as isize)?;
    Ok((slab, offsets))
}

/// Stack equally shaped inputs along a new axis
pub struct PackKernel {
    inputs: Vec<TensorRef>,
    output: TensorRef,
    /// Per input: (offsets into the input, offsets into the output)
    moves: Vec<(Vec<usize>, Vec<usize>)>,
}

impl PackKernel {
    /// `axis` is the normalized logical axis of the output; `backend_axis`
    /// its remapped position.
    pub fn configure(
        inputs: Vec<TensorRef>,
        output: TensorRef,
        axis: usize,
        backend_axis: usize,
    ) -> ForgeResult<Self> {
        let out_dims = output.dims()?;
        if out_dims.get(backend_axis) != Some(&inputs.len()) {
            return Err(ForgeError::InvariantViolation(format!(
                "Pack of {} inputs into backend axis {} of {:?}",
                inputs.len(),
                backend_axis,
                out_dims
            )));
        }
        let out_map = output.axis_map()?;
        let mut moves = Vec::with_capacity(inputs.len());
        for (k, input) in inputs.iter().enumerate() {
            require_full_rank(input, "Pack")?;
            let (slab, dst) = slab_offsets(&out_dims, backend_axis, k)?;
            let steps = projected_strides(&out_map, &input.axis_map()?, &input.logical_dims()?, |l| {
                match l.cmp(&axis) {
                    std::cmp::Ordering::Less => Some(l),
                    std::cmp::Ordering::Equal => None,
                    std::cmp::Ordering::Greater => Some(l - 1),
                }
            });
            let src = gather_offsets(&slab, &steps, 0)?;
            moves.push((src, dst));
        }
        Ok(Self {
            inputs,
            output,
            moves,
        })
    }
}

impl Function for PackKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let size = self.output.element_size();
        let mut out = vec![0u8; self.output.byte_size()?];
        for (input, (src, dst)) in self.inputs.iter().zip(&self.moves) {
            copy_elements(&input.read_bytes()?, src, &mut out, dst, size)?;
        }
        self.output.write_bytes(&out)
    }

    fn name(&self) -> &str {
        "Pack"
    }
}

/// Split one input into slabs along an axis, dropping that axis
pub struct UnpackKernel {
    input: TensorRef,
    outputs: Vec<TensorRef>,
    moves: Vec<(Vec<usize>, Vec<usize>)>,
}

impl UnpackKernel {
    /// `axis` is the normalized logical axis of the input
    pub fn configure(
        input: TensorRef,
        outputs: Vec<TensorRef>,
        axis: usize,
        backend_axis: usize,
    ) -> ForgeResult<Self> {
        let in_dims = input.dims()?;
        if in_dims.get(backend_axis) != Some(&outputs.len()) {
            return Err(ForgeError::InvariantViolation(format!(
                "Unpack into {} outputs along backend axis {} of {:?}",
                outputs.len(),
                backend_axis,
                in_dims
            )));
        }
        let in_map = input.axis_map()?;
        let mut moves = Vec::with_capacity(outputs.len());
        for (k, output) in outputs.iter().enumerate() {
            require_full_rank(output, "Unpack")?;
            let (slab, src) = slab_offsets(&in_dims, backend_axis, k)?;
            let steps = projected_strides(&in_map, &output.axis_map()?, &output.logical_dims()?, |l| {
                match l.cmp(&axis) {
                    std::cmp::Ordering::Less => Some(l),
                    std::cmp::Ordering::Equal => None,
                    std::cmp::Ordering::Greater => Some(l - 1),
                }
            });
            let dst = gather_offsets(&slab, &steps, 0)?;
            moves.push((src, dst));
        }
        Ok(Self {
            input,
            outputs,
            moves,
        })
    }
}

impl Function for UnpackKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let size = self.input.element_size();
        let data = self.input.read_bytes()?;
        for (output, (src, dst)) in self.outputs.iter().zip(&self.moves) {
            let mut out = vec![0u8; output.byte_size()?];
            copy_elements(&data, src, &mut out, dst, size)?;
            output.write_bytes(&out)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "Unpack"
    }
}

fn split_moves(input: &TensorRef, outputs: &[TensorRef], axis: usize, sizes: &[usize]) -> ForgeResult<Vec<Vec<usize>>> {
    let in_dims = input.dims()?;
    let strides = dense_strides(&in_dims);
    let steps: Vec<isize> = strides.iter().map(|&s| s as isize).collect();
    let mut cursor = 0;
    let mut moves = Vec::with_capacity(outputs.len());
    for (output, &size) in outputs.iter().zip(sizes) {
        let mut dims = in_dims.clone();
        dims[axis] = size;
        if output.dims()? != dims {
            return Err(ForgeError::InvariantViolation(format!(
                "split output {} has backend dims {:?}, expected {:?}",
                output.operand(),
                output.dims()?,
                dims
            )));
        }
        moves.push(gather_offsets(&dims, &steps, (cursor * strides[axis]) as isize)?);
        cursor += size;
    }
    Ok(moves)
}

fn run_split(input: &TensorRef, outputs: &[TensorRef], moves: &[Vec<usize>]) -> ForgeResult<()> {
    let size = input.element_size();
    let data = input.read_bytes()?;
    for (output, src) in outputs.iter().zip(moves) {
        let mut out = vec![0u8; src.len() * size];
        let dense: Vec<usize> = (0..src.len()).collect();
        copy_elements(&data, src, &mut out, &dense, size)?;
        output.write_bytes(&out)?;
    }
    Ok(())
}

/// Equal split along one backend axis
pub struct SplitKernel {
    input: TensorRef,
    outputs: Vec<TensorRef>,
    moves: Vec<Vec<usize>>,
}

impl SplitKernel {
    pub fn configure(input: TensorRef, outputs: Vec<TensorRef>, axis: usize) -> ForgeResult<Self> {
        let dim = input.dims()?.get(axis).copied().unwrap_or(1);
        let n = outputs.len();
        if n == 0 || dim % n != 0 {
            return Err(ForgeError::InvariantViolation(format!(
                "Split of extent {} into {} parts",
                dim, n
            )));
        }
        let sizes = vec![dim / n; n];
        let moves = split_moves(&input, &outputs, axis, &sizes)?;
        Ok(Self {
            input,
            outputs,
            moves,
        })
    }
}

impl Function for SplitKernel {
    fn run(&mut self) -> ForgeResult<()> {
        run_split(&self.input, &self.outputs, &self.moves)
    }

    fn name(&self) -> &str {
        "Split"
    }
}

/// Split with sizes read from a tensor on every run; one size may be -1
pub struct SplitVKernel {
    input: TensorRef,
    size_splits: TensorRef,
    outputs: Vec<TensorRef>,
    axis: usize,
}

impl SplitVKernel {
    pub fn configure(
        input: TensorRef,
        size_splits: TensorRef,
        outputs: Vec<TensorRef>,
        axis: usize,
    ) -> ForgeResult<Self> {
        require_full_rank(&input, "SplitV")?;
        if size_splits.num_elements()? != outputs.len() {
            return Err(ForgeError::InvariantViolation(format!(
                "SplitV has {} sizes for {} outputs",
                size_splits.num_elements()?,
                outputs.len()
            )));
        }
        Ok(Self {
            input,
            size_splits,
            outputs,
            axis,
        })
    }

    fn resolve_sizes(&self) -> ForgeResult<Vec<usize>> {
        let dim = self.input.dims()?.get(self.axis).copied().unwrap_or(1);
        let raw = self.size_splits.read_logical_i32()?;
        let inferred = raw.iter().filter(|&&s| s == -1).count();
        let known: i64 = raw.iter().filter(|&&s| s != -1).map(|&s| s as i64).sum();
        if inferred > 1 || raw.iter().any(|&s| s < -1) || known > dim as i64 {
            return Err(ForgeError::KernelFailed(format!(
                "SplitV sizes {:?} do not split extent {}",
                raw, dim
            )));
        }
        let sizes: Vec<usize> = raw
            .iter()
            .map(|&s| if s == -1 { (dim as i64 - known) as usize } else { s as usize })
            .collect();
        if sizes.iter().sum::<usize>() != dim {
            return Err(ForgeError::KernelFailed(format!(
                "SplitV sizes {:?} sum to {}, extent is {}",
                sizes,
                sizes.iter().sum::<usize>(),
                dim
            )));
        }
        Ok(sizes)
    }
}

impl Function for SplitVKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let sizes = self.resolve_sizes()?;
        let moves = split_moves(&self.input, &self.outputs, self.axis, &sizes)
            .map_err(|e| ForgeError::KernelFailed(e.to_string()))?;
        run_split(&self.input, &self.outputs, &moves)
    }

    fn name(&self) -> &str {
        "SplitV"
    }
}

/// `output = input[..., indices, ...]` along one axis
pub struct GatherKernel {
    input: TensorRef,
    indices: TensorRef,
    output: TensorRef,
    input_offsets: Vec<usize>,
    index_offsets: Vec<usize>,
    axis_stride: usize,
    axis_extent: usize,
}

impl GatherKernel {
    /// `axis` is the normalized logical axis of the input
    pub fn configure(
        input: TensorRef,
        indices: TensorRef,
        output: TensorRef,
        axis: usize,
    ) -> ForgeResult<Self> {
        require_full_rank(&input, "Gather")?;
        require_full_rank(&indices, "Gather")?;
        let in_dims = input.logical_dims()?;
        let idx_rank = indices.logical_rank()?;
        let out_rank = output.logical_rank()?;
        if out_rank != in_dims.len() + idx_rank - 1 {
            return Err(ForgeError::InvariantViolation(format!(
                "Gather of rank {} by rank {} indices cannot produce rank {}",
                in_dims.len(),
                idx_rank,
                out_rank
            )));
        }
        let out_map = output.axis_map()?;
        let out_dims = output.dims()?;
        let in_steps = projected_strides(&out_map, &input.axis_map()?, &in_dims, |l| {
            if l < axis {
                Some(l)
            } else if l < axis + idx_rank {
                None
            } else {
                Some(l + 1 - idx_rank)
            }
        });
        let idx_steps = projected_strides(&out_map, &indices.axis_map()?, &indices.logical_dims()?, |l| {
            if l >= axis && l < axis + idx_rank {
                Some(l - axis)
            } else {
                None
            }
        });
        let axis_stride = input.axis_map()?.logical_strides(&in_dims)[axis];
        Ok(Self {
            input_offsets: gather_offsets(&out_dims, &in_steps, 0)?,
            index_offsets: gather_offsets(&out_dims, &idx_steps, 0)?,
            axis_stride,
            axis_extent: in_dims[axis],
            input,
            indices,
            output,
        })
    }
}

impl Function for GatherKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let size = self.input.element_size();
        let data = self.input.read_bytes()?;
        let indices = self.indices.read_f32()?;
        let mut src = Vec::with_capacity(self.input_offsets.len());
        for (&base, &io) in self.input_offsets.iter().zip(&self.index_offsets) {
            let index = indices.get(io).copied().unwrap_or(-1.0) as i64;
            if index < 0 || index as usize >= self.axis_extent {
                return Err(ForgeError::KernelFailed(format!(
                    "Gather index {} out of range 0..{}",
                    index, self.axis_extent
                )));
            }
            src.push(base + index as usize * self.axis_stride);
        }
        let mut out = vec![0u8; src.len() * size];
        let dense: Vec<usize> = (0..src.len()).collect();
        copy_elements(&data, &src, &mut out, &dense, size)?;
        self.output.write_bytes(&out)
    }

    fn name(&self) -> &str {
        "Gather"
    }
}

/// One-hot encoding along a new axis of the output
pub struct OneHotKernel {
    indices: TensorRef,
    on_value: TensorRef,
    off_value: TensorRef,
    output: TensorRef,
    index_offsets: Vec<usize>,
    positions: Vec<usize>,
}

impl OneHotKernel {
    /// `axis` is the normalized logical axis of the output
    pub fn configure(
        indices: TensorRef,
        on_value: TensorRef,
        off_value: TensorRef,
        output: TensorRef,
        axis: usize,
        backend_axis: usize,
        depth: usize,
    ) -> ForgeResult<Self> {
        require_full_rank(&output, "OneHot")?;
        let out_dims = output.dims()?;
        if out_dims.get(backend_axis) != Some(&depth) {
            return Err(ForgeError::InvariantViolation(format!(
                "OneHot depth {} does not match backend dims {:?} at axis {}",
                depth, out_dims, backend_axis
            )));
        }
        let out_map = output.axis_map()?;
        let steps = projected_strides(&out_map, &indices.axis_map()?, &indices.logical_dims()?, |l| {
            match l.cmp(&axis) {
                std::cmp::Ordering::Less => Some(l),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(l - 1),
            }
        });
        let coordinate: Vec<isize> = (0..out_dims.len())
            .map(|b| if b == backend_axis { 1 } else { 0 })
            .collect();
        Ok(Self {
            index_offsets: gather_offsets(&out_dims, &steps, 0)?,
            positions: gather_offsets(&out_dims, &coordinate, 0)?,
            indices,
            on_value,
            off_value,
            output,
        })
    }
}

fn scalar_value(tensor: &TensorRef) -> ForgeResult<f32> {
    tensor
        .read_logical_f32()?
        .first()
        .copied()
        .ok_or_else(|| ForgeError::KernelFailed(format!("operand {} is empty", tensor.operand())))
}

impl Function for OneHotKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let indices = self.indices.read_f32()?;
        let on = scalar_value(&self.on_value)?;
        let off = scalar_value(&self.off_value)?;
        let out: Vec<f32> = self
            .index_offsets
            .iter()
            .zip(&self.positions)
            .map(|(&io, &pos)| {
                let index = indices.get(io).copied().unwrap_or(-1.0) as i64;
                if index == pos as i64 {
                    on
                } else {
                    off
                }
            })
            .collect();
        self.output.write_f32(&out)
    }

    fn name(&self) -> &str {
        "OneHot"
    }
}

/// Constant padding; pads are (before, after) per backend axis
pub struct PadKernel {
    input: TensorRef,
    output: TensorRef,
    rank: usize,
    offsets: Vec<usize>,
}

impl PadKernel {
    pub fn configure(input: TensorRef, output: TensorRef, pads: &[(usize, usize)]) -> ForgeResult<Self> {
        let in_dims = input.dims()?;
        let out_dims = output.dims()?;
        if pads.len() != in_dims.len() || out_dims.len() != in_dims.len() {
            return Err(ForgeError::InvariantViolation(format!(
                "Pad list of {} entries for backend rank {}",
                pads.len(),
                in_dims.len()
            )));
        }
        for (b, &(before, after)) in pads.iter().enumerate() {
            if in_dims[b] + before + after != out_dims[b] {
                return Err(ForgeError::InvariantViolation(format!(
                    "Pad on backend axis {}: {} + {} + {} != {}",
                    b, before, in_dims[b], after, out_dims[b]
                )));
            }
        }
        let strides = dense_strides(&out_dims);
        let steps: Vec<isize> = strides.iter().map(|&s| s as isize).collect();
        let base: usize = pads.iter().zip(&strides).map(|(p, s)| p.0 * s).sum();
        Ok(Self {
            rank: input.logical_rank()?.max(1),
            offsets: gather_offsets(&in_dims, &steps, base as isize)?,
            input,
            output,
        })
    }
}

impl Function for PadKernel {
    fn run(&mut self) -> ForgeResult<()> {
        // the kernel indexes the input at full rank
        let reported = self.input.num_dimensions()?;
        if reported != self.rank {
            return Err(ForgeError::InvariantViolation(format!(
                "Pad input {} reports rank {}, kernel was built for {}",
                self.input.operand(),
                reported,
                self.rank
            )));
        }
        let size = self.output.element_size();
        let zero = self.output.type_info().zero_element();
        let mut out: Vec<u8> = zero
            .iter()
            .copied()
            .cycle()
            .take(self.output.byte_size()?)
            .collect();
        let data = self.input.read_bytes()?;
        let dense: Vec<usize> = (0..self.offsets.len()).collect();
        copy_elements(&data, &dense, &mut out, &self.offsets, size)?;
        self.output.write_bytes(&out)
    }

    fn name(&self) -> &str {
        "Pad"
    }
}

/// DepthToSpace / SpaceToDepth over rank-4 feature maps
pub struct SpaceDepthKernel {
    input: TensorRef,
    output: TensorRef,
    ifm: FeatureAccess,
    ofm: FeatureAccess,
    block: usize,
    to_space: bool,
}

impl SpaceDepthKernel {
    pub fn depth_to_space(input: TensorRef, output: TensorRef, block: usize) -> ForgeResult<Self> {
        Self::configure(input, output, block, true)
    }

    pub fn space_to_depth(input: TensorRef, output: TensorRef, block: usize) -> ForgeResult<Self> {
        Self::configure(input, output, block, false)
    }

    fn configure(input: TensorRef, output: TensorRef, block: usize, to_space: bool) -> ForgeResult<Self> {
        let ifm = FeatureAccess::of(&input)?;
        let ofm = FeatureAccess::of(&output)?;
        let (deep, shallow) = if to_space { (ifm, ofm) } else { (ofm, ifm) };
        let fits = block > 0
            && deep.shape.n == shallow.shape.n
            && shallow.shape.h == deep.shape.h * block
            && shallow.shape.w == deep.shape.w * block
            && deep.shape.c == shallow.shape.c * block * block;
        if !fits {
            return Err(ForgeError::InvariantViolation(format!(
                "block size {} does not relate {:?} and {:?}",
                block, ifm.shape, ofm.shape
            )));
        }
        Ok(Self {
            input,
            output,
            ifm,
            ofm,
            block,
            to_space,
        })
    }
}

impl Function for SpaceDepthKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let size = self.output.element_size();
        let data = self.input.read_bytes()?;
        let bs = self.block;
        let (deep_access, shallow_access) = if self.to_space {
            (self.ifm, self.ofm)
        } else {
            (self.ofm, self.ifm)
        };
        let shallow = shallow_access.shape;
        let mut deep_offsets = Vec::with_capacity(data.len() / size);
        let mut shallow_offsets = Vec::with_capacity(data.len() / size);
        for n in 0..shallow.n {
            for h in 0..shallow.h {
                for w in 0..shallow.w {
                    for c in 0..shallow.c {
                        let dc = ((h % bs) * bs + w % bs) * shallow.c + c;
                        deep_offsets.push(deep_access.offset(n, h / bs, w / bs, dc));
                        shallow_offsets.push(shallow_access.offset(n, h, w, c));
                    }
                }
            }
        }
        let mut out = vec![0u8; self.output.byte_size()?];
        if self.to_space {
            copy_elements(&data, &deep_offsets, &mut out, &shallow_offsets, size)?;
        } else {
            copy_elements(&data, &shallow_offsets, &mut out, &deep_offsets, size)?;
        }
        self.output.write_bytes(&out)
    }

    fn name(&self) -> &str {
        if self.to_space {
            "DepthToSpace"
        } else {
            "SpaceToDepth"
        }
    }
}
