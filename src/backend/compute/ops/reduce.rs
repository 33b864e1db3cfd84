//! Reductions over backend axes.
//!
//! Both kernels produce a keep-dims result in the input's backend order.
//! When the output drops the reduced axes its backend order no longer
//! matches, so the result goes out through the logical view instead.

use crate::backend::compute::ops::{split_at_axis, TensorRef};
use crate::backend::layout_remap::{dense_strides, gather_offsets, physical_offsets};
use crate::error::{ForgeError, ForgeResult};
use crate::exec::Function;
use crate::ir::ReduceType;

/// Keep-dims shape of `input` with backend `axes` collapsed, and the
/// physical offset of each of its elements in logical order
fn keep_dims_order(input: &TensorRef, axes: &[usize]) -> ForgeResult<(Vec<usize>, Vec<usize>)> {
    let map = input.axis_map()?;
    let mut logical = input.logical_dims()?;
    let mut dims = input.dims()?;
    for &b in axes {
        if b >= dims.len() {
            return Err(ForgeError::InvariantViolation(format!(
                "reduction axis {} beyond backend rank {}",
                b,
                dims.len()
            )));
        }
        dims[b] = 1;
        if !logical.is_empty() {
            logical[map.to_logical(b)] = 1;
        }
    }
    let order = physical_offsets(&logical, input.frontend_layout(), input.backend_layout())?;
    Ok((dims, order))
}

fn write_result(output: &TensorRef, result: Vec<f32>, logical_order: Option<&[usize]>) -> ForgeResult<()> {
    match logical_order {
        None => output.write_f32(&result),
        Some(order) => {
            let logical: Vec<f32> = order.iter().map(|&o| result[o]).collect();
            output.write_logical_f32(&logical)
        }
    }
}

pub struct ReduceKernel {
    input: TensorRef,
    output: TensorRef,
    op: ReduceType,
    /// Result slot of each input element
    targets: Vec<usize>,
    result_len: usize,
    counts: usize,
    logical_order: Option<Vec<usize>>,
}

impl ReduceKernel {
    pub fn configure(
        input: TensorRef,
        output: TensorRef,
        op: ReduceType,
        axes: &[usize],
        keep_dims: bool,
    ) -> ForgeResult<Self> {
        let in_dims = input.dims()?;
        let (kept, order) = keep_dims_order(&input, axes)?;
        let result_len: usize = kept.iter().product();
        if output.num_elements()? != result_len {
            return Err(ForgeError::InvariantViolation(format!(
                "Reduce output {} must hold {} elements",
                output.operand(),
                result_len
            )));
        }
        let strides: Vec<isize> = dense_strides(&kept)
            .into_iter()
            .enumerate()
            .map(|(b, s)| if axes.contains(&b) { 0 } else { s as isize })
            .collect();
        let targets = gather_offsets(&in_dims, &strides, 0)?;
        let counts = axes.iter().map(|&b| in_dims[b]).product::<usize>().max(1);
        Ok(Self {
            input,
            output,
            op,
            targets,
            result_len,
            counts,
            logical_order: if keep_dims { None } else { Some(order) },
        })
    }
}

impl Function for ReduceKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let init = match self.op {
            ReduceType::Sum | ReduceType::Mean => 0.0,
            ReduceType::Prod => 1.0,
            ReduceType::Max => f32::NEG_INFINITY,
            ReduceType::Min => f32::INFINITY,
        };
        let mut acc = vec![init; self.result_len];
        for (&v, &t) in x.iter().zip(&self.targets) {
            let slot = &mut acc[t];
            *slot = match self.op {
                ReduceType::Sum | ReduceType::Mean => *slot + v,
                ReduceType::Prod => *slot * v,
                ReduceType::Max => slot.max(v),
                ReduceType::Min => slot.min(v),
            };
        }
        if self.op == ReduceType::Mean {
            let n = self.counts as f32;
            acc.iter_mut().for_each(|v| *v /= n);
        }
        write_result(&self.output, acc, self.logical_order.as_deref())
    }

    fn name(&self) -> &str {
        match self.op {
            ReduceType::Sum => "ReduceSum",
            ReduceType::Mean => "ReduceMean",
            ReduceType::Max => "ReduceMax",
            ReduceType::Min => "ReduceMin",
            ReduceType::Prod => "ReduceProd",
        }
    }
}

/// Index of the maximum along one backend axis; first one wins on ties
pub struct ArgMaxKernel {
    input: TensorRef,
    output: TensorRef,
    axis: usize,
    logical_order: Vec<usize>,
}

impl ArgMaxKernel {
    pub fn configure(input: TensorRef, output: TensorRef, axis: usize) -> ForgeResult<Self> {
        let (kept, order) = keep_dims_order(&input, &[axis])?;
        if output.num_elements()? != kept.iter().product::<usize>() {
            return Err(ForgeError::InvariantViolation(format!(
                "ArgMax output {} has the wrong element count",
                output.operand()
            )));
        }
        Ok(Self {
            input,
            output,
            axis,
            logical_order: order,
        })
    }
}

impl Function for ArgMaxKernel {
    fn run(&mut self) -> ForgeResult<()> {
        let x = self.input.read_f32()?;
        let (outer, extent, inner) = split_at_axis(&self.input.dims()?, self.axis);
        let mut result = vec![0.0f32; outer * inner];
        for o in 0..outer {
            for i in 0..inner {
                let mut best = 0;
                let mut best_value = f32::NEG_INFINITY;
                for a in 0..extent {
                    let v = x[o * extent * inner + a * inner + i];
                    if v > best_value {
                        best_value = v;
                        best = a;
                    }
                }
                result[o * inner + i] = best as f32;
            }
        }
        write_result(&self.output, result, Some(&self.logical_order))
    }

    fn name(&self) -> &str {
        "ArgMax"
    }
}
