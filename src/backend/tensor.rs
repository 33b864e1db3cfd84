//! Backend tensor bindings.
//!
//! A [`BackendTensor`] is one operand's buffer view on one backend. It keeps
//! the operand's logical dims next to the backend-order dims, and a
//! `num_dimensions` that may be smaller than the logical rank when the
//! backend elides outer unit dims (dimension correction).

use std::sync::{Arc, RwLock};

use crate::backend::layout_remap::{
    backend_dims, dense_strides, gather_offsets, physical_offsets, AxisMap,
};
use crate::error::{ForgeError, ForgeResult};
use crate::ir::{Layout, OperandId, OperandInfo, TypeInfo};

/// Host memory shared between a root tensor and its sub-tensors
#[derive(Debug, Default)]
pub struct HostBuffer {
    bytes: RwLock<Vec<u8>>,
}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0; len]),
        }
    }
}

#[derive(Debug, Clone)]
struct ShapeState {
    logical: Vec<usize>,
    dims: Vec<usize>,
    num_dimensions: usize,
}

#[derive(Debug)]
enum Storage {
    Root(Arc<HostBuffer>),
    /// Region of a parent buffer. Strides and base are in elements.
    Child {
        buffer: Arc<HostBuffer>,
        strides: Vec<usize>,
        base: usize,
    },
}

/// Dims as a backend reports them: only the first `num_dimensions`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendShape {
    pub dims: Vec<usize>,
}

impl BackendShape {
    pub fn num_dimensions(&self) -> usize {
        self.dims.len()
    }
}

/// Buffer view of one operand on one backend
#[derive(Debug)]
pub struct BackendTensor {
    operand: OperandId,
    type_info: TypeInfo,
    frontend_layout: Layout,
    backend_layout: Layout,
    dynamic: bool,
    dim_correction: bool,
    shape: RwLock<ShapeState>,
    storage: Storage,
    parent: Option<OperandId>,
}

fn corrected_rank(dims: &[usize], enabled: bool) -> usize {
    if !enabled {
        return dims.len().max(1);
    }
    dims.iter().rposition(|&d| d != 1).map_or(1, |p| p + 1)
}

impl BackendTensor {
    fn shape_state(logical: &[usize], fe: Layout, be: Layout, correction: bool) -> ShapeState {
        let dims = backend_dims(logical, fe, be);
        let num_dimensions = corrected_rank(&dims, correction);
        ShapeState {
            logical: logical.to_vec(),
            dims,
            num_dimensions,
        }
    }

    /// Tensor owning a fresh zeroed buffer
    pub fn root(
        operand: OperandId,
        info: &OperandInfo,
        frontend_layout: Layout,
        backend_layout: Layout,
        dim_correction: bool,
    ) -> Self {
        let shape = Self::shape_state(
            info.shape.dims(),
            frontend_layout,
            backend_layout,
            dim_correction,
        );
        Self {
            operand,
            type_info: info.type_info.clone(),
            frontend_layout,
            backend_layout,
            dynamic: info.shape.is_dynamic(),
            dim_correction,
            shape: RwLock::new(shape),
            storage: Storage::Root(Arc::new(HostBuffer::zeroed(info.byte_size()))),
            parent: None,
        }
    }

    /// View of `parent` starting at backend coordinates `offset`
    pub fn sub_tensor(
        operand: OperandId,
        info: &OperandInfo,
        parent: &BackendTensor,
        offset: &[usize],
    ) -> ForgeResult<Self> {
        let (buffer, root_strides, root_base) = match &parent.storage {
            Storage::Root(buffer) => {
                let dims = parent.dims()?;
                (buffer.clone(), dense_strides(&dims), 0)
            }
            Storage::Child { .. } => {
                return Err(ForgeError::InvariantViolation(format!(
                    "operand {} cannot nest inside sub-tensor {}",
                    operand, parent.operand
                )))
            }
        };
        let shape = Self::shape_state(
            info.shape.dims(),
            parent.frontend_layout,
            parent.backend_layout,
            parent.dim_correction,
        );
        if offset.len() != root_strides.len() || shape.dims.len() != root_strides.len() {
            return Err(ForgeError::InvariantViolation(format!(
                "sub-tensor {} rank does not match parent {}",
                operand, parent.operand
            )));
        }
        let parent_dims = parent.dims()?;
        for axis in 0..offset.len() {
            if offset[axis] + shape.dims[axis] > parent_dims[axis] {
                return Err(ForgeError::InvariantViolation(format!(
                    "sub-tensor {} overruns parent {} on backend axis {}",
                    operand, parent.operand, axis
                )));
            }
        }
        let base = root_base
            + offset
                .iter()
                .zip(&root_strides)
                .map(|(o, s)| o * s)
                .sum::<usize>();
        Ok(Self {
            operand,
            type_info: info.type_info.clone(),
            frontend_layout: parent.frontend_layout,
            backend_layout: parent.backend_layout,
            dynamic: false,
            dim_correction: parent.dim_correction,
            shape: RwLock::new(shape),
            storage: Storage::Child {
                buffer,
                strides: root_strides,
                base,
            },
            parent: Some(parent.operand),
        })
    }

    pub fn operand(&self) -> OperandId {
        self.operand
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    pub fn element_size(&self) -> usize {
        self.type_info.element_size()
    }

    /// Layout operation parameters are expressed in
    pub fn frontend_layout(&self) -> Layout {
        self.frontend_layout
    }

    /// Layout of the physical buffer
    pub fn backend_layout(&self) -> Layout {
        self.backend_layout
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_sub_tensor(&self) -> bool {
        self.parent.is_some()
    }

    pub fn parent(&self) -> Option<OperandId> {
        self.parent
    }

    /// Operand whose buffer this tensor lives in
    pub fn root_operand(&self) -> OperandId {
        self.parent.unwrap_or(self.operand)
    }

    pub fn logical_dims(&self) -> ForgeResult<Vec<usize>> {
        Ok(self.shape.read()?.logical.clone())
    }

    pub fn logical_rank(&self) -> ForgeResult<usize> {
        Ok(self.shape.read()?.logical.len())
    }

    /// Axis correspondence for this tensor's current rank
    pub fn axis_map(&self) -> ForgeResult<AxisMap> {
        Ok(AxisMap::new(
            self.logical_rank()?,
            self.frontend_layout,
            self.backend_layout,
        ))
    }

    /// Full backend-order dims
    pub fn dims(&self) -> ForgeResult<Vec<usize>> {
        Ok(self.shape.read()?.dims.clone())
    }

    pub fn num_dimensions(&self) -> ForgeResult<usize> {
        Ok(self.shape.read()?.num_dimensions)
    }

    /// Dims as the backend currently reports them
    pub fn shape_info(&self) -> ForgeResult<BackendShape> {
        let state = self.shape.read()?;
        Ok(BackendShape {
            dims: state.dims[..state.num_dimensions.min(state.dims.len())].to_vec(),
        })
    }

    /// Override the reported rank; returns the previous value.
    pub(crate) fn set_num_dimensions(&self, rank: usize) -> ForgeResult<usize> {
        let mut state = self.shape.write()?;
        if rank == 0 || rank > state.dims.len().max(1) {
            return Err(ForgeError::InvariantViolation(format!(
                "cannot report rank {} for operand {} with {} backend dims",
                rank,
                self.operand,
                state.dims.len()
            )));
        }
        let previous = state.num_dimensions;
        state.num_dimensions = rank;
        Ok(previous)
    }

    /// Restore a saved rank; never fails, so guards can call it from `Drop`.
    pub(crate) fn restore_num_dimensions(&self, rank: usize) {
        let mut state = match self.shape.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.num_dimensions = rank;
    }

    pub fn num_elements(&self) -> ForgeResult<usize> {
        Ok(self.shape.read()?.logical.iter().product())
    }

    pub fn byte_size(&self) -> ForgeResult<usize> {
        Ok(self.num_elements()? * self.element_size())
    }

    /// Change the logical dims of a dynamic root tensor, reallocating its
    /// buffer when the size changes.
    pub fn resize(&self, logical: &[usize]) -> ForgeResult<()> {
        let buffer = match &self.storage {
            Storage::Root(buffer) if self.dynamic => buffer,
            _ => {
                return Err(ForgeError::InvariantViolation(format!(
                    "operand {} is not a resizable tensor",
                    self.operand
                )))
            }
        };
        let mut state = self.shape.write()?;
        if state.logical.len() != logical.len() {
            return Err(ForgeError::InvalidIo(format!(
                "operand {} has rank {}, got shape of rank {}",
                self.operand,
                state.logical.len(),
                logical.len()
            )));
        }
        if state.logical == logical {
            return Ok(());
        }
        *state = Self::shape_state(
            logical,
            self.frontend_layout,
            self.backend_layout,
            self.dim_correction,
        );
        let len = logical.iter().product::<usize>() * self.element_size();
        let mut bytes = buffer.bytes.write()?;
        bytes.clear();
        bytes.resize(len, 0);
        Ok(())
    }

    fn child_offsets(&self, strides: &[usize], base: usize) -> ForgeResult<Vec<usize>> {
        let dims = self.dims()?;
        let strides: Vec<isize> = strides.iter().map(|&s| s as isize).collect();
        gather_offsets(&dims, &strides, base as isize)
    }

    /// Contents in backend order (axis 0 fastest), densely packed
    pub fn read_bytes(&self) -> ForgeResult<Vec<u8>> {
        let size = self.element_size();
        match &self.storage {
            Storage::Root(buffer) => Ok(buffer.bytes.read()?.clone()),
            Storage::Child {
                buffer,
                strides,
                base,
            } => {
                let offsets = self.child_offsets(strides, *base)?;
                let bytes = buffer.bytes.read()?;
                let mut out = Vec::with_capacity(offsets.len() * size);
                for off in offsets {
                    let start = off * size;
                    let chunk = bytes.get(start..start + size).ok_or_else(|| {
                        ForgeError::InvariantViolation(format!(
                            "sub-tensor {} reads past its parent buffer",
                            self.operand
                        ))
                    })?;
                    out.extend_from_slice(chunk);
                }
                Ok(out)
            }
        }
    }

    /// Overwrite the contents from densely packed backend-order bytes
    pub fn write_bytes(&self, data: &[u8]) -> ForgeResult<()> {
        let expected = self.byte_size()?;
        if data.len() != expected {
            return Err(ForgeError::InvariantViolation(format!(
                "operand {} holds {} bytes, got {}",
                self.operand,
                expected,
                data.len()
            )));
        }
        let size = self.element_size();
        match &self.storage {
            Storage::Root(buffer) => {
                let mut bytes = buffer.bytes.write()?;
                bytes.copy_from_slice(data);
                Ok(())
            }
            Storage::Child {
                buffer,
                strides,
                base,
            } => {
                let offsets = self.child_offsets(strides, *base)?;
                let mut bytes = buffer.bytes.write()?;
                for (i, off) in offsets.into_iter().enumerate() {
                    let start = off * size;
                    let dst = bytes.get_mut(start..start + size).ok_or_else(|| {
                        ForgeError::InvariantViolation(format!(
                            "sub-tensor {} writes past its parent buffer",
                            self.operand
                        ))
                    })?;
                    dst.copy_from_slice(&data[i * size..(i + 1) * size]);
                }
                Ok(())
            }
        }
    }

    /// Quantization channel of each backend-order element
    fn backend_channel_fn(&self) -> ForgeResult<impl Fn(usize) -> usize> {
        let dims = self.dims()?;
        let map = self.axis_map()?;
        let (inner, extent) = match self.type_info.quant.as_ref().and_then(|q| q.channel_axis) {
            Some(axis) if axis < map.rank() => {
                let b = map.to_backend(axis);
                (dims[..b].iter().product::<usize>(), dims[b])
            }
            _ => (1, 1),
        };
        Ok(move |i: usize| (i / inner.max(1)) % extent.max(1))
    }

    fn logical_channel_fn(&self) -> ForgeResult<impl Fn(usize) -> usize> {
        let logical = self.logical_dims()?;
        let (inner, extent) = match self.type_info.quant.as_ref().and_then(|q| q.channel_axis) {
            Some(axis) if axis < logical.len() => (
                logical[axis + 1..].iter().product::<usize>(),
                logical[axis],
            ),
            _ => (1, 1),
        };
        Ok(move |i: usize| (i / inner.max(1)) % extent.max(1))
    }

    /// Decoded contents in backend order
    pub fn read_f32(&self) -> ForgeResult<Vec<f32>> {
        let bytes = self.read_bytes()?;
        self.type_info.decode_f32(&bytes, self.backend_channel_fn()?)
    }

    pub fn write_f32(&self, values: &[f32]) -> ForgeResult<()> {
        let bytes = self.type_info.encode_f32(values, self.backend_channel_fn()?);
        self.write_bytes(&bytes)
    }

    /// Contents in logical row-major order
    pub fn read_logical_bytes(&self) -> ForgeResult<Vec<u8>> {
        let physical = self.read_bytes()?;
        let offsets =
            physical_offsets(&self.logical_dims()?, self.frontend_layout, self.backend_layout)?;
        let size = self.element_size();
        let mut out = Vec::with_capacity(physical.len());
        for off in offsets {
            let chunk = physical.get(off * size..(off + 1) * size).ok_or_else(|| {
                ForgeError::InvariantViolation(format!(
                    "operand {} buffer is smaller than its shape",
                    self.operand
                ))
            })?;
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    /// Overwrite the contents from logical row-major bytes
    pub fn write_logical_bytes(&self, data: &[u8]) -> ForgeResult<()> {
        let expected = self.byte_size()?;
        if data.len() != expected {
            return Err(ForgeError::InvariantViolation(format!(
                "operand {} holds {} bytes, got {}",
                self.operand,
                expected,
                data.len()
            )));
        }
        let offsets =
            physical_offsets(&self.logical_dims()?, self.frontend_layout, self.backend_layout)?;
        let size = self.element_size();
        let mut physical = vec![0u8; data.len()];
        for (i, off) in offsets.into_iter().enumerate() {
            physical[off * size..(off + 1) * size].copy_from_slice(&data[i * size..(i + 1) * size]);
        }
        self.write_bytes(&physical)
    }

    pub fn read_logical_f32(&self) -> ForgeResult<Vec<f32>> {
        let bytes = self.read_logical_bytes()?;
        self.type_info.decode_f32(&bytes, self.logical_channel_fn()?)
    }

    pub fn write_logical_f32(&self, values: &[f32]) -> ForgeResult<()> {
        let bytes = self.type_info.encode_f32(values, self.logical_channel_fn()?);
        self.write_logical_bytes(&bytes)
    }

    /// Logical row-major contents as i32
    pub fn read_logical_i32(&self) -> ForgeResult<Vec<i32>> {
        Ok(self.read_logical_f32()?.into_iter().map(|v| v as i32).collect())
    }
}
