//! Operands: typed tensor slots of a graph.

use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::ir::{bytes_to_i32, DataType, OperationId, Shape, TypeInfo};

/// Shape and type of an operand
#[derive(Debug, Clone, PartialEq)]
pub struct OperandInfo {
    pub shape: Shape,
    pub type_info: TypeInfo,
}

impl OperandInfo {
    pub fn new(shape: impl Into<Shape>, type_info: TypeInfo) -> Self {
        Self {
            shape: shape.into(),
            type_info,
        }
    }

    pub fn of(dims: &[usize], dtype: DataType) -> Self {
        Self::new(Shape::new(dims.to_vec()), TypeInfo::new(dtype))
    }

    pub fn dtype(&self) -> DataType {
        self.type_info.dtype
    }

    pub fn byte_size(&self) -> usize {
        self.shape.num_elements() * self.type_info.element_size()
    }
}

/// A node-independent tensor slot.
///
/// Constant data is shared and never mutated once the operand exists.
#[derive(Debug, Clone)]
pub struct Operand {
    info: OperandInfo,
    data: Option<Arc<[u8]>>,
    def: Option<OperationId>,
    uses: Vec<OperationId>,
}

impl Operand {
    pub(crate) fn new(info: OperandInfo, data: Option<Arc<[u8]>>) -> Self {
        Self {
            info,
            data,
            def: None,
            uses: Vec::new(),
        }
    }

    pub fn info(&self) -> &OperandInfo {
        &self.info
    }

    pub fn shape(&self) -> &Shape {
        &self.info.shape
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.info.type_info
    }

    pub fn dtype(&self) -> DataType {
        self.info.type_info.dtype
    }

    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_dynamic(&self) -> bool {
        self.info.shape.is_dynamic()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub(crate) fn shared_data(&self) -> Option<Arc<[u8]>> {
        self.data.clone()
    }

    /// The operation producing this operand, if any
    pub fn def(&self) -> Option<OperationId> {
        self.def
    }

    pub fn uses(&self) -> &[OperationId] {
        &self.uses
    }

    pub fn use_count(&self) -> usize {
        self.uses.len()
    }

    pub(crate) fn set_def(&mut self, op: OperationId) {
        self.def = Some(op);
    }

    pub(crate) fn add_use(&mut self, op: OperationId) {
        self.uses.push(op);
    }

    /// Constant contents as i32 values
    pub fn as_i32_vec(&self) -> Option<Vec<i32>> {
        if self.dtype() != DataType::Int32 {
            return None;
        }
        self.data().map(bytes_to_i32)
    }

    /// Single constant i32
    pub fn as_i32_scalar(&self) -> Option<i32> {
        self.as_i32_vec()
            .and_then(|v| if v.len() == 1 { Some(v[0]) } else { None })
    }

    pub(crate) fn check_data_len(info: &OperandInfo, data: &[u8]) -> ForgeResult<()> {
        if data.len() != info.byte_size() {
            return Err(ForgeError::InvalidGraph(format!(
                "constant of shape {} and type {} needs {} bytes, got {}",
                info.shape,
                info.dtype().name(),
                info.byte_size(),
                data.len()
            )));
        }
        Ok(())
    }
}
