//! The operand/operation graph.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::ir::{
    f32_to_bytes, i32_to_bytes, DataType, Layout, OpKind, Operand, OperandId, OperandInfo,
    Operation, OperationId, Shape, TypeInfo,
};

/// A dataflow graph of operations over operands.
///
/// Operations are stored in insertion order, which must be a topological
/// order; [`Graph::validate`] checks it.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    inputs: Vec<OperandId>,
    outputs: Vec<OperandId>,
    layout: Layout,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph authored in `layout`
    pub fn with_layout(layout: Layout) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    /// Logical layout every operation parameter is expressed in
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Empty graph carrying a copy of `other`'s operands under the same ids,
    /// with producer and consumer links cleared.
    pub(crate) fn with_operands_of(other: &Graph) -> Self {
        let operands = other
            .operands
            .iter()
            .map(|o| Operand::new(o.info().clone(), o.shared_data()))
            .collect();
        Self {
            operands,
            operations: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            layout: other.layout,
        }
    }

    pub fn add_operand(&mut self, info: OperandInfo) -> OperandId {
        let id = OperandId(self.operands.len());
        self.operands.push(Operand::new(info, None));
        id
    }

    /// Add an operand with immutable constant contents
    pub fn add_constant(&mut self, info: OperandInfo, data: Vec<u8>) -> ForgeResult<OperandId> {
        Operand::check_data_len(&info, &data)?;
        let id = OperandId(self.operands.len());
        self.operands.push(Operand::new(info, Some(Arc::from(data))));
        Ok(id)
    }

    pub fn add_constant_i32(&mut self, dims: &[usize], values: &[i32]) -> ForgeResult<OperandId> {
        self.add_constant(OperandInfo::of(dims, DataType::Int32), i32_to_bytes(values))
    }

    pub fn add_constant_f32(&mut self, dims: &[usize], values: &[f32]) -> ForgeResult<OperandId> {
        self.add_constant(OperandInfo::of(dims, DataType::Float32), f32_to_bytes(values))
    }

    /// Scalar int32 constant
    pub fn add_scalar_i32(&mut self, value: i32) -> ForgeResult<OperandId> {
        self.add_constant(
            OperandInfo::new(Shape::scalar(), TypeInfo::new(DataType::Int32)),
            i32_to_bytes(&[value]),
        )
    }

    /// Append an operation, recording producer and consumer links.
    pub fn add_operation(
        &mut self,
        kind: OpKind,
        inputs: Vec<OperandId>,
        outputs: Vec<OperandId>,
    ) -> ForgeResult<OperationId> {
        let (in_arity, out_arity) = kind.arity();
        if !in_arity.accepts(inputs.len()) || !out_arity.accepts(outputs.len()) {
            return Err(ForgeError::InvalidGraph(format!(
                "{} takes {} inputs and {} outputs, got {} and {}",
                kind.name(),
                in_arity,
                out_arity,
                inputs.len(),
                outputs.len()
            )));
        }
        for &id in inputs.iter().chain(outputs.iter()) {
            self.operand(id)?;
        }
        for &id in &outputs {
            let operand = &self.operands[id.0];
            if operand.is_constant() {
                return Err(ForgeError::InvalidGraph(format!(
                    "{} cannot write constant operand {}",
                    kind.name(),
                    id
                )));
            }
            if let Some(def) = operand.def() {
                return Err(ForgeError::InvalidGraph(format!(
                    "operand {} is already produced by operation {}",
                    id, def
                )));
            }
        }

        let op_id = OperationId(self.operations.len());
        for &id in &inputs {
            self.operands[id.0].add_use(op_id);
        }
        for &id in &outputs {
            self.operands[id.0].set_def(op_id);
        }
        self.operations.push(Operation::new(kind, inputs, outputs));
        Ok(op_id)
    }

    pub fn add_input(&mut self, id: OperandId) -> ForgeResult<()> {
        let operand = self.operand(id)?;
        if operand.is_constant() {
            return Err(ForgeError::InvalidGraph(format!(
                "constant operand {} cannot be a graph input",
                id
            )));
        }
        self.inputs.push(id);
        Ok(())
    }

    pub fn add_output(&mut self, id: OperandId) -> ForgeResult<()> {
        self.operand(id)?;
        self.outputs.push(id);
        Ok(())
    }

    pub fn operand(&self, id: OperandId) -> ForgeResult<&Operand> {
        self.operands.get(id.0).ok_or(ForgeError::OperandNotFound(id))
    }

    pub fn operation(&self, id: OperationId) -> ForgeResult<&Operation> {
        self.operations.get(id.0).ok_or_else(|| {
            ForgeError::InvalidGraph(format!("operation {} does not exist", id))
        })
    }

    pub fn operands(&self) -> impl Iterator<Item = (OperandId, &Operand)> {
        self.operands
            .iter()
            .enumerate()
            .map(|(i, o)| (OperandId(i), o))
    }

    pub fn operations(&self) -> impl Iterator<Item = (OperationId, &Operation)> {
        self.operations
            .iter()
            .enumerate()
            .map(|(i, op)| (OperationId(i), op))
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn inputs(&self) -> &[OperandId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OperandId] {
        &self.outputs
    }

    pub fn is_input(&self, id: OperandId) -> bool {
        self.inputs.contains(&id)
    }

    pub fn is_output(&self, id: OperandId) -> bool {
        self.outputs.contains(&id)
    }

    /// Check the structural rules every later stage relies on.
    pub fn validate(&self) -> ForgeResult<()> {
        let mut available: HashSet<OperandId> = self
            .operands()
            .filter(|(_, o)| o.is_constant())
            .map(|(id, _)| id)
            .collect();
        for &id in &self.inputs {
            self.operand(id)?;
            if self.operands[id.0].def().is_some() {
                return Err(ForgeError::InvalidGraph(format!(
                    "graph input {} is produced by an operation",
                    id
                )));
            }
            available.insert(id);
        }

        for (op_id, op) in self.operations() {
            let (in_arity, out_arity) = op.kind.arity();
            if !in_arity.accepts(op.inputs.len()) || !out_arity.accepts(op.outputs.len()) {
                return Err(ForgeError::InvalidGraph(format!(
                    "operation {} ({}) has the wrong operand count",
                    op_id,
                    op.name()
                )));
            }
            for &id in &op.inputs {
                self.operand(id)?;
                if !available.contains(&id) {
                    return Err(ForgeError::InvalidGraph(format!(
                        "operation {} ({}) reads operand {} before it is produced",
                        op_id,
                        op.name(),
                        id
                    )));
                }
                if !self.operands[id.0].uses().contains(&op_id) {
                    return Err(ForgeError::InvalidGraph(format!(
                        "operand {} does not record its use by operation {}",
                        id, op_id
                    )));
                }
            }
            for &id in &op.outputs {
                let operand = self.operand(id)?;
                if operand.is_constant() {
                    return Err(ForgeError::InvalidGraph(format!(
                        "operation {} writes constant operand {}",
                        op_id, id
                    )));
                }
                if operand.def() != Some(op_id) {
                    return Err(ForgeError::InvalidGraph(format!(
                        "operand {} has inconsistent producer",
                        id
                    )));
                }
                available.insert(id);
            }
        }

        for &id in &self.outputs {
            if !available.contains(&id) {
                return Err(ForgeError::InvalidGraph(format!(
                    "graph output {} is never produced",
                    id
                )));
            }
        }

        let recorded_uses: usize = self.operands.iter().map(Operand::use_count).sum();
        let actual_uses: usize = self.operations.iter().map(|op| op.inputs.len()).sum();
        if recorded_uses != actual_uses {
            return Err(ForgeError::InvalidGraph(format!(
                "use counts disagree: {} recorded, {} actual",
                recorded_uses, actual_uses
            )));
        }
        Ok(())
    }
}
