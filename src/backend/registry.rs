//! Tensor registries: operand id to backend tensor, per backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::layout_remap::{backend_dims, normalize_axis, to_backend_axis};
use crate::backend::tensor::BackendTensor;
use crate::backend::BackendConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::ir::{Graph, Layout, OpKind, OperandId, OperandInfo, OperationId};

/// Tensors of one backend
#[derive(Debug, Default)]
pub struct TensorRegistry {
    backend_id: String,
    tensors: HashMap<OperandId, Arc<BackendTensor>>,
}

impl TensorRegistry {
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            tensors: HashMap::new(),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Bind `tensor` to `operand`. Binding an operand twice is an internal error.
    pub fn register(&mut self, operand: OperandId, tensor: Arc<BackendTensor>) -> ForgeResult<()> {
        if self.tensors.contains_key(&operand) {
            return Err(ForgeError::InvariantViolation(format!(
                "{} backend: operand {} registered twice",
                self.backend_id, operand
            )));
        }
        self.tensors.insert(operand, tensor);
        Ok(())
    }

    pub fn get(&self, operand: OperandId) -> ForgeResult<Arc<BackendTensor>> {
        self.tensors
            .get(&operand)
            .cloned()
            .ok_or_else(|| ForgeError::TensorNotBound {
                backend: self.backend_id.clone(),
                operand,
            })
    }

    pub fn contains(&self, operand: OperandId) -> bool {
        self.tensors.contains_key(&operand)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OperandId, &Arc<BackendTensor>)> {
        self.tensors.iter()
    }

    /// True when every child already lives inside `parent`'s buffer
    pub fn are_sub_tensors_of(&self, parent: OperandId, children: &[OperandId]) -> bool {
        !children.is_empty()
            && children.iter().all(|c| {
                self.tensors
                    .get(c)
                    .map_or(false, |t| t.parent() == Some(parent))
            })
    }
}

/// Every backend's registry, keyed by backend id
#[derive(Debug, Default)]
pub struct TensorRegistries {
    registries: BTreeMap<String, TensorRegistry>,
}

impl TensorRegistries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registry: TensorRegistry) {
        self.registries
            .insert(registry.backend_id().to_string(), registry);
    }

    pub fn get(&self, backend_id: &str) -> ForgeResult<&TensorRegistry> {
        self.registries
            .get(backend_id)
            .ok_or_else(|| ForgeError::UnknownBackend(backend_id.to_string()))
    }

    /// The tensor bound to `operand` on whichever backend owns it
    pub fn find(&self, operand: OperandId) -> ForgeResult<Arc<BackendTensor>> {
        self.registries
            .values()
            .find_map(|r| r.tensors.get(&operand).cloned())
            .ok_or_else(|| ForgeError::TensorNotBound {
                backend: "any".to_string(),
                operand,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorRegistry> {
        self.registries.values()
    }
}

#[derive(Debug, Clone)]
struct PlannedTensor {
    info: OperandInfo,
    frontend: Layout,
    backend: Layout,
    constant: Option<Arc<[u8]>>,
}

#[derive(Debug, Clone)]
struct SubTensorPlan {
    parent: OperandId,
    offset: Vec<usize>,
}

/// Collects tensor requests for one backend, then allocates them
#[derive(Debug)]
pub struct TensorBuilder {
    backend_id: String,
    dim_correction: bool,
    support_permutation: bool,
    planned: BTreeMap<OperandId, PlannedTensor>,
    children: BTreeMap<OperandId, SubTensorPlan>,
}

impl TensorBuilder {
    pub fn new(config: &dyn BackendConfig) -> Self {
        Self {
            backend_id: config.id().to_string(),
            dim_correction: config.apply_dim_correction(),
            support_permutation: config.support_permutation(),
            planned: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn register(
        &mut self,
        operand: OperandId,
        info: OperandInfo,
        frontend: Layout,
        backend: Layout,
    ) -> ForgeResult<()> {
        if self.planned.contains_key(&operand) {
            return Err(ForgeError::InvariantViolation(format!(
                "{} backend: operand {} registered twice",
                self.backend_id, operand
            )));
        }
        self.planned.insert(
            operand,
            PlannedTensor {
                info,
                frontend,
                backend,
                constant: None,
            },
        );
        Ok(())
    }

    /// Register a constant; its data is copied in when the tensors are built
    pub fn register_constant(
        &mut self,
        operand: OperandId,
        info: OperandInfo,
        data: Arc<[u8]>,
        frontend: Layout,
        backend: Layout,
    ) -> ForgeResult<()> {
        self.register(operand, info, frontend, backend)?;
        if let Some(planned) = self.planned.get_mut(&operand) {
            planned.constant = Some(data);
        }
        Ok(())
    }

    pub fn is_registered(&self, operand: OperandId) -> bool {
        self.planned.contains_key(&operand)
    }

    pub fn is_sub_tensor(&self, operand: OperandId) -> bool {
        self.children.contains_key(&operand)
    }

    fn is_parent(&self, operand: OperandId) -> bool {
        self.children.values().any(|c| c.parent == operand)
    }

    /// Try to place every input of Concat `op` inside its output buffer.
    ///
    /// Returns whether the inputs became sub-tensors. Any input that fails
    /// the aliasing rules leaves the concat as an explicit copy.
    pub fn plan_concat(&mut self, graph: &Graph, op: OperationId) -> ForgeResult<bool> {
        if !self.support_permutation {
            return Ok(false);
        }
        let operation = graph.operation(op)?;
        let axis = match &operation.kind {
            OpKind::Concat(p) => p.axis,
            other => {
                return Err(ForgeError::InvariantViolation(format!(
                    "sub-tensor planning on {}",
                    other.name()
                )))
            }
        };
        let output = match operation.output(0) {
            Some(o) => o,
            None => return Ok(false),
        };
        let out_plan = match self.planned.get(&output) {
            Some(p) => p.clone(),
            None => return Ok(false),
        };
        if self.is_sub_tensor(output)
            || out_plan.constant.is_some()
            || out_plan.info.shape.is_dynamic()
        {
            return Ok(false);
        }

        let rank = out_plan.info.shape.rank();
        let mut seen = HashSet::new();
        for &input in &operation.inputs {
            let operand = graph.operand(input)?;
            let plan = match self.planned.get(&input) {
                Some(p) => p,
                None => return Ok(false),
            };
            let eligible = seen.insert(input)
                && !operand.is_constant()
                && !operand.is_dynamic()
                && !graph.is_input(input)
                && !graph.is_output(input)
                && operand.use_count() == 1
                && !self.is_sub_tensor(input)
                && !self.is_parent(input)
                && plan.frontend == out_plan.frontend
                && plan.backend == out_plan.backend
                && plan.info.shape.rank() == rank
                && plan.info.type_info == out_plan.info.type_info;
            if !eligible {
                trace!(operation = %op, operand = %input, "concat input cannot alias output");
                return Ok(false);
            }
        }

        let axis = to_backend_axis(
            rank,
            normalize_axis(axis, rank)?,
            out_plan.frontend,
            out_plan.backend,
        );
        let mut cursor = 0;
        let mut plans = Vec::with_capacity(operation.inputs.len());
        for &input in &operation.inputs {
            let dims = backend_dims(
                graph.operand(input)?.shape().dims(),
                out_plan.frontend,
                out_plan.backend,
            );
            let mut offset = vec![0; dims.len()];
            offset[axis] = cursor;
            cursor += dims[axis];
            plans.push((input, offset));
        }
        let out_dims = backend_dims(out_plan.info.shape.dims(), out_plan.frontend, out_plan.backend);
        if cursor != out_dims[axis] {
            return Err(ForgeError::InvariantViolation(format!(
                "concat {} inputs cover {} of {} along backend axis {}",
                op, cursor, out_dims[axis], axis
            )));
        }

        for (input, offset) in plans {
            self.children.insert(
                input,
                SubTensorPlan {
                    parent: output,
                    offset,
                },
            );
        }
        debug!(
            backend = %self.backend_id,
            operation = %op,
            parent = %output,
            children = operation.inputs.len(),
            "concat inputs planned as sub-tensors"
        );
        Ok(true)
    }

    /// Allocate every planned tensor and copy constant data in.
    pub fn build(self) -> ForgeResult<TensorRegistry> {
        let mut registry = TensorRegistry::new(self.backend_id.clone());

        for (&operand, plan) in &self.planned {
            if self.children.contains_key(&operand) {
                continue;
            }
            let tensor = BackendTensor::root(
                operand,
                &plan.info,
                plan.frontend,
                plan.backend,
                self.dim_correction,
            );
            if let Some(data) = &plan.constant {
                tensor.write_logical_bytes(data)?;
            }
            registry.register(operand, Arc::new(tensor))?;
        }

        for (&operand, child) in &self.children {
            let plan = self.planned.get(&operand).ok_or_else(|| {
                ForgeError::InvariantViolation(format!("sub-tensor {} was never registered", operand))
            })?;
            let parent = registry.get(child.parent)?;
            let tensor = BackendTensor::sub_tensor(operand, &plan.info, &parent, &child.offset)?;
            registry.register(operand, Arc::new(tensor))?;
        }

        debug!(
            backend = %self.backend_id,
            tensors = registry.len(),
            sub_tensors = self.children.len(),
            "tensors built"
        );
        Ok(registry)
    }
}
