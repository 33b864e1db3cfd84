//! Executors of every (model, subgraph) in a package.
//!
//! A single-model package runs its entry subgraph directly. With several
//! models, edges route one model's outputs into another's inputs and the
//! package I/O lists say which model slots the caller's buffers bind to.
//! Models run in dependency order; models on the same level run
//! concurrently.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{ForgeError, ForgeResult};
use crate::exec::io::IoDescription;
use crate::exec::subgraph::{copy_output, CompiledSubgraph};
use crate::ir::{IoIndex, ModelIndex, OperandInfo, SubgraphIndex};

/// One input or output slot of one model's primary subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoSlot {
    pub model: ModelIndex,
    pub index: IoIndex,
}

impl IoSlot {
    pub fn new(model: usize, index: usize) -> Self {
        Self {
            model: ModelIndex(model),
            index: IoIndex(index),
        }
    }
}

/// Output `from` of one model feeds input `to` of another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelEdge {
    pub from: IoSlot,
    pub to: IoSlot,
}

type Staged = (Vec<usize>, Vec<u8>);

/// Registry of compiled subgraphs, keyed by (model, subgraph)
#[derive(Debug, Default)]
pub struct Executors {
    executors: BTreeMap<(ModelIndex, SubgraphIndex), CompiledSubgraph>,
    edges: Vec<ModelEdge>,
    package_inputs: Vec<IoSlot>,
    package_outputs: Vec<IoSlot>,
}

const PRIMARY: SubgraphIndex = SubgraphIndex(0);

impl Executors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor`. A key may be registered once.
    pub fn emplace(
        &mut self,
        model: ModelIndex,
        subgraph: SubgraphIndex,
        executor: CompiledSubgraph,
    ) -> ForgeResult<()> {
        if self.executors.contains_key(&(model, subgraph)) {
            return Err(ForgeError::DuplicateExecutor { model, subgraph });
        }
        self.executors.insert((model, subgraph), executor);
        Ok(())
    }

    pub fn at(&self, model: ModelIndex, subgraph: SubgraphIndex) -> ForgeResult<&CompiledSubgraph> {
        self.executors
            .get(&(model, subgraph))
            .ok_or(ForgeError::ExecutorNotFound { model, subgraph })
    }

    /// The executor of (model 0, subgraph 0)
    pub fn entry(&self) -> ForgeResult<&CompiledSubgraph> {
        self.at(ModelIndex(0), PRIMARY)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn add_edge(&mut self, from: IoSlot, to: IoSlot) {
        self.edges.push(ModelEdge { from, to });
    }

    pub fn add_package_input(&mut self, slot: IoSlot) {
        self.package_inputs.push(slot);
    }

    pub fn add_package_output(&mut self, slot: IoSlot) {
        self.package_outputs.push(slot);
    }

    pub fn edges(&self) -> &[ModelEdge] {
        &self.edges
    }

    fn is_package(&self) -> bool {
        !self.edges.is_empty() || !self.package_inputs.is_empty() || !self.package_outputs.is_empty()
    }

    pub fn input_size(&self) -> ForgeResult<usize> {
        if self.is_package() {
            Ok(self.package_inputs.len())
        } else {
            Ok(self.entry()?.input_count())
        }
    }

    pub fn output_size(&self) -> ForgeResult<usize> {
        if self.is_package() {
            Ok(self.package_outputs.len())
        } else {
            Ok(self.entry()?.output_count())
        }
    }

    pub fn input_info(&self, index: usize) -> ForgeResult<&OperandInfo> {
        if !self.is_package() {
            return self.entry()?.input_info(index);
        }
        let slot = self
            .package_inputs
            .get(index)
            .ok_or_else(|| ForgeError::InvalidIo(format!("no package input {}", index)))?;
        self.at(slot.model, PRIMARY)?.input_info(slot.index.0)
    }

    pub fn output_info(&self, index: usize) -> ForgeResult<&OperandInfo> {
        if !self.is_package() {
            return self.entry()?.output_info(index);
        }
        let slot = self
            .package_outputs
            .get(index)
            .ok_or_else(|| ForgeError::InvalidIo(format!("no package output {}", index)))?;
        self.at(slot.model, PRIMARY)?.output_info(slot.index.0)
    }

    /// Models that take part in a package run, grouped by dependency level
    pub fn model_levels(&self) -> ForgeResult<Vec<Vec<ModelIndex>>> {
        let mut models: BTreeSet<ModelIndex> = BTreeSet::new();
        models.insert(ModelIndex(0));
        for edge in &self.edges {
            models.insert(edge.from.model);
            models.insert(edge.to.model);
        }
        models.extend(self.package_inputs.iter().map(|s| s.model));
        models.extend(self.package_outputs.iter().map(|s| s.model));

        let mut level: BTreeMap<ModelIndex, usize> = models.iter().map(|&m| (m, 0)).collect();
        // longest-path relaxation; more rounds than models means a cycle
        for _ in 0..=models.len() {
            let mut changed = false;
            for edge in &self.edges {
                let next = level[&edge.from.model] + 1;
                if next > level[&edge.to.model] {
                    level.insert(edge.to.model, next);
                    changed = true;
                }
            }
            if !changed {
                let depth = level.values().max().map_or(0, |m| m + 1);
                let mut levels = vec![Vec::new(); depth];
                for (model, l) in level {
                    levels[l].push(model);
                }
                return Ok(levels);
            }
        }
        Err(ForgeError::InvalidConfiguration(
            "model edges form a cycle".to_string(),
        ))
    }

    /// Copy caller inputs in, run, copy outputs out
    pub fn execute(&self, io: &mut IoDescription<'_>) -> ForgeResult<()> {
        if !self.is_package() {
            return self.entry()?.execute(io);
        }
        if io.inputs.len() != self.package_inputs.len() || io.outputs.len() != self.package_outputs.len() {
            return Err(ForgeError::InvalidIo(format!(
                "package expects {} inputs and {} outputs, got {} and {}",
                self.package_inputs.len(),
                self.package_outputs.len(),
                io.inputs.len(),
                io.outputs.len()
            )));
        }

        let levels = self.model_levels()?;
        let caller: &IoDescription<'_> = io;
        let produced: Mutex<BTreeMap<ModelIndex, Vec<Staged>>> = Mutex::new(BTreeMap::new());
        for level in &levels {
            debug!(models = ?level, "running model level");
            let results: Vec<(ModelIndex, Vec<Staged>)> = level
                .par_iter()
                .map(|&model| {
                    let inputs = self.gather_inputs(model, caller, &produced)?;
                    let borrowed: Vec<(Vec<usize>, &[u8])> = inputs
                        .iter()
                        .map(|(dims, bytes)| (dims.clone(), bytes.as_slice()))
                        .collect();
                    let outputs = self.at(model, PRIMARY)?.execute_staged(&borrowed)?;
                    Ok((model, outputs))
                })
                .collect::<ForgeResult<_>>()?;
            produced.lock()?.extend(results);
        }

        let produced = produced.into_inner()?;
        for (k, slot) in self.package_outputs.iter().enumerate() {
            let (_, bytes) = produced
                .get(&slot.model)
                .and_then(|outs| outs.get(slot.index.0))
                .ok_or_else(|| ForgeError::InvalidIo(format!("package output {} was not produced", k)))?;
            let dynamic = self.at(slot.model, PRIMARY)?.output_tensor(slot.index.0)?.is_dynamic();
            copy_output(k, bytes, &mut io.outputs[k], dynamic)?;
        }
        info!(models = produced.len(), "package executed");
        Ok(())
    }

    /// Inputs of `model`, from the caller's buffers or upstream outputs
    fn gather_inputs(
        &self,
        model: ModelIndex,
        io: &IoDescription<'_>,
        produced: &Mutex<BTreeMap<ModelIndex, Vec<Staged>>>,
    ) -> ForgeResult<Vec<Staged>> {
        let executor = self.at(model, PRIMARY)?;
        let mut inputs = Vec::with_capacity(executor.input_count());
        for index in 0..executor.input_count() {
            let slot = IoSlot {
                model,
                index: IoIndex(index),
            };
            if let Some(k) = self.package_inputs.iter().position(|s| *s == slot) {
                let dims = match io.input_shapes.get(&k) {
                    Some(dims) => dims.clone(),
                    None => executor.input_tensor(index)?.logical_dims()?,
                };
                inputs.push((dims, io.inputs[k].to_vec()));
                continue;
            }
            let edge = self
                .edges
                .iter()
                .find(|e| e.to == slot)
                .ok_or_else(|| {
                    ForgeError::InvalidIo(format!("input {} of model {} is not bound", index, model))
                })?;
            let staged = produced
                .lock()?
                .get(&edge.from.model)
                .and_then(|outs| outs.get(edge.from.index.0))
                .cloned()
                .ok_or_else(|| {
                    crate::invariant!("model {} ran before its producer {}", model, edge.from.model)
                })?;
            inputs.push(staged);
        }
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::builtin::PermuteLayer;
    use crate::backend::BackendTensor;
    use crate::config::ExecutionMode;
    use crate::exec::subgraph::{CompiledSequence, IoTensor};
    use crate::exec::FunctionSequence;
    use crate::ir::{f32_to_bytes, bytes_to_f32, DataType, Layout, OperandId, OperandInfo};
    use crate::profiling::CpuTimer;

    /// Subgraph copying its single input to its single output
    fn copy_subgraph(len: usize) -> CompiledSubgraph {
        let info = OperandInfo::of(&[len], DataType::Float32);
        let input = Arc::new(BackendTensor::root(OperandId(0), &info, Layout::Nhwc, Layout::Nhwc, false));
        let output = Arc::new(BackendTensor::root(OperandId(1), &info, Layout::Nhwc, Layout::Nhwc, false));
        let mut functions = FunctionSequence::new();
        functions.push(Box::new(PermuteLayer::configure(input.clone(), output.clone()).unwrap()));
        let sequence = CompiledSequence {
            backend: "builtin".to_string(),
            operation_count: 1,
            functions,
            reads: [OperandId(0)].into_iter().collect(),
            writes: [OperandId(1)].into_iter().collect(),
            timer: Box::new(CpuTimer::new()),
        };
        CompiledSubgraph::new(
            vec![sequence],
            vec![IoTensor { operand: OperandId(0), info: info.clone(), tensor: input }],
            vec![IoTensor { operand: OperandId(1), info, tensor: output }],
            ExecutionMode::Linear,
            None,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_emplace_twice_is_rejected() {
        let mut executors = Executors::new();
        executors.emplace(ModelIndex(0), SubgraphIndex(0), copy_subgraph(2)).unwrap();
        let err = executors
            .emplace(ModelIndex(0), SubgraphIndex(0), copy_subgraph(2))
            .unwrap_err();
        assert!(matches!(err, ForgeError::DuplicateExecutor { .. }));
        assert!(matches!(
            executors.at(ModelIndex(1), SubgraphIndex(0)),
            Err(ForgeError::ExecutorNotFound { .. })
        ));
        assert_eq!(executors.len(), 1);
    }

    #[test]
    fn test_single_model_runs_entry() {
        let mut executors = Executors::new();
        executors.emplace(ModelIndex(0), SubgraphIndex(0), copy_subgraph(3)).unwrap();
        assert_eq!(executors.input_size().unwrap(), 1);

        let input = f32_to_bytes(&[1.0, 2.0, 3.0]);
        let mut output = vec![0u8; 12];
        let mut io = IoDescription::new().with_input(&input).with_output(&mut output);
        executors.execute(&mut io).unwrap();
        assert_eq!(bytes_to_f32(&output), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_chained_models_pass_outputs_along() {
        let mut executors = Executors::new();
        for model in 0..3 {
            executors.emplace(ModelIndex(model), SubgraphIndex(0), copy_subgraph(2)).unwrap();
        }
        executors.add_package_input(IoSlot::new(0, 0));
        executors.add_edge(IoSlot::new(0, 0), IoSlot::new(1, 0));
        executors.add_edge(IoSlot::new(1, 0), IoSlot::new(2, 0));
        executors.add_package_output(IoSlot::new(2, 0));

        let levels = executors.model_levels().unwrap();
        assert_eq!(levels, vec![vec![ModelIndex(0)], vec![ModelIndex(1)], vec![ModelIndex(2)]]);

        let input = f32_to_bytes(&[4.0, 5.0]);
        let mut output = vec![0u8; 8];
        let mut io = IoDescription::new().with_input(&input).with_output(&mut output);
        executors.execute(&mut io).unwrap();
        assert_eq!(bytes_to_f32(&output), vec![4.0, 5.0]);
    }

    #[test]
    fn test_package_and_single_model_size_outputs_alike() {
        let input = f32_to_bytes(&[4.0, 5.0]);
        let oversized = |executors: &Executors| {
            let mut output = vec![0u8; 12];
            let mut io = IoDescription::new().with_input(&input).with_output(&mut output);
            executors.execute(&mut io).unwrap_err()
        };

        let mut single = Executors::new();
        single.emplace(ModelIndex(0), SubgraphIndex(0), copy_subgraph(2)).unwrap();

        let mut package = Executors::new();
        package.emplace(ModelIndex(0), SubgraphIndex(0), copy_subgraph(2)).unwrap();
        package.emplace(ModelIndex(1), SubgraphIndex(0), copy_subgraph(2)).unwrap();
        package.add_package_input(IoSlot::new(0, 0));
        package.add_edge(IoSlot::new(0, 0), IoSlot::new(1, 0));
        package.add_package_output(IoSlot::new(1, 0));

        for executors in [&single, &package] {
            assert!(matches!(
                oversized(executors),
                ForgeError::IoSizeMismatch {
                    direction: "output",
                    index: 0,
                    expected: 8,
                    actual: 12,
                }
            ));
        }
    }

    #[test]
    fn test_unbound_model_input_is_reported() {
        let mut executors = Executors::new();
        executors.emplace(ModelIndex(0), SubgraphIndex(0), copy_subgraph(2)).unwrap();
        executors.emplace(ModelIndex(1), SubgraphIndex(0), copy_subgraph(2)).unwrap();
        executors.add_package_input(IoSlot::new(0, 0));
        executors.add_package_output(IoSlot::new(1, 0));

        let input = f32_to_bytes(&[1.0, 2.0]);
        let mut output = vec![0u8; 8];
        let mut io = IoDescription::new().with_input(&input).with_output(&mut output);
        assert!(matches!(executors.execute(&mut io), Err(ForgeError::InvalidIo(_))));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut executors = Executors::new();
        executors.add_edge(IoSlot::new(0, 0), IoSlot::new(1, 0));
        executors.add_edge(IoSlot::new(1, 0), IoSlot::new(0, 0));
        assert!(matches!(
            executors.model_levels(),
            Err(ForgeError::InvalidConfiguration(_))
        ));
    }
}
