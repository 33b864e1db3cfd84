//! Graph compiler: turns a [`Graph`] into a runnable [`CompiledSubgraph`].
//!
//! Stages:
//! 1. validate the graph and options
//! 2. place every operation on a backend ([`partition::assign_backends`])
//! 3. insert transfers where operands cross placements
//! 4. plan tensors per backend, including Concat sub-tensors
//! 5. partition into operation sequences and generate each one
//! 6. derive read/write sets and assemble the executor

pub mod partition;

pub use partition::{assign_backends, insert_transfers, partition, LoweredGraph, Placement};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{
    create_backend_with_fp16, Backend, OperationSequence, TensorBuilder, TensorRegistries, BUILTIN_BACKEND_ID,
};
use crate::config::CompilerOptions;
use crate::error::{ForgeError, ForgeResult};
use crate::exec::{CompiledSequence, CompiledSubgraph, Executors, IoTensor};
use crate::ir::{DataType, Graph, Layout, ModelIndex, OpKind, OperandId, SubgraphIndex};
use crate::profiling::ScopedTimer;

/// Lowered graph and its sequences, before any tensor exists
#[derive(Debug, Clone)]
pub struct CompilePlan {
    pub lowered: LoweredGraph,
    pub sequences: Vec<OperationSequence>,
}

/// Compiles graphs against a fixed set of backends
pub struct Compiler {
    options: CompilerOptions,
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("options", &self.options)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Compiler {
    /// Instantiate every backend in `options.backend_list`, plus builtin
    pub fn new(options: CompilerOptions) -> ForgeResult<Self> {
        options.validate()?;
        let mut backends = BTreeMap::new();
        for id in options
            .backend_list
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(BUILTIN_BACKEND_ID))
        {
            if !backends.contains_key(id) {
                let fp16 = options.fp16_enabled(id);
                backends.insert(id.to_string(), create_backend_with_fp16(id, fp16)?);
            }
        }
        debug!(backends = ?backends.keys().collect::<Vec<_>>(), "compiler ready");
        Ok(Self { options, backends })
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    fn backend(&self, id: &str) -> ForgeResult<&Arc<dyn Backend>> {
        self.backends
            .get(id)
            .ok_or_else(|| ForgeError::UnknownBackend(id.to_string()))
    }

    /// Place, lower and partition `graph` without generating anything
    pub fn plan(&self, graph: &Graph) -> ForgeResult<CompilePlan> {
        graph.validate()?;
        let placements = assign_backends(graph, &self.options, &self.backends)?;
        let lowered = insert_transfers(graph, &placements)?;
        self.check_capabilities(&lowered)?;
        let sequences = partition(&lowered);
        Ok(CompilePlan { lowered, sequences })
    }

    /// Compile `graph` into an executor
    pub fn compile(&self, graph: &Graph) -> ForgeResult<CompiledSubgraph> {
        let _timer = ScopedTimer::new("compile");
        let plan = self.plan(graph)?;
        let registries = self.plan_tensors(&plan.lowered)?;
        let graph = &plan.lowered.graph;

        let mut compiled = Vec::with_capacity(plan.sequences.len());
        for (index, sequence) in plan.sequences.iter().enumerate() {
            let backend = self.backend(&sequence.backend)?;
            let generated = backend.generate(graph, &registries, sequence)?;
            if !generated.left_widened.is_empty() {
                debug!(
                    sequence = index,
                    operands = ?generated.left_widened,
                    "sequence leaves tensors widened"
                );
            }
            let (reads, writes) = access_sets(graph, &registries, sequence)?;
            compiled.push(CompiledSequence {
                backend: sequence.backend.clone(),
                operation_count: sequence.operations.len(),
                functions: generated.sequence,
                reads,
                writes,
                timer: backend.config().timer(),
            });
        }

        let builtin = registries.get(BUILTIN_BACKEND_ID)?;
        let bind = |ids: &[OperandId]| -> ForgeResult<Vec<IoTensor>> {
            ids.iter()
                .map(|&id| {
                    Ok(IoTensor {
                        operand: id,
                        info: graph.operand(id)?.info().clone(),
                        tensor: builtin.get(id)?,
                    })
                })
                .collect()
        };
        let inputs = bind(graph.inputs())?;
        let outputs = bind(graph.outputs())?;

        info!(
            operations = graph.operation_count(),
            transfers = plan.lowered.transfers,
            sequences = compiled.len(),
            "graph compiled"
        );
        CompiledSubgraph::new(
            compiled,
            inputs,
            outputs,
            self.options.executor,
            self.options.parallel_threads,
            self.options.profile,
        )
    }

    /// Compile `graph` as the primary subgraph of `model` and register it
    pub fn compile_into(
        &self,
        executors: &mut Executors,
        model: ModelIndex,
        graph: &Graph,
    ) -> ForgeResult<()> {
        let compiled = self.compile(graph)?;
        executors.emplace(model, SubgraphIndex(0), compiled)
    }

    /// Reject operands a backend cannot hold. Transfers are byte copies
    /// and are checked through the operations on either side.
    fn check_capabilities(&self, lowered: &LoweredGraph) -> ForgeResult<()> {
        for (id, op) in lowered.graph.operations() {
            if matches!(op.kind, OpKind::Permute(_)) {
                continue;
            }
            let placement = lowered.placement(id)?;
            let config = self.backend(&placement.backend)?.config();
            for &operand_id in op.inputs.iter().chain(op.outputs.iter()) {
                let operand = lowered.graph.operand(operand_id)?;
                if operand.is_dynamic() && !config.support_dynamic_tensor() {
                    return Err(ForgeError::unsupported(
                        config.id(),
                        op.name(),
                        format!("operand {} has a dynamic shape", operand_id),
                    ));
                }
                if operand.dtype() == DataType::Float16 && !config.support_fp16() {
                    return Err(ForgeError::unsupported(
                        config.id(),
                        op.name(),
                        format!("operand {} is float16", operand_id),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Register every tensor on the backend that holds it and build the
    /// registries
    fn plan_tensors(&self, lowered: &LoweredGraph) -> ForgeResult<TensorRegistries> {
        let graph = &lowered.graph;
        let frontend = graph.layout();
        let mut builders: BTreeMap<String, TensorBuilder> = self
            .backends
            .iter()
            .map(|(id, backend)| (id.clone(), TensorBuilder::new(backend.config())))
            .collect();
        for (&operand, home) in &lowered.homes {
            builder_for(&mut builders, &home.backend)?.register(
                operand,
                graph.operand(operand)?.info().clone(),
                frontend,
                home.layout,
            )?;
        }

        // constants are materialised once per consuming backend
        let mut constant_layouts: HashMap<(String, OperandId), Layout> = HashMap::new();
        let mut constant_uses: Vec<(OperandId, String, Layout, &'static str)> = Vec::new();
        for (id, op) in graph.operations() {
            let placement = lowered.placement(id)?;
            for &input in &op.inputs {
                if graph.operand(input)?.is_constant() {
                    constant_uses.push((input, placement.backend.clone(), placement.layout, op.name()));
                }
            }
        }
        for &output in graph.outputs() {
            if graph.operand(output)?.is_constant() {
                constant_uses.push((output, BUILTIN_BACKEND_ID.to_string(), frontend, "output"));
            }
        }
        for (operand, backend, layout, user) in constant_uses {
            match constant_layouts.get(&(backend.clone(), operand)) {
                Some(&existing) if existing == layout => continue,
                Some(_) => {
                    return Err(ForgeError::unsupported(
                        &backend,
                        user,
                        format!("constant {} is needed in two layouts", operand),
                    ))
                }
                None => {}
            }
            let source = graph.operand(operand)?;
            let data = source
                .shared_data()
                .ok_or_else(|| crate::invariant!("constant {} has no data", operand))?;
            builder_for(&mut builders, &backend)?.register_constant(
                operand,
                source.info().clone(),
                data,
                frontend,
                layout,
            )?;
            constant_layouts.insert((backend, operand), layout);
        }

        if self.options.enable_sub_tensors {
            for (id, op) in graph.operations() {
                if !matches!(op.kind, OpKind::Concat(_)) {
                    continue;
                }
                let placement = lowered.placement(id)?;
                if let Some(b) = builders.get_mut(&placement.backend) {
                    b.plan_concat(graph, id)?;
                }
            }
        }

        let mut registries = TensorRegistries::new();
        for (_, b) in builders {
            registries.insert(b.build()?);
        }
        Ok(registries)
    }
}

fn builder_for<'b>(
    builders: &'b mut BTreeMap<String, TensorBuilder>,
    id: &str,
) -> ForgeResult<&'b mut TensorBuilder> {
    builders
        .get_mut(id)
        .ok_or_else(|| ForgeError::UnknownBackend(id.to_string()))
}

/// Root buffers read and written by one sequence
fn access_sets(
    graph: &Graph,
    registries: &TensorRegistries,
    sequence: &OperationSequence,
) -> ForgeResult<(BTreeSet<OperandId>, BTreeSet<OperandId>)> {
    let registry = registries.get(&sequence.backend)?;
    let root = |operand: OperandId| -> ForgeResult<OperandId> {
        let tensor = if registry.contains(operand) {
            registry.get(operand)?
        } else {
            registries.find(operand)?
        };
        Ok(tensor.root_operand())
    };
    let mut reads = BTreeSet::new();
    let mut writes = BTreeSet::new();
    for &id in &sequence.operations {
        let op = graph.operation(id)?;
        for &input in &op.inputs {
            reads.insert(root(input)?);
        }
        for &output in &op.outputs {
            writes.insert(root(output)?);
        }
    }
    Ok((reads, writes))
}

/// Compile with `options` in one call
pub fn compile(graph: &Graph, options: CompilerOptions) -> ForgeResult<CompiledSubgraph> {
    Compiler::new(options)?.compile(graph)
}
