//! Backend assignment, transfer insertion and sequence partitioning.
//!
//! Every operation gets a [`Placement`]: the backend it runs on and the
//! physical layout that backend keeps its tensors in. Whenever a consumer's
//! placement differs from where an operand was written, a Permute on the
//! builtin backend copies it across. Graph inputs and outputs always live
//! on the builtin backend in the graph's own layout.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::{create_backend, Backend, OperationSequence, BUILTIN_BACKEND_ID};
use crate::config::CompilerOptions;
use crate::error::{ForgeError, ForgeResult};
use crate::ir::{Graph, Layout, OpKind, OperandId, OperationId, Permute, PermuteType};

/// Where an operation runs and where its outputs live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placement {
    pub backend: String,
    pub layout: Layout,
}

impl Placement {
    pub fn new(backend: impl Into<String>, layout: Layout) -> Self {
        Self {
            backend: backend.into(),
            layout,
        }
    }

    pub fn builtin(layout: Layout) -> Self {
        Self::new(BUILTIN_BACKEND_ID, layout)
    }

    pub fn is_builtin(&self) -> bool {
        self.backend == BUILTIN_BACKEND_ID
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backend, self.layout)
    }
}

/// Graph with transfers inserted, plus where everything lives
#[derive(Debug, Clone)]
pub struct LoweredGraph {
    pub graph: Graph,
    /// Placement of each operation, by operation id
    pub placements: Vec<Placement>,
    /// Where each non-constant operand is written (or bound, for inputs)
    pub homes: BTreeMap<OperandId, Placement>,
    /// Number of Permute operations the lowering added
    pub transfers: usize,
}

impl LoweredGraph {
    pub fn placement(&self, op: OperationId) -> ForgeResult<&Placement> {
        self.placements
            .get(op.0)
            .ok_or_else(|| crate::invariant!("operation {} has no placement", op))
    }
}

/// Choose a backend and physical layout for every operation of `graph`
pub fn assign_backends(
    graph: &Graph,
    options: &CompilerOptions,
    backends: &BTreeMap<String, Arc<dyn Backend>>,
) -> ForgeResult<Vec<Placement>> {
    let mut placements = Vec::with_capacity(graph.operation_count());
    for (id, op) in graph.operations() {
        let backend_id = options
            .manual_scheduler
            .backend_for(id, op.code())
            .unwrap_or_else(|| options.default_backend());
        let backend = match backends.get(backend_id) {
            Some(b) => b,
            None => {
                // an unknown id reports as such; a known one is just not enabled
                create_backend(backend_id)?;
                return Err(ForgeError::InvalidConfiguration(format!(
                    "operation {} ({}) is scheduled on {}, which is not in backend_list",
                    id,
                    op.name(),
                    backend_id
                )));
            }
        };
        let layout = backend.config().support_layout(op, graph.layout());
        trace!(operation = %id, kind = op.name(), backend = backend_id, layout = %layout, "assigned");
        placements.push(Placement::new(backend_id, layout));
    }
    Ok(placements)
}

/// Rebuild `graph` with a Permute wherever an operand crosses placements
pub fn insert_transfers(graph: &Graph, placements: &[Placement]) -> ForgeResult<LoweredGraph> {
    if placements.len() != graph.operation_count() {
        return Err(crate::invariant!(
            "{} placements for {} operations",
            placements.len(),
            graph.operation_count()
        ));
    }
    let frontend = graph.layout();
    let io_home = Placement::builtin(frontend);
    let mut lowered = LoweredGraph {
        graph: Graph::with_operands_of(graph),
        placements: Vec::with_capacity(placements.len()),
        homes: BTreeMap::new(),
        transfers: 0,
    };
    let mut copies: HashMap<(OperandId, Placement), OperandId> = HashMap::new();

    for &input in graph.inputs() {
        lowered.graph.add_input(input)?;
        lowered.homes.insert(input, io_home.clone());
    }

    for ((_, op), placement) in graph.operations().zip(placements) {
        let mut inputs = Vec::with_capacity(op.inputs.len());
        for &input in &op.inputs {
            if graph.operand(input)?.is_constant() {
                inputs.push(input);
                continue;
            }
            inputs.push(lowered.operand_at(input, placement, &mut copies)?);
        }
        let id = lowered
            .graph
            .add_operation(op.kind.clone(), inputs, op.outputs.clone())?;
        for &output in &op.outputs {
            lowered.homes.insert(output, placement.clone());
        }
        lowered.placements.push(placement.clone());
        trace!(operation = %id, kind = op.name(), placement = %placement, "placed");
    }

    for &output in graph.outputs() {
        let bound = if graph.operand(output)?.is_constant() {
            output
        } else {
            lowered.operand_at(output, &io_home, &mut copies)?
        };
        lowered.graph.add_output(bound)?;
    }

    debug!(
        operations = lowered.graph.operation_count(),
        transfers = lowered.transfers,
        "transfers inserted"
    );
    Ok(lowered)
}

impl LoweredGraph {
    /// Id under which `operand` is readable at `target`, adding a transfer
    /// the first time it is needed there
    fn operand_at(
        &mut self,
        operand: OperandId,
        target: &Placement,
        copies: &mut HashMap<(OperandId, Placement), OperandId>,
    ) -> ForgeResult<OperandId> {
        let home = self
            .homes
            .get(&operand)
            .cloned()
            .ok_or_else(|| crate::invariant!("operand {} is read before it is written", operand))?;
        if &home == target {
            return Ok(operand);
        }
        if let Some(&copy) = copies.get(&(operand, target.clone())) {
            return Ok(copy);
        }

        let info = self.graph.operand(operand)?.info().clone();
        let copy = self.graph.add_operand(info);
        let kind = OpKind::Permute(Permute {
            permute_type: PermuteType::between(home.layout, target.layout),
        });
        let id = self.graph.add_operation(kind, vec![operand], vec![copy])?;
        self.placements.push(Placement::builtin(self.graph.layout()));
        self.homes.insert(copy, target.clone());
        copies.insert((operand, target.clone()), copy);
        self.transfers += 1;
        debug!(
            operation = %id,
            from = %home,
            to = %target,
            operand = %operand,
            copy = %copy,
            "transfer inserted"
        );
        Ok(copy)
    }
}

/// Split the lowered operation list into maximal runs of equal placement
pub fn partition(lowered: &LoweredGraph) -> Vec<OperationSequence> {
    let frontend = lowered.graph.layout();
    let mut sequences: Vec<OperationSequence> = Vec::new();
    for (index, placement) in lowered.placements.iter().enumerate() {
        let id = OperationId(index);
        match sequences.last_mut() {
            Some(last) if last.backend == placement.backend && last.physical_layout == placement.layout => {
                last.operations.push(id);
            }
            _ => sequences.push(OperationSequence {
                backend: placement.backend.clone(),
                layout: frontend,
                physical_layout: placement.layout,
                operations: vec![id],
            }),
        }
    }
    debug!(sequences = sequences.len(), "graph partitioned");
    sequences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Activation, ArithmeticType, BinaryArithmetic, DataType, OperandInfo};

    fn add(activation: Activation) -> OpKind {
        OpKind::BinaryArithmetic(BinaryArithmetic {
            op: ArithmeticType::Add,
            activation,
        })
    }

    /// a + b -> c, c + b -> d on two backends
    fn two_op_graph() -> Graph {
        let mut graph = Graph::with_layout(Layout::Nhwc);
        let info = OperandInfo::of(&[1, 2, 2, 3], DataType::Float32);
        let a = graph.add_operand(info.clone());
        let b = graph.add_operand(info.clone());
        let c = graph.add_operand(info.clone());
        let d = graph.add_operand(info);
        graph.add_input(a).unwrap();
        graph.add_input(b).unwrap();
        graph.add_operation(add(Activation::None), vec![a, b], vec![c]).unwrap();
        graph.add_operation(add(Activation::Relu), vec![c, b], vec![d]).unwrap();
        graph.add_output(d).unwrap();
        graph
    }

    #[test]
    fn test_transfers_follow_placement_changes() {
        let graph = two_op_graph();
        let placements = vec![
            Placement::new("gpu_cl", Layout::Nchw),
            Placement::new("cpu_neon", Layout::Nhwc),
        ];
        let lowered = insert_transfers(&graph, &placements).unwrap();
        lowered.graph.validate().unwrap();

        // a, b into gpu; c, b into cpu; d back out
        assert_eq!(lowered.transfers, 5);
        let output = lowered.graph.outputs()[0];
        assert_ne!(output, OperandId(3));
        assert_eq!(lowered.homes[&output], Placement::builtin(Layout::Nhwc));

        let permutes: Vec<_> = lowered
            .graph
            .operations()
            .filter_map(|(_, op)| match &op.kind {
                OpKind::Permute(p) => Some(p.permute_type),
                _ => None,
            })
            .collect();
        assert_eq!(permutes[0], PermuteType::NhwcToNchw);
        assert!(permutes.contains(&PermuteType::NchwToNhwc));
    }

    #[test]
    fn test_copies_are_shared_between_consumers() {
        let graph = two_op_graph();
        let placements = vec![Placement::new("gpu_cl", Layout::Nchw); 2];
        let lowered = insert_transfers(&graph, &placements).unwrap();
        // a and b in once each, d out once
        assert_eq!(lowered.transfers, 3);
    }

    #[test]
    fn test_partition_groups_equal_placements() {
        let graph = two_op_graph();
        let placements = vec![Placement::new("gpu_cl", Layout::Nchw); 2];
        let lowered = insert_transfers(&graph, &placements).unwrap();
        let sequences = partition(&lowered);

        let backends: Vec<_> = sequences.iter().map(|s| s.backend.as_str()).collect();
        assert_eq!(backends, vec![BUILTIN_BACKEND_ID, "gpu_cl", BUILTIN_BACKEND_ID]);
        assert_eq!(sequences[1].physical_layout, Layout::Nchw);
        let total: usize = sequences.iter().map(|s| s.operations.len()).sum();
        assert_eq!(total, lowered.graph.operation_count());
        assert!(sequences.iter().all(|s| s.layout == Layout::Nhwc));
    }

    #[test]
    fn test_backend_outside_list_is_rejected() {
        let graph = two_op_graph();
        let mut backends: BTreeMap<String, Arc<dyn Backend>> = BTreeMap::new();
        backends.insert("gpu_cl".to_string(), create_backend("gpu_cl").unwrap());

        let options = CompilerOptions::new().with_backend_for_all("cpu_neon");
        assert!(matches!(
            assign_backends(&graph, &options, &backends),
            Err(ForgeError::InvalidConfiguration(_))
        ));
        let options = CompilerOptions::new().with_backend_for_all("npu");
        assert!(matches!(
            assign_backends(&graph, &options, &backends),
            Err(ForgeError::UnknownBackend(_))
        ));
    }
}
