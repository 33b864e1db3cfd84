//! Execution side: units, compiled subgraphs and the executor table.

pub mod executors;
pub mod function;
pub mod io;
pub mod subgraph;

pub use executors::{Executors, IoSlot, ModelEdge};
pub use function::{Function, FunctionSequence, NopFunction};
pub use io::IoDescription;
pub use subgraph::{dependency_levels, CompiledSequence, CompiledSubgraph, IoTensor};
