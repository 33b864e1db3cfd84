//! graphforge - heterogeneous-backend graph compiler and executor
//!
//! Compiles a backend-agnostic neural-network dataflow graph into sequences
//! of backend kernels and runs them against caller-supplied buffers.
//!
//! ```rust,ignore
//! use graphforge::{compile, CompilerOptions, IoDescription};
//!
//! let compiled = compile(&graph, CompilerOptions::from_env())?;
//! let mut io = IoDescription::new().with_input(&input).with_output(&mut output);
//! compiled.execute(&mut io)?;
//! ```

#![allow(clippy::too_many_arguments)] // Kernel configuration takes many shape parameters
#![allow(clippy::needless_range_loop)] // Clearer for axis arithmetic
#![allow(clippy::type_complexity)] // Read/write set tuples
#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod backend;
pub mod compiler;
pub mod config;
pub mod error;
pub mod exec;
pub mod ir;
pub mod logging;
pub mod profiling;

pub use backend::{create_backend, create_backend_with_fp16, Backend, BackendConfig, BUILTIN_BACKEND_ID};
pub use compiler::{compile, CompilePlan, Compiler};
pub use config::{CompilerOptions, ExecutionMode, ManualSchedulerOptions};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use exec::{CompiledSubgraph, Executors, IoDescription, IoSlot};
pub use ir::{Graph, Layout, OpKind, OperandId, OperandInfo, OperationId};
pub use profiling::{CpuTimer, ExecutionProfile, Timer};
