//! Backend-agnostic graph representation.

pub mod dtype;
pub mod graph;
pub mod index;
pub mod layout;
pub mod operand;
pub mod operation;
pub mod padding;
pub mod shape;

pub use dtype::{bytes_to_f32, bytes_to_i32, f32_to_bytes, i32_to_bytes, DataType, Quantization, TypeInfo};
pub use graph::Graph;
pub use index::{IoIndex, ModelIndex, OperandId, OperationId, SubgraphIndex};
pub use layout::{permute_axis, permute_dims, Layout, PermuteType};
pub use operand::{Operand, OperandInfo};
pub use operation::*;
pub use padding::{calculate_padding, Dilation, ExplicitPadding, Padding, Stride};
pub use shape::{feature_axes, FeatureShape, Shape};
