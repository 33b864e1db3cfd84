//! Typed indices into graphs and executor tables.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        pub struct $name(pub usize);

        impl $name {
            pub fn value(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                $name(value)
            }
        }
    };
}

index_type!(
    /// Position of an operand in its graph
    OperandId
);
index_type!(
    /// Position of an operation in its graph
    OperationId
);
index_type!(
    /// Model in a multi-model package
    ModelIndex
);
index_type!(
    /// Subgraph within a model; subgraph 0 is the primary one
    SubgraphIndex
);
index_type!(
    /// Position in a graph's declared input or output list
    IoIndex
);
