//! Operand shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};
use crate::ir::Layout;

/// Logical shape of an operand
///
/// A dynamic shape keeps its dims only as a hint; the real extent is known
/// once the executor has been handed concrete input shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
    dynamic: bool,
}

/// Feature-map view of a rank-4 shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureShape {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self {
            dims: dims.into(),
            dynamic: false,
        }
    }

    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    /// Shape resolved at run time; `hint` fixes the rank
    pub fn dynamic(hint: impl Into<Vec<usize>>) -> Self {
        Self {
            dims: hint.into(),
            dynamic: true,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Dim `axis`; axes beyond the rank read as 1
    pub fn dim(&self, axis: usize) -> usize {
        self.dims.get(axis).copied().unwrap_or(1)
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Same rank and dims, ignoring the dynamic flag
    pub fn same_extent(&self, other: &Shape) -> bool {
        self.dims == other.dims
    }

    /// Feature-map dims of a rank-4 shape authored in `layout`
    pub fn as_feature(&self, layout: Layout) -> ForgeResult<FeatureShape> {
        if self.rank() != 4 {
            return Err(ForgeError::InvariantViolation(format!(
                "feature view needs a rank-4 shape, got {}",
                self
            )));
        }
        let d = &self.dims;
        Ok(match layout {
            Layout::Nchw => FeatureShape {
                n: d[0],
                c: d[1],
                h: d[2],
                w: d[3],
            },
            Layout::Nhwc | Layout::Unknown => FeatureShape {
                n: d[0],
                h: d[1],
                w: d[2],
                c: d[3],
            },
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")?;
        if self.dynamic {
            write!(f, "?")?;
        }
        Ok(())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

/// Logical axes of N, H, W and C for a rank-4 layout
pub fn feature_axes(layout: Layout) -> [usize; 4] {
    match layout {
        Layout::Nchw => [0, 2, 3, 1],
        Layout::Nhwc | Layout::Unknown => [0, 1, 2, 3],
    }
}
