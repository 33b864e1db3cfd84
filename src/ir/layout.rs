//! Data layouts and rank-4 layout permutation.
//!
//! Only rank-4 shapes are feature maps; every other rank is laid out the same
//! way regardless of the layout tag.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Axis order of a rank-4 feature map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    /// No preference; treated like the other side of any conversion
    Unknown,
    /// Channel-last
    #[default]
    Nhwc,
    /// Channel-first
    Nchw,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Unknown => write!(f, "UNKNOWN"),
            Layout::Nhwc => write!(f, "NHWC"),
            Layout::Nchw => write!(f, "NCHW"),
        }
    }
}

/// Conversion performed by a Permute operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermuteType {
    Copy,
    NhwcToNchw,
    NchwToNhwc,
}

impl PermuteType {
    pub fn between(from: Layout, to: Layout) -> Self {
        match (from, to) {
            (Layout::Nhwc, Layout::Nchw) => PermuteType::NhwcToNchw,
            (Layout::Nchw, Layout::Nhwc) => PermuteType::NchwToNhwc,
            _ => PermuteType::Copy,
        }
    }
}

fn is_conversion(rank: usize, from: Layout, to: Layout) -> bool {
    rank == 4 && PermuteType::between(from, to) != PermuteType::Copy
}

/// Position in `to` order of axis `axis` given in `from` order.
pub fn permute_axis(rank: usize, axis: usize, from: Layout, to: Layout) -> usize {
    if !is_conversion(rank, from, to) {
        return axis;
    }
    match PermuteType::between(from, to) {
        // N H W C -> N C H W
        PermuteType::NhwcToNchw => [0, 2, 3, 1][axis],
        // N C H W -> N H W C
        PermuteType::NchwToNhwc => [0, 3, 1, 2][axis],
        PermuteType::Copy => axis,
    }
}

/// Reorder dims given in `from` order into `to` order.
pub fn permute_dims(dims: &[usize], from: Layout, to: Layout) -> Vec<usize> {
    let rank = dims.len();
    let mut out = dims.to_vec();
    if is_conversion(rank, from, to) {
        for (axis, &d) in dims.iter().enumerate() {
            out[permute_axis(rank, axis, from, to)] = d;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permute_dims_nhwc_nchw() {
        assert_eq!(
            permute_dims(&[1, 2, 3, 4], Layout::Nhwc, Layout::Nchw),
            vec![1, 4, 2, 3]
        );
        assert_eq!(
            permute_dims(&[1, 4, 2, 3], Layout::Nchw, Layout::Nhwc),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn test_non_rank4_is_untouched() {
        assert_eq!(
            permute_dims(&[2, 3, 4], Layout::Nhwc, Layout::Nchw),
            vec![2, 3, 4]
        );
        assert_eq!(permute_axis(3, 2, Layout::Nhwc, Layout::Nchw), 2);
    }

    #[test]
    fn test_channel_axis_moves() {
        assert_eq!(permute_axis(4, 3, Layout::Nhwc, Layout::Nchw), 1);
        assert_eq!(permute_axis(4, 1, Layout::Nchw, Layout::Nhwc), 3);
        assert_eq!(permute_axis(4, 3, Layout::Unknown, Layout::Nchw), 3);
    }

    #[test]
    fn test_permute_type_between() {
        assert_eq!(PermuteType::between(Layout::Nhwc, Layout::Nchw), PermuteType::NhwcToNchw);
        assert_eq!(PermuteType::between(Layout::Nhwc, Layout::Nhwc), PermuteType::Copy);
    }
}
