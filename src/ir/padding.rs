//! Convolution/pooling window parameters and padding resolution.

use serde::{Deserialize, Serialize};

use crate::ir::FeatureShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stride {
    pub vertical: usize,
    pub horizontal: usize,
}

impl Stride {
    pub fn new(vertical: usize, horizontal: usize) -> Self {
        Self {
            vertical,
            horizontal,
        }
    }
}

impl Default for Stride {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dilation {
    pub height: usize,
    pub width: usize,
}

impl Default for Dilation {
    fn default() -> Self {
        Self {
            height: 1,
            width: 1,
        }
    }
}

/// Explicit per-side padding in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExplicitPadding {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    Same,
    Valid,
    Explicit(ExplicitPadding),
}

/// Resolve `padding` into explicit amounts for a window of `kw` x `kh`.
///
/// SAME splits the total padding with the extra element at the bottom/right.
pub fn calculate_padding(
    padding: Padding,
    ifm: FeatureShape,
    ofm: FeatureShape,
    stride: Stride,
    kw: usize,
    kh: usize,
    dilation: Dilation,
) -> ExplicitPadding {
    match padding {
        Padding::Explicit(p) => p,
        Padding::Valid => ExplicitPadding::default(),
        Padding::Same => {
            let effective_kh = (kh - 1) * dilation.height + 1;
            let effective_kw = (kw - 1) * dilation.width + 1;

            let needed_h = (ofm.h.max(1) - 1) * stride.vertical + effective_kh;
            let needed_w = (ofm.w.max(1) - 1) * stride.horizontal + effective_kw;
            let total_h = needed_h.saturating_sub(ifm.h);
            let total_w = needed_w.saturating_sub(ifm.w);

            ExplicitPadding {
                top: total_h / 2,
                bottom: (total_h + 1) / 2,
                left: total_w / 2,
                right: (total_w + 1) / 2,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(h: usize, w: usize) -> FeatureShape {
        FeatureShape { n: 1, h, w, c: 1 }
    }

    #[test]
    fn test_same_padding_odd_total_goes_bottom_right() {
        let p = calculate_padding(
            Padding::Same,
            feature(4, 4),
            feature(2, 2),
            Stride::new(2, 2),
            2,
            2,
            Dilation::default(),
        );
        assert_eq!(p, ExplicitPadding::default());

        let p = calculate_padding(
            Padding::Same,
            feature(5, 5),
            feature(5, 5),
            Stride::default(),
            4,
            4,
            Dilation::default(),
        );
        assert_eq!((p.top, p.bottom, p.left, p.right), (1, 2, 1, 2));
    }

    #[test]
    fn test_valid_is_zero() {
        let p = calculate_padding(
            Padding::Valid,
            feature(5, 5),
            feature(3, 3),
            Stride::default(),
            3,
            3,
            Dilation::default(),
        );
        assert_eq!(p, ExplicitPadding::default());
    }
}
