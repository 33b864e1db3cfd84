//! Axis remapping between logical and backend coordinates.

use graphforge::backend::layout_remap::{
    axes_to_backend, backend_dims, backend_permutation, normalize_axis, physical_offsets,
    reorder_bits, to_backend_axis, to_logical_axis, AxisMap,
};
use graphforge::ir::{permute_axis, permute_dims, Layout};
use proptest::prelude::*;

fn layout() -> impl Strategy<Value = Layout> {
    prop_oneof![Just(Layout::Nhwc), Just(Layout::Nchw)]
}

proptest! {
    #[test]
    fn test_rank4_permutation_round_trips(axis in 0..4usize, from in layout(), to in layout()) {
        let there = permute_axis(4, axis, from, to);
        prop_assert_eq!(permute_axis(4, there, to, from), axis);
    }

    #[test]
    fn test_backend_axis_round_trips(rank in 1..6usize, seed in 0..64usize, from in layout(), to in layout()) {
        let axis = seed % rank;
        let backend = to_backend_axis(rank, axis, from, to);
        prop_assert!(backend < rank);
        prop_assert_eq!(to_logical_axis(rank, backend, from, to), axis);
    }

    #[test]
    fn test_normalize_axis_is_in_range_and_idempotent(rank in 1..8usize, seed in 0..64i32) {
        let r = rank as i32;
        let axis = seed % (2 * r) - r;
        let normalized = normalize_axis(axis, rank).unwrap();
        prop_assert!(normalized < rank);
        prop_assert_eq!(normalize_axis(normalized as i32, rank).unwrap(), normalized);
    }

    #[test]
    fn test_reorder_bits_moves_each_bit(mask in 0u32..16, from in layout(), to in layout()) {
        let moved = reorder_bits(mask, 4, from, to).unwrap();
        prop_assert_eq!(moved.count_ones(), mask.count_ones());
        for axis in 0..4 {
            let expected = mask & (1 << axis) != 0;
            let b = to_backend_axis(4, axis, from, to);
            prop_assert_eq!(moved & (1 << b) != 0, expected);
        }
    }

    #[test]
    fn test_physical_offsets_cover_buffer_once(
        dims in prop::collection::vec(1..4usize, 1..5),
        from in layout(),
        to in layout(),
    ) {
        let mut offsets = physical_offsets(&dims, from, to).unwrap();
        let total: usize = dims.iter().product();
        prop_assert_eq!(offsets.len(), total);
        offsets.sort_unstable();
        prop_assert_eq!(offsets, (0..total).collect::<Vec<_>>());
    }

    #[test]
    fn test_permute_dims_round_trips(dims in prop::collection::vec(1..6usize, 4), from in layout(), to in layout()) {
        let there = permute_dims(&dims, from, to);
        prop_assert_eq!(permute_dims(&there, to, from), dims);
    }
}

#[test]
fn test_channel_axis_of_nhwc_map() {
    // logical (N=1, H=2, W=2, C=3), channel is logical axis 3
    let dims = [1, 2, 2, 3];

    // NHWC buffer: channel is innermost
    assert_eq!(to_backend_axis(4, 3, Layout::Nhwc, Layout::Nhwc), 0);
    assert_eq!(backend_dims(&dims, Layout::Nhwc, Layout::Nhwc), vec![3, 2, 2, 1]);

    // NCHW buffer: channel sits just inside batch
    assert_eq!(to_backend_axis(4, 3, Layout::Nhwc, Layout::Nchw), 2);
    assert_eq!(backend_dims(&dims, Layout::Nhwc, Layout::Nchw), vec![2, 2, 3, 1]);

    let negative = AxisMap::new(4, Layout::Nhwc, Layout::Nchw).backend_axis(-1).unwrap();
    assert_eq!(negative, 2);
}

#[test]
fn test_other_ranks_only_reverse() {
    for rank in [1usize, 2, 3, 5] {
        for axis in 0..rank {
            assert_eq!(to_backend_axis(rank, axis, Layout::Nhwc, Layout::Nchw), rank - 1 - axis);
        }
    }
}

#[test]
fn test_identity_permutation_stays_identity() {
    let pv = [0, 1, 2, 3];
    assert_eq!(
        backend_permutation(4, &pv, Layout::Nhwc, Layout::Nchw).unwrap(),
        vec![0, 1, 2, 3]
    );
    assert!(backend_permutation(4, &[0, 0, 1, 2], Layout::Nhwc, Layout::Nhwc).is_err());
}

#[test]
fn test_axes_list_is_deduplicated() {
    let axes = axes_to_backend(&[3, -1, 1], 4, Layout::Nhwc, Layout::Nhwc).unwrap();
    assert_eq!(axes, vec![0, 2]);
}

#[test]
fn test_out_of_range_axis_is_rejected() {
    assert!(normalize_axis(4, 4).is_err());
    assert!(normalize_axis(-5, 4).is_err());
}
