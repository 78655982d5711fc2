//! Property tests over the sampling pipeline.

use proptest::prelude::*;

use crate::split_memo::SplitFactorizationMemo;
use crate::test::helpers::{matmul, random_policy};

proptest! {
    #[test]
    fn factorization_schemes_divide_the_extent(
        extent in 1i64..512,
        num_lengths in 1usize..4,
        cap in 1i64..64,
    ) {
        let mut memo = SplitFactorizationMemo::default();
        let schemes = memo.get_factorization_schemes(extent, num_lengths, cap);
        for scheme in schemes.iter() {
            prop_assert_eq!(scheme.len(), num_lengths);
            let product: i64 = scheme.iter().product();
            prop_assert_eq!(extent % product, 0);
            prop_assert!(scheme[num_lengths - 1] <= cap);
        }
    }

    #[test]
    fn sampled_states_survive_replay(seed in 0u64..16) {
        let (dag, _c) = matmul();
        let mut policy = random_policy(&dag, "matmul", seed);
        let sketches = policy.generate_sketches().unwrap();
        let population = policy.sample_init_population(&sketches, 4).unwrap();
        for state in &population {
            prop_assert!(state.concrete);
            let replayed = dag.infer_bound(state).unwrap();
            prop_assert_eq!(replayed.to_str(), state.to_str());
        }
    }
}
