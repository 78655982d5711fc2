//! Initial-population sampling scenarios.

use loft_ir::{ComputeAtKind, IterAnnotation, TransformStep};

use crate::test::helpers::*;

#[test]
fn chain_samples_keep_the_inline_and_are_concrete() {
    let dag = elementwise_chain();
    let mut policy = random_policy(&dag, "chain", 3);
    let sketches = policy.generate_sketches().unwrap();
    let population = policy.sample_init_population(&sketches, 8).unwrap();

    assert_eq!(population.len(), 8);
    for state in &population {
        assert!(state.concrete);
        assert_eq!(state.stages[1].compute_at, ComputeAtKind::Inlined);
        // The output stage gets its outer loop parallelized.
        assert!(state.stages[2].iters.iter().any(|it| it.annotation == IterAnnotation::Parallel));
    }
    // A single-sketch, choice-free space collapses to one canonical state.
    let first = population[0].to_str();
    assert!(population.iter().all(|s| s.to_str() == first));
}

#[test]
fn matmul_samples_are_concrete_with_auto_unroll_pragmas() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 7);
    let sketches = policy.generate_sketches().unwrap();
    let population = policy.sample_init_population(&sketches, 16).unwrap();

    assert_eq!(population.len(), 16);
    for state in &population {
        assert!(state.concrete);
        for step in &state.transform_steps {
            if let TransformStep::Split { lengths, .. } = step {
                assert!(lengths.iter().all(Option::is_some));
            }
        }

        let pragmas: Vec<&str> = state
            .transform_steps
            .iter()
            .filter_map(|s| match s {
                TransformStep::Pragma { iter_id: 0, pragma_type, .. } => Some(pragma_type.as_str()),
                _ => None,
            })
            .collect();
        assert!(!pragmas.is_empty());
        for pragma in pragmas {
            let value: i64 = pragma.strip_prefix("auto_unroll_max_step$").unwrap().parse().unwrap();
            assert!([0, 16, 64, 512].contains(&value));
        }
    }
}

#[test]
fn tile_sizes_respect_the_innermost_cap() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 11);
    let sketches = policy.generate_sketches().unwrap();
    let population = policy.sample_init_population(&sketches, 16).unwrap();

    let cap = policy.params.max_innermost_split_factor;
    for state in &population {
        for step in &state.transform_steps {
            if let TransformStep::Split { lengths, .. } = step
                && let Some(Some(innermost)) = lengths.last()
            {
                assert!(*innermost <= cap, "innermost tile {innermost} exceeds cap {cap}");
            }
        }
    }
}

#[test]
fn sampling_is_deterministic_under_a_seed() {
    let (dag, _c) = matmul();

    let run = |seed: u64| {
        let mut policy = random_policy(&dag, "matmul", seed);
        let sketches = policy.generate_sketches().unwrap();
        let population = policy.sample_init_population(&sketches, 12).unwrap();
        population.iter().map(|s| s.to_str()).collect::<Vec<_>>()
    };

    assert_eq!(run(42), run(42));
}

#[test]
fn bound_inference_is_idempotent_on_samples() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 5);
    let sketches = policy.generate_sketches().unwrap();
    let population = policy.sample_init_population(&sketches, 8).unwrap();

    for state in &population {
        let once = dag.infer_bound(state).unwrap();
        let twice = dag.infer_bound(&once).unwrap();
        assert_eq!(once.to_str(), twice.to_str());
    }
}

#[test]
fn samples_replay_from_their_history() {
    let dag = elementwise_chain();
    let mut policy = random_policy(&dag, "chain", 9);
    let sketches = policy.generate_sketches().unwrap();
    let population = policy.sample_init_population(&sketches, 4).unwrap();

    for state in &population {
        let replayed = dag.infer_bound(state).unwrap();
        assert_eq!(replayed.to_str(), state.to_str());
    }
}

#[test]
fn always_unroll_attribute_unrolls_listed_iterators() {
    let mut b = loft_ir::ComputeDag::builder();
    let a = b.placeholder("A", &[32, 8]);
    let c = b.compute("C", &[("i", 32)], &[("k", 8)], &[a]);
    b.always_unroll(c, &["k"]);
    let dag = b.build();

    let mut policy = random_policy(&dag, "unrolled", 13);
    let sketches = policy.generate_sketches().unwrap();
    let population = policy.sample_init_population(&sketches, 4).unwrap();

    for state in &population {
        let cs = state.stage_of_op(c).unwrap();
        let k = state.stages[cs].iters.iter().find(|it| it.name == "k").unwrap();
        assert_eq!(k.annotation, IterAnnotation::Unroll);
    }
}

#[test]
fn disable_change_compute_location_skips_the_rule() {
    let dag = elementwise_chain();
    let params = crate::params::SearchParams::builder()
        .population(16)
        .disable_change_compute_location(true)
        .build();
    let task = task_of(&dag, "chain");
    let mut policy =
        crate::policy::SketchPolicy::new(task, Box::new(crate::cost_model::RandomModel::new(0)), params, 0);

    let sketches = policy.generate_sketches().unwrap();
    let population = policy.sample_init_population(&sketches, 4).unwrap();
    assert_eq!(population.len(), 4);
    for state in &population {
        assert!(state.concrete);
    }
}
