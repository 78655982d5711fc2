//! Search-driver scenarios: the outer loop, early stopping, exhaustion.

use std::collections::HashSet;

use loft_ir::State;

use crate::measure::{MeasureInput, Measurer, ProgramMeasurer};
use crate::test::helpers::*;

/// `A -> C`, a space with exactly one candidate schedule.
fn single_candidate_policy() -> crate::policy::SketchPolicy {
    let mut b = loft_ir::ComputeDag::builder();
    let a = b.placeholder("A", &[4]);
    let c = b.compute("C", &[("i", 4)], &[], &[a]);
    b.strict_inlineable(c, false);
    let dag = b.build();
    random_policy(&dag, "single", 0)
}

#[test]
fn single_trial_skips_measurement() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 0);
    let mut measurer = FakeMeasurer::new();
    let best = policy.search(1, -1, 4, &mut measurer).unwrap();
    assert!(best.concrete);
    assert!(measurer.batches.is_empty());
}

#[test]
fn search_returns_the_measured_best() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 0);
    let mut measurer = FakeMeasurer::new();
    let best = policy.search(12, -1, 4, &mut measurer).unwrap();

    assert!(!measurer.batches.is_empty());
    assert!(measurer.total_measured() <= 12);
    for batch in &measurer.batches {
        assert!(batch.len() <= 4);
    }
    // The returned state is the one the measurer recorded as best.
    assert_eq!(best.to_str(), measurer.best.as_ref().unwrap().to_str());
}

#[test]
fn measured_states_are_never_repeated() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 0);
    let mut measurer = FakeMeasurer::new();
    let _ = policy.search(16, -1, 4, &mut measurer).unwrap();

    let unique: HashSet<&String> = measurer.measured_keys.iter().collect();
    assert_eq!(unique.len(), measurer.measured_keys.len());
}

#[test]
fn early_stopping_bounds_the_trial_count() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 0);
    // The best trial is pinned at 10: the loop must give up once the counter
    // runs more than the early-stopping window past it.
    let mut measurer = FakeMeasurer::with_pinned_best_ct(10);
    let _ = policy.search(100, 5, 4, &mut measurer).unwrap();
    assert!(measurer.total_measured() <= 20, "measured {} states", measurer.total_measured());
}

#[test]
fn exhausted_space_terminates_the_loop() {
    let mut policy = single_candidate_policy();
    let mut measurer = FakeMeasurer::new();
    let best = policy.search(50, -1, 4, &mut measurer).unwrap();

    // One candidate measured once, then the next round finds nothing new.
    assert_eq!(measurer.total_measured(), 1);
    assert_eq!(measurer.batches.len(), 1);
    assert!(best.concrete);
}

#[test]
fn search_is_deterministic_under_a_seed() {
    let run = || {
        let (dag, _c) = matmul();
        let mut policy = random_policy(&dag, "matmul", 42);
        let mut measurer = FakeMeasurer::new();
        let _ = policy.search(12, -1, 4, &mut measurer).unwrap();
        measurer.measured_keys
    };
    assert_eq!(run(), run());
}

#[test]
fn program_measurer_tracks_the_best_state() {
    let (dag, _c) = matmul();
    let mut policy = random_policy(&dag, "matmul", 0);
    let sketches = policy.generate_sketches().unwrap();
    let states = policy.sample_init_population(&sketches, 3).unwrap();

    // Costs improve per input; the last one fails outright.
    let mut call = 0usize;
    let runner = move |_task: &crate::task::SearchTask, _state: &State| -> Result<Vec<f64>, String> {
        call += 1;
        match call {
            1 => Ok(vec![4.0]),
            2 => Ok(vec![2.0]),
            _ => Err("compile failed".to_string()),
        }
    };
    let mut measurer = ProgramMeasurer::new(runner);

    let inputs: Vec<MeasureInput> = states.iter().map(|s| MeasureInput { state: s.clone() }).collect();
    let task = policy.task.clone();
    let results = measurer.measure(&task, &policy, &inputs);

    assert_eq!(results.len(), 3);
    assert!(results[2].error.is_some());
    assert_eq!(measurer.error_ct, 1);
    assert_eq!(measurer.best_ct("matmul"), 1);
    assert_eq!(measurer.best_state("matmul").unwrap().to_str(), states[1].to_str());
}
