use std::collections::BTreeSet;
use std::sync::Arc;

use test_case::test_case;

use crate::dag::ComputeDag;
use crate::state::{ComputeAtKind, IterAnnotation, IterKind, State, extract_original_iterators};

fn matmul_dag() -> Arc<ComputeDag> {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[512, 512]);
    let bb = b.placeholder("B", &[512, 512]);
    let c = b.compute("C", &[("i", 512), ("j", 512)], &[("k", 512)], &[a, bb]);
    b.needs_multi_level_tiling(c);
    b.build()
}

#[test]
fn init_state_shape() {
    let dag = matmul_dag();
    let state = dag.init_state();
    assert_eq!(state.stages.len(), 3);
    assert!(state.stages[0].iters.is_empty());
    assert_eq!(state.stages[2].iters.len(), 3);
    assert!(state.concrete);
    assert!(state.transform_steps.is_empty());
}

#[test]
fn split_names_and_extents() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    let parts = state.split(2, 0, &[Some(4), Some(8)]).unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0].name, "i.0");
    assert_eq!(parts[1].name, "i.1");
    assert_eq!(parts[2].name, "i.2");
    assert_eq!(parts[0].extent, Some(16)); // ceil(512 / 32)
    assert_eq!(parts[1].extent, Some(4));
    assert_eq!(parts[2].extent, Some(8));
    assert_eq!(state.stages[2].iters.len(), 5);
    assert!(state.concrete);
}

#[test]
fn split_with_hole_marks_sketch() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    let parts = state.split(2, 2, &[None]).unwrap();
    assert_eq!(parts[0].extent, None);
    assert_eq!(parts[1].extent, None);
    assert!(!state.concrete);
}

#[test]
fn fuse_joins_names_and_extents() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    let fused = state.fuse(2, &[0, 1]).unwrap();
    assert_eq!(fused.name, "i@j");
    assert_eq!(fused.extent, Some(512 * 512));
    assert_eq!(fused.kind, IterKind::Spatial);
    assert_eq!(state.stages[2].iters.len(), 2);

    // Fusing across a reduction iterator yields a reduction iterator.
    let mut state = dag.init_state();
    let fused = state.fuse(2, &[1, 2]).unwrap();
    assert_eq!(fused.kind, IterKind::Reduction);
}

#[test]
fn fuse_rejects_non_contiguous() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    assert!(state.fuse(2, &[0, 2]).is_err());
}

#[test]
fn reorder_permutes() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    state.reorder(2, &[2, 0, 1]).unwrap();
    let names: Vec<&str> = state.stages[2].iters.iter().map(|it| it.name.as_str()).collect();
    assert_eq!(names, ["k", "i", "j"]);
    assert!(state.reorder(2, &[0, 0, 1]).is_err());
}

#[test]
fn compute_at_updates_attach_map_and_clears_bounds() {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[64]);
    let p = b.compute("P", &[("i", 64)], &[], &[a]);
    let c = b.compute("C", &[("i", 64)], &[], &[p]);
    let dag = b.build();
    let mut state = dag.init_state();
    let (ps, cs) = (state.stage_of_op(p).unwrap(), state.stage_of_op(c).unwrap());
    state.split(cs, 0, &[Some(8)]).unwrap();
    state.compute_at(ps, cs, 0).unwrap();

    assert_eq!(state.stages[ps].compute_at, ComputeAtKind::Iter);
    assert_eq!(state.attach_map.attach_iter_of(ps), Some((cs, 0)));
    assert!(state.stages[ps].iters.iter().all(|it| it.extent.is_none()));

    state.compute_root(ps).unwrap();
    assert_eq!(state.stages[ps].compute_at, ComputeAtKind::Root);
    assert_eq!(state.attach_map.attach_iter_of(ps), None);
}

#[test]
fn split_shifts_attachments_inward() {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[64]);
    let p = b.compute("P", &[("i", 64)], &[], &[a]);
    let c = b.compute("C", &[("x", 64), ("y", 32)], &[], &[p]);
    b.simple_access(c, false);
    let dag = b.build();
    let mut state = dag.init_state();
    let (ps, cs) = (state.stage_of_op(p).unwrap(), state.stage_of_op(c).unwrap());
    state.compute_at(ps, cs, 1).unwrap();

    // Splitting an earlier iterator of the target moves the attachment.
    state.split(cs, 0, &[Some(8)]).unwrap();
    assert_eq!(state.attach_map.attach_iter_of(ps), Some((cs, 2)));
}

#[test]
fn cache_write_inserts_stage() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    let new_id = state.cache_write(2, "local").unwrap();
    assert_eq!(new_id, 2);
    assert_eq!(state.stages.len(), 4);
    assert_eq!(state.dag.op_info(state.stages[2].op).name, "C.local");
    assert_eq!(state.stages[2].iters.len(), 3);
    assert_eq!(state.stages[3].iters.len(), 2);
    assert!(!state.stages[3].has_reduce_iter());
}

#[test]
fn rfactor_inserts_stage_with_factor_axis() {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[1024]);
    let c = b.compute("C", &[], &[("k", 1024)], &[a]);
    let dag = b.build();
    let mut state = dag.init_state();
    let cs = state.stage_of_op(c).unwrap();
    state.split(cs, 0, &[Some(1)]).unwrap();
    let rf = state.rfactor(cs, 0, 0).unwrap();
    assert_eq!(rf, cs);
    assert_eq!(state.stages.len(), 3);
    let rf_stage = &state.stages[rf];
    assert_eq!(state.dag.op_info(rf_stage.op).name, "C.rf");
    assert_eq!(rf_stage.iters[0].kind, IterKind::Spatial);
    assert_eq!(rf_stage.iters[0].name, "k.0");
    assert_eq!(rf_stage.iters[1].kind, IterKind::Reduction);
}

#[test]
fn annotations_land_on_iterators() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    state.parallel(2, 0).unwrap();
    state.vectorize(2, 1).unwrap();
    state.unroll(2, 2).unwrap();
    assert_eq!(state.stages[2].iters[0].annotation, IterAnnotation::Parallel);
    assert_eq!(state.stages[2].iters[1].annotation, IterAnnotation::Vectorize);
    assert_eq!(state.stages[2].iters[2].annotation, IterAnnotation::Unroll);
    state.pragma(2, 0, "auto_unroll_max_step$64").unwrap();
    assert_eq!(state.transform_steps.len(), 4);
}

#[test]
fn canonical_string_distinguishes_schedules() {
    let dag = matmul_dag();
    let base = dag.init_state();
    let mut split = base.clone();
    split.split(2, 0, &[Some(8)]).unwrap();
    let mut other = base.clone();
    other.split(2, 0, &[Some(16)]).unwrap();
    assert_ne!(base.to_str(), split.to_str());
    assert_ne!(split.to_str(), other.to_str());
    assert_eq!(split.to_str(), split.clone().to_str());
}

#[test]
fn clone_shares_stage_slots() {
    let dag = matmul_dag();
    let state = dag.init_state();
    let mut copy = state.clone();
    copy.split(2, 0, &[Some(8)]).unwrap();
    // The untouched slots are still shared with the source state.
    assert!(Arc::ptr_eq(&state.stages[0], &copy.stages[0]));
    assert!(!Arc::ptr_eq(&state.stages[2], &copy.stages[2]));
    assert_eq!(state.stages[2].iters.len(), 3);
}

#[test_case("i", &["i"]; "plain name")]
#[test_case("i.0", &["i"]; "split part")]
#[test_case("i.0.1", &["i"]; "nested split part")]
#[test_case("i@j", &["i", "j"]; "fused pair")]
#[test_case("i.0@j.1", &["i", "j"]; "fused split parts")]
fn original_iterator_extraction(name: &str, expected: &[&str]) {
    let mut set = BTreeSet::new();
    extract_original_iterators(name, &mut set);
    let expected: BTreeSet<String> = expected.iter().map(|s| s.to_string()).collect();
    assert_eq!(set, expected);
}

#[test]
fn replay_matches_after_cache_write() {
    let dag = matmul_dag();
    let mut state = dag.init_state();
    state.cache_write(2, "local").unwrap();
    state.split(2, 0, &[Some(4), Some(8)]).unwrap();
    state.parallel(2, 0).unwrap();
    let replayed = dag.replay(&state.transform_steps).unwrap();
    assert_eq!(replayed.to_str(), state.to_str());
    assert_eq!(replayed.stages.len(), state.stages.len());
}

#[test]
fn state_new_is_used_for_derived_dags() {
    let dag = matmul_dag();
    let (derived, _cache) = dag.with_cache_write(2, "local").unwrap();
    let state = State::new(Arc::new(derived));
    assert_eq!(state.stages.len(), 4);
}
