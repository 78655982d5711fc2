//! Predicates and small helpers shared by the sketch and init rules.

use loft_ir::{ComputeAtKind, Iter, OpKind, State, TransformStep};

/// Extent of an iterator, `-1` when it is not known yet. Mirrors how the
/// annotation rules accumulate degree products: an unknown extent poisons the
/// product instead of aborting the walk.
pub fn get_extent(it: &Iter) -> i64 {
    it.extent.unwrap_or(-1)
}

/// Whether the stage's iterator list no longer matches its operation's axes,
/// i.e. some split or fusion has restructured it.
pub fn is_tiled(state: &State, stage_id: usize) -> bool {
    let stage = &state.stages[stage_id];
    let info = state.dag.op_info(stage.op);
    stage.iters.len() != info.spatial.len() + info.reduction.len()
}

/// Whether `stage_id` already has a cache-write stage associated.
///
/// Steps record the stage ids of their own time, so the probe id is walked
/// back across every stage-inserting step recorded for an earlier position.
pub fn has_cache_write_stage(state: &State, stage_id: usize) -> bool {
    let mut stage_id = stage_id as isize;
    for step in state.transform_steps.iter().rev() {
        if let TransformStep::CacheWrite { stage_id: step_stage, .. } = step
            && stage_id == *step_stage as isize
        {
            return true;
        }
        if step.inserts_stage() && stage_id > step.stage_id() as isize {
            stage_id -= 1;
        }
    }
    false
}

/// Stage ids of the consumers of `stage_id`, looking through inlined stages.
pub fn get_consumers(state: &State, stage_id: usize) -> Vec<usize> {
    let op = state.stages[stage_id].op;
    let mut ids: Vec<usize> = state
        .dag
        .get_consumers(state, op)
        .into_iter()
        .filter_map(|c| state.stage_of_op(c))
        .collect();
    ids.sort_unstable();
    ids
}

/// The only consumer of `stage_id` when it is elementwise-matched, if any.
pub fn has_single_elementwise_matched_consumer(state: &State, stage_id: usize) -> Option<usize> {
    let consumers = get_consumers(state, stage_id);
    if let [target] = consumers.as_slice()
        && state.dag.element_wise_match(state.stages[stage_id].op, state.stages[*target].op)
    {
        return Some(*target);
    }
    None
}

/// The single consumer to consider for a compute-location move: the direct
/// consumer when unique, else the common root stage all consumers sit under.
pub fn get_single_consumer_id(state: &State, stage_id: usize) -> Option<usize> {
    let consumers = get_consumers(state, stage_id);
    match consumers.as_slice() {
        [] => None,
        [single] => Some(*single),
        many => {
            let mut common_root = None;
            for &consumer in many {
                let root = if state.stages[consumer].compute_at == ComputeAtKind::Root {
                    Some(consumer)
                } else {
                    state.attach_map.attach_iter_of(consumer).map(|(target, _)| target)
                };
                match (common_root, root) {
                    (_, None) => return None,
                    (None, Some(r)) => common_root = Some(r),
                    (Some(prev), Some(r)) if prev != r => return None,
                    _ => {}
                }
            }
            common_root
        }
    }
}

/// Whether the stage is a compute stage that should always be inlined.
pub fn should_always_be_inlined(state: &State, stage_id: usize) -> bool {
    let stage = &state.stages[stage_id];
    if stage.op_type == OpKind::Placeholder {
        return false;
    }
    if state.dag.is_output(stage.op) || stage.has_reduce_iter() {
        return false;
    }
    state.dag.op_info(stage.op).attrs.always_compute_inline || state.dag.is_strict_inlineable(stage.op)
}

/// Indices sorted by descending score.
pub fn argsort_descending(scores: &[f64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&l, &r| scores[r].partial_cmp(&scores[l]).unwrap_or(std::cmp::Ordering::Equal));
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use loft_ir::ComputeDag;

    fn chain_state() -> State {
        let mut b = ComputeDag::builder();
        let a = b.placeholder("A", &[64]);
        let p = b.compute("B", &[("i", 64)], &[], &[a]);
        let _c = b.compute("C", &[("i", 64)], &[], &[p]);
        b.build().init_state()
    }

    #[test]
    fn tiled_detection() {
        let mut state = chain_state();
        assert!(!is_tiled(&state, 1));
        state.split(1, 0, &[Some(8)]).unwrap();
        assert!(is_tiled(&state, 1));
    }

    #[test]
    fn consumer_queries() {
        let state = chain_state();
        assert_eq!(get_consumers(&state, 1), vec![2]);
        assert_eq!(has_single_elementwise_matched_consumer(&state, 1), Some(2));
        assert_eq!(get_single_consumer_id(&state, 1), Some(2));
        assert_eq!(get_single_consumer_id(&state, 2), None);
    }

    #[test]
    fn cache_write_probe_tracks_insertions() {
        let mut b = ComputeDag::builder();
        let a = b.placeholder("A", &[64, 64]);
        let c = b.compute("C", &[("i", 64), ("j", 64)], &[("k", 64)], &[a]);
        b.needs_multi_level_tiling(c);
        let dag = b.build();
        let mut state = dag.init_state();
        let cs = state.stage_of_op(c).unwrap();
        assert!(!has_cache_write_stage(&state, cs));
        let cache_id = state.cache_write(cs, "local").unwrap();
        assert!(has_cache_write_stage(&state, cache_id));
    }

    #[test]
    fn always_inline_requires_no_reduction_and_non_output() {
        let state = chain_state();
        assert!(should_always_be_inlined(&state, 1));
        // The chain output must not be inlined.
        assert!(!should_always_be_inlined(&state, 2));
        // Placeholders never are.
        assert!(!should_always_be_inlined(&state, 0));
    }

    #[test]
    fn argsort_is_descending() {
        assert_eq!(argsort_descending(&[0.1, 0.9, 0.5]), vec![1, 2, 0]);
    }
}
