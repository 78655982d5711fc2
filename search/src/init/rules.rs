//! The initialization rules that turn a sketch into a concrete state.
//!
//! Run in fixed order: tile sizes first (later rules assume concrete
//! extents), then compute-location mutation, then the annotation passes.

use std::collections::BTreeSet;

use loft_ir::{ComputeAtKind, IterAnnotation, IterKind, OpKind, State, TransformStep, extract_original_iterators};
use rand::Rng;
use snafu::ResultExt;

use crate::error::*;
use crate::init::ResultKind;
use crate::policy::SketchPolicy;
use crate::utils::{get_extent, get_single_consumer_id, is_tiled};

/// The initialization rules, in their fixed run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitRule {
    FillTileSize,
    ChangeComputeLocation,
    Parallel,
    Vectorization,
    Unroll,
}

impl InitRule {
    pub fn apply(self, policy: &mut SketchPolicy, state: &mut State) -> Result<ResultKind> {
        match self {
            Self::FillTileSize => fill_tile_size(policy, state),
            Self::ChangeComputeLocation => change_compute_location(policy, state),
            Self::Parallel => init_parallel(policy, state),
            Self::Vectorization => init_vectorization(policy, state),
            Self::Unroll => init_unroll(policy, state),
        }
    }
}

/// Fill every tile-size hole with a randomly drawn factorization scheme.
fn fill_tile_size(policy: &mut SketchPolicy, state: &mut State) -> Result<ResultKind> {
    for step_id in 0..state.transform_steps.len() {
        let (stage_id, iter_id, extent, num_lengths, inner_to_outer) = match &state.transform_steps[step_id] {
            TransformStep::Split { stage_id, iter_id, extent, lengths, inner_to_outer }
                if lengths.iter().any(Option::is_none) =>
            {
                (*stage_id, *iter_id, *extent, lengths.len(), *inner_to_outer)
            }
            _ => continue,
        };

        let Some(extent_val) = extent else { return Ok(ResultKind::Invalid) };
        let schemes = policy.split_memo.get_factorization_schemes(
            extent_val,
            num_lengths,
            policy.params.max_innermost_split_factor,
        );
        if schemes.is_empty() {
            return Ok(ResultKind::Invalid);
        }
        let scheme = &schemes[policy.rng.gen_range(0..schemes.len())];
        state.transform_steps[step_id] = TransformStep::Split {
            stage_id,
            iter_id,
            extent,
            lengths: scheme.iter().map(|l| Some(*l)).collect(),
            inner_to_outer,
        };
    }
    state.concrete = true;
    Ok(ResultKind::Valid)
}

/// Randomly move the computation location of the stages that allow it.
fn change_compute_location(policy: &mut SketchPolicy, state: &mut State) -> Result<ResultKind> {
    if policy.params.disable_change_compute_location {
        return Ok(ResultKind::Valid);
    }

    for stage_id in (0..state.stages.len()).rev() {
        let stage = state.stages[stage_id].clone();
        if stage.op_type == OpKind::Placeholder || stage.compute_at == ComputeAtKind::Inlined {
            continue;
        }
        if is_tiled(state, stage_id) || state.dag.needs_multi_level_tiling(stage.op) {
            continue;
        }

        let Some(target_stage_id) = get_single_consumer_id(state, stage_id) else {
            continue;
        };
        let target_stage = state.stages[target_stage_id].clone();
        let mut to_unroll = state.dag.op_info(target_stage.op).attrs.always_unroll.clone();

        let mut candidates: Vec<(usize, usize)> = Vec::new();
        let target_compute_at_other = target_stage.compute_at == ComputeAtKind::Iter;
        let target_is_tiled = is_tiled(state, target_stage_id);

        let mut visited_reduce = false;
        for (i, target_iter) in target_stage.iters.iter().enumerate() {
            match target_iter.kind {
                IterKind::Reduction => {
                    visited_reduce = true;
                    if !target_is_tiled {
                        // Do not go into the reduce region of an untiled stage.
                        break;
                    }
                }
                IterKind::Spatial => {
                    if visited_reduce {
                        // Do not go into an inner tile.
                        break;
                    }
                }
            }
            if to_unroll.contains(&target_iter.name) {
                // Do not go into an always-unroll region.
                break;
            }
            if get_extent(target_iter) == 1 {
                continue;
            }
            if target_compute_at_other
                && target_iter.kind == IterKind::Spatial
                && target_iter.name.ends_with(".0")
            {
                // First-level iterators of an attached consumer are unit-sized.
                continue;
            }
            candidates.push((target_stage_id, i));

            if state.attach_map.has_attached_stages(target_stage_id, i) {
                break;
            }
        }

        // When the consumer is itself attached somewhere, attaching there is
        // also an option.
        if target_compute_at_other
            && let Some((tt_id, _)) = state.attach_map.attach_iter_of(target_stage_id)
        {
            let tt_stage = state.stages[tt_id].clone();
            to_unroll = state.dag.op_info(tt_stage.op).attrs.always_unroll.clone();
            for (i, it) in tt_stage.iters.iter().enumerate() {
                if it.kind == IterKind::Reduction || state.attach_map.has_attached_stages(tt_id, i) {
                    break;
                }
                if to_unroll.contains(&it.name) {
                    break;
                }
                if get_extent(it) == 1 {
                    continue;
                }
                candidates.push((tt_id, i));
            }
        }

        let choice = policy.rng.gen_range(0..candidates.len() + 2);
        if choice == 0 {
            if !stage.has_reduce_iter() && state.attach_map.attach_iter_of(stage_id).is_some() {
                state.compute_inline(stage_id).context(StateSnafu)?;
            }
        } else if choice == 1 {
            state.compute_root(stage_id).context(StateSnafu)?;
        } else {
            let (target, iter) = candidates[choice - 2];
            state.compute_at(stage_id, target, iter).context(StateSnafu)?;
        }
    }

    *state = policy.task.dag.infer_bound(state).context(StateSnafu)?;
    Ok(ResultKind::Valid)
}

/// Fuse and parallelize the outermost spatial iterators of root stages.
fn init_parallel(policy: &mut SketchPolicy, state: &mut State) -> Result<ResultKind> {
    for stage_id in 0..state.stages.len() {
        let stage = &state.stages[stage_id];
        if stage.compute_at != ComputeAtKind::Root || stage.op_type == OpKind::Placeholder {
            continue;
        }
        annotate_parallel(policy, state, stage_id, 0)?;
    }
    Ok(ResultKind::Valid)
}

fn annotate_parallel(
    policy: &SketchPolicy,
    state: &mut State,
    stage_id: usize,
    iter_offset: usize,
) -> Result<()> {
    let stage = state.stages[stage_id].clone();
    let mut to_fuse: Vec<usize> = Vec::new();
    let mut parallel_degree = 1i64;

    // Collect outermost iterators until the parallel degree suffices or a
    // reduction, annotation or anchored attachment blocks the fuse group.
    let mut iter_id = iter_offset;
    while iter_id < stage.iters.len() {
        let it = &stage.iters[iter_id];
        if it.kind == IterKind::Reduction || it.annotation != IterAnnotation::None {
            break;
        }
        to_fuse.push(iter_id);
        parallel_degree *= get_extent(it);
        if parallel_degree > policy.task.hardware_params.num_cores as i64 * 16 {
            break;
        }
        if state.attach_map.has_attached_stages(stage_id, iter_id) {
            break;
        }
        iter_id += 1;
    }

    if parallel_degree == 1 {
        let mut attached = state.attach_map.attached_stages_at(stage_id, iter_id).to_vec();
        if !attached.is_empty() {
            attached.sort_unstable();
            for attached_stage_id in attached {
                annotate_parallel(policy, state, attached_stage_id, 0)?;
            }
            annotate_parallel(policy, state, stage_id, iter_id + 1)?;
        }
    }

    if !to_fuse.is_empty() {
        if to_fuse.len() > 1 {
            state.fuse(stage_id, &to_fuse).context(StateSnafu)?;
        }
        state.parallel(stage_id, to_fuse[0]).context(StateSnafu)?;
    }
    Ok(())
}

/// Fuse and vectorize the innermost spatial tile of each stage.
fn init_vectorization(policy: &mut SketchPolicy, state: &mut State) -> Result<ResultKind> {
    for stage_id in 0..state.stages.len() {
        let stage = state.stages[stage_id].clone();
        if stage.compute_at == ComputeAtKind::Inlined || stage.op_type == OpKind::Placeholder {
            continue;
        }
        if stage.iters.iter().any(|it| it.annotation == IterAnnotation::Tensorize) {
            continue;
        }

        let to_unroll = state.dag.op_info(stage.op).attrs.always_unroll.clone();
        let tiled = is_tiled(state, stage_id);
        let mut cum_length_prod = 1i64;
        let mut num_fusible = 0usize;
        while num_fusible < stage.iters.len() {
            let iter_id = stage.iters.len() - 1 - num_fusible;
            if state.attach_map.has_attached_stages(stage_id, iter_id) {
                break;
            }
            let it = &stage.iters[iter_id];
            if it.kind == IterKind::Reduction
                || it.annotation != IterAnnotation::None
                || to_unroll.contains(&it.name)
            {
                break;
            }
            // Past the innermost iterator of a tiled stage the access is no
            // longer contiguous.
            if tiled && num_fusible != 0 {
                break;
            }
            cum_length_prod *= get_extent(it);
            if cum_length_prod > policy.params.max_vectorize_size {
                break;
            }
            num_fusible += 1;
        }

        if num_fusible > 1 {
            // A random prefix of the fusible run.
            num_fusible = 1 + policy.rng.gen_range(0..num_fusible - 1);
        }

        if num_fusible == 1 {
            state.vectorize(stage_id, stage.iters.len() - 1).context(StateSnafu)?;
        } else if num_fusible > 1 {
            let ids: Vec<usize> = (stage.iters.len() - num_fusible..stage.iters.len()).collect();
            state.fuse(stage_id, &ids).context(StateSnafu)?;
            state.vectorize(stage_id, ids[0]).context(StateSnafu)?;
        }
    }
    Ok(ResultKind::Valid)
}

/// Unroll the iterators the operation's attributes ask for, and add the
/// auto-unroll pragma to reduction stages.
fn init_unroll(policy: &mut SketchPolicy, state: &mut State) -> Result<ResultKind> {
    const AUTO_UNROLL_CONFIGS: [i64; 4] = [0, 16, 64, 512];

    for stage_id in 0..state.stages.len() {
        let stage = state.stages[stage_id].clone();
        if stage.compute_at == ComputeAtKind::Inlined || stage.op_type == OpKind::Placeholder {
            continue;
        }
        let attrs = state.dag.op_info(stage.op).attrs.clone();

        if !attrs.always_unroll_inner.is_empty() {
            // Unroll the listed iterators inside the innermost tile. The tile
            // boundary is where an iterator stops contributing new original
            // names.
            let mut visited_names: BTreeSet<String> = BTreeSet::new();
            for n in (0..stage.iters.len()).rev() {
                let it = &stage.iters[n];
                let size_before = visited_names.len();
                extract_original_iterators(&it.name, &mut visited_names);
                if size_before == visited_names.len() {
                    break;
                }

                let mut names = BTreeSet::new();
                extract_original_iterators(&it.name, &mut names);
                if names.len() == 1
                    && attrs.always_unroll_inner.contains(names.iter().next().unwrap())
                    && it.annotation == IterAnnotation::None
                {
                    state.unroll(stage_id, n).context(StateSnafu)?;
                }
            }
        }

        if !attrs.always_unroll.is_empty() {
            for n in (0..stage.iters.len()).rev() {
                if attrs.always_unroll.contains(&stage.iters[n].name) {
                    state.unroll(stage_id, n).context(StateSnafu)?;
                }
            }
        }

        if stage.has_reduce_iter() {
            let value = AUTO_UNROLL_CONFIGS[policy.rng.gen_range(0..AUTO_UNROLL_CONFIGS.len())];
            state
                .pragma(stage_id, 0, &format!("auto_unroll_max_step${value}"))
                .context(StateSnafu)?;
        }
    }
    Ok(ResultKind::Valid)
}
