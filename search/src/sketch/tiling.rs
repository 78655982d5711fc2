//! Structured tiling helpers used by the derivation rules.

use loft_ir::{IterKind, State};
use snafu::ResultExt;

use crate::error::*;

/// Multi-level tile a stage according to a structure string over `{S, R}`.
///
/// Each spatial iterator is split into as many parts as there are `S`
/// characters, each reduction iterator into as many parts as there are `R`
/// characters (tile sizes are left as holes), and the parts are reordered so
/// the levels nest in structure-string order. Iterators named in the
/// operation's `no_split_at_inner` attribute are not split and join the
/// innermost level of their kind.
///
/// Returns the tiled state and the ids of the recorded spatial split steps.
pub fn do_multi_level_tiling(state: &State, stage_id: usize, format: &str) -> Result<(State, Vec<usize>)> {
    let n_space = format.chars().filter(|c| c.eq_ignore_ascii_case(&'s')).count();
    let n_reduce = format.chars().filter(|c| c.eq_ignore_ascii_case(&'r')).count();

    let mut space_levels: Vec<Vec<usize>> = vec![Vec::new(); n_space];
    let mut reduce_levels: Vec<Vec<usize>> = vec![Vec::new(); n_reduce];
    let mut space_inner: Vec<usize> = Vec::new();
    let mut reduce_inner: Vec<usize> = Vec::new();
    let mut spatial_split_step_ids = Vec::new();

    let mut tmp = state.clone();
    let no_split = state.dag.op_info(state.stages[stage_id].op).attrs.no_split_at_inner.clone();
    let orig_iters: Vec<(String, IterKind)> =
        state.stages[stage_id].iters.iter().map(|it| (it.name.clone(), it.kind)).collect();

    // `cursor` tracks the position of the iterator being processed in the
    // evolving iterator list; each split shifts the tail.
    let mut cursor = 0usize;
    for (name, kind) in orig_iters {
        if no_split.contains(&name) {
            match kind {
                IterKind::Spatial => space_inner.push(cursor),
                IterKind::Reduction => reduce_inner.push(cursor),
            }
            cursor += 1;
            continue;
        }
        let (levels, n_parts) = match kind {
            IterKind::Spatial => (&mut space_levels, n_space),
            IterKind::Reduction => (&mut reduce_levels, n_reduce),
        };
        if n_parts == 0 {
            // No level of this kind in the structure; keep the iterator where
            // the innermost level of the other kind ends.
            match kind {
                IterKind::Spatial => space_inner.push(cursor),
                IterKind::Reduction => reduce_inner.push(cursor),
            }
            cursor += 1;
        } else if n_parts == 1 {
            levels[0].push(cursor);
            cursor += 1;
        } else {
            let lengths = vec![None; n_parts - 1];
            tmp.split(stage_id, cursor, &lengths).context(StateSnafu)?;
            if kind == IterKind::Spatial {
                spatial_split_step_ids.push(tmp.transform_steps.len() - 1);
            }
            for (level, bucket) in levels.iter_mut().enumerate() {
                bucket.push(cursor + level);
            }
            cursor += n_parts;
        }
    }

    let mut trailing: Vec<usize> = Vec::new();
    match space_levels.last_mut() {
        Some(last) => last.splice(0..0, space_inner).for_each(drop),
        None => trailing.extend(space_inner),
    }
    match reduce_levels.last_mut() {
        Some(last) => last.splice(0..0, reduce_inner).for_each(drop),
        None => trailing.extend(reduce_inner),
    }

    let mut order = Vec::with_capacity(tmp.stages[stage_id].iters.len());
    let (mut space_ct, mut reduce_ct) = (0, 0);
    for c in format.chars() {
        if c.eq_ignore_ascii_case(&'s') {
            order.extend(&space_levels[space_ct]);
            space_ct += 1;
        } else {
            order.extend(&reduce_levels[reduce_ct]);
            reduce_ct += 1;
        }
    }
    order.extend(trailing);
    tmp.reorder(stage_id, &order).context(StateSnafu)?;
    Ok((tmp, spatial_split_step_ids))
}

/// Tile a consumer so a producer can attach at one of its levels: every
/// spatial iterator is split into `n_split + 1` parts (hole tile sizes) and
/// the parts are regrouped level by level, outermost first.
pub fn follow_tiling(state: &State, stage_id: usize, n_split: usize) -> Result<State> {
    let mut levels: Vec<Vec<usize>> = vec![Vec::new(); n_split + 1];
    let mut tmp = state.clone();

    let orig: Vec<IterKind> = state.stages[stage_id].iters.iter().map(|it| it.kind).collect();
    let mut cursor = 0usize;
    for kind in orig {
        debug_assert_eq!(kind, IterKind::Spatial);
        if n_split == 0 {
            levels[0].push(cursor);
            cursor += 1;
            continue;
        }
        let lengths = vec![None; n_split];
        tmp.split(stage_id, cursor, &lengths).context(StateSnafu)?;
        for (level, bucket) in levels.iter_mut().enumerate() {
            bucket.push(cursor + level);
        }
        cursor += n_split + 1;
    }

    let order: Vec<usize> = levels.into_iter().flatten().collect();
    tmp.reorder(stage_id, &order).context(StateSnafu)?;
    Ok(tmp)
}

/// Fuse every reduction iterator of a stage into one.
///
/// Returns the new state, the index of the (possibly already single) fused
/// reduction iterator, and the number of spatial iterators.
pub fn fuse_all_reduction_iterators(state: &State, stage_id: usize) -> Result<(State, usize, usize)> {
    let mut space_ids = Vec::new();
    let mut reduce_ids = Vec::new();
    for (i, it) in state.stages[stage_id].iters.iter().enumerate() {
        match it.kind {
            IterKind::Spatial => space_ids.push(i),
            IterKind::Reduction => reduce_ids.push(i),
        }
    }
    debug_assert!(!reduce_ids.is_empty());

    let mut tmp = state.clone();
    if reduce_ids.len() > 1 {
        tmp.fuse(stage_id, &reduce_ids).context(StateSnafu)?;
    }
    Ok((tmp, reduce_ids[0], space_ids.len()))
}
