//! The sketch derivation rules.
//!
//! A closed set of stateless rules consulted in registration order at each
//! stage cursor. The first rule answering `ApplyAndSkipRest` terminates rule
//! consideration for that cursor position.

use loft_ir::State;
use snafu::ResultExt;

use crate::error::*;
use crate::policy::SketchPolicy;
use crate::sketch::tiling::{do_multi_level_tiling, follow_tiling, fuse_all_reduction_iterators};
use crate::utils::{
    has_cache_write_stage, has_single_elementwise_matched_consumer, should_always_be_inlined,
};

/// Answer of a rule's condition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// Not applicable here.
    Pass,
    /// Apply, then keep consulting later rules.
    Apply,
    /// Apply and consult no further rule at this cursor.
    ApplyAndSkipRest,
}

/// The derivation rules, in their registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchRule {
    AlwaysInline,
    AddRfactor,
    AddCacheWrite,
    MultiLevelTilingWithFusion,
    MultiLevelTiling,
    SkipStage,
}

impl SketchRule {
    pub fn meet_condition(self, policy: &SketchPolicy, state: &State, stage_id: usize) -> ConditionKind {
        let dag = &state.dag;
        let op = state.stages[stage_id].op;
        match self {
            Self::AlwaysInline => {
                if should_always_be_inlined(state, stage_id) {
                    ConditionKind::ApplyAndSkipRest
                } else {
                    ConditionKind::Pass
                }
            }
            Self::AddRfactor => {
                if dag.needs_rfactor(state, stage_id, &policy.task.hardware_params)
                    && !has_cache_write_stage(state, stage_id)
                {
                    ConditionKind::Apply
                } else {
                    ConditionKind::Pass
                }
            }
            Self::AddCacheWrite => {
                if dag.op_info(op).attrs.no_cache_write {
                    return ConditionKind::Pass;
                }
                if dag.needs_multi_level_tiling(op)
                    && has_single_elementwise_matched_consumer(state, stage_id).is_none()
                {
                    ConditionKind::Apply
                } else {
                    ConditionKind::Pass
                }
            }
            Self::MultiLevelTilingWithFusion => {
                if dag.needs_multi_level_tiling(op)
                    && has_single_elementwise_matched_consumer(state, stage_id).is_some()
                {
                    // A stage that already has its cache write must fuse.
                    if has_cache_write_stage(state, stage_id) {
                        ConditionKind::ApplyAndSkipRest
                    } else {
                        ConditionKind::Apply
                    }
                } else {
                    ConditionKind::Pass
                }
            }
            Self::MultiLevelTiling => {
                if dag.needs_multi_level_tiling(op) {
                    ConditionKind::Apply
                } else {
                    ConditionKind::Pass
                }
            }
            Self::SkipStage => ConditionKind::Apply,
        }
    }

    /// Apply the rule, producing successor states and the cursor each one
    /// continues at.
    pub fn apply(self, policy: &SketchPolicy, state: &State, stage_id: usize) -> Result<Vec<(State, i32)>> {
        match self {
            Self::AlwaysInline => {
                let mut tmp = state.clone();
                tmp.compute_inline(stage_id).context(StateSnafu)?;
                Ok(vec![(tmp, stage_id as i32 - 1)])
            }

            Self::AddRfactor => {
                let (mut base, fused_id, n_space) = fuse_all_reduction_iterators(state, stage_id)?;
                base.split(stage_id, fused_id, &[Some(1)]).context(StateSnafu)?;
                let factor_axis = n_space;

                let mut ret = Vec::with_capacity(2);
                for half in 0..2 {
                    let mut tmp = base.clone();
                    let rstage_id = tmp.rfactor(stage_id, fused_id + half, factor_axis).context(StateSnafu)?;
                    if half == 1 {
                        // Move the factored axis innermost so it vectorizes.
                        let n = tmp.stages[rstage_id].iters.len();
                        let mut order: Vec<usize> = (0..n).filter(|&i| i != n_space).collect();
                        order.push(n_space);
                        tmp.reorder(rstage_id, &order).context(StateSnafu)?;
                    }
                    ret.push((tmp, rstage_id as i32 - 1));
                }
                Ok(ret)
            }

            Self::AddCacheWrite => {
                let mut tmp = state.clone();
                tmp.cache_write(stage_id, "local").context(StateSnafu)?;
                Ok(vec![(tmp, stage_id as i32)])
            }

            Self::MultiLevelTilingWithFusion => {
                let Some(target_stage_id) = has_single_elementwise_matched_consumer(state, stage_id) else {
                    return Ok(Vec::new());
                };
                let structure = &policy.params.cpu_multi_level_tiling_structure;
                let (base, spatial_split_step_ids) = do_multi_level_tiling(state, stage_id, structure)?;
                // A structure without spatial levels leaves nothing to attach at.
                if spatial_split_step_ids.is_empty() {
                    return Ok(Vec::new());
                }

                let mut ret = Vec::new();
                for level in [1usize, 2] {
                    if structure.len() < level || !structure.as_bytes()[level - 1].eq_ignore_ascii_case(&b's') {
                        continue;
                    }
                    let mut tmp = follow_tiling(&base, target_stage_id, level)?;
                    let target_iter_id = level * spatial_split_step_ids.len() - 1;
                    tmp.compute_at(stage_id, target_stage_id, target_iter_id).context(StateSnafu)?;
                    ret.push((tmp, stage_id as i32 - 1));
                }
                Ok(ret)
            }

            Self::MultiLevelTiling => {
                let structure = &policy.params.cpu_multi_level_tiling_structure;
                let (tmp, _) = do_multi_level_tiling(state, stage_id, structure)?;
                Ok(vec![(tmp, stage_id as i32 - 1)])
            }

            Self::SkipStage => Ok(vec![(state.clone(), stage_id as i32 - 1)]),
        }
    }
}
