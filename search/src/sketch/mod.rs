//! Sketch generation: derivation-rule enumeration over stage cursors.

pub mod rules;
pub mod tiling;

use loft_ir::{State, TransformStep};
use snafu::ensure;

use crate::error::*;
use crate::policy::SketchPolicy;
use self::rules::ConditionKind;

/// Enumerate the sketches of the policy's task.
///
/// A double-buffered breadth-first walk over `(state, stage cursor)` pairs:
/// states whose cursor passed the first stage are complete; for the rest the
/// derivation rules are consulted in order and their successors enter the
/// next round.
pub fn generate_sketches(policy: &SketchPolicy) -> Result<Vec<State>> {
    let init_state = policy.task.dag.init_state();
    let init_cursor = init_state.stages.len() as i32 - 1;

    let mut pnow: Vec<(State, i32)> = vec![(init_state, init_cursor)];
    let mut pnext: Vec<(State, i32)> = Vec::new();
    let mut out_states: Vec<State> = Vec::new();

    while !pnow.is_empty() {
        pnext.clear();
        for (state, cursor) in &pnow {
            if *cursor < 0 {
                out_states.push(state.clone());
                continue;
            }
            let stage_id = *cursor as usize;
            for rule in policy.sketch_rules() {
                let cond = rule.meet_condition(policy, state, stage_id);
                if cond != ConditionKind::Pass {
                    pnext.extend(rule.apply(policy, state, stage_id)?);
                    if cond == ConditionKind::ApplyAndSkipRest {
                        break;
                    }
                }
            }
        }
        std::mem::swap(&mut pnow, &mut pnext);
    }

    // Rfactor records its split with a literal unit length so the primitives
    // stay applicable mid-derivation; rewrite it to a hole now so the sampler
    // can draw the factor freely.
    for state in &mut out_states {
        punch_rfactor_holes(state)?;
    }

    tracing::info!(count = out_states.len(), "generated sketches");
    Ok(out_states)
}

fn punch_rfactor_holes(state: &mut State) -> Result<()> {
    for index in 0..state.transform_steps.len() {
        if !matches!(state.transform_steps[index], TransformStep::Rfactor { .. }) {
            continue;
        }
        ensure!(index >= 1, RfactorWithoutSplitSnafu { index });
        let prev = index - 1;
        match &state.transform_steps[prev] {
            TransformStep::Split { stage_id, iter_id, extent, inner_to_outer, .. } => {
                state.transform_steps[prev] = TransformStep::Split {
                    stage_id: *stage_id,
                    iter_id: *iter_id,
                    extent: *extent,
                    lengths: vec![None],
                    inner_to_outer: *inner_to_outer,
                };
                state.concrete = false;
            }
            _ => return RfactorWithoutSplitSnafu { index }.fail(),
        }
    }
    Ok(())
}
