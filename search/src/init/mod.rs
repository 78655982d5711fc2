//! Initial-population sampling over generated sketches.

pub mod rules;

use std::time::Instant;

use loft_ir::State;
use rand::Rng;

use crate::error::*;
use crate::policy::SketchPolicy;

/// Outcome of one initialization rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Valid,
    /// The sampled state cannot be completed; reject it and redraw.
    Invalid,
}

/// Sample concrete states from random sketches until `out_size` states were
/// accepted or as many were rejected.
pub fn sample_init_population(
    policy: &mut SketchPolicy,
    sketches: &[State],
    out_size: usize,
) -> Result<Vec<State>> {
    let tic = Instant::now();
    let mut out_states = Vec::new();
    let mut fail_ct = 0usize;

    if sketches.is_empty() {
        tracing::warn!("no sketches to sample an initial population from");
        return Ok(out_states);
    }

    while out_states.len() < out_size && fail_ct < out_size {
        let mut tmp = sketches[policy.rng.gen_range(0..sketches.len())].clone();
        let mut valid = true;
        for rule in policy.init_rules() {
            if rule.apply(policy, &mut tmp)? == ResultKind::Invalid {
                valid = false;
                break;
            }
        }
        if valid {
            out_states.push(tmp);
        } else {
            fail_ct += 1;
        }
    }

    tracing::info!(
        count = out_states.len(),
        fail_ct,
        elapsed_ms = tic.elapsed().as_millis() as u64,
        "sampled initial population"
    );
    Ok(out_states)
}
