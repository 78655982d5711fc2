//! Transform steps: the replayable history of schedule primitives.
//!
//! Every mutation of a [`State`](crate::State) is recorded as one
//! [`TransformStep`]. Re-applying the recorded sequence to the initial state
//! of the same compute DAG reproduces the state exactly, which is what bound
//! inference and the measurement pipeline rely on.

use std::fmt;

use crate::state::IterAnnotation;

/// One schedule primitive, recorded with everything needed to replay it.
///
/// A closed sum: apply and print sites match on the variant directly.
///
/// `Split::lengths` entries may be `None` while a state is still a sketch
/// (a tile-size hole); a concrete state has every length defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformStep {
    Split {
        stage_id: usize,
        iter_id: usize,
        /// Extent of the split iterator at record time, if known.
        extent: Option<i64>,
        lengths: Vec<Option<i64>>,
        /// When true, `lengths` describe the inner parts from outer to inner.
        inner_to_outer: bool,
    },
    Fuse {
        stage_id: usize,
        /// Contiguous, ascending iterator ids.
        fused_ids: Vec<usize>,
    },
    Reorder {
        stage_id: usize,
        /// Permutation: position `i` holds the old id of the new `i`-th iterator.
        after_ids: Vec<usize>,
    },
    ComputeAt {
        stage_id: usize,
        target_stage_id: usize,
        target_iter_id: usize,
    },
    ComputeInline {
        stage_id: usize,
    },
    ComputeRoot {
        stage_id: usize,
    },
    CacheWrite {
        stage_id: usize,
        scope_name: String,
    },
    Rfactor {
        stage_id: usize,
        iter_id: usize,
        factor_axis: usize,
    },
    Parallel {
        stage_id: usize,
        iter_id: usize,
    },
    Vectorize {
        stage_id: usize,
        iter_id: usize,
    },
    Unroll {
        stage_id: usize,
        iter_id: usize,
    },
    Pragma {
        stage_id: usize,
        iter_id: usize,
        pragma_type: String,
    },
}

impl TransformStep {
    /// Annotation carried by the step, for annotation-style steps.
    pub fn annotation(&self) -> Option<IterAnnotation> {
        match self {
            Self::Parallel { .. } => Some(IterAnnotation::Parallel),
            Self::Vectorize { .. } => Some(IterAnnotation::Vectorize),
            Self::Unroll { .. } => Some(IterAnnotation::Unroll),
            _ => None,
        }
    }

    /// Whether this step inserts a new stage into the state.
    pub fn inserts_stage(&self) -> bool {
        matches!(self, Self::CacheWrite { .. } | Self::Rfactor { .. })
    }

    /// The stage the step was recorded against.
    pub fn stage_id(&self) -> usize {
        match self {
            Self::Split { stage_id, .. }
            | Self::Fuse { stage_id, .. }
            | Self::Reorder { stage_id, .. }
            | Self::ComputeAt { stage_id, .. }
            | Self::ComputeInline { stage_id }
            | Self::ComputeRoot { stage_id }
            | Self::CacheWrite { stage_id, .. }
            | Self::Rfactor { stage_id, .. }
            | Self::Parallel { stage_id, .. }
            | Self::Vectorize { stage_id, .. }
            | Self::Unroll { stage_id, .. }
            | Self::Pragma { stage_id, .. } => *stage_id,
        }
    }
}

fn fmt_len(len: &Option<i64>) -> String {
    match len {
        Some(l) => l.to_string(),
        None => "?".to_string(),
    }
}

impl fmt::Display for TransformStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split { stage_id, iter_id, lengths, .. } => {
                let lens: Vec<String> = lengths.iter().map(fmt_len).collect();
                write!(f, "split(s{stage_id}, i{iter_id}, [{}])", lens.join(", "))
            }
            Self::Fuse { stage_id, fused_ids } => write!(f, "fuse(s{stage_id}, {fused_ids:?})"),
            Self::Reorder { stage_id, after_ids } => write!(f, "reorder(s{stage_id}, {after_ids:?})"),
            Self::ComputeAt { stage_id, target_stage_id, target_iter_id } => {
                write!(f, "compute_at(s{stage_id}, s{target_stage_id}, i{target_iter_id})")
            }
            Self::ComputeInline { stage_id } => write!(f, "compute_inline(s{stage_id})"),
            Self::ComputeRoot { stage_id } => write!(f, "compute_root(s{stage_id})"),
            Self::CacheWrite { stage_id, scope_name } => write!(f, "cache_write(s{stage_id}, \"{scope_name}\")"),
            Self::Rfactor { stage_id, iter_id, factor_axis } => {
                write!(f, "rfactor(s{stage_id}, i{iter_id}, {factor_axis})")
            }
            Self::Parallel { stage_id, iter_id } => write!(f, "parallel(s{stage_id}, i{iter_id})"),
            Self::Vectorize { stage_id, iter_id } => write!(f, "vectorize(s{stage_id}, i{iter_id})"),
            Self::Unroll { stage_id, iter_id } => write!(f, "unroll(s{stage_id}, i{iter_id})"),
            Self::Pragma { stage_id, iter_id, pragma_type } => {
                write!(f, "pragma(s{stage_id}, i{iter_id}, \"{pragma_type}\")")
            }
        }
    }
}

/// Render a step sequence as schedule-API-like pseudo code, for debugging.
pub fn print_steps_as_python(steps: &[TransformStep]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for step in steps {
        match step {
            TransformStep::Split { stage_id, iter_id, lengths, .. } => {
                let lens: Vec<String> = lengths.iter().map(fmt_len).collect();
                let _ = writeln!(out, "s[{stage_id}].split(ax{iter_id}, factors=[{}])", lens.join(", "));
            }
            TransformStep::Fuse { stage_id, fused_ids } => {
                let axes: Vec<String> = fused_ids.iter().map(|i| format!("ax{i}")).collect();
                let _ = writeln!(out, "s[{stage_id}].fuse({})", axes.join(", "));
            }
            TransformStep::Reorder { stage_id, after_ids } => {
                let axes: Vec<String> = after_ids.iter().map(|i| format!("ax{i}")).collect();
                let _ = writeln!(out, "s[{stage_id}].reorder({})", axes.join(", "));
            }
            TransformStep::ComputeAt { stage_id, target_stage_id, target_iter_id } => {
                let _ = writeln!(out, "s[{stage_id}].compute_at(s[{target_stage_id}], ax{target_iter_id})");
            }
            TransformStep::ComputeInline { stage_id } => {
                let _ = writeln!(out, "s[{stage_id}].compute_inline()");
            }
            TransformStep::ComputeRoot { stage_id } => {
                let _ = writeln!(out, "s[{stage_id}].compute_root()");
            }
            TransformStep::CacheWrite { stage_id, scope_name } => {
                let _ = writeln!(out, "s.cache_write(s[{stage_id}], \"{scope_name}\")");
            }
            TransformStep::Rfactor { stage_id, iter_id, factor_axis } => {
                let _ = writeln!(out, "s.rfactor(s[{stage_id}], ax{iter_id}, factor_axis={factor_axis})");
            }
            TransformStep::Parallel { stage_id, iter_id } => {
                let _ = writeln!(out, "s[{stage_id}].parallel(ax{iter_id})");
            }
            TransformStep::Vectorize { stage_id, iter_id } => {
                let _ = writeln!(out, "s[{stage_id}].vectorize(ax{iter_id})");
            }
            TransformStep::Unroll { stage_id, iter_id } => {
                let _ = writeln!(out, "s[{stage_id}].unroll(ax{iter_id})");
            }
            TransformStep::Pragma { stage_id, iter_id, pragma_type } => {
                let _ = writeln!(out, "s[{stage_id}].pragma(ax{iter_id}, \"{pragma_type}\")");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_split_with_holes() {
        let step = TransformStep::Split {
            stage_id: 2,
            iter_id: 1,
            extent: Some(512),
            lengths: vec![None, Some(8)],
            inner_to_outer: true,
        };
        assert_eq!(step.to_string(), "split(s2, i1, [?, 8])");
    }

    #[test]
    fn annotation_mapping() {
        let step = TransformStep::Parallel { stage_id: 0, iter_id: 0 };
        assert_eq!(step.annotation(), Some(IterAnnotation::Parallel));
        let step = TransformStep::Pragma { stage_id: 0, iter_id: 0, pragma_type: "x".into() };
        assert_eq!(step.annotation(), None);
    }

    #[test]
    fn python_printer_smoke() {
        let steps = vec![
            TransformStep::Split { stage_id: 0, iter_id: 0, extent: Some(16), lengths: vec![Some(4)], inner_to_outer: true },
            TransformStep::Parallel { stage_id: 0, iter_id: 0 },
        ];
        let code = print_steps_as_python(&steps);
        assert!(code.contains("split(ax0, factors=[4])"));
        assert!(code.contains("parallel(ax0)"));
    }
}
