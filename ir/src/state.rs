//! Loop-schedule state: stages, iterators and the schedule primitives.
//!
//! A [`State`] is a logically immutable snapshot of one schedule. Stage slots
//! are shared (`Arc`) so cloning a state for a search frontier is cheap; a
//! primitive mutates only the touched slot via clone-on-write and appends one
//! [`TransformStep`] to the replayable history.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use snafu::ensure;

use crate::attach::{AttachMap, IterKey};
use crate::dag::{ComputeDag, OpId, OpKind};
use crate::error::*;
use crate::step::TransformStep;

/// Loop kind of an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterKind {
    Spatial,
    Reduction,
}

/// Annotation attached to an iterator by the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IterAnnotation {
    #[default]
    None,
    Parallel,
    Vectorize,
    Unroll,
    Tensorize,
}

impl fmt::Display for IterAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Parallel => "parallel",
            Self::Vectorize => "vectorize",
            Self::Unroll => "unroll",
            Self::Tensorize => "tensorize",
        };
        write!(f, "{s}")
    }
}

/// One loop variable of a stage.
///
/// Split derivation is encoded in the name (`i` splits into `i.0`, `i.1`, …)
/// and fusion joins names with `@`. The extent is `None` until it can be
/// derived, e.g. for parts of a split whose tile sizes are still holes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iter {
    pub name: String,
    pub extent: Option<i64>,
    pub kind: IterKind,
    pub annotation: IterAnnotation,
}

impl Iter {
    pub fn new(name: impl Into<String>, extent: Option<i64>, kind: IterKind) -> Self {
        Self { name: name.into(), extent, kind, annotation: IterAnnotation::None }
    }
}

/// Where a stage is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeAtKind {
    #[default]
    Root,
    Inlined,
    /// Attached at an iterator of another stage; the target lives in the
    /// state's attach map.
    Iter,
}

impl fmt::Display for ComputeAtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Root => "root",
            Self::Inlined => "inlined",
            Self::Iter => "iter",
        };
        write!(f, "{s}")
    }
}

/// Scheduling view of one operation of the compute DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub op: OpId,
    pub op_type: OpKind,
    pub iters: SmallVec<[Iter; 8]>,
    pub compute_at: ComputeAtKind,
}

impl Stage {
    /// Build the untransformed stage of `op`: spatial iterators first, then
    /// reduction iterators, all computed at root. Placeholder stages carry no
    /// iterators.
    pub fn from_op(op: OpId, dag: &ComputeDag) -> Stage {
        let info = dag.op_info(op);
        let mut iters = SmallVec::new();
        if info.kind == OpKind::Compute {
            for axis in &info.spatial {
                iters.push(Iter::new(axis.name.clone(), axis.extent, IterKind::Spatial));
            }
            for axis in &info.reduction {
                iters.push(Iter::new(axis.name.clone(), axis.extent, IterKind::Reduction));
            }
        }
        Stage { op, op_type: info.kind, iters, compute_at: ComputeAtKind::Root }
    }

    pub fn has_reduce_iter(&self) -> bool {
        self.iters.iter().any(|it| it.kind == IterKind::Reduction)
    }
}

/// An immutable schedule snapshot with a replayable transform history.
#[derive(Debug, Clone)]
pub struct State {
    pub stages: Vec<Arc<Stage>>,
    pub transform_steps: Vec<TransformStep>,
    pub attach_map: AttachMap,
    /// True iff no split step carries an undefined length.
    pub concrete: bool,
    /// The DAG this state currently schedules. Stage-inserting primitives
    /// (cache write, rfactor) swap in an updated DAG.
    pub dag: Arc<ComputeDag>,
}

impl State {
    /// The initial state of a DAG: one root stage per operation in
    /// topological order, no steps.
    pub fn new(dag: Arc<ComputeDag>) -> Self {
        let stages = dag.topo_order().iter().map(|&op| Arc::new(Stage::from_op(op, &dag))).collect();
        State { stages, transform_steps: Vec::new(), attach_map: AttachMap::default(), concrete: true, dag }
    }

    /// The stage currently scheduling `op`, if any.
    pub fn stage_of_op(&self, op: OpId) -> Option<usize> {
        self.stages.iter().position(|s| s.op == op)
    }

    fn check_stage(&self, stage_id: usize) -> Result<()> {
        ensure!(stage_id < self.stages.len(), StageOutOfBoundsSnafu { stage_id, count: self.stages.len() });
        Ok(())
    }

    fn check_iter(&self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.check_stage(stage_id)?;
        let count = self.stages[stage_id].iters.len();
        ensure!(iter_id < count, IterOutOfBoundsSnafu { stage_id, iter_id, count });
        Ok(())
    }

    fn stage_mut(&mut self, stage_id: usize) -> &mut Stage {
        Arc::make_mut(&mut self.stages[stage_id])
    }

    // ------------------------------------------------------------------
    // Schedule primitives. Each records one step and applies it.
    // ------------------------------------------------------------------

    pub fn compute_inline(&mut self, stage_id: usize) -> Result<()> {
        self.record(TransformStep::ComputeInline { stage_id })
    }

    pub fn compute_root(&mut self, stage_id: usize) -> Result<()> {
        self.record(TransformStep::ComputeRoot { stage_id })
    }

    pub fn compute_at(&mut self, stage_id: usize, target_stage_id: usize, target_iter_id: usize) -> Result<()> {
        self.record(TransformStep::ComputeAt { stage_id, target_stage_id, target_iter_id })
    }

    /// Split one iterator into `lengths.len() + 1` parts; `None` lengths are
    /// tile-size holes to be filled later. Returns the new iterators.
    pub fn split(&mut self, stage_id: usize, iter_id: usize, lengths: &[Option<i64>]) -> Result<Vec<Iter>> {
        self.check_iter(stage_id, iter_id)?;
        let extent = self.stages[stage_id].iters[iter_id].extent;
        let step = TransformStep::Split {
            stage_id,
            iter_id,
            extent,
            lengths: lengths.to_vec(),
            inner_to_outer: true,
        };
        self.record(step)?;
        let stage = &self.stages[stage_id];
        Ok(stage.iters[iter_id..=iter_id + lengths.len()].to_vec())
    }

    /// Fuse contiguous iterators into one. Returns the fused iterator.
    pub fn fuse(&mut self, stage_id: usize, iter_ids: &[usize]) -> Result<Iter> {
        let first = *iter_ids.first().ok_or_else(|| FuseEmptySnafu { stage_id }.build())?;
        self.record(TransformStep::Fuse { stage_id, fused_ids: iter_ids.to_vec() })?;
        Ok(self.stages[stage_id].iters[first].clone())
    }

    pub fn reorder(&mut self, stage_id: usize, after_ids: &[usize]) -> Result<()> {
        self.record(TransformStep::Reorder { stage_id, after_ids: after_ids.to_vec() })
    }

    /// Insert a cache-write stage for `stage_id`. The new stage takes over the
    /// full computation at the original position (which it returns); the
    /// original stage degenerates to a copy-out over its spatial axes at the
    /// next id.
    pub fn cache_write(&mut self, stage_id: usize, scope_name: &str) -> Result<usize> {
        self.record(TransformStep::CacheWrite { stage_id, scope_name: scope_name.to_string() })?;
        Ok(stage_id)
    }

    /// Factor the reduction iterator `iter_id` out into a new stage, placing
    /// the factored axis at `factor_axis` of the new stage. Returns the new
    /// stage's id.
    pub fn rfactor(&mut self, stage_id: usize, iter_id: usize, factor_axis: usize) -> Result<usize> {
        self.record(TransformStep::Rfactor { stage_id, iter_id, factor_axis })?;
        Ok(stage_id)
    }

    pub fn parallel(&mut self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.record(TransformStep::Parallel { stage_id, iter_id })
    }

    pub fn vectorize(&mut self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.record(TransformStep::Vectorize { stage_id, iter_id })
    }

    pub fn unroll(&mut self, stage_id: usize, iter_id: usize) -> Result<()> {
        self.record(TransformStep::Unroll { stage_id, iter_id })
    }

    pub fn pragma(&mut self, stage_id: usize, iter_id: usize, pragma_type: &str) -> Result<()> {
        self.record(TransformStep::Pragma { stage_id, iter_id, pragma_type: pragma_type.to_string() })
    }

    fn record(&mut self, step: TransformStep) -> Result<()> {
        self.apply_step(&step)?;
        self.transform_steps.push(step);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step application.
    // ------------------------------------------------------------------

    /// Apply one step to the stage views, the attach map and the DAG, without
    /// recording it. Replay drives this directly.
    pub fn apply_step(&mut self, step: &TransformStep) -> Result<()> {
        match step {
            TransformStep::Split { stage_id, iter_id, extent, lengths, .. } => {
                self.apply_split(*stage_id, *iter_id, *extent, lengths)
            }
            TransformStep::Fuse { stage_id, fused_ids } => self.apply_fuse(*stage_id, fused_ids),
            TransformStep::Reorder { stage_id, after_ids } => self.apply_reorder(*stage_id, after_ids),
            TransformStep::ComputeAt { stage_id, target_stage_id, target_iter_id } => {
                self.apply_compute_at(*stage_id, *target_stage_id, *target_iter_id)
            }
            TransformStep::ComputeInline { stage_id } => self.apply_compute_inline(*stage_id),
            TransformStep::ComputeRoot { stage_id } => self.apply_compute_root(*stage_id),
            TransformStep::CacheWrite { stage_id, scope_name } => self.apply_cache_write(*stage_id, scope_name),
            TransformStep::Rfactor { stage_id, iter_id, factor_axis } => {
                self.apply_rfactor(*stage_id, *iter_id, *factor_axis)
            }
            TransformStep::Parallel { stage_id, iter_id }
            | TransformStep::Vectorize { stage_id, iter_id }
            | TransformStep::Unroll { stage_id, iter_id } => {
                self.check_iter(*stage_id, *iter_id)?;
                let annotation = step.annotation().unwrap_or_default();
                self.stage_mut(*stage_id).iters[*iter_id].annotation = annotation;
                Ok(())
            }
            TransformStep::Pragma { stage_id, iter_id, .. } => self.check_iter(*stage_id, *iter_id),
        }
    }

    fn apply_split(
        &mut self,
        stage_id: usize,
        iter_id: usize,
        recorded_extent: Option<i64>,
        lengths: &[Option<i64>],
    ) -> Result<()> {
        self.check_iter(stage_id, iter_id)?;
        ensure!(!lengths.is_empty(), SplitEmptySnafu { stage_id });

        let old_len = self.stages[stage_id].iters.len();
        let old = self.stages[stage_id].iters[iter_id].clone();
        let extent = old.extent.or(recorded_extent);

        let inner_prod: Option<i64> = lengths.iter().try_fold(1i64, |acc, l| l.map(|v| acc * v));
        let outer_extent = match (extent, inner_prod) {
            (Some(e), Some(p)) if p > 0 => Some((e + p - 1) / p),
            _ => None,
        };

        let mut parts = Vec::with_capacity(lengths.len() + 1);
        parts.push(Iter::new(format!("{}.0", old.name), outer_extent, old.kind));
        for (k, len) in lengths.iter().enumerate() {
            parts.push(Iter::new(format!("{}.{}", old.name, k + 1), *len, old.kind));
        }

        let stage = self.stage_mut(stage_id);
        stage.iters.remove(iter_id);
        for (k, part) in parts.into_iter().enumerate() {
            stage.iters.insert(iter_id + k, part);
        }

        // Attachments at and after the split point shift inward by the number
        // of new parts.
        let shift = lengths.len();
        let from: Vec<IterKey> = (iter_id..old_len).map(|i| (stage_id, i)).collect();
        let to: Vec<IterKey> = (iter_id..old_len).map(|i| (stage_id, i + shift)).collect();
        self.attach_map.update_iters(&from, &to);

        if lengths.iter().any(Option::is_none) {
            self.concrete = false;
        }
        Ok(())
    }

    fn apply_fuse(&mut self, stage_id: usize, fused_ids: &[usize]) -> Result<()> {
        self.check_stage(stage_id)?;
        ensure!(!fused_ids.is_empty(), FuseEmptySnafu { stage_id });
        let contiguous = fused_ids.windows(2).all(|w| w[1] == w[0] + 1);
        ensure!(contiguous, FuseNonContiguousSnafu { stage_id, iter_ids: fused_ids.to_vec() });
        let (begin, end) = (fused_ids[0], *fused_ids.last().unwrap());
        self.check_iter(stage_id, end)?;

        let old_len = self.stages[stage_id].iters.len();
        let parts: Vec<Iter> = self.stages[stage_id].iters[begin..=end].to_vec();
        let name = parts.iter().map(|it| it.name.as_str()).collect::<Vec<_>>().join("@");
        let extent = parts.iter().try_fold(1i64, |acc, it| it.extent.map(|e| acc * e));
        let kind = if parts.iter().any(|it| it.kind == IterKind::Reduction) {
            IterKind::Reduction
        } else {
            IterKind::Spatial
        };

        let stage = self.stage_mut(stage_id);
        stage.iters.drain(begin..=end);
        stage.iters.insert(begin, Iter::new(name, extent, kind));

        let mut from: Vec<IterKey> = Vec::new();
        let mut to: Vec<IterKey> = Vec::new();
        for i in (begin + 1)..old_len {
            from.push((stage_id, i));
            to.push(if i <= end { (stage_id, begin) } else { (stage_id, i - (end - begin)) });
        }
        self.attach_map.update_iters(&from, &to);
        Ok(())
    }

    fn apply_reorder(&mut self, stage_id: usize, after_ids: &[usize]) -> Result<()> {
        self.check_stage(stage_id)?;
        let count = self.stages[stage_id].iters.len();
        let mut seen = vec![false; count];
        let valid = after_ids.len() == count
            && after_ids.iter().all(|&i| i < count && !std::mem::replace(&mut seen[i], true));
        ensure!(valid, ReorderMismatchSnafu { stage_id, expected: count, found: after_ids.len() });

        let old: Vec<Iter> = self.stages[stage_id].iters.to_vec();
        let stage = self.stage_mut(stage_id);
        stage.iters = after_ids.iter().map(|&i| old[i].clone()).collect();
        Ok(())
    }

    fn apply_compute_at(&mut self, stage_id: usize, target_stage_id: usize, target_iter_id: usize) -> Result<()> {
        self.check_iter(target_stage_id, target_iter_id)?;
        self.check_stage(stage_id)?;
        ensure!(stage_id != target_stage_id, SelfAttachmentSnafu { target_stage_id });

        let stage = self.stage_mut(stage_id);
        stage.compute_at = ComputeAtKind::Iter;
        // Accurate lengths are unknown until bounds are inferred again.
        for it in stage.iters.iter_mut() {
            it.extent = None;
        }
        self.attach_map.set_compute_at_iter(stage_id, target_stage_id, target_iter_id);
        Ok(())
    }

    fn apply_compute_inline(&mut self, stage_id: usize) -> Result<()> {
        self.check_stage(stage_id)?;
        ensure!(!self.stages[stage_id].has_reduce_iter(), InlineReductionSnafu { stage_id });
        self.stage_mut(stage_id).compute_at = ComputeAtKind::Inlined;
        self.attach_map.delete_stage(stage_id);
        Ok(())
    }

    fn apply_compute_root(&mut self, stage_id: usize) -> Result<()> {
        self.check_stage(stage_id)?;
        let stage = self.stage_mut(stage_id);
        stage.compute_at = ComputeAtKind::Root;
        for it in stage.iters.iter_mut() {
            it.extent = None;
        }
        self.attach_map.delete_stage(stage_id);
        Ok(())
    }

    fn apply_cache_write(&mut self, stage_id: usize, scope_name: &str) -> Result<()> {
        self.check_stage(stage_id)?;
        let op = self.stages[stage_id].op;
        ensure!(
            self.stages[stage_id].op_type == OpKind::Compute,
            PrimitiveOnPlaceholderSnafu { primitive: "cache_write", stage_id }
        );

        let (new_dag, cache_op) = self.dag.with_cache_write(op, scope_name)?;
        self.dag = Arc::new(new_dag);

        // Both the cache stage and the demoted original are rebuilt from the
        // updated DAG; the original keeps only its spatial axes.
        let original = Stage::from_op(op, &self.dag);
        let cache = Stage::from_op(cache_op, &self.dag);
        self.stages[stage_id] = Arc::new(original);
        self.stages.insert(stage_id, Arc::new(cache));
        self.attach_map.shift_stage_ids(stage_id);
        Ok(())
    }

    fn apply_rfactor(&mut self, stage_id: usize, iter_id: usize, factor_axis: usize) -> Result<()> {
        self.check_iter(stage_id, iter_id)?;
        let stage = self.stages[stage_id].clone();
        ensure!(
            stage.op_type == OpKind::Compute,
            PrimitiveOnPlaceholderSnafu { primitive: "rfactor", stage_id }
        );
        ensure!(stage.iters[iter_id].kind == IterKind::Reduction, RfactorOnSpatialSnafu { stage_id });
        let num_spatial = stage.iters.iter().filter(|it| it.kind == IterKind::Spatial).count();
        ensure!(factor_axis <= num_spatial, RfactorFactorAxisSnafu { stage_id, factor_axis });

        let factor_iter = stage.iters[iter_id].clone();
        let remaining: Vec<Iter> = stage
            .iters
            .iter()
            .enumerate()
            .filter(|(i, it)| *i != iter_id && it.kind == IterKind::Reduction)
            .map(|(_, it)| it.clone())
            .collect();

        let (new_dag, rf_op) = self.dag.with_rfactor(stage.op, &factor_iter, factor_axis, &remaining)?;
        self.dag = Arc::new(new_dag);

        let original = Stage::from_op(stage.op, &self.dag);
        let rf = Stage::from_op(rf_op, &self.dag);
        self.stages[stage_id] = Arc::new(original);
        self.stages.insert(stage_id, Arc::new(rf));
        self.attach_map.shift_stage_ids(stage_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Canonical form.
    // ------------------------------------------------------------------

    /// Deterministic textual form of the state, used as the dedup key for
    /// the measured-state set.
    pub fn to_str(&self) -> String {
        self.to_string()
    }
}

/// Collect the original (pre-split, pre-fusion) iterator names a derived
/// iterator name was built from.
///
/// Split parts carry numeric `.k` suffixes and fusion joins names with `@`,
/// so `i.0@j.1` maps back to `{i, j}`.
pub fn extract_original_iterators(name: &str, rets: &mut std::collections::BTreeSet<String>) {
    let bytes = name.as_bytes();
    let mut last_pos = 0;
    for i in 0..bytes.len() {
        let c = bytes[i] as char;
        if c == '@' || c == '.' {
            if i > 0 {
                let prev = bytes[i - 1] as char;
                if !prev.is_ascii_digit() && prev != '@' && prev != '.' {
                    rets.insert(name[last_pos..i].to_string());
                }
            }
            last_pos = i + 1;
        }
    }
    if let Some(&last) = bytes.last() {
        let c = last as char;
        if !c.is_ascii_digit() && c != '@' && c != '.' {
            rets.insert(name[last_pos..].to_string());
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, stage) in self.stages.iter().enumerate() {
            let kind = match stage.op_type {
                OpKind::Placeholder => "placeholder",
                OpKind::Compute => "compute",
            };
            write!(f, "S{id} {} {kind} {} [", self.dag.op_info(stage.op).name, stage.compute_at)?;
            for (i, it) in stage.iters.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                let kind = match it.kind {
                    IterKind::Spatial => "sp",
                    IterKind::Reduction => "rd",
                };
                match it.extent {
                    Some(e) => write!(f, "{}:{kind}:{e}:{}", it.name, it.annotation)?,
                    None => write!(f, "{}:{kind}:?:{}", it.name, it.annotation)?,
                }
            }
            writeln!(f, "]")?;
        }
        for (stage, target, iter) in self.attach_map.sorted_entries() {
            writeln!(f, "A S{stage} -> S{target}.{iter}")?;
        }
        for step in &self.transform_steps {
            writeln!(f, "T {step}")?;
        }
        Ok(())
    }
}
