//! Compute DAG, static access analysis and bound inference.
//!
//! The DAG is the scheduling front end's output: one entry per tensor-producing
//! operation, in topological order, together with the static analyses the
//! search rules consult (simple access, strict inlineability, multi-level
//! tiling need, consumer/producer relations, elementwise matching).
//!
//! Stage-inserting primitives (`cache_write`, `rfactor`) derive an updated DAG
//! rather than mutating the original, so every [`State`] can carry the DAG it
//! actually schedules.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use snafu::ensure;

use crate::error::*;
use crate::state::{ComputeAtKind, Iter, IterKind, State, extract_original_iterators};
use crate::step::TransformStep;

/// Stable handle of one operation. Handles survive DAG derivation: a derived
/// DAG appends new operations and never renumbers existing ones.
pub type OpId = usize;

/// Operation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Placeholder,
    Compute,
}

/// One loop axis of an operation. The extent is `None` when it cannot be
/// derived statically (e.g. the factored axis of an rfactor whose tile size
/// is still a hole).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Axis {
    pub name: String,
    pub extent: Option<i64>,
}

impl Axis {
    pub fn new(name: impl Into<String>, extent: i64) -> Self {
        Self { name: name.into(), extent: Some(extent) }
    }
}

/// Scheduling hints attached to an operation by the front end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpAttrs {
    pub always_compute_inline: bool,
    pub no_cache_write: bool,
    pub always_unroll: BTreeSet<String>,
    pub always_unroll_inner: BTreeSet<String>,
    pub no_split_at_inner: BTreeSet<String>,
}

/// One operation of the DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpInfo {
    pub name: String,
    pub kind: OpKind,
    pub spatial: Vec<Axis>,
    pub reduction: Vec<Axis>,
    pub attrs: OpAttrs,
}

/// CPU facts the search rules need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareParams {
    pub num_cores: usize,
    pub vector_unit_bytes: usize,
    pub cache_line_bytes: usize,
}

impl Default for HardwareParams {
    fn default() -> Self {
        let num_cores = std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4);
        Self { num_cores, vector_unit_bytes: 64, cache_line_bytes: 64 }
    }
}

impl HardwareParams {
    pub fn new(num_cores: usize, vector_unit_bytes: usize, cache_line_bytes: usize) -> Self {
        Self { num_cores, vector_unit_bytes, cache_line_bytes }
    }
}

/// Static read/write analysis tables, indexed by [`OpId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AccessAnalyzer {
    read_from: Vec<Vec<OpId>>,
    read_by: Vec<Vec<OpId>>,
    is_simple_access: Vec<bool>,
    is_strict_inlineable: Vec<bool>,
    needs_multi_level_tiling: Vec<bool>,
    is_output: Vec<bool>,
    elementwise_matches: BTreeSet<(OpId, OpId)>,
    num_common_outer: HashMap<(OpId, OpId), usize>,
}

/// The compute DAG plus its access analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeDag {
    ops: Vec<OpInfo>,
    topo_order: Vec<OpId>,
    analyzer: AccessAnalyzer,
}

impl ComputeDag {
    pub fn builder() -> DagBuilder {
        DagBuilder::default()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn topo_order(&self) -> &[OpId] {
        &self.topo_order
    }

    pub fn op_info(&self, op: OpId) -> &OpInfo {
        &self.ops[op]
    }

    /// The initial state: every operation at root, no transform steps.
    pub fn init_state(self: &Arc<Self>) -> State {
        State::new(self.clone())
    }

    // ------------------------------------------------------------------
    // Access analysis queries.
    // ------------------------------------------------------------------

    pub fn is_simple_access(&self, op: OpId) -> bool {
        self.analyzer.is_simple_access[op]
    }

    pub fn is_strict_inlineable(&self, op: OpId) -> bool {
        self.analyzer.is_strict_inlineable[op]
    }

    pub fn needs_multi_level_tiling(&self, op: OpId) -> bool {
        self.analyzer.needs_multi_level_tiling[op]
    }

    pub fn is_output(&self, op: OpId) -> bool {
        self.analyzer.is_output[op]
    }

    /// Direct producers, without inline propagation.
    pub fn get_direct_producers(&self, op: OpId) -> Vec<OpId> {
        self.analyzer.read_from[op].clone()
    }

    /// Consumers of `op`, looking through stages the state has inlined.
    pub fn get_consumers(&self, state: &State, op: OpId) -> Vec<OpId> {
        let mut out = BTreeSet::new();
        self.collect_consumers(state, op, &mut out);
        out.into_iter().collect()
    }

    fn collect_consumers(&self, state: &State, op: OpId, out: &mut BTreeSet<OpId>) {
        for &c in &self.analyzer.read_by[op] {
            let inlined = state
                .stage_of_op(c)
                .is_some_and(|sid| state.stages[sid].compute_at == ComputeAtKind::Inlined);
            if inlined {
                self.collect_consumers(state, c, out);
            } else {
                out.insert(c);
            }
        }
    }

    /// Producers of `op`, looking through stages the state has inlined.
    pub fn get_producers(&self, state: &State, op: OpId) -> Vec<OpId> {
        let mut out = BTreeSet::new();
        self.collect_producers(state, op, &mut out);
        out.into_iter().collect()
    }

    fn collect_producers(&self, state: &State, op: OpId, out: &mut BTreeSet<OpId>) {
        for &p in &self.analyzer.read_from[op] {
            let inlined = state
                .stage_of_op(p)
                .is_some_and(|sid| state.stages[sid].compute_at == ComputeAtKind::Inlined);
            if inlined {
                self.collect_producers(state, p, out);
            } else {
                out.insert(p);
            }
        }
    }

    /// Whether `op` and `target` access their tensors elementwise-compatibly,
    /// so that `op` can follow `target`'s tiling.
    pub fn element_wise_match(&self, op: OpId, target: OpId) -> bool {
        self.analyzer.elementwise_matches.contains(&(op, target))
    }

    /// Number of common outer iterators between two related operations.
    pub fn num_common_outer_iterators(&self, op: OpId, target: OpId) -> usize {
        self.analyzer.num_common_outer.get(&(op, target)).copied().unwrap_or(0)
    }

    /// Whether factoring the reduction of `stage_id` out into its own stage is
    /// worthwhile: reductions that dwarf the available spatial parallelism.
    pub fn needs_rfactor(&self, state: &State, stage_id: usize, hw: &HardwareParams) -> bool {
        let stage = &state.stages[stage_id];
        if stage.op_type != OpKind::Compute {
            return false;
        }
        let mut cum_space = 1i64;
        let mut cum_reduce = 1i64;
        for it in &stage.iters {
            let Some(extent) = it.extent else { return false };
            match it.kind {
                IterKind::Spatial => cum_space *= extent,
                IterKind::Reduction => cum_reduce *= extent,
            }
        }
        let num_cores = hw.num_cores as i64;
        if self.needs_multi_level_tiling(stage.op) {
            // Enough parallelism on the space iterators already.
            !(cum_space > cum_reduce || cum_space > num_cores * 16)
        } else if cum_reduce > 1 {
            cum_reduce > num_cores
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // DAG derivation.
    // ------------------------------------------------------------------

    /// Derive the DAG after a cache-write on `op`: a new operation takes over
    /// the full computation and `op` degenerates to a copy-out over its
    /// spatial axes. Returns the derived DAG and the new operation's handle.
    pub fn with_cache_write(&self, op: OpId, scope_name: &str) -> Result<(ComputeDag, OpId)> {
        ensure!(op < self.ops.len(), UnknownOperationSnafu { op });
        let mut dag = self.clone();
        let info = &dag.ops[op];

        let cache_op = dag.ops.len();
        let cache_info = OpInfo {
            name: format!("{}.{}", info.name, scope_name),
            kind: OpKind::Compute,
            spatial: info.spatial.clone(),
            reduction: info.reduction.clone(),
            attrs: info.attrs.clone(),
        };

        let old_producers = dag.analyzer.read_from[op].clone();
        dag.ops[op].reduction.clear();
        dag.ops.push(cache_info);

        let a = &mut dag.analyzer;
        a.read_from.push(old_producers.clone());
        a.read_by.push(vec![op]);
        a.read_from[op] = vec![cache_op];
        for p in old_producers {
            for c in a.read_by[p].iter_mut() {
                if *c == op {
                    *c = cache_op;
                }
            }
        }
        a.is_simple_access.push(a.is_simple_access[op]);
        a.is_strict_inlineable.push(false);
        a.needs_multi_level_tiling.push(a.needs_multi_level_tiling[op]);
        a.is_output.push(false);
        a.is_simple_access[op] = true;
        a.is_strict_inlineable[op] = false;
        a.needs_multi_level_tiling[op] = false;
        a.elementwise_matches.insert((cache_op, op));
        let n = dag.ops[op].spatial.len();
        a.num_common_outer.insert((cache_op, op), n);

        let pos = dag.topo_order.iter().position(|&o| o == op).ok_or_else(|| UnknownOperationSnafu { op }.build())?;
        dag.topo_order.insert(pos, cache_op);
        Ok((dag, cache_op))
    }

    /// Derive the DAG after an rfactor on `op`: a new operation computes the
    /// partial reductions with `factor_iter` as a spatial axis at
    /// `factor_axis`; `op` keeps a single reduction over the factored extent.
    pub fn with_rfactor(
        &self,
        op: OpId,
        factor_iter: &Iter,
        factor_axis: usize,
        remaining_reduce: &[Iter],
    ) -> Result<(ComputeDag, OpId)> {
        ensure!(op < self.ops.len(), UnknownOperationSnafu { op });
        let mut dag = self.clone();
        let info = &dag.ops[op];

        let mut spatial = info.spatial.clone();
        spatial.insert(factor_axis, Axis { name: factor_iter.name.clone(), extent: factor_iter.extent });
        let reduction = remaining_reduce
            .iter()
            .map(|it| Axis { name: it.name.clone(), extent: it.extent })
            .collect();

        let rf_op = dag.ops.len();
        let rf_info = OpInfo {
            name: format!("{}.rf", info.name),
            kind: OpKind::Compute,
            spatial,
            reduction,
            attrs: OpAttrs::default(),
        };

        let old_producers = dag.analyzer.read_from[op].clone();
        dag.ops[op].reduction =
            vec![Axis { name: format!("{}.v", factor_iter.name), extent: factor_iter.extent }];
        dag.ops.push(rf_info);

        let a = &mut dag.analyzer;
        a.read_from.push(old_producers.clone());
        a.read_by.push(vec![op]);
        a.read_from[op] = vec![rf_op];
        for p in old_producers {
            for c in a.read_by[p].iter_mut() {
                if *c == op {
                    *c = rf_op;
                }
            }
        }
        a.is_simple_access.push(false);
        a.is_strict_inlineable.push(false);
        a.needs_multi_level_tiling.push(false);
        a.is_output.push(false);
        a.num_common_outer.insert((rf_op, op), dag.ops[op].spatial.len());

        let pos = dag.topo_order.iter().position(|&o| o == op).ok_or_else(|| UnknownOperationSnafu { op }.build())?;
        dag.topo_order.insert(pos, rf_op);
        Ok((dag, rf_op))
    }

    // ------------------------------------------------------------------
    // Replay and bound inference.
    // ------------------------------------------------------------------

    /// Re-apply a transform history to the initial state of this DAG.
    pub fn replay(self: &Arc<Self>, steps: &[TransformStep]) -> Result<State> {
        let mut state = State::new(self.clone());
        for step in steps {
            state.apply_step(step)?;
            state.transform_steps.push(step.clone());
        }
        Ok(state)
    }

    /// Apply a transform history, yielding the scheduled state.
    pub fn apply_steps(self: &Arc<Self>, steps: &[TransformStep]) -> Result<State> {
        self.replay(steps)
    }

    /// Replay a history and return the DAG it ends up scheduling (stage
    /// inserting steps derive new DAGs along the way).
    pub fn replay_and_get_dag(self: &Arc<Self>, steps: &[TransformStep]) -> Result<Arc<ComputeDag>> {
        Ok(self.replay(steps)?.dag)
    }

    /// Recompute the bound information of a state.
    ///
    /// Replays the state's history while keeping the extents that attachment
    /// primitives discard, then narrows the extents of stages attached to an
    /// elementwise-matched consumer down to the consumer's inner tile.
    pub fn infer_bound(self: &Arc<Self>, state: &State) -> Result<State> {
        let mut out = State::new(self.clone());
        for step in &state.transform_steps {
            match step {
                TransformStep::ComputeAt { stage_id, .. } | TransformStep::ComputeRoot { stage_id } => {
                    let saved: Vec<Option<i64>> =
                        out.stages[*stage_id].iters.iter().map(|it| it.extent).collect();
                    out.apply_step(step)?;
                    let stage = Arc::make_mut(&mut out.stages[*stage_id]);
                    for (it, extent) in stage.iters.iter_mut().zip(saved) {
                        it.extent = extent;
                    }
                }
                _ => out.apply_step(step)?,
            }
            out.transform_steps.push(step.clone());
        }
        out.concrete = state.concrete;

        for stage_id in 0..out.stages.len() {
            narrow_attached_stage(&mut out, stage_id);
        }
        Ok(out)
    }

    /// Batch variant of [`ComputeDag::infer_bound`].
    pub fn infer_bound_states(self: &Arc<Self>, states: &[State]) -> Result<Vec<State>> {
        states.iter().map(|s| self.infer_bound(s)).collect()
    }
}

/// Narrow the extents of an attached stage to what its consumer's inner tile
/// requires. Only derivable for elementwise-matched consumers; other attached
/// stages keep their full-extent-derived bounds.
fn narrow_attached_stage(state: &mut State, stage_id: usize) {
    let stage = state.stages[stage_id].clone();
    if stage.compute_at != ComputeAtKind::Iter {
        return;
    }
    let Some((target_id, attach_pos)) = state.attach_map.attach_iter_of(stage_id) else { return };
    let target = state.stages[target_id].clone();
    let dag = state.dag.clone();
    if !dag.element_wise_match(stage.op, target.op) {
        return;
    }

    let op_info = dag.op_info(stage.op);
    let target_info = dag.op_info(target.op);
    if op_info.spatial.len() != target_info.spatial.len() {
        return;
    }

    // Per spatial dimension, the required extent is the product of the
    // consumer's parts inner to the attach point; dimensions fully covered by
    // the consumer loop collapse to one.
    for (dim, axis) in op_info.spatial.iter().enumerate() {
        let target_axis = &target_info.spatial[dim].name;
        let mut needed = Some(1i64);
        for it in target.iters.iter().skip(attach_pos + 1) {
            if it.kind != IterKind::Spatial {
                continue;
            }
            let mut names = BTreeSet::new();
            extract_original_iterators(&it.name, &mut names);
            if names.len() == 1 && names.contains(target_axis) {
                needed = match (needed, it.extent) {
                    (Some(acc), Some(e)) => Some(acc * e),
                    _ => None,
                };
            }
        }
        let Some(needed) = needed else { continue };

        // Rescale the outermost part derived from this axis; inner parts keep
        // their tile lengths.
        let mut inner_prod = Some(1i64);
        let mut outer_idx = None;
        for (i, it) in stage.iters.iter().enumerate() {
            let mut names = BTreeSet::new();
            extract_original_iterators(&it.name, &mut names);
            if !(names.len() == 1 && names.contains(&axis.name)) {
                continue;
            }
            if is_outermost_part(&it.name, &axis.name) {
                outer_idx = Some(i);
            } else {
                inner_prod = match (inner_prod, it.extent) {
                    (Some(acc), Some(e)) => Some(acc * e),
                    _ => None,
                };
            }
        }
        if let (Some(outer_idx), Some(inner_prod)) = (outer_idx, inner_prod)
            && inner_prod > 0
        {
            let stage = Arc::make_mut(&mut state.stages[stage_id]);
            stage.iters[outer_idx].extent = Some((needed + inner_prod - 1) / inner_prod);
        }
    }
}

/// Whether a derived iterator name is the outermost part of `axis`: the axis
/// name followed only by `.0` segments.
fn is_outermost_part(name: &str, axis: &str) -> bool {
    let Some(rest) = name.strip_prefix(axis) else { return false };
    rest.is_empty() || rest.split('.').skip(1).all(|seg| seg == "0") && rest.starts_with('.')
}

// ----------------------------------------------------------------------
// Builder.
// ----------------------------------------------------------------------

/// Builds a [`ComputeDag`] from operations declared in topological order.
///
/// Analysis defaults are derived from the declared structure (reduction-free
/// simple computes are strictly inlineable, operations nobody reads are
/// outputs, directly-read simple consumers of equal shape elementwise-match)
/// and every one of them can be overridden explicitly.
#[derive(Debug, Default)]
pub struct DagBuilder {
    ops: Vec<OpInfo>,
    reads: Vec<Vec<OpId>>,
    needs_mlt: Vec<Option<bool>>,
    strict_inlineable: Vec<Option<bool>>,
    simple_access: Vec<Option<bool>>,
    extra_elementwise: BTreeSet<(OpId, OpId)>,
}

impl DagBuilder {
    pub fn placeholder(&mut self, name: impl Into<String>, shape: &[i64]) -> OpId {
        let spatial = shape
            .iter()
            .enumerate()
            .map(|(i, &extent)| Axis::new(format!("ax{i}"), extent))
            .collect();
        self.push(OpInfo {
            name: name.into(),
            kind: OpKind::Placeholder,
            spatial,
            reduction: Vec::new(),
            attrs: OpAttrs::default(),
        }, Vec::new())
    }

    pub fn compute(
        &mut self,
        name: impl Into<String>,
        spatial: &[(&str, i64)],
        reduction: &[(&str, i64)],
        reads: &[OpId],
    ) -> OpId {
        let spatial = spatial.iter().map(|(n, e)| Axis::new(*n, *e)).collect();
        let reduction = reduction.iter().map(|(n, e)| Axis::new(*n, *e)).collect();
        self.push(
            OpInfo { name: name.into(), kind: OpKind::Compute, spatial, reduction, attrs: OpAttrs::default() },
            reads.to_vec(),
        )
    }

    fn push(&mut self, info: OpInfo, reads: Vec<OpId>) -> OpId {
        let op = self.ops.len();
        self.ops.push(info);
        self.reads.push(reads);
        self.needs_mlt.push(None);
        self.strict_inlineable.push(None);
        self.simple_access.push(None);
        op
    }

    pub fn needs_multi_level_tiling(&mut self, op: OpId) -> &mut Self {
        self.needs_mlt[op] = Some(true);
        self
    }

    pub fn strict_inlineable(&mut self, op: OpId, value: bool) -> &mut Self {
        self.strict_inlineable[op] = Some(value);
        self
    }

    pub fn simple_access(&mut self, op: OpId, value: bool) -> &mut Self {
        self.simple_access[op] = Some(value);
        self
    }

    pub fn elementwise_match(&mut self, op: OpId, target: OpId) -> &mut Self {
        self.extra_elementwise.insert((op, target));
        self
    }

    pub fn always_compute_inline(&mut self, op: OpId) -> &mut Self {
        self.ops[op].attrs.always_compute_inline = true;
        self
    }

    pub fn no_cache_write(&mut self, op: OpId) -> &mut Self {
        self.ops[op].attrs.no_cache_write = true;
        self
    }

    pub fn always_unroll(&mut self, op: OpId, iters: &[&str]) -> &mut Self {
        self.ops[op].attrs.always_unroll.extend(iters.iter().map(|s| s.to_string()));
        self
    }

    pub fn always_unroll_inner(&mut self, op: OpId, iters: &[&str]) -> &mut Self {
        self.ops[op].attrs.always_unroll_inner.extend(iters.iter().map(|s| s.to_string()));
        self
    }

    pub fn no_split_at_inner(&mut self, op: OpId, iters: &[&str]) -> &mut Self {
        self.ops[op].attrs.no_split_at_inner.extend(iters.iter().map(|s| s.to_string()));
        self
    }

    pub fn build(self) -> Arc<ComputeDag> {
        let n = self.ops.len();
        let mut read_by: Vec<Vec<OpId>> = vec![Vec::new(); n];
        for (op, reads) in self.reads.iter().enumerate() {
            for &p in reads {
                read_by[p].push(op);
            }
        }

        let is_output: Vec<bool> = read_by.iter().map(Vec::is_empty).collect();
        let is_simple_access: Vec<bool> = self
            .ops
            .iter()
            .enumerate()
            .map(|(op, info)| {
                self.simple_access[op]
                    .unwrap_or(info.kind == OpKind::Placeholder || info.reduction.is_empty())
            })
            .collect();
        let is_strict_inlineable: Vec<bool> = self
            .ops
            .iter()
            .enumerate()
            .map(|(op, info)| {
                self.strict_inlineable[op].unwrap_or(
                    info.kind == OpKind::Compute && info.reduction.is_empty() && is_simple_access[op],
                )
            })
            .collect();
        let needs_multi_level_tiling: Vec<bool> =
            (0..n).map(|op| self.needs_mlt[op].unwrap_or(false)).collect();

        let mut elementwise_matches = self.extra_elementwise;
        let mut num_common_outer = HashMap::new();
        for (op, info) in self.ops.iter().enumerate() {
            for &c in &read_by[op] {
                let consumer = &self.ops[c];
                let same_shape = consumer.spatial.len() == info.spatial.len()
                    && consumer
                        .spatial
                        .iter()
                        .zip(&info.spatial)
                        .all(|(a, b)| a.extent == b.extent);
                if consumer.kind == OpKind::Compute && is_simple_access[c] && same_shape {
                    elementwise_matches.insert((op, c));
                }
            }
        }
        for &(a, b) in &elementwise_matches {
            num_common_outer.insert((a, b), self.ops[a].spatial.len());
        }

        Arc::new(ComputeDag {
            topo_order: (0..n).collect(),
            analyzer: AccessAnalyzer {
                read_from: self.reads,
                read_by,
                is_simple_access,
                is_strict_inlineable,
                needs_multi_level_tiling,
                is_output,
                elementwise_matches,
                num_common_outer,
            },
            ops: self.ops,
        })
    }
}
