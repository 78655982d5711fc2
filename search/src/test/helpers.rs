//! Shared fixtures: small DAGs, tasks and measurers.

use std::sync::Arc;

use loft_ir::{ComputeDag, HardwareParams, OpId, State};

use crate::cost_model::RandomModel;
use crate::measure::{MeasureInput, MeasureResult, Measurer};
use crate::params::SearchParams;
use crate::policy::SketchPolicy;
use crate::task::SearchTask;

pub const TEST_CORES: usize = 8;

pub fn hw() -> HardwareParams {
    HardwareParams::new(TEST_CORES, 64, 64)
}

/// `A(placeholder) -> B(x = A) -> C(y = B)`, both compute ops inlineable.
pub fn elementwise_chain() -> Arc<ComputeDag> {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[64]);
    let x = b.compute("B", &[("i", 64)], &[], &[a]);
    let _y = b.compute("C", &[("i", 64)], &[], &[x]);
    b.build()
}

/// `A, B(placeholders) -> C(matmul)`, C needs multi-level tiling.
pub fn matmul() -> (Arc<ComputeDag>, OpId) {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[512, 512]);
    let bb = b.placeholder("B", &[512, 512]);
    let c = b.compute("C", &[("i", 512), ("j", 512)], &[("k", 512)], &[a, bb]);
    b.needs_multi_level_tiling(c);
    (b.build(), c)
}

/// Matmul followed by an elementwise-matched bias + relu stage.
pub fn matmul_relu() -> (Arc<ComputeDag>, OpId, OpId) {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[512, 512]);
    let bb = b.placeholder("B", &[512, 512]);
    let bias = b.placeholder("bias", &[512]);
    let c = b.compute("C", &[("i", 512), ("j", 512)], &[("k", 512)], &[a, bb]);
    let d = b.compute("D", &[("i", 512), ("j", 512)], &[], &[c, bias]);
    b.needs_multi_level_tiling(c);
    (b.build(), c, d)
}

/// A large sum reduction the analyzer marks as needing rfactor.
pub fn big_reduction() -> (Arc<ComputeDag>, OpId) {
    let mut b = ComputeDag::builder();
    let a = b.placeholder("A", &[4096]);
    let c = b.compute("C", &[], &[("k", 4096)], &[a]);
    (b.build(), c)
}

pub fn task_of(dag: &Arc<ComputeDag>, key: &str) -> SearchTask {
    SearchTask::new(dag.clone(), key, hw())
}

pub fn small_params() -> SearchParams {
    SearchParams::builder().population(16).build()
}

pub fn random_policy(dag: &Arc<ComputeDag>, key: &str, seed: u64) -> SketchPolicy {
    SketchPolicy::new(task_of(dag, key), Box::new(RandomModel::new(seed)), small_params(), seed)
}

/// Measurer with scripted behavior: constant costs and an optionally pinned
/// best-trial counter, recording every batch it sees.
pub struct FakeMeasurer {
    pub batches: Vec<Vec<MeasureInput>>,
    pub measured_keys: Vec<String>,
    pub best: Option<State>,
    /// When set, `best_ct` always answers this value.
    pub pinned_best_ct: Option<usize>,
    ct: usize,
    best_ct: usize,
}

impl FakeMeasurer {
    pub fn new() -> Self {
        Self { batches: Vec::new(), measured_keys: Vec::new(), best: None, pinned_best_ct: None, ct: 0, best_ct: 0 }
    }

    pub fn with_pinned_best_ct(best_ct: usize) -> Self {
        Self { pinned_best_ct: Some(best_ct), ..Self::new() }
    }

    pub fn total_measured(&self) -> usize {
        self.ct
    }
}

impl Measurer for FakeMeasurer {
    fn reset(&mut self) {
        self.batches.clear();
        self.measured_keys.clear();
        self.best = None;
        self.ct = 0;
        self.best_ct = 0;
    }

    fn measure(&mut self, _task: &SearchTask, _policy: &SketchPolicy, inputs: &[MeasureInput]) -> Vec<MeasureResult> {
        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            if self.best.is_none() {
                self.best = Some(input.state.clone());
                self.best_ct = self.ct;
            }
            self.measured_keys.push(input.state.to_str());
            self.ct += 1;
            results.push(MeasureResult::ok(vec![1.0]));
        }
        self.batches.push(inputs.to_vec());
        results
    }

    fn best_ct(&self, _workload_key: &str) -> usize {
        self.pinned_best_ct.unwrap_or(self.best_ct)
    }

    fn best_state(&self, _workload_key: &str) -> Option<State> {
        self.best.clone()
    }
}
