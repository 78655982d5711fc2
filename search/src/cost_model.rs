//! Cost models scoring candidate states.

use loft_ir::State;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::measure::{MeasureInput, MeasureResult};
use crate::task::SearchTask;

/// Scores states so the policy can rank candidates without measuring them.
pub trait CostModel {
    /// Learn from a batch of measurements.
    fn update(&mut self, inputs: &[MeasureInput], results: &[MeasureResult]);

    /// Score each state; higher is better.
    fn predict(&mut self, task: &SearchTask, states: &[State]) -> Vec<f64>;

    /// Per-stage score breakdown. Models without stage-level scoring keep the
    /// default, which aborts.
    fn predict_stages(&mut self, _task: &SearchTask, _states: &[State]) -> (Vec<f64>, Vec<Vec<f64>>) {
        unimplemented!("this cost model does not support per-stage prediction")
    }

    /// Whether this model's scores carry no information. An uninformative
    /// model disables the evolutionary refinement path.
    fn is_random(&self) -> bool {
        false
    }
}

/// The baseline model: uniform random scores.
#[derive(Debug)]
pub struct RandomModel {
    rng: StdRng,
}

impl RandomModel {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl CostModel for RandomModel {
    fn update(&mut self, _inputs: &[MeasureInput], _results: &[MeasureResult]) {}

    fn predict(&mut self, _task: &SearchTask, states: &[State]) -> Vec<f64> {
        states.iter().map(|_| self.rng.gen_range(0.0..1.0)).collect()
    }

    fn is_random(&self) -> bool {
        true
    }
}
