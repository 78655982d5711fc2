//! Measurement inputs, results and the measurement harness boundary.

use std::collections::HashMap;

use loft_ir::State;

use crate::policy::SketchPolicy;
use crate::task::SearchTask;

/// One candidate handed to the measurer.
#[derive(Debug, Clone)]
pub struct MeasureInput {
    pub state: State,
}

/// Outcome of measuring one candidate. A failed build or run is recorded per
/// input and never aborts the batch.
#[derive(Debug, Clone)]
pub struct MeasureResult {
    /// Wall-clock costs of the repeated runs, in seconds. A failed input
    /// carries a single infinite cost.
    pub costs: Vec<f64>,
    pub error: Option<String>,
}

impl MeasureResult {
    pub fn ok(costs: Vec<f64>) -> Self {
        Self { costs, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { costs: vec![f64::INFINITY], error: Some(error.into()) }
    }

    pub fn mean_cost(&self) -> f64 {
        if self.costs.is_empty() {
            return f64::INFINITY;
        }
        self.costs.iter().sum::<f64>() / self.costs.len() as f64
    }
}

/// The measurement harness the search loop drives.
pub trait Measurer {
    fn reset(&mut self);

    fn measure(
        &mut self,
        task: &SearchTask,
        policy: &SketchPolicy,
        inputs: &[MeasureInput],
    ) -> Vec<MeasureResult>;

    /// Trial count at which the best state of a workload was found.
    fn best_ct(&self, workload_key: &str) -> usize;

    /// Best state measured so far for a workload.
    fn best_state(&self, workload_key: &str) -> Option<State>;
}

/// Compiles and runs one concrete state, returning per-run costs in seconds.
pub trait ProgramRunner {
    fn run(&mut self, task: &SearchTask, state: &State) -> Result<Vec<f64>, String>;
}

impl<F> ProgramRunner for F
where
    F: FnMut(&SearchTask, &State) -> Result<Vec<f64>, String>,
{
    fn run(&mut self, task: &SearchTask, state: &State) -> Result<Vec<f64>, String> {
        self(task, state)
    }
}

/// Standard measurer: drives a [`ProgramRunner`] over each input and keeps
/// per-workload best-cost bookkeeping.
#[derive(Debug)]
pub struct ProgramMeasurer<R> {
    runner: R,
    pub best_cost: HashMap<String, f64>,
    pub best_state: HashMap<String, State>,
    pub best_ct: HashMap<String, usize>,
    pub error_ct: usize,
    ct: usize,
}

impl<R: ProgramRunner> ProgramMeasurer<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            best_cost: HashMap::new(),
            best_state: HashMap::new(),
            best_ct: HashMap::new(),
            error_ct: 0,
            ct: 0,
        }
    }
}

impl<R: ProgramRunner> Measurer for ProgramMeasurer<R> {
    fn reset(&mut self) {
        self.best_cost.clear();
        self.best_state.clear();
        self.best_ct.clear();
        self.error_ct = 0;
        self.ct = 0;
    }

    fn measure(
        &mut self,
        task: &SearchTask,
        _policy: &SketchPolicy,
        inputs: &[MeasureInput],
    ) -> Vec<MeasureResult> {
        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            let result = match self.runner.run(task, &input.state) {
                Ok(costs) => MeasureResult::ok(costs),
                Err(error) => {
                    self.error_ct += 1;
                    MeasureResult::failed(error)
                }
            };

            let mean = result.mean_cost();
            let key = task.workload_key.as_str();
            let best = self.best_cost.get(key).copied().unwrap_or(f64::INFINITY);
            if mean < best {
                self.best_cost.insert(key.to_string(), mean);
                self.best_state.insert(key.to_string(), input.state.clone());
                self.best_ct.insert(key.to_string(), self.ct);
            }
            self.ct += 1;
            results.push(result);
        }
        tracing::debug!(batch = inputs.len(), errors = self.error_ct, "measured batch");
        results
    }

    fn best_ct(&self, workload_key: &str) -> usize {
        self.best_ct.get(workload_key).copied().unwrap_or(0)
    }

    fn best_state(&self, workload_key: &str) -> Option<State> {
        self.best_state.get(workload_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_cost_of_failure_is_infinite() {
        let result = MeasureResult::failed("compile error");
        assert!(result.mean_cost().is_infinite());
        assert!(result.error.is_some());
    }

    #[test]
    fn mean_cost_averages_runs() {
        let result = MeasureResult::ok(vec![1.0, 3.0]);
        assert_eq!(result.mean_cost(), 2.0);
    }
}
