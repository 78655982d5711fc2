//! The sketch search policy: the outer tuning loop.
//!
//! One policy instance owns the rule registrations, a seeded random source,
//! the split-scheme memo and the measured-state bookkeeping. The search loop
//! alternates rounds of sketch generation + population sampling with
//! measurement batches picked ε-greedily, retraining the cost model on every
//! new batch.

use std::collections::HashSet;
use std::time::Instant;

use loft_ir::State;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snafu::ResultExt;

use crate::cost_model::CostModel;
use crate::error::*;
use crate::init::rules::InitRule;
use crate::init::sample_init_population;
use crate::measure::{MeasureInput, MeasureResult, Measurer};
use crate::params::SearchParams;
use crate::sketch::generate_sketches;
use crate::sketch::rules::SketchRule;
use crate::split_memo::SplitFactorizationMemo;
use crate::task::SearchTask;
use crate::utils::argsort_descending;

pub struct SketchPolicy {
    pub task: SearchTask,
    pub params: SearchParams,
    pub(crate) cost_model: Box<dyn CostModel>,
    pub(crate) rng: StdRng,
    pub(crate) split_memo: SplitFactorizationMemo,
    sketch_rules: Vec<SketchRule>,
    init_rules: Vec<InitRule>,
    measured_states_set: HashSet<String>,
    measured_states_vector: Vec<State>,
    measured_states_throughputs: Vec<f64>,
    num_measure_per_iter: usize,
}

impl SketchPolicy {
    /// Build a policy with the CPU rule registrations.
    ///
    /// Rule order matters: a rule answering apply-and-skip-rest hides every
    /// later rule at that cursor, and the initialization rules assume the
    /// invariants their predecessors establish.
    pub fn new(task: SearchTask, cost_model: Box<dyn CostModel>, params: SearchParams, seed: u64) -> Self {
        Self {
            task,
            params,
            cost_model,
            rng: StdRng::seed_from_u64(seed),
            split_memo: SplitFactorizationMemo::default(),
            sketch_rules: vec![
                SketchRule::AlwaysInline,
                SketchRule::AddRfactor,
                SketchRule::AddCacheWrite,
                SketchRule::MultiLevelTilingWithFusion,
                SketchRule::MultiLevelTiling,
                SketchRule::SkipStage,
            ],
            init_rules: vec![
                InitRule::FillTileSize,
                InitRule::ChangeComputeLocation,
                InitRule::Parallel,
                InitRule::Vectorization,
                InitRule::Unroll,
            ],
            measured_states_set: HashSet::new(),
            measured_states_vector: Vec::new(),
            measured_states_throughputs: Vec::new(),
            num_measure_per_iter: 0,
        }
    }

    pub fn sketch_rules(&self) -> Vec<SketchRule> {
        self.sketch_rules.clone()
    }

    pub fn init_rules(&self) -> Vec<InitRule> {
        self.init_rules.clone()
    }

    /// Enumerate the sketches of the task.
    pub fn generate_sketches(&self) -> Result<Vec<State>> {
        generate_sketches(self)
    }

    /// Sample up to `out_size` concrete states from the sketches.
    pub fn sample_init_population(&mut self, sketches: &[State], out_size: usize) -> Result<Vec<State>> {
        sample_init_population(self, sketches, out_size)
    }

    /// Evolutionary refinement over the initial population.
    ///
    /// TODO(evolutionary-search): port the mutation/crossover refinement once
    /// the learned cost model lands; the seam currently yields no states and
    /// the round falls back to the sampled population.
    pub fn evolutionary_search(&mut self, _init_population: &[State], _out_size: usize) -> Vec<State> {
        let tic = Instant::now();
        let best_states: Vec<State> = Vec::new();
        tracing::info!(
            count = best_states.len(),
            elapsed_ms = tic.elapsed().as_millis() as u64,
            "evolutionary search"
        );
        best_states
    }

    /// Run the search and return the best measured state.
    pub fn search(
        &mut self,
        n_trials: usize,
        early_stopping: isize,
        num_measure_per_iter: usize,
        measurer: &mut dyn Measurer,
    ) -> Result<State> {
        self.num_measure_per_iter = num_measure_per_iter;

        if n_trials <= 1 {
            // No measurement allowed: one round, best candidate wins.
            let (best_states, _) = self.search_one_round(0)?;
            return best_states.into_iter().next().ok_or_else(|| EmptySearchSpaceSnafu.build());
        }

        let num_random = (self.params.eps_greedy * num_measure_per_iter as f64) as usize;
        let early_stopping = if early_stopping < 0 { isize::MAX >> 1 } else { early_stopping };
        measurer.reset();

        let mut inputs: Vec<MeasureInput> = Vec::new();
        let mut results: Vec<MeasureResult> = Vec::new();
        let mut ct = 0usize;

        while ct < n_trials {
            if !inputs.is_empty() {
                tracing::info!(measurements = inputs.len(), "training cost model");
                self.cost_model.update(&inputs, &results);
            }

            tracing::info!(ct, "search round");
            let (best_states, random_states) = self.search_one_round(num_random)?;

            // Bounds must be final before the canonical-form redundancy check.
            let best_states = self.task.dag.infer_bound_states(&best_states).context(StateSnafu)?;
            let random_states = self.task.dag.infer_bound_states(&random_states).context(StateSnafu)?;

            inputs = self.pick_states_with_eps_greedy(&best_states, &random_states, n_trials - ct);
            if inputs.is_empty() {
                tracing::info!("all candidates in the search space have been measured");
                break;
            }

            tracing::info!(batch = inputs.len(), "measuring candidates");
            results = measurer.measure(&self.task, self, &inputs);
            ct += inputs.len();

            if ct as isize - measurer.best_ct(&self.task.workload_key) as isize > early_stopping {
                tracing::info!("met the early stopping condition");
                break;
            }

            for res in &results {
                self.measured_states_throughputs.push(1.0 / res.mean_cost());
            }
        }
        tracing::info!(ct, "search done");

        measurer
            .best_state(&self.task.workload_key)
            .ok_or_else(|| NoBestStateSnafu { workload_key: self.task.workload_key.clone() }.build())
    }

    /// One round: sketches, population, then either evolutionary refinement
    /// with a random exploration pool, or plain random picks when the cost
    /// model carries no signal.
    pub fn search_one_round(&mut self, num_random_states: usize) -> Result<(Vec<State>, Vec<State>)> {
        let population = self.params.population;
        let num_use_measured = std::cmp::min(
            self.measured_states_vector.len(),
            (self.params.use_measured_ratio * population as f64) as usize,
        );
        let is_cost_model_reasonable = !self.cost_model.is_random();

        let sketches = self.generate_sketches()?;

        let sample_target =
            if is_cost_model_reasonable { population.saturating_sub(num_use_measured) } else { population };
        let mut init_population = self.sample_init_population(&sketches, sample_target)?;

        if is_cost_model_reasonable {
            // Seed the population with the best states measured so far.
            let indices = argsort_descending(&self.measured_states_throughputs);
            for &i in indices.iter().take(num_use_measured) {
                init_population.push(self.measured_states_vector[i].clone());
            }
            let best_states = self.evolutionary_search(&init_population, self.num_measure_per_iter * 2);
            let random_states = self.random_sample_states(&init_population, num_random_states * 10);
            Ok((best_states, random_states))
        } else {
            let best_states = self.random_sample_states(&init_population, self.num_measure_per_iter * 3);
            Ok((best_states, Vec::new()))
        }
    }

    fn random_sample_states(&mut self, in_states: &[State], out_size: usize) -> Vec<State> {
        if in_states.is_empty() {
            return Vec::new();
        }
        (0..out_size).map(|_| in_states[self.rng.gen_range(0..in_states.len())].clone()).collect()
    }

    /// Pick the next measurement batch: the first `num_measure_per_iter -
    /// num_random` slots prefer the best states, the rest prefer the random
    /// pool, and an exhausted list falls through to the other. Already
    /// measured states are skipped by canonical form.
    fn pick_states_with_eps_greedy(
        &mut self,
        best_states: &[State],
        random_states: &[State],
        remaining_n_trials: usize,
    ) -> Vec<MeasureInput> {
        let num_random = (self.params.eps_greedy * self.num_measure_per_iter as f64) as usize;
        let num_good = self.num_measure_per_iter - num_random;

        let mut inputs = Vec::new();
        let (mut offset_best, mut offset_random) = (0usize, 0usize);

        while inputs.len() < std::cmp::min(self.num_measure_per_iter, remaining_n_trials) {
            let has_best = offset_best < best_states.len();
            let has_random = offset_random < random_states.len();

            let state = if inputs.len() < num_good {
                if has_best {
                    offset_best += 1;
                    &best_states[offset_best - 1]
                } else if has_random {
                    offset_random += 1;
                    &random_states[offset_random - 1]
                } else {
                    break;
                }
            } else if has_random {
                offset_random += 1;
                &random_states[offset_random - 1]
            } else if has_best {
                offset_best += 1;
                &best_states[offset_best - 1]
            } else {
                break;
            };

            let state_str = state.to_str();
            if !self.measured_states_set.contains(&state_str) {
                self.measured_states_set.insert(state_str);
                self.measured_states_vector.push(state.clone());
                inputs.push(MeasureInput { state: state.clone() });
            }
        }
        inputs
    }
}
