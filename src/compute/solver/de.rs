//! Differential evolution, current-to-best/1/bin with dithered scale factor.

use rand::Rng;
use rand::rngs::StdRng;

use super::{Solver, SolverStatus, rank_value};
use crate::schema::Bounds;

const CROSSOVER: f64 = 0.9;
/// Population spread below which the search has collapsed.
const MIN_SPREAD: f64 = 1e-12;

pub struct DifferentialEvolution {
    bounds: Bounds,
    dim: usize,
    popsize: usize,
    /// Parents, in unit coordinates.
    population: Vec<Vec<f64>>,
    values: Vec<f64>,
    /// Last asked candidates; equal to the parents before the first tell.
    trials: Vec<Vec<f64>>,
    initialized: bool,
    rng: StdRng,
}

impl DifferentialEvolution {
    /// The first population holds `mean` plus uniform samples of the unit cube.
    pub fn new(bounds: Bounds, mean: &[f64], popsize: usize, mut rng: StdRng) -> Self {
        let dim = bounds.dim();
        let mut population = Vec::with_capacity(popsize);
        population.push(mean.to_vec());
        while population.len() < popsize {
            population.push((0..dim).map(|_| rng.r#gen::<f64>()).collect());
        }
        Self {
            bounds,
            dim,
            popsize,
            population,
            values: vec![f64::INFINITY; popsize],
            trials: Vec::new(),
            initialized: false,
            rng,
        }
    }

    fn best_index(&self) -> usize {
        (0..self.popsize)
            .min_by(|&a, &b| self.values[a].total_cmp(&self.values[b]))
            .unwrap_or(0)
    }

    /// Two distinct indices, both different from `i`.
    fn pick(&mut self, i: usize) -> (usize, usize) {
        let r1 = loop {
            let r = self.rng.gen_range(0..self.popsize);
            if r != i {
                break r;
            }
        };
        let r2 = loop {
            let r = self.rng.gen_range(0..self.popsize);
            if r != i && r != r1 {
                break r;
            }
        };
        (r1, r2)
    }

    fn trial(&mut self, i: usize, best: usize) -> Vec<f64> {
        let (r1, r2) = self.pick(i);
        let f = 0.5 + 0.5 * self.rng.r#gen::<f64>();
        let forced = self.rng.gen_range(0..self.dim);
        let x = &self.population[i];
        let mut trial = x.clone();
        for j in 0..self.dim {
            if j == forced || self.rng.r#gen::<f64>() < CROSSOVER {
                let v = x[j]
                    + f * (self.population[best][j] - x[j])
                    + f * (self.population[r1][j] - self.population[r2][j]);
                // Out-of-range components land halfway between parent and bound.
                trial[j] = if v < 0.0 {
                    0.5 * x[j]
                } else if v > 1.0 {
                    0.5 * (x[j] + 1.0)
                } else {
                    v
                };
            }
        }
        trial
    }

    fn spread(&self) -> f64 {
        (0..self.dim)
            .map(|j| {
                let (lo, hi) = self
                    .population
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
                        (lo.min(x[j]), hi.max(x[j]))
                    });
                hi - lo
            })
            .fold(0.0, f64::max)
    }
}

impl Solver for DifferentialEvolution {
    fn popsize(&self) -> usize {
        self.popsize
    }

    fn ask(&mut self) -> Vec<Vec<f64>> {
        self.trials = if self.initialized {
            let best = self.best_index();
            (0..self.popsize).map(|i| self.trial(i, best)).collect()
        } else {
            self.population.clone()
        };
        self.trials
            .iter()
            .map(|u| self.bounds.denormalize(u))
            .collect()
    }

    fn tell(&mut self, values: &[f64]) -> SolverStatus {
        if values.len() != self.trials.len() || values.is_empty() {
            log::warn!(
                "DE told {} values for {} candidates",
                values.len(),
                self.trials.len()
            );
            return SolverStatus::Degenerate;
        }
        let trials = std::mem::take(&mut self.trials);
        for (i, (trial, &value)) in trials.into_iter().zip(values).enumerate() {
            let value = rank_value(value);
            if !self.initialized || value <= self.values[i] {
                self.population[i] = trial;
                self.values[i] = value;
            }
        }
        self.initialized = true;
        if self.spread() < MIN_SPREAD {
            SolverStatus::Converged
        } else {
            SolverStatus::Running
        }
    }
}
