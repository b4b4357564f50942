//! Separable natural evolution strategy with rank-based utilities.

use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use super::{Solver, SolverStatus, ranking};
use crate::schema::Bounds;

const MIN_STEP: f64 = 1e-12;

pub struct Snes {
    bounds: Bounds,
    dim: usize,
    popsize: usize,
    mean: Vec<f64>,
    /// Per-dimension standard deviation, in unit coordinates.
    scale: Vec<f64>,
    /// Fitness-shaping utilities by rank, best first; they sum to zero.
    utilities: Vec<f64>,
    eta_scale: f64,
    /// Standard normal draws behind the last asked candidates.
    noise: Vec<Vec<f64>>,
    rng: StdRng,
}

impl Snes {
    pub fn new(bounds: Bounds, mean: &[f64], popsize: usize, sigma: f64, rng: StdRng) -> Self {
        let dim = bounds.dim();
        let n = dim as f64;
        let lambda = popsize as f64;
        let raw: Vec<f64> = (1..=popsize)
            .map(|k| ((lambda / 2.0 + 1.0).ln() - (k as f64).ln()).max(0.0))
            .collect();
        let sum: f64 = raw.iter().sum();
        let utilities = raw.iter().map(|u| u / sum - 1.0 / lambda).collect();
        Self {
            bounds,
            dim,
            popsize,
            mean: mean.to_vec(),
            scale: vec![sigma; dim],
            utilities,
            eta_scale: (3.0 + n.ln()) / (5.0 * n.sqrt()),
            noise: Vec::new(),
            rng,
        }
    }
}

impl Solver for Snes {
    fn popsize(&self) -> usize {
        self.popsize
    }

    fn ask(&mut self) -> Vec<Vec<f64>> {
        self.noise = (0..self.popsize)
            .map(|_| {
                (0..self.dim)
                    .map(|_| StandardNormal.sample(&mut self.rng))
                    .collect()
            })
            .collect();
        self.noise
            .iter()
            .map(|z| {
                let u: Vec<f64> = z
                    .iter()
                    .zip(self.mean.iter().zip(&self.scale))
                    .map(|(z, (m, s))| (m + s * z).clamp(0.0, 1.0))
                    .collect();
                self.bounds.denormalize(&u)
            })
            .collect()
    }

    fn tell(&mut self, values: &[f64]) -> SolverStatus {
        if values.len() != self.noise.len() || values.is_empty() {
            log::warn!(
                "SNES told {} values for {} candidates",
                values.len(),
                self.noise.len()
            );
            return SolverStatus::Degenerate;
        }
        let mut grad_mean = vec![0.0; self.dim];
        let mut grad_scale = vec![0.0; self.dim];
        for (&i, u) in ranking(values).iter().zip(&self.utilities) {
            for (j, z) in self.noise[i].iter().enumerate() {
                grad_mean[j] += u * z;
                grad_scale[j] += u * (z * z - 1.0);
            }
        }
        for j in 0..self.dim {
            self.mean[j] = (self.mean[j] + self.scale[j] * grad_mean[j]).clamp(0.0, 1.0);
            self.scale[j] *= (0.5 * self.eta_scale * grad_scale[j]).exp();
        }

        let largest = self.scale.iter().copied().fold(0.0, f64::max);
        if !largest.is_finite() || self.mean.iter().any(|v| !v.is_finite()) {
            SolverStatus::Degenerate
        } else if largest < MIN_STEP {
            SolverStatus::Converged
        } else {
            SolverStatus::Running
        }
    }
}
