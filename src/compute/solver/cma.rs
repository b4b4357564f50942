//! CMA-ES with full covariance matrix, minimizing in the unit cube.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use super::{Solver, SolverStatus, ranking};
use crate::schema::Bounds;

/// Step size (times the largest axis) below which the search has collapsed.
const MIN_STEP: f64 = 1e-12;
/// Largest tolerated covariance condition number.
const MAX_CONDITION: f64 = 1e14;

pub struct CmaEs {
    bounds: Bounds,
    dim: usize,
    popsize: usize,
    mu: usize,
    /// Recombination weights of the best `mu` candidates (sum to 1).
    weights: DVector<f64>,
    mu_eff: f64,
    c_sigma: f64,
    d_sigma: f64,
    c_c: f64,
    c_1: f64,
    c_mu: f64,
    /// `E[||N(0, I)||]`.
    expected_norm: f64,
    mean: DVector<f64>,
    sigma: f64,
    covariance: DMatrix<f64>,
    /// `B * D`: sampling transform from the eigendecomposition.
    bd: DMatrix<f64>,
    /// `C^{-1/2}`.
    inv_sqrt: DMatrix<f64>,
    p_c: DVector<f64>,
    p_sigma: DVector<f64>,
    generation: i32,
    /// Last asked candidates, in unit coordinates.
    population: Vec<DVector<f64>>,
    rng: StdRng,
}

impl CmaEs {
    /// `mean` in unit coordinates, `sigma` relative to the bound widths.
    pub fn new(bounds: Bounds, mean: &[f64], popsize: usize, sigma: f64, rng: StdRng) -> Self {
        let dim = bounds.dim();
        let n = dim as f64;
        let mu = (popsize / 2).max(1);

        let raw: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let sum: f64 = raw.iter().sum();
        let weights = DVector::from_iterator(mu, raw.iter().map(|w| w / sum));
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let c_sigma = (mu_eff + 2.0) / (n + mu_eff + 5.0);
        let d_sigma = 1.0 + 2.0 * (((mu_eff - 1.0) / (n + 1.0)).sqrt() - 1.0).max(0.0) + c_sigma;
        let c_c = (4.0 + mu_eff / n) / (n + 4.0 + 2.0 * mu_eff / n);
        let c_1 = 2.0 / ((n + 1.3).powi(2) + mu_eff);
        let c_mu =
            (2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((n + 2.0).powi(2) + mu_eff)).min(1.0 - c_1);
        let expected_norm = n.sqrt() * (1.0 - 1.0 / (4.0 * n) + 1.0 / (21.0 * n * n));

        Self {
            bounds,
            dim,
            popsize,
            mu,
            weights,
            mu_eff,
            c_sigma,
            d_sigma,
            c_c,
            c_1,
            c_mu,
            expected_norm,
            mean: DVector::from_column_slice(mean),
            sigma,
            covariance: DMatrix::identity(dim, dim),
            bd: DMatrix::identity(dim, dim),
            inv_sqrt: DMatrix::identity(dim, dim),
            p_c: DVector::zeros(dim),
            p_sigma: DVector::zeros(dim),
            generation: 0,
            population: Vec::new(),
            rng,
        }
    }

    /// Current global step size.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Refresh `bd` and `inv_sqrt`; `None` if the covariance is unusable.
    fn decompose(&mut self) -> Option<f64> {
        let eigen = SymmetricEigen::new(self.covariance.clone());
        let min = eigen.eigenvalues.min();
        let max = eigen.eigenvalues.max();
        if !(min > 0.0) || !max.is_finite() || max / min > MAX_CONDITION {
            return None;
        }
        let sqrt = eigen.eigenvalues.map(f64::sqrt);
        self.bd = &eigen.eigenvectors * DMatrix::from_diagonal(&sqrt);
        self.inv_sqrt = &eigen.eigenvectors
            * DMatrix::from_diagonal(&sqrt.map(|v| 1.0 / v))
            * eigen.eigenvectors.transpose();
        Some(max)
    }
}

impl Solver for CmaEs {
    fn popsize(&self) -> usize {
        self.popsize
    }

    fn ask(&mut self) -> Vec<Vec<f64>> {
        self.population.clear();
        let mut xs = Vec::with_capacity(self.popsize);
        for _ in 0..self.popsize {
            let z: DVector<f64> = DVector::from_iterator(
                self.dim,
                (0..self.dim).map(|_| StandardNormal.sample(&mut self.rng)),
            );
            let mut u = &self.mean + self.sigma * &self.bd * z;
            u.apply(|v| *v = v.clamp(0.0, 1.0));
            xs.push(self.bounds.denormalize(u.as_slice()));
            self.population.push(u);
        }
        xs
    }

    fn tell(&mut self, values: &[f64]) -> SolverStatus {
        if values.len() != self.population.len() || values.is_empty() {
            log::warn!(
                "CMA-ES told {} values for {} candidates",
                values.len(),
                self.population.len()
            );
            return SolverStatus::Degenerate;
        }
        let order = ranking(values);

        let old_mean = self.mean.clone();
        let mut new_mean = DVector::zeros(self.dim);
        for (w, &i) in order.iter().take(self.mu).enumerate() {
            new_mean += self.weights[w] * &self.population[i];
        }
        let step = (&new_mean - &old_mean) / self.sigma;

        self.p_sigma = (1.0 - self.c_sigma) * &self.p_sigma
            + (self.c_sigma * (2.0 - self.c_sigma) * self.mu_eff).sqrt() * &self.inv_sqrt * &step;

        let decay = 1.0 - (1.0 - self.c_sigma).powi(2 * (self.generation + 1));
        let ps_norm = self.p_sigma.norm();
        let h_sigma = if ps_norm
            < (1.4 + 2.0 / (self.dim as f64 + 1.0)) * self.expected_norm * decay.sqrt()
        {
            1.0
        } else {
            0.0
        };

        self.p_c = (1.0 - self.c_c) * &self.p_c
            + h_sigma * (self.c_c * (2.0 - self.c_c) * self.mu_eff).sqrt() * &step;

        let mut rank_mu = DMatrix::zeros(self.dim, self.dim);
        for (w, &i) in order.iter().take(self.mu).enumerate() {
            let y = (&self.population[i] - &old_mean) / self.sigma;
            rank_mu += self.weights[w] * &y * y.transpose();
        }

        let delta_h = (1.0 - h_sigma) * self.c_c * (2.0 - self.c_c);
        self.covariance = (1.0 - self.c_1 - self.c_mu + self.c_1 * delta_h) * &self.covariance
            + self.c_1 * &self.p_c * self.p_c.transpose()
            + self.c_mu * rank_mu;
        self.covariance = (&self.covariance + self.covariance.transpose()) * 0.5;

        self.sigma *= ((self.c_sigma / self.d_sigma) * (ps_norm / self.expected_norm - 1.0)).exp();
        self.sigma = self.sigma.min(1e3);
        self.mean = new_mean;
        self.generation += 1;

        if !self.sigma.is_finite() || self.mean.iter().any(|v| !v.is_finite()) {
            return SolverStatus::Degenerate;
        }
        match self.decompose() {
            None => SolverStatus::Degenerate,
            Some(max_eigen) if self.sigma * max_eigen.sqrt() < MIN_STEP => SolverStatus::Converged,
            Some(_) => SolverStatus::Running,
        }
    }
}
