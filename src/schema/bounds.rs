//! Box constraints for decision variables and behavior descriptors.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Axis-aligned box given by lower and upper limit vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Lower limits, one per dimension.
    pub lb: Vec<f64>,
    /// Upper limits, one per dimension.
    pub ub: Vec<f64>,
}

impl Bounds {
    /// Create validated bounds.
    pub fn new(lb: Vec<f64>, ub: Vec<f64>) -> Result<Self, ConfigError> {
        let bounds = Self { lb, ub };
        bounds.validate()?;
        Ok(bounds)
    }

    /// Same `[lower, upper]` interval in every dimension.
    pub fn uniform(dim: usize, lower: f64, upper: f64) -> Self {
        Self {
            lb: vec![lower; dim],
            ub: vec![upper; dim],
        }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.lb.len()
    }

    /// Check lengths, finiteness and ordering.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lb.is_empty() {
            return Err(ConfigError::InvalidBounds("no dimensions".to_string()));
        }
        if self.lb.len() != self.ub.len() {
            return Err(ConfigError::InvalidBounds(format!(
                "lower has {} entries, upper has {}",
                self.lb.len(),
                self.ub.len()
            )));
        }
        for (i, (&lo, &hi)) in self.lb.iter().zip(&self.ub).enumerate() {
            if !lo.is_finite() || !hi.is_finite() {
                return Err(ConfigError::InvalidBounds(format!(
                    "dimension {i} is not finite"
                )));
            }
            if lo >= hi {
                return Err(ConfigError::InvalidBounds(format!(
                    "dimension {i}: lower ({lo}) >= upper ({hi})"
                )));
            }
        }
        Ok(())
    }

    /// Width of every dimension.
    pub fn scale(&self) -> Vec<f64> {
        self.lb.iter().zip(&self.ub).map(|(lo, hi)| hi - lo).collect()
    }

    /// Midpoint of the box.
    pub fn center(&self) -> Vec<f64> {
        self.lb
            .iter()
            .zip(&self.ub)
            .map(|(lo, hi)| 0.5 * (lo + hi))
            .collect()
    }

    /// Whether `x` lies inside the box (inclusive).
    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.dim()
            && x
                .iter()
                .zip(self.lb.iter().zip(&self.ub))
                .all(|(&v, (&lo, &hi))| v >= lo && v <= hi)
    }

    /// Clamp `x` into the box in place.
    pub fn clip(&self, x: &mut [f64]) {
        for (v, (&lo, &hi)) in x.iter_mut().zip(self.lb.iter().zip(&self.ub)) {
            *v = v.clamp(lo, hi);
        }
    }

    /// Uniform random point inside the box.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.lb
            .iter()
            .zip(&self.ub)
            .map(|(&lo, &hi)| lo + (hi - lo) * rng.r#gen::<f64>())
            .collect()
    }

    /// Map `x` to unit-cube coordinates.
    pub fn normalize(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.lb.iter().zip(&self.ub))
            .map(|(&v, (&lo, &hi))| (v - lo) / (hi - lo))
            .collect()
    }

    /// Map unit-cube coordinates back into the box.
    pub fn denormalize(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .zip(self.lb.iter().zip(&self.ub))
            .map(|(&v, (&lo, &hi))| lo + v * (hi - lo))
            .collect()
    }

    /// Intersection with the box `[lo, hi]`, keeping at least `min_width`
    /// of each dimension's width around the requested interval.
    pub fn narrowed(&self, lo: &[f64], hi: &[f64], min_width: f64) -> Bounds {
        let mut lb = Vec::with_capacity(self.dim());
        let mut ub = Vec::with_capacity(self.dim());
        for i in 0..self.dim() {
            let width = (self.ub[i] - self.lb[i]) * min_width;
            let mid = 0.5 * (lo[i] + hi[i]);
            let half = (0.5 * (hi[i] - lo[i])).max(0.5 * width);
            let a = (mid - half).max(self.lb[i]);
            let b = (mid + half).min(self.ub[i]);
            if a < b {
                lb.push(a);
                ub.push(b);
            } else {
                lb.push(self.lb[i]);
                ub.push(self.ub[i]);
            }
        }
        Bounds { lb, ub }
    }
}
