//! Benchmark problems for the command line and benchmarks.

use std::f64::consts::PI;

use super::fitness::{EvalError, Evaluation, QdFitness};
use crate::schema::{Bounds, ConfigError, ProblemKind};

/// A quality-diversity test problem with its search and descriptor bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Problem {
    /// Sum of squares on `[-5, 5]^dim`; descriptor `(x0, x1)`.
    Sphere { dim: usize },
    /// Rastrigin on `[-5.12, 5.12]^dim`; descriptor `(x0, x1)`.
    Rastrigin { dim: usize },
    /// Planar arm with unit total length; minimizes joint angle variance,
    /// descriptor is the end effector position scaled to `[0, 1]^2`.
    Arm { joints: usize },
}

impl Problem {
    pub fn from_kind(kind: &ProblemKind) -> Result<Self, ConfigError> {
        let problem = match *kind {
            ProblemKind::Sphere { dim } => Problem::Sphere { dim },
            ProblemKind::Rastrigin { dim } => Problem::Rastrigin { dim },
            ProblemKind::Arm { joints } => Problem::Arm { joints },
        };
        let (n, min) = match problem {
            Problem::Sphere { dim } | Problem::Rastrigin { dim } => (dim, 2),
            Problem::Arm { joints } => (joints, 1),
        };
        if n < min {
            return Err(ConfigError::InvalidProblem(format!(
                "{} needs at least {min} dimensions, got {n}",
                problem.name()
            )));
        }
        Ok(problem)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Problem::Sphere { .. } => "sphere",
            Problem::Rastrigin { .. } => "rastrigin",
            Problem::Arm { .. } => "arm",
        }
    }

    pub fn bounds(&self) -> Bounds {
        match *self {
            Problem::Sphere { dim } => Bounds::uniform(dim, -5.0, 5.0),
            Problem::Rastrigin { dim } => Bounds::uniform(dim, -5.12, 5.12),
            Problem::Arm { joints } => Bounds::uniform(joints, 0.0, 1.0),
        }
    }

    pub fn desc_bounds(&self) -> Bounds {
        match self {
            Problem::Sphere { .. } => Bounds::uniform(2, -5.0, 5.0),
            Problem::Rastrigin { .. } => Bounds::uniform(2, -5.12, 5.12),
            Problem::Arm { .. } => Bounds::uniform(2, 0.0, 1.0),
        }
    }

    pub fn objective(&self, x: &[f64]) -> f64 {
        match self {
            Problem::Sphere { .. } => x.iter().map(|v| v * v).sum(),
            Problem::Rastrigin { .. } => {
                10.0 * x.len() as f64
                    + x.iter()
                        .map(|v| v * v - 10.0 * (2.0 * PI * v).cos())
                        .sum::<f64>()
            }
            Problem::Arm { .. } => {
                let angles: Vec<f64> = x.iter().map(|v| joint_angle(*v)).collect();
                let mean = angles.iter().sum::<f64>() / angles.len() as f64;
                angles.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / angles.len() as f64
            }
        }
    }

    pub fn descriptors(&self, x: &[f64]) -> Vec<f64> {
        match self {
            Problem::Sphere { .. } | Problem::Rastrigin { .. } => vec![x[0], x[1]],
            Problem::Arm { .. } => {
                let link = 1.0 / x.len() as f64;
                let (mut angle, mut px, mut py) = (0.0, 0.0, 0.0);
                for v in x {
                    angle += joint_angle(*v);
                    px += link * angle.cos();
                    py += link * angle.sin();
                }
                vec![0.5 * (px + 1.0), 0.5 * (py + 1.0)]
            }
        }
    }
}

/// Unit interval to a joint angle in `[-pi, pi]`.
fn joint_angle(v: f64) -> f64 {
    (v - 0.5) * 2.0 * PI
}

impl QdFitness for Problem {
    fn evaluate(&self, x: &[f64]) -> Result<Evaluation, EvalError> {
        Ok(Evaluation::new(self.objective(x), self.descriptors(x)))
    }
}
