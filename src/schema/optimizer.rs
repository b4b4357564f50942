//! Wrapped-solver selection and per-attempt parameters.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Bounds, ConfigError};

/// Ask/tell solver kinds that can be wrapped.
///
/// Parsed from the solver names used in configuration files. The `_CPP`
/// names select the same algorithm as their plain counterparts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SolverKind {
    /// Covariance Matrix Adaptation Evolution Strategy.
    #[default]
    Cma,
    /// Differential evolution.
    De,
    /// Separable natural evolution strategy.
    Snes,
}

/// Names of solvers known from other front ends that have no implementation here.
const UNSUPPORTED_SOLVERS: &[&str] = &["CRMFNES", "CRMFNES_CPP", "PGPE"];

impl SolverKind {
    /// Smallest population the solver can work with.
    pub fn min_popsize(self) -> usize {
        match self {
            SolverKind::Cma => 2,
            SolverKind::De => 4,
            SolverKind::Snes => 2,
        }
    }

    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            SolverKind::Cma => "CMA",
            SolverKind::De => "DE",
            SolverKind::Snes => "SNES",
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SolverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "CMA" | "CMA_CPP" => Ok(SolverKind::Cma),
            "DE" | "DE_CPP" => Ok(SolverKind::De),
            "SNES" => Ok(SolverKind::Snes),
            other if UNSUPPORTED_SOLVERS.contains(&other) => {
                Err(ConfigError::UnsupportedSolver(s.to_string()))
            }
            _ => Err(ConfigError::UnknownSolver(s.to_string())),
        }
    }
}

impl TryFrom<String> for SolverKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SolverKind> for String {
    fn from(kind: SolverKind) -> Self {
        kind.name().to_string()
    }
}

/// Parameters for one solver run inside an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptParams {
    /// Which solver to wrap.
    #[serde(default)]
    pub solver: SolverKind,
    /// Candidates per iteration.
    #[serde(default = "default_popsize")]
    pub popsize: usize,
    /// Initial spread in bound-normalized units.
    /// Drawn per attempt from `sigma_range` when absent.
    #[serde(default)]
    pub sigma: Option<f64>,
    /// Range `(a, b)`; the default sigma is `u^2` with `u ~ U(a, b)`.
    #[serde(default = "default_sigma_range")]
    pub sigma_range: (f64, f64),
    /// Initial centroid. Uniform in bounds when absent, unless chained.
    #[serde(default)]
    pub mean: Option<Vec<f64>>,
    /// Evaluation budget of one run.
    #[serde(default = "default_max_evals")]
    pub max_evals: usize,
    /// Iterations without niche improvement before the run is abandoned.
    #[serde(default = "default_stall_criterion")]
    pub stall_criterion: usize,
}

impl Default for OptParams {
    fn default() -> Self {
        Self {
            solver: SolverKind::default(),
            popsize: default_popsize(),
            sigma: None,
            sigma_range: default_sigma_range(),
            mean: None,
            max_evals: default_max_evals(),
            stall_criterion: default_stall_criterion(),
        }
    }
}

fn default_popsize() -> usize {
    32
}
fn default_sigma_range() -> (f64, f64) {
    (0.03, 0.3)
}
fn default_max_evals() -> usize {
    50_000
}
fn default_stall_criterion() -> usize {
    50
}

impl OptParams {
    /// Parameters for the given solver, everything else default.
    pub fn for_solver(solver: SolverKind) -> Self {
        Self {
            solver,
            ..Default::default()
        }
    }

    /// Iteration budget: `max_evals / popsize`.
    pub fn max_iterations(&self) -> usize {
        self.max_evals / self.popsize.max(1)
    }

    /// Initial spread, drawn from `sigma_range` unless fixed.
    pub fn draw_sigma<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self.sigma {
            Some(sigma) => sigma,
            None => {
                let (a, b) = self.sigma_range;
                let u = a + (b - a) * rng.r#gen::<f64>();
                u * u
            }
        }
    }

    /// Initial centroid: the chained `x0` wins, then the configured mean,
    /// then a uniform draw inside `bounds`.
    pub fn initial_mean<R: Rng + ?Sized>(
        &self,
        bounds: &Bounds,
        x0: Option<&[f64]>,
        rng: &mut R,
    ) -> Vec<f64> {
        if let Some(x0) = x0 {
            return x0.to_vec();
        }
        match &self.mean {
            Some(mean) => mean.clone(),
            None => bounds.sample(rng),
        }
    }

    /// Validate against the decision-space dimension.
    pub fn validate(&self, dim: usize) -> Result<(), ConfigError> {
        let min = self.solver.min_popsize();
        if self.popsize < min {
            return Err(ConfigError::PopulationTooSmall {
                solver: self.solver,
                popsize: self.popsize,
                min,
            });
        }
        if self.max_evals < self.popsize {
            return Err(ConfigError::BudgetTooSmall {
                max_evals: self.max_evals,
                popsize: self.popsize,
            });
        }
        if self.stall_criterion == 0 {
            return Err(ConfigError::InvalidStallCriterion);
        }
        if let Some(sigma) = self.sigma
            && (!sigma.is_finite() || sigma <= 0.0)
        {
            return Err(ConfigError::InvalidSigma(format!(
                "sigma {sigma} must be positive"
            )));
        }
        let (a, b) = self.sigma_range;
        if !(a > 0.0 && a <= b && b.is_finite()) {
            return Err(ConfigError::InvalidSigma(format!(
                "sigma range ({a}, {b}) must satisfy 0 < a <= b"
            )));
        }
        if let Some(mean) = &self.mean
            && mean.len() != dim
        {
            return Err(ConfigError::MeanDimension {
                expected: dim,
                actual: mean.len(),
            });
        }
        Ok(())
    }
}

/// One parameter set, or a sequence run in order where each stage starts
/// from the best real solution of the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptParamsChain {
    Sequence(Vec<OptParams>),
    Single(OptParams),
}

impl Default for OptParamsChain {
    fn default() -> Self {
        Self::Single(OptParams::default())
    }
}

impl From<OptParams> for OptParamsChain {
    fn from(params: OptParams) -> Self {
        Self::Single(params)
    }
}

impl OptParamsChain {
    /// Stages in execution order.
    pub fn stages(&self) -> &[OptParams] {
        match self {
            Self::Single(params) => std::slice::from_ref(params),
            Self::Sequence(seq) => seq,
        }
    }

    /// Validate every stage.
    pub fn validate(&self, dim: usize) -> Result<(), ConfigError> {
        if self.stages().is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        self.stages().iter().try_for_each(|p| p.validate(dim))
    }
}
