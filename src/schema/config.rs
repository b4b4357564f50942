//! Configuration types for diversifying optimization runs.

use serde::{Deserialize, Serialize};

use super::{Bounds, OptParamsChain, SolverKind};

/// Top-level configuration of [`minimize`](crate::compute::minimize).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiversifierConfig {
    /// Number of niches (Voronoi cells) in descriptor space.
    #[serde(default = "default_niche_num")]
    pub niche_num: usize,
    /// Random descriptor samples drawn per niche to place the centers.
    #[serde(default = "default_samples_per_niche")]
    pub samples_per_niche: usize,
    /// Total attempts across all workers. Defaults to the worker count.
    #[serde(default)]
    pub retries: Option<usize>,
    /// Parallel workers. Defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Seed for the per-worker random streams.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Lloyd iterations used when placing niche centers.
    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,
    /// Wrapped solver configuration, or a chain of them.
    #[serde(default)]
    pub opt_params: OptParamsChain,
}

impl Default for DiversifierConfig {
    fn default() -> Self {
        Self {
            niche_num: default_niche_num(),
            samples_per_niche: default_samples_per_niche(),
            retries: None,
            workers: None,
            random_seed: None,
            kmeans_iterations: default_kmeans_iterations(),
            opt_params: OptParamsChain::default(),
        }
    }
}

fn default_niche_num() -> usize {
    4000
}
fn default_samples_per_niche() -> usize {
    20
}
fn default_kmeans_iterations() -> usize {
    100
}

/// Number of hardware threads, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl DiversifierConfig {
    /// Effective worker count.
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(default_workers)
    }

    /// Effective retry count.
    pub fn retries(&self) -> usize {
        self.retries.unwrap_or_else(|| self.workers())
    }

    /// Validate against the run's decision and descriptor bounds.
    pub fn validate(&self, bounds: &Bounds, desc_bounds: &Bounds) -> Result<(), ConfigError> {
        bounds.validate()?;
        desc_bounds.validate()?;
        if self.niche_num == 0 {
            return Err(ConfigError::NoNiches);
        }
        if self.samples_per_niche == 0 {
            return Err(ConfigError::NoSamples);
        }
        if self.workers() == 0 {
            return Err(ConfigError::NoWorkers);
        }
        self.opt_params.validate(bounds.dim())
    }
}

/// Configuration of the classical boundary-narrowing retry used by
/// [`apply_advretry`](crate::compute::apply_advretry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvretryConfig {
    /// Optimization runs to perform.
    #[serde(default = "default_num_retries")]
    pub num_retries: usize,
    /// Parallel workers. Defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Final evaluation budget as a multiple of `min_evals`.
    #[serde(default = "default_max_eval_fac")]
    pub max_eval_fac: f64,
    /// Evaluation budget of the first runs.
    #[serde(default = "default_min_evals")]
    pub min_evals: usize,
    /// Minimum number of results the store keeps.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Seed for the per-worker random streams.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for AdvretryConfig {
    fn default() -> Self {
        Self {
            num_retries: default_num_retries(),
            workers: None,
            max_eval_fac: default_max_eval_fac(),
            min_evals: default_min_evals(),
            capacity: default_capacity(),
            random_seed: None,
        }
    }
}

fn default_num_retries() -> usize {
    1000
}
fn default_max_eval_fac() -> f64 {
    5.0
}
fn default_min_evals() -> usize {
    1500
}
fn default_capacity() -> usize {
    500
}

impl AdvretryConfig {
    /// Effective worker count.
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(default_workers)
    }

    /// Evaluation budget of retry `index`, growing linearly from
    /// `min_evals` to `max_eval_fac * min_evals`.
    pub fn eval_budget(&self, index: usize) -> usize {
        let progress = if self.num_retries > 1 {
            index.min(self.num_retries - 1) as f64 / (self.num_retries - 1) as f64
        } else {
            1.0
        };
        let fac = 1.0 + (self.max_eval_fac - 1.0) * progress;
        (self.min_evals as f64 * fac).round() as usize
    }

    /// Validate the retry settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers() == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !(self.max_eval_fac >= 1.0) {
            return Err(ConfigError::InvalidAdvretry(format!(
                "max_eval_fac {} must be at least 1",
                self.max_eval_fac
            )));
        }
        if self.min_evals == 0 {
            return Err(ConfigError::InvalidAdvretry(
                "min_evals must be positive".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(ConfigError::InvalidAdvretry(
                "capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Built-in benchmark problems selectable from a run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProblemKind {
    /// Sum of squares; descriptor is the first two coordinates.
    Sphere { dim: usize },
    /// Rastrigin; descriptor is the first two coordinates.
    Rastrigin { dim: usize },
    /// Planar robotic arm; descriptor is the end effector position.
    Arm { joints: usize },
}

impl Default for ProblemKind {
    fn default() -> Self {
        Self::Rastrigin { dim: 6 }
    }
}

/// Run file read by the command line binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Problem to optimize.
    #[serde(default)]
    pub problem: ProblemKind,
    /// Diversifier settings.
    #[serde(default)]
    pub diversifier: DiversifierConfig,
    /// Optional classical refinement after the diversifying run.
    #[serde(default)]
    pub advretry: Option<AdvretryConfig>,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),
    #[error("Niche count must be non-zero")]
    NoNiches,
    #[error("Samples per niche must be non-zero")]
    NoSamples,
    #[error("Worker count must be non-zero")]
    NoWorkers,
    #[error("Population size {popsize} too small for {solver} (minimum {min})")]
    PopulationTooSmall {
        solver: SolverKind,
        popsize: usize,
        min: usize,
    },
    #[error("Evaluation budget {max_evals} is smaller than population size {popsize}")]
    BudgetTooSmall { max_evals: usize, popsize: usize },
    #[error("Invalid sigma: {0}")]
    InvalidSigma(String),
    #[error("Stall criterion must be at least one iteration")]
    InvalidStallCriterion,
    #[error("Initial mean has {actual} entries, expected {expected}")]
    MeanDimension { expected: usize, actual: usize },
    #[error("Unknown solver '{0}'")]
    UnknownSolver(String),
    #[error("Solver '{0}' is not supported")]
    UnsupportedSolver(String),
    #[error("Optimizer chain is empty")]
    EmptyChain,
    #[error("Archive does not match the run: {0}")]
    ArchiveMismatch(String),
    #[error("Invalid advretry setting: {0}")]
    InvalidAdvretry(String),
    #[error("Invalid problem: {0}")]
    InvalidProblem(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = DiversifierConfig::default();
        let bounds = Bounds::uniform(4, -1.0, 1.0);
        let desc = Bounds::uniform(2, 0.0, 1.0);
        assert!(config.validate(&bounds, &desc).is_ok());
        assert!(AdvretryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_retries_default_to_workers() {
        let config = DiversifierConfig {
            workers: Some(3),
            ..Default::default()
        };
        assert_eq!(config.retries(), 3);
        let config = DiversifierConfig {
            workers: Some(3),
            retries: Some(10),
            ..Default::default()
        };
        assert_eq!(config.retries(), 10);
    }

    #[test]
    fn test_invalid_config() {
        let bounds = Bounds::uniform(2, -1.0, 1.0);
        let desc = Bounds::uniform(2, 0.0, 1.0);
        let config = DiversifierConfig {
            niche_num: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(&bounds, &desc),
            Err(ConfigError::NoNiches)
        ));
        let config = DiversifierConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(&bounds, &desc),
            Err(ConfigError::NoWorkers)
        ));
    }

    #[test]
    fn test_eval_budget_grows() {
        let config = AdvretryConfig {
            num_retries: 5,
            min_evals: 100,
            max_eval_fac: 3.0,
            ..Default::default()
        };
        assert_eq!(config.eval_budget(0), 100);
        assert_eq!(config.eval_budget(2), 200);
        assert_eq!(config.eval_budget(4), 300);
        assert_eq!(config.eval_budget(99), 300);
    }

    #[test]
    fn test_run_config_serialization() {
        let json = r#"{
            "problem": {"type": "Arm", "joints": 5},
            "diversifier": {"niche_num": 100, "opt_params": [{"solver": "DE"}, {"solver": "CMA"}]}
        }"#;
        let run: RunConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(run.problem, ProblemKind::Arm { joints: 5 }));
        assert_eq!(run.diversifier.niche_num, 100);
        assert_eq!(run.diversifier.opt_params.stages().len(), 2);
        assert!(run.advretry.is_none());

        let back = serde_json::to_string(&run).unwrap();
        let parsed: RunConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(parsed.diversifier.niche_num, 100);
    }
}
