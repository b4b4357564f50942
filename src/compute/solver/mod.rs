//! Ask/tell solvers wrapped by the diversifier.
//!
//! Every solver searches the unit cube spanned by the decision bounds and
//! hands out candidates mapped back into the bounds, so the initial spread
//! `sigma` is always relative to the bound widths.

mod cma;
mod de;
mod snes;

pub use cma::CmaEs;
pub use de::DifferentialEvolution;
pub use snes::Snes;

use rand::rngs::StdRng;

use crate::schema::{Bounds, ConfigError, SolverKind};

/// Result of feeding one generation's values back to a solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    /// Keep iterating.
    Running,
    /// The search distribution collapsed.
    Converged,
    /// Numerical breakdown; the instance cannot continue.
    Degenerate,
}

impl SolverStatus {
    /// Whether the caller must stop iterating this instance.
    pub fn is_stop(self) -> bool {
        self != SolverStatus::Running
    }
}

/// Population-based optimizer driven from outside.
pub trait Solver: Send {
    /// Candidates produced by each `ask`.
    fn popsize(&self) -> usize;

    /// Produce exactly `popsize` candidates inside the bounds.
    fn ask(&mut self) -> Vec<Vec<f64>>;

    /// Accept one value per candidate of the last `ask`, in order; lower is better.
    fn tell(&mut self, values: &[f64]) -> SolverStatus;
}

/// Closed set of solvers the diversifier can wrap.
pub enum WrappedSolver {
    Cma(CmaEs),
    De(DifferentialEvolution),
    Snes(Snes),
}

impl WrappedSolver {
    /// Construct a solver of the given kind.
    ///
    /// `mean` is the initial centroid in decision space and `sigma` the
    /// initial spread relative to the bound widths.
    pub fn new(
        kind: SolverKind,
        bounds: &Bounds,
        mean: &[f64],
        popsize: usize,
        sigma: f64,
        rng: StdRng,
    ) -> Result<Self, ConfigError> {
        bounds.validate()?;
        if mean.len() != bounds.dim() {
            return Err(ConfigError::MeanDimension {
                expected: bounds.dim(),
                actual: mean.len(),
            });
        }
        if popsize < kind.min_popsize() {
            return Err(ConfigError::PopulationTooSmall {
                solver: kind,
                popsize,
                min: kind.min_popsize(),
            });
        }
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(ConfigError::InvalidSigma(format!(
                "sigma {sigma} must be positive"
            )));
        }
        let unit_mean = to_unit(bounds, mean);
        Ok(match kind {
            SolverKind::Cma => Self::Cma(CmaEs::new(bounds.clone(), &unit_mean, popsize, sigma, rng)),
            SolverKind::De => {
                Self::De(DifferentialEvolution::new(bounds.clone(), &unit_mean, popsize, rng))
            }
            SolverKind::Snes => {
                Self::Snes(Snes::new(bounds.clone(), &unit_mean, popsize, sigma, rng))
            }
        })
    }

    /// Kind of the wrapped solver.
    pub fn kind(&self) -> SolverKind {
        match self {
            Self::Cma(_) => SolverKind::Cma,
            Self::De(_) => SolverKind::De,
            Self::Snes(_) => SolverKind::Snes,
        }
    }
}

impl Solver for WrappedSolver {
    fn popsize(&self) -> usize {
        match self {
            Self::Cma(s) => s.popsize(),
            Self::De(s) => s.popsize(),
            Self::Snes(s) => s.popsize(),
        }
    }

    fn ask(&mut self) -> Vec<Vec<f64>> {
        match self {
            Self::Cma(s) => s.ask(),
            Self::De(s) => s.ask(),
            Self::Snes(s) => s.ask(),
        }
    }

    fn tell(&mut self, values: &[f64]) -> SolverStatus {
        match self {
            Self::Cma(s) => s.tell(values),
            Self::De(s) => s.tell(values),
            Self::Snes(s) => s.tell(values),
        }
    }
}

/// Decision vector to clipped unit-cube coordinates.
fn to_unit(bounds: &Bounds, x: &[f64]) -> Vec<f64> {
    bounds
        .normalize(x)
        .into_iter()
        .map(|v| if v.is_nan() { 0.5 } else { v.clamp(0.0, 1.0) })
        .collect()
}

/// NaN ranks last.
fn rank_value(v: f64) -> f64 {
    if v.is_nan() { f64::INFINITY } else { v }
}

/// Candidate indices, best first.
fn ranking(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| rank_value(values[a]).total_cmp(&rank_value(values[b])));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    pub(super) fn sphere(x: &[f64]) -> f64 {
        x.iter().map(|v| v * v).sum()
    }

    /// Best value found by a plain ask/tell loop.
    pub(super) fn minimize_sphere(solver: &mut dyn Solver, bounds: &Bounds, iterations: usize) -> f64 {
        let mut best = f64::INFINITY;
        for _ in 0..iterations {
            let xs = solver.ask();
            assert_eq!(xs.len(), solver.popsize());
            for x in &xs {
                assert!(bounds.contains(x));
            }
            let ys: Vec<f64> = xs.iter().map(|x| sphere(x)).collect();
            best = ys.iter().copied().fold(best, f64::min);
            if solver.tell(&ys).is_stop() {
                break;
            }
        }
        best
    }

    #[test]
    fn test_construction_errors() {
        let bounds = Bounds::uniform(3, -1.0, 1.0);
        let rng = || StdRng::seed_from_u64(0);
        assert!(matches!(
            WrappedSolver::new(SolverKind::Cma, &bounds, &[0.0; 2], 8, 0.1, rng()),
            Err(ConfigError::MeanDimension { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            WrappedSolver::new(SolverKind::De, &bounds, &[0.0; 3], 3, 0.1, rng()),
            Err(ConfigError::PopulationTooSmall { .. })
        ));
        assert!(matches!(
            WrappedSolver::new(SolverKind::Snes, &bounds, &[0.0; 3], 8, -1.0, rng()),
            Err(ConfigError::InvalidSigma(_))
        ));
        let solver = WrappedSolver::new(SolverKind::De, &bounds, &[0.0; 3], 8, 0.1, rng()).unwrap();
        assert_eq!(solver.kind(), SolverKind::De);
        assert_eq!(solver.popsize(), 8);
    }

    #[test]
    fn test_every_kind_improves_sphere() {
        let bounds = Bounds::uniform(4, -5.0, 5.0);
        for kind in [SolverKind::Cma, SolverKind::De, SolverKind::Snes] {
            let mut solver = WrappedSolver::new(
                kind,
                &bounds,
                &[3.0, -3.0, 2.0, 4.0],
                16,
                0.2,
                StdRng::seed_from_u64(42),
            )
            .unwrap();
            let best = minimize_sphere(&mut solver, &bounds, 400);
            assert!(best < 1e-2, "{kind} reached only {best}");
        }
    }

    #[test]
    fn test_ranking_puts_nan_last() {
        assert_eq!(ranking(&[2.0, f64::NAN, -1.0, 0.5]), vec![2, 3, 0, 1]);
    }

    #[test]
    fn test_to_unit_clips() {
        let bounds = Bounds::uniform(2, 0.0, 2.0);
        assert_eq!(to_unit(&bounds, &[3.0, 1.0]), vec![1.0, 0.5]);
    }
}
