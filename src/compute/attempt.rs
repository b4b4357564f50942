//! One worker attempt: drive a wrapped solver against the niche-relative
//! objective until it stalls, breaks down or runs out of budget.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::archive::Archive;
use super::fitness::{GuardedFitness, QdFitness};
use super::solver::{Solver, SolverStatus, WrappedSolver};
use super::transform::{Transformed, update_archive};
use crate::schema::{Bounds, ConfigError, OptParams, OptParamsChain};

/// Why an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStop {
    /// No niche improved for `stall_criterion` iterations.
    Stalled,
    /// The solver's search distribution collapsed.
    Converged,
    /// The solver reported numerical breakdown.
    Degenerate,
    /// `max_evals / popsize` iterations were performed.
    BudgetExhausted,
}

impl From<SolverStatus> for AttemptStop {
    fn from(status: SolverStatus) -> Self {
        match status {
            SolverStatus::Converged => AttemptStop::Converged,
            _ => AttemptStop::Degenerate,
        }
    }
}

/// Result of an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    /// Best solution by real fitness, if any candidate was evaluated.
    pub best_x: Option<Vec<f64>>,
    pub best_y: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub stop: AttemptStop,
}

/// Detects iterations in which no niche improved.
///
/// An iteration improves when its sorted relative values are
/// lexicographically smaller than those of the iteration before.
#[derive(Debug, Clone)]
pub struct StallTracker {
    criterion: usize,
    previous: Option<Vec<f64>>,
    last_improvement: usize,
}

impl StallTracker {
    pub fn new(criterion: usize) -> Self {
        Self {
            criterion,
            previous: None,
            last_improvement: 0,
        }
    }

    /// Record iteration `iteration`; returns `true` once the attempt is stalled.
    pub fn update(&mut self, iteration: usize, diff: &[f64]) -> bool {
        let mut sorted = diff.to_vec();
        sorted.sort_by(f64::total_cmp);
        let improved = self
            .previous
            .as_deref()
            .is_none_or(|previous| lexicographic(&sorted, previous) == Ordering::Less);
        if improved {
            self.last_improvement = iteration;
        }
        self.previous = Some(sorted);
        iteration - self.last_improvement >= self.criterion
    }

    /// Index of the last improving iteration.
    pub fn last_improvement(&self) -> usize {
        self.last_improvement
    }
}

fn lexicographic(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

/// Run `solver` for at most `max_iterations`, feeding it the values
/// returned by `evaluate`.
///
/// The stall check runs before the values are told, so a stalled attempt
/// does not pay for a final solver update.
pub fn drive<S, E>(
    solver: &mut S,
    max_iterations: usize,
    stall_criterion: usize,
    mut evaluate: E,
) -> AttemptOutcome
where
    S: Solver + ?Sized,
    E: FnMut(&[Vec<f64>]) -> Transformed,
{
    let mut tracker = StallTracker::new(stall_criterion);
    let mut outcome = AttemptOutcome {
        best_x: None,
        best_y: f64::INFINITY,
        iterations: 0,
        evaluations: 0,
        stop: AttemptStop::BudgetExhausted,
    };

    for iteration in 0..max_iterations {
        let xs = solver.ask();
        let transformed = evaluate(&xs);
        outcome.iterations += 1;
        outcome.evaluations += xs.len();

        for (x, &y) in xs.iter().zip(&transformed.ys) {
            if y < outcome.best_y || outcome.best_x.is_none() {
                outcome.best_y = y;
                outcome.best_x = Some(x.clone());
            }
        }

        if tracker.update(iteration, &transformed.diff) {
            outcome.stop = AttemptStop::Stalled;
            break;
        }
        let status = solver.tell(&transformed.diff);
        if status.is_stop() {
            outcome.stop = status.into();
            break;
        }
    }
    outcome
}

/// One solver run against the archive, starting at `x0` when chained.
pub fn run_attempt<F: QdFitness + ?Sized>(
    archive: &Archive,
    fitness: &GuardedFitness<'_, F>,
    bounds: &Bounds,
    params: &OptParams,
    x0: Option<&[f64]>,
    rng: &mut StdRng,
) -> Result<AttemptOutcome, ConfigError> {
    let mean = params.initial_mean(bounds, x0, rng);
    let sigma = params.draw_sigma(rng);
    let mut solver = WrappedSolver::new(
        params.solver,
        bounds,
        &mean,
        params.popsize,
        sigma,
        StdRng::seed_from_u64(rng.r#gen()),
    )?;
    let outcome = drive(
        &mut solver,
        params.max_iterations(),
        params.stall_criterion,
        |xs| update_archive(archive, xs, fitness),
    );
    log::debug!(
        "{} attempt: {:?} after {} iterations, best {}",
        params.solver,
        outcome.stop,
        outcome.iterations,
        outcome.best_y
    );
    Ok(outcome)
}

/// Run every stage of `chain` in order, each starting from the best
/// solution of the stage right before it.
pub fn run_chain<F: QdFitness + ?Sized>(
    archive: &Archive,
    fitness: &GuardedFitness<'_, F>,
    bounds: &Bounds,
    chain: &OptParamsChain,
    rng: &mut StdRng,
) -> Result<AttemptOutcome, ConfigError> {
    let mut total: Option<AttemptOutcome> = None;
    let mut previous_x: Option<Vec<f64>> = None;
    for params in chain.stages() {
        let stage = run_attempt(archive, fitness, bounds, params, previous_x.as_deref(), rng)?;
        previous_x = stage.best_x.clone();
        total = Some(match total {
            None => stage,
            Some(mut acc) => {
                if stage.best_y < acc.best_y || acc.best_x.is_none() {
                    acc.best_y = stage.best_y;
                    acc.best_x = stage.best_x;
                }
                acc.iterations += stage.iterations;
                acc.evaluations += stage.evaluations;
                acc.stop = stage.stop;
                acc
            }
        });
    }
    total.ok_or(ConfigError::EmptyChain)
}
