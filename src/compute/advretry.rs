//! Classical single-objective retry with boundary narrowing.
//!
//! Results of all runs go into a shared [`Store`] sorted by fitness. Each
//! new run picks two good stored solutions, narrows the bounds to the
//! region around them and starts from the better one, so the search
//! concentrates on promising regions while the evaluation budget per run
//! grows.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::parallel::{RetryCounter, master_rng, worker_rngs};
use super::sink::{InfoSink, summary_line};
use super::solver::{Solver, WrappedSolver};
use crate::schema::{AdvretryConfig, Bounds, ConfigError, SolverKind};

/// Minimum narrowed width as a fraction of the full bound width.
const MIN_NARROW_WIDTH: f64 = 0.01;
/// Initial spread of runs inside narrowed bounds.
const NARROW_SDEV: f64 = 0.1;
/// Initial spread of runs over the full bounds.
const FULL_SDEV: f64 = 0.3;

/// Scalar objective of the classical retry; lower is better.
pub type Objective<'a> = dyn Fn(&[f64]) -> f64 + Sync + 'a;

/// Best solution of one optimizer run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeResult {
    pub x: Vec<f64>,
    pub y: f64,
    pub evaluations: usize,
}

/// Single-objective optimizer usable by [`retry`].
pub trait Optimizer: Send + Sync {
    fn name(&self) -> String;

    /// Minimize `fitness` inside `bounds` with at most `max_evals`
    /// evaluations, starting at `guess` (uniform when absent) with spread
    /// `sdev` relative to the bound widths.
    fn minimize(
        &self,
        fitness: &Objective<'_>,
        bounds: &Bounds,
        guess: Option<&[f64]>,
        sdev: f64,
        max_evals: usize,
        rng: &mut StdRng,
    ) -> Result<OptimizeResult, ConfigError>;
}

/// Runs one wrapped solver kind until it stops or the budget is used.
#[derive(Debug, Clone, Copy)]
pub struct SolverOptimizer {
    pub kind: SolverKind,
    pub popsize: usize,
}

impl SolverOptimizer {
    pub fn new(kind: SolverKind, popsize: usize) -> Self {
        Self { kind, popsize }
    }
}

impl Optimizer for SolverOptimizer {
    fn name(&self) -> String {
        self.kind.to_string()
    }

    fn minimize(
        &self,
        fitness: &Objective<'_>,
        bounds: &Bounds,
        guess: Option<&[f64]>,
        sdev: f64,
        max_evals: usize,
        rng: &mut StdRng,
    ) -> Result<OptimizeResult, ConfigError> {
        let mean = match guess {
            Some(guess) => guess.to_vec(),
            None => bounds.sample(rng),
        };
        let mut solver = WrappedSolver::new(
            self.kind,
            bounds,
            &mean,
            self.popsize,
            sdev,
            StdRng::seed_from_u64(rng.r#gen()),
        )?;
        let mut best = OptimizeResult {
            y: f64::INFINITY,
            x: mean,
            evaluations: 0,
        };
        while best.evaluations + self.popsize <= max_evals.max(self.popsize) {
            let xs = solver.ask();
            let ys: Vec<f64> = xs
                .iter()
                .map(|x| {
                    let y = fitness(x);
                    if y.is_nan() { f64::INFINITY } else { y }
                })
                .collect();
            best.evaluations += xs.len();
            for (x, &y) in xs.iter().zip(&ys) {
                if y < best.y {
                    best.y = y;
                    best.x.clone_from(x);
                }
            }
            if solver.tell(&ys).is_stop() {
                break;
            }
        }
        Ok(best)
    }
}

/// Optimizers run in order, splitting the budget evenly; each starts from
/// the best solution of the one before.
pub struct Sequence {
    optimizers: Vec<Box<dyn Optimizer>>,
}

impl Sequence {
    pub fn new(optimizers: Vec<Box<dyn Optimizer>>) -> Self {
        Self { optimizers }
    }
}

impl Optimizer for Sequence {
    fn name(&self) -> String {
        self.optimizers
            .iter()
            .map(|o| o.name())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn minimize(
        &self,
        fitness: &Objective<'_>,
        bounds: &Bounds,
        guess: Option<&[f64]>,
        sdev: f64,
        max_evals: usize,
        rng: &mut StdRng,
    ) -> Result<OptimizeResult, ConfigError> {
        if self.optimizers.is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        let share = max_evals / self.optimizers.len();
        let mut best: Option<OptimizeResult> = None;
        let mut evaluations = 0;
        for optimizer in &self.optimizers {
            let start = best.as_ref().map(|b| b.x.clone());
            let guess = start.as_deref().or(guess);
            let result = optimizer.minimize(fitness, bounds, guess, sdev, share, rng)?;
            evaluations += result.evaluations;
            if best.as_ref().is_none_or(|b| result.y < b.y) {
                best = Some(result);
            }
        }
        let mut best = best.ok_or(ConfigError::EmptyChain)?;
        best.evaluations = evaluations;
        Ok(best)
    }
}

/// Differential evolution followed by CMA-ES.
pub fn de_cma() -> Sequence {
    Sequence::new(vec![
        Box::new(SolverOptimizer::new(SolverKind::De, 24)),
        Box::new(SolverOptimizer::new(SolverKind::Cma, 12)),
    ])
}

/// Bounded collection of `(y, x)` results, ascending by `y`.
#[derive(Debug)]
pub struct Store {
    capacity: usize,
    entries: Mutex<Vec<(f64, Vec<f64>)>>,
}

impl Store {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a result; non-finite values are dropped and the worst
    /// entry falls out when the store is full.
    pub fn add_result(&self, y: f64, x: Vec<f64>) {
        if !y.is_finite() {
            return;
        }
        let mut entries = self.entries.lock();
        let at = entries.partition_point(|(e, _)| *e <= y);
        if at >= self.capacity {
            return;
        }
        entries.insert(at, (y, x));
        entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Stored values, ascending.
    pub fn get_ys(&self) -> Vec<f64> {
        self.entries.lock().iter().map(|(y, _)| *y).collect()
    }

    /// Stored solutions, in the order of [`get_ys`](Self::get_ys).
    pub fn get_xs(&self) -> Vec<Vec<f64>> {
        self.entries.lock().iter().map(|(_, x)| x.clone()).collect()
    }

    /// Best entry.
    pub fn best(&self) -> Option<(f64, Vec<f64>)> {
        self.entries.lock().first().cloned()
    }

    /// Two distinct entries from the better half, the better one first.
    pub fn pick_pair<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(Vec<f64>, Vec<f64>)> {
        let entries = self.entries.lock();
        if entries.len() < 2 {
            return None;
        }
        let half = (entries.len() / 2).max(2);
        let i = rng.gen_range(0..half);
        let j = (i + rng.gen_range(1..half)) % half;
        let (a, b) = (i.min(j), i.max(j));
        Some((entries[a].1.clone(), entries[b].1.clone()))
    }
}

/// Bounds around `a` and `b`, widened by their distance per dimension.
fn narrow(bounds: &Bounds, a: &[f64], b: &[f64]) -> Bounds {
    let mut lo = Vec::with_capacity(a.len());
    let mut hi = Vec::with_capacity(a.len());
    for (&u, &v) in a.iter().zip(b) {
        let dist = (u - v).abs();
        lo.push(u.min(v) - dist);
        hi.push(u.max(v) + dist);
    }
    bounds.narrowed(&lo, &hi, MIN_NARROW_WIDTH)
}

/// Run `config.num_retries` optimizations in parallel, adding every result
/// to `store`.
pub fn retry(
    fitness: &Objective<'_>,
    store: &Store,
    optimizer: &dyn Optimizer,
    bounds: &Bounds,
    config: &AdvretryConfig,
    sink: &dyn InfoSink,
) -> Result<(), ConfigError> {
    config.validate()?;
    bounds.validate()?;
    let start = Instant::now();
    let counter = RetryCounter::new(config.num_retries);
    let mut master = master_rng(config.random_seed);
    let rngs = worker_rngs(&mut master, config.workers());

    thread::scope(|s| {
        for (id, mut rng) in rngs.into_iter().enumerate() {
            let counter = &counter;
            s.spawn(move || {
                while let Some(index) = counter.try_acquire() {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        let budget = config.eval_budget(index);
                        match store.pick_pair(&mut rng) {
                            Some((better, other)) => {
                                let narrowed = narrow(bounds, &better, &other);
                                let mut guess = better;
                                narrowed.clip(&mut guess);
                                optimizer.minimize(
                                    fitness,
                                    &narrowed,
                                    Some(&guess),
                                    NARROW_SDEV,
                                    budget,
                                    &mut rng,
                                )
                            }
                            None => {
                                let guess = store.best().map(|(_, x)| x);
                                optimizer.minimize(
                                    fitness,
                                    bounds,
                                    guess.as_deref(),
                                    FULL_SDEV,
                                    budget,
                                    &mut rng,
                                )
                            }
                        }
                    }));
                    match result {
                        Ok(Ok(result)) => {
                            log::debug!(
                                "retry {index} on worker {id}: {} after {} evaluations",
                                result.y,
                                result.evaluations
                            );
                            store.add_result(result.y, result.x);
                        }
                        Ok(Err(err)) => log::warn!("retry {index} rejected: {err}"),
                        Err(_) => log::warn!("retry {index} on worker {id} panicked"),
                    }
                }
            });
        }
    });

    sink.info(&format!(
        "{} {} retries, {} results stored",
        optimizer.name(),
        counter.value(),
        store.len()
    ));
    sink.info(&summary_line(&store.get_ys(), start.elapsed().as_secs_f64()));
    Ok(())
}
