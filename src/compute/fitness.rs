//! Quality-diversity objective contract and the guarded evaluation wrapper.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::archive::Archive;
use super::sink::InfoSink;

/// Result of evaluating one solution: fitness (lower is better) and
/// behavior descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub y: f64,
    pub desc: Vec<f64>,
}

impl Evaluation {
    pub fn new(y: f64, desc: Vec<f64>) -> Self {
        Self { y, desc }
    }

    /// Worst possible fitness with a zero descriptor.
    pub fn failed(desc_dim: usize) -> Self {
        Self {
            y: f64::INFINITY,
            desc: vec![0.0; desc_dim],
        }
    }

    /// Scalarize a multi-valued objective by summation.
    pub fn from_objectives(ys: &[f64], desc: Vec<f64>) -> Self {
        Self {
            y: ys.iter().sum(),
            desc,
        }
    }

    /// No NaN in fitness or descriptor.
    pub fn is_valid(&self) -> bool {
        !self.y.is_nan() && !self.desc.iter().any(|d| d.is_nan())
    }

    /// Replace an unusable evaluation (NaN or wrong descriptor length)
    /// by a failed one.
    pub fn sanitized(self, desc_dim: usize) -> Self {
        if self.is_valid() && self.desc.len() == desc_dim {
            self
        } else {
            Self::failed(desc_dim)
        }
    }
}

/// Errors a user objective may report.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Objective failed: {0}")]
    Failed(String),
    #[error("Objective panicked")]
    Panicked,
}

/// Objective returning fitness and behavior descriptor for a solution.
pub trait QdFitness: Send + Sync {
    fn evaluate(&self, x: &[f64]) -> Result<Evaluation, EvalError>;
}

impl<F> QdFitness for F
where
    F: Fn(&[f64]) -> (f64, Vec<f64>) + Send + Sync,
{
    fn evaluate(&self, x: &[f64]) -> Result<Evaluation, EvalError> {
        let (y, desc) = self(x);
        Ok(Evaluation::new(y, desc))
    }
}

/// Adapts an objective returning several fitness values per solution;
/// they are summed into the scalar fitness.
#[derive(Debug, Clone, Copy)]
pub struct MultiObjective<F>(pub F);

impl<F> QdFitness for MultiObjective<F>
where
    F: Fn(&[f64]) -> (Vec<f64>, Vec<f64>) + Send + Sync,
{
    fn evaluate(&self, x: &[f64]) -> Result<Evaluation, EvalError> {
        let (ys, desc) = (self.0)(x);
        if ys.is_empty() {
            return Err(EvalError::Failed("no objective values".to_string()));
        }
        Ok(Evaluation::from_objectives(&ys, desc))
    }
}

/// Wraps an objective so that no evaluation can fail or poison a worker.
///
/// NaN inputs, reported errors, panics and NaN outputs all become
/// [`Evaluation::failed`]. Counts evaluations and reports every new global
/// best through the sink.
pub struct GuardedFitness<'a, F: ?Sized> {
    inner: &'a F,
    desc_dim: usize,
    evals: AtomicU64,
    best_y: AtomicU64,
    start: Instant,
    sink: &'a dyn InfoSink,
    archive: Option<&'a Archive>,
}

impl<'a, F: QdFitness + ?Sized> GuardedFitness<'a, F> {
    pub fn new(inner: &'a F, desc_dim: usize, sink: &'a dyn InfoSink) -> Self {
        Self {
            inner,
            desc_dim,
            evals: AtomicU64::new(0),
            best_y: AtomicU64::new(f64::INFINITY.to_bits()),
            start: Instant::now(),
            sink,
            archive: None,
        }
    }

    /// Include the archive occupancy in progress lines.
    pub fn with_archive(mut self, archive: &'a Archive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Evaluations performed so far (NaN inputs are not counted).
    pub fn evaluations(&self) -> u64 {
        self.evals.load(Ordering::Relaxed)
    }

    /// Best fitness seen so far.
    pub fn best_y(&self) -> f64 {
        f64::from_bits(self.best_y.load(Ordering::Acquire))
    }

    /// Evaluate `x`, never failing.
    pub fn eval(&self, x: &[f64]) -> Evaluation {
        if x.iter().any(|v| v.is_nan()) {
            return Evaluation::failed(self.desc_dim);
        }
        let evals = self.evals.fetch_add(1, Ordering::Relaxed) + 1;
        let evaluation = match panic::catch_unwind(AssertUnwindSafe(|| self.inner.evaluate(x))) {
            Ok(Ok(evaluation)) => evaluation.sanitized(self.desc_dim),
            Ok(Err(err)) => {
                log::debug!("evaluation failed: {err}");
                Evaluation::failed(self.desc_dim)
            }
            Err(_) => {
                log::warn!("{}", EvalError::Panicked);
                Evaluation::failed(self.desc_dim)
            }
        };
        if self.improve_best(evaluation.y) {
            let elapsed = self.start.elapsed().as_secs_f64();
            let occupied = self.archive.map_or(0, Archive::get_occupied);
            self.sink.info(&format!(
                "{:.2} {} {} {:.1} {} {:?}",
                elapsed,
                occupied,
                evals,
                evals as f64 / (elapsed + 1e-9),
                evaluation.y,
                x
            ));
        }
        evaluation
    }

    fn improve_best(&self, y: f64) -> bool {
        let mut current = self.best_y.load(Ordering::Acquire);
        loop {
            if !(y < f64::from_bits(current)) {
                return false;
            }
            match self.best_y.compare_exchange_weak(
                current,
                y.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl<F: QdFitness + ?Sized> QdFitness for GuardedFitness<'_, F> {
    fn evaluate(&self, x: &[f64]) -> Result<Evaluation, EvalError> {
        Ok(self.eval(x))
    }
}
