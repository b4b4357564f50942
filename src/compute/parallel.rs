//! Parallel retry coordinator: independent workers share one archive and a
//! retry counter, each running attempts until the budget is used up.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::archive::Archive;
use super::attempt::run_chain;
use super::fitness::{GuardedFitness, QdFitness};
use super::sink::{InfoSink, summary_line};
use crate::schema::{Bounds, ConfigError, DiversifierConfig, OptParamsChain};

/// Fitness values summarized after a run.
const SUMMARY_SIZE: usize = 100;

/// Shared attempt budget.
///
/// Every successful [`try_acquire`](Self::try_acquire) starts one attempt;
/// the counter never moves past its target.
#[derive(Debug)]
pub struct RetryCounter {
    started: AtomicUsize,
    target: usize,
}

impl RetryCounter {
    pub fn new(target: usize) -> Self {
        Self {
            started: AtomicUsize::new(0),
            target,
        }
    }

    /// Claim the next attempt; `None` once the budget is used up.
    pub fn try_acquire(&self) -> Option<usize> {
        self.started
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.target).then_some(n + 1)
            })
            .ok()
    }

    /// Attempts started so far.
    pub fn value(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

/// Master generator: seeded when `seed` is given, from OS entropy otherwise.
pub fn master_rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

/// `n` independent generators derived from `master`.
pub fn worker_rngs(master: &mut StdRng, n: usize) -> Vec<StdRng> {
    (0..n)
        .map(|_| StdRng::seed_from_u64(master.r#gen()))
        .collect()
}

/// Fill a niche archive by parallel diversifying retries.
///
/// A fresh archive with `config.niche_num` niches is created when
/// `archive` is `None`; a given archive is continued. Evaluation failures
/// never surface here: the archive is returned even if no niche was filled.
pub fn minimize<F: QdFitness + ?Sized>(
    fitness: &F,
    bounds: &Bounds,
    desc_bounds: &Bounds,
    config: &DiversifierConfig,
    archive: Option<Archive>,
    sink: &dyn InfoSink,
) -> Result<Archive, ConfigError> {
    config.validate(bounds, desc_bounds)?;
    let start = Instant::now();
    let mut master = master_rng(config.random_seed);

    let mut archive = match archive {
        Some(archive) => {
            if archive.dim() != bounds.dim() || archive.desc_dim() != desc_bounds.dim() {
                return Err(ConfigError::ArchiveMismatch(format!(
                    "archive holds {}-dimensional solutions with {}-dimensional descriptors, \
                     run has {} and {}",
                    archive.dim(),
                    archive.desc_dim(),
                    bounds.dim(),
                    desc_bounds.dim()
                )));
            }
            archive
        }
        None => Archive::new(bounds.dim(), desc_bounds.dim(), config.niche_num),
    };
    if !archive.is_initialized() {
        archive
            .init_niches(
                desc_bounds,
                config.samples_per_niche,
                config.kmeans_iterations,
                &mut master,
            )
            .map_err(|err| ConfigError::ArchiveMismatch(err.to_string()))?;
        sink.info(&format!(
            "placed {} niche centers in {:.2} s",
            archive.capacity(),
            start.elapsed().as_secs_f64()
        ));
    }

    let guarded = GuardedFitness::new(fitness, desc_bounds.dim(), sink).with_archive(&archive);
    let counter = RetryCounter::new(config.retries());
    let rngs = worker_rngs(&mut master, config.workers());
    let started = run_workers(&archive, &guarded, bounds, &config.opt_params, &counter, rngs);

    archive.argsort();
    sink.info(&format!(
        "{started} attempts, {} evaluations, {} of {} niches occupied",
        guarded.evaluations(),
        archive.get_occupied(),
        archive.capacity()
    ));
    sink.info(&summary_line(
        &archive.best_ys(SUMMARY_SIZE),
        start.elapsed().as_secs_f64(),
    ));
    Ok(archive)
}

/// Run one worker per generator until `counter` is exhausted; returns the
/// number of attempts started.
///
/// A panicking attempt is logged and abandoned; its slot stays consumed
/// and the worker moves on to the next one.
pub fn run_workers<F: QdFitness + ?Sized>(
    archive: &Archive,
    fitness: &GuardedFitness<'_, F>,
    bounds: &Bounds,
    chain: &OptParamsChain,
    counter: &RetryCounter,
    rngs: Vec<StdRng>,
) -> usize {
    thread::scope(|s| {
        let handles: Vec<_> = rngs
            .into_iter()
            .enumerate()
            .map(|(id, mut rng)| {
                s.spawn(move || {
                    let mut attempts = 0usize;
                    while let Some(slot) = counter.try_acquire() {
                        attempts += 1;
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            run_chain(archive, fitness, bounds, chain, &mut rng)
                        }));
                        match result {
                            Ok(Ok(outcome)) => log::debug!(
                                "worker {id} attempt {slot}: {:?}, best {}",
                                outcome.stop,
                                outcome.best_y
                            ),
                            Ok(Err(err)) => {
                                log::warn!("worker {id} attempt {slot} rejected: {err}")
                            }
                            Err(_) => log::warn!("worker {id} attempt {slot} panicked"),
                        }
                    }
                    attempts
                })
            })
            .collect();

        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(attempts) => log::debug!("worker {id} finished after {attempts} attempts"),
                Err(_) => log::error!("worker {id} died"),
            }
        }
    });
    counter.value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::sink::NoopSink;
    use crate::compute::sink::tests::CollectSink;
    use crate::schema::{OptParams, SolverKind};

    fn sphere(x: &[f64]) -> (f64, Vec<f64>) {
        (x.iter().map(|v| v * v).sum(), vec![x[0], x[1]])
    }

    fn small_config(workers: usize, retries: usize) -> DiversifierConfig {
        DiversifierConfig {
            niche_num: 20,
            samples_per_niche: 10,
            workers: Some(workers),
            retries: Some(retries),
            random_seed: Some(7),
            opt_params: OptParams {
                popsize: 8,
                sigma: Some(0.3),
                max_evals: 400,
                stall_criterion: 10,
                ..OptParams::for_solver(SolverKind::Cma)
            }
            .into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_counter_stops_at_target() {
        let counter = RetryCounter::new(10);
        let claimed = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while counter.try_acquire().is_some() {
                        claimed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(counter.value(), 10);
        assert_eq!(claimed.load(Ordering::Relaxed), 10);
        assert_eq!(counter.try_acquire(), None);
    }

    #[test]
    fn test_run_workers_counter_bound() {
        let (retries, workers) = (7, 3);
        let bounds = Bounds::uniform(3, -1.0, 1.0);
        let archive = Archive::with_centers(3, 2, vec![vec![0.0, 0.0], vec![0.5, 0.5]]).unwrap();
        let f = sphere;
        let guarded = GuardedFitness::new(&f, 2, &NoopSink);
        let counter = RetryCounter::new(retries);
        let mut master = master_rng(Some(3));
        let started = run_workers(
            &archive,
            &guarded,
            &bounds,
            &small_config(workers, retries).opt_params,
            &counter,
            worker_rngs(&mut master, workers),
        );
        assert!((retries..retries + workers).contains(&started));
        assert!(archive.get_occupied() > 0);
    }

    #[test]
    fn test_single_niche_finds_optimum() {
        let bounds = Bounds::uniform(3, -5.0, 5.0);
        let desc_bounds = Bounds::uniform(1, -5.0, 5.0);
        let f = |x: &[f64]| (x.iter().map(|v| v * v).sum::<f64>(), vec![x[0]]);
        let config = DiversifierConfig {
            niche_num: 1,
            samples_per_niche: 5,
            workers: Some(2),
            retries: Some(4),
            random_seed: Some(11),
            opt_params: OptParams {
                popsize: 16,
                max_evals: 8000,
                ..OptParams::for_solver(SolverKind::Cma)
            }
            .into(),
            ..Default::default()
        };
        let archive = minimize(&f, &bounds, &desc_bounds, &config, None, &NoopSink).unwrap();
        assert_eq!(archive.get_occupied(), 1);
        assert!(archive.get(0) < 1e-6, "best {}", archive.get(0));
        let elite = archive.elite(0).unwrap();
        assert!(elite.x.iter().all(|v| v.abs() < 1e-2));
    }

    #[test]
    fn test_minimize_fills_niches() {
        let bounds = Bounds::uniform(3, -1.0, 1.0);
        let desc_bounds = Bounds::uniform(2, -1.0, 1.0);
        let archive =
            minimize(&sphere, &bounds, &desc_bounds, &small_config(2, 4), None, &NoopSink).unwrap();
        assert_eq!(archive.capacity(), 20);
        assert!(archive.get_occupied() > 5);
        let sorted = archive.sorted_niches();
        assert!(archive.get(sorted[0]) <= archive.get(sorted[1]));
    }

    #[test]
    fn test_run_reports_go_through_sink() {
        let bounds = Bounds::uniform(3, -1.0, 1.0);
        let desc_bounds = Bounds::uniform(2, -1.0, 1.0);
        let sink = CollectSink::default();
        minimize(&sphere, &bounds, &desc_bounds, &small_config(1, 1), None, &sink).unwrap();
        let lines = sink.lines.lock();
        assert!(lines.iter().any(|l| l.starts_with("placed 20 niche centers")));
        assert!(lines.iter().any(|l| l.starts_with("1 attempts")));
        assert!(lines.last().is_some_and(|l| l.starts_with("best ")));
    }

    #[test]
    fn test_single_worker_reproducible() {
        let bounds = Bounds::uniform(3, -1.0, 1.0);
        let desc_bounds = Bounds::uniform(2, -1.0, 1.0);
        let config = small_config(1, 2);
        let a = minimize(&sphere, &bounds, &desc_bounds, &config, None, &NoopSink).unwrap();
        let b = minimize(&sphere, &bounds, &desc_bounds, &config, None, &NoopSink).unwrap();
        assert_eq!(a.get_ys(), b.get_ys());
        assert_eq!(a.centers(), b.centers());
    }

    #[test]
    fn test_continue_archive() {
        let bounds = Bounds::uniform(3, -1.0, 1.0);
        let desc_bounds = Bounds::uniform(2, -1.0, 1.0);
        let config = small_config(2, 2);
        let first = minimize(&sphere, &bounds, &desc_bounds, &config, None, &NoopSink).unwrap();
        let before = first.get_ys();
        let centers = first.centers().to_vec();
        let second =
            minimize(&sphere, &bounds, &desc_bounds, &config, Some(first), &NoopSink).unwrap();
        assert_eq!(second.centers(), centers.as_slice());
        for (old, new) in before.iter().zip(second.get_ys()) {
            assert!(new <= *old);
        }

        let wrong = Archive::new(4, 2, 5);
        assert!(matches!(
            minimize(&sphere, &bounds, &desc_bounds, &config, Some(wrong), &NoopSink),
            Err(ConfigError::ArchiveMismatch(_))
        ));
    }

    #[test]
    fn test_failing_objective_still_returns_archive() {
        let bounds = Bounds::uniform(2, -1.0, 1.0);
        let desc_bounds = Bounds::uniform(2, -1.0, 1.0);
        let f = |_: &[f64]| -> (f64, Vec<f64>) { panic!("broken objective") };
        let archive =
            minimize(&f, &bounds, &desc_bounds, &small_config(2, 2), None, &NoopSink).unwrap();
        assert_eq!(archive.get_occupied(), 0);
    }
}
