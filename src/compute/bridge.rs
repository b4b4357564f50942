//! Hybrid refinement: run the classical retry over the archive's elites
//! and fold the improved solutions back into their niches.

use std::time::Instant;

use rayon::prelude::*;

use super::advretry::{Objective, Optimizer, Store, retry};
use super::archive::{Archive, ArchiveError};
use super::fitness::Evaluation;
use super::sink::{InfoSink, summary_line};
use crate::schema::{AdvretryConfig, Bounds, ConfigError};

/// Refine `archive` with [`retry`], starting from its occupied niches.
///
/// `descriptors` recomputes the descriptor of each retry result; results
/// with an unusable descriptor are skipped. Niches are only ever replaced
/// by strictly better solutions.
pub fn apply_advretry<D>(
    fitness: &Objective<'_>,
    descriptors: &D,
    bounds: &Bounds,
    archive: &Archive,
    optimizer: &dyn Optimizer,
    config: &AdvretryConfig,
    sink: &dyn InfoSink,
) -> Result<(), ConfigError>
where
    D: Fn(&[f64]) -> Vec<f64> + Sync + ?Sized,
{
    if archive.dim() != bounds.dim() {
        return Err(ConfigError::ArchiveMismatch(format!(
            "archive holds {}-dimensional solutions, bounds have {} dimensions",
            archive.dim(),
            bounds.dim()
        )));
    }
    if !archive.is_initialized() {
        return Err(ConfigError::ArchiveMismatch(
            ArchiveError::Uninitialized.to_string(),
        ));
    }
    let start = Instant::now();

    let store = Store::new(config.capacity.max(archive.get_occupied()));
    for elite in archive.elites() {
        store.add_result(elite.y, elite.x);
    }
    sink.info(&format!(
        "advretry starts from {} elites with {} retries",
        store.len(),
        config.num_retries
    ));
    retry(fitness, &store, optimizer, bounds, config, sink)?;

    let ys = store.get_ys();
    let xs = store.get_xs();
    let desc_dim = archive.desc_dim();
    let descs: Vec<Option<Vec<f64>>> = xs
        .par_iter()
        .map(|x| {
            let desc = descriptors(x);
            (desc.len() == desc_dim && desc.iter().all(|d| d.is_finite())).then_some(desc)
        })
        .collect();

    let mut inserted = 0;
    for ((y, x), desc) in ys.into_iter().zip(&xs).zip(descs) {
        let Some(desc) = desc else {
            continue;
        };
        let niche = archive.index_of_niche(&desc);
        if archive.set_if_better(niche, &Evaluation::new(y, desc), x) {
            inserted += 1;
        }
    }
    archive.argsort();

    sink.info(&format!(
        "advretry improved {inserted} niches, {} of {} occupied",
        archive.get_occupied(),
        archive.capacity()
    ));
    sink.info(&summary_line(
        &archive.best_ys(100),
        start.elapsed().as_secs_f64(),
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::advretry::{OptimizeResult, de_cma};
    use crate::compute::sink::NoopSink;
    use rand::rngs::StdRng;

    fn sphere(x: &[f64]) -> f64 {
        x.iter().map(|v| v * v).sum()
    }

    fn first_two(x: &[f64]) -> Vec<f64> {
        vec![x[0], x[1]]
    }

    /// Returns its guess unchanged.
    struct Idle;

    impl Optimizer for Idle {
        fn name(&self) -> String {
            "idle".to_string()
        }

        fn minimize(
            &self,
            fitness: &Objective<'_>,
            bounds: &Bounds,
            guess: Option<&[f64]>,
            _sdev: f64,
            _max_evals: usize,
            _rng: &mut StdRng,
        ) -> Result<OptimizeResult, ConfigError> {
            let x = guess.map_or_else(|| bounds.center(), <[f64]>::to_vec);
            Ok(OptimizeResult {
                y: fitness(&x),
                x,
                evaluations: 1,
            })
        }
    }

    fn seeded_archive() -> Archive {
        let centers = vec![
            vec![-1.0, -1.0],
            vec![1.0, -1.0],
            vec![-1.0, 1.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ];
        let archive = Archive::with_centers(3, 2, centers).unwrap();
        // Niches 2, 1 and 3; the central niche stays empty.
        for x in [[-0.5, 0.5, 1.0], [0.5, -0.5, 0.5], [1.0, 1.0, -1.0]] {
            let niche = archive.index_of_niche(&first_two(&x));
            archive.set(niche, &Evaluation::new(sphere(&x), first_two(&x)), &x);
        }
        archive
    }

    fn config(num_retries: usize) -> AdvretryConfig {
        AdvretryConfig {
            num_retries,
            workers: Some(2),
            min_evals: 200,
            random_seed: Some(4),
            ..Default::default()
        }
    }

    fn refine(
        archive: &Archive,
        descriptors: &(dyn Fn(&[f64]) -> Vec<f64> + Sync),
        optimizer: &dyn Optimizer,
        num_retries: usize,
    ) -> Result<(), ConfigError> {
        apply_advretry(
            &sphere,
            descriptors,
            &Bounds::uniform(3, -2.0, 2.0),
            archive,
            optimizer,
            &config(num_retries),
            &NoopSink,
        )
    }

    #[test]
    fn test_zero_retries_keeps_archive() {
        let archive = seeded_archive();
        let before = archive.get_ys();
        let occupied = archive.get_occupied();
        refine(&archive, &first_two, &de_cma(), 0).unwrap();
        assert_eq!(archive.get_ys(), before);
        assert_eq!(archive.get_occupied(), occupied);
    }

    #[test]
    fn test_idle_optimizer_never_degrades() {
        let archive = seeded_archive();
        let before = archive.get_ys();
        let occupied = archive.get_occupied();
        refine(&archive, &first_two, &Idle, 10).unwrap();
        for (old, new) in before.iter().zip(archive.get_ys()) {
            assert!(new <= *old);
        }
        assert!(archive.get_occupied() >= occupied);
    }

    #[test]
    fn test_retries_improve_archive() {
        let archive = seeded_archive();
        let best_before = archive.best_ys(1)[0];
        refine(&archive, &first_two, &de_cma(), 20).unwrap();
        let best_after = archive.best_ys(1)[0];
        assert!(best_after < best_before);
        // The optimum lands in the central niche.
        assert!(archive.get(4) < 1e-2);
        assert_eq!(archive.sorted_niches()[0], 4);
    }

    #[test]
    fn test_bad_descriptors_are_skipped() {
        let archive = seeded_archive();
        let before = archive.get_ys();
        let broken = |_: &[f64]| vec![f64::NAN, 0.0];
        refine(&archive, &broken, &de_cma(), 4).unwrap();
        assert_eq!(archive.get_ys(), before);
    }

    #[test]
    fn test_mismatched_bounds() {
        let archive = seeded_archive();
        assert!(matches!(
            apply_advretry(
                &sphere,
                &first_two,
                &Bounds::uniform(2, -2.0, 2.0),
                &archive,
                &de_cma(),
                &config(0),
                &NoopSink
            ),
            Err(ConfigError::ArchiveMismatch(_))
        ));
    }
}
