//! Niche-relative objective: what a wrapped solver is told.
//!
//! Instead of absolute fitness the solver sees each candidate's improvement
//! over the elite of the niche it lands in, which drives it to expand and
//! refine all niches instead of collapsing onto one optimum.

use super::archive::Archive;
use super::fitness::{GuardedFitness, QdFitness};

/// Added to the population's worst finite fitness to stand in for the
/// elite of an unoccupied niche.
pub const UNOCCUPIED_MARGIN: f64 = 1e-9;

/// Output of one transformed generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    /// Fitness relative to the niche elite; negative means improvement.
    pub diff: Vec<f64>,
    /// Raw fitness values, never told to the solver.
    pub ys: Vec<f64>,
    /// Niches taken over by a candidate of this generation.
    pub improved: usize,
}

/// Elite value assumed for unoccupied niches in a generation with fitness `ys`.
pub fn unoccupied_value(ys: &[f64]) -> f64 {
    let max = ys
        .iter()
        .copied()
        .filter(|y| y.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        0.0
    } else {
        (max + UNOCCUPIED_MARGIN).max(max.next_up())
    }
}

/// Evaluate `xs`, insert every niche improvement into the archive and
/// return the niche-relative values.
pub fn update_archive<F: QdFitness + ?Sized>(
    archive: &Archive,
    xs: &[Vec<f64>],
    fitness: &GuardedFitness<'_, F>,
) -> Transformed {
    let evaluations: Vec<_> = xs.iter().map(|x| fitness.eval(x)).collect();
    let ys: Vec<f64> = evaluations.iter().map(|e| e.y).collect();
    let descs: Vec<&[f64]> = evaluations.iter().map(|e| e.desc.as_slice()).collect();
    let niches = archive.index_of_niches(&descs);
    let substitute = unoccupied_value(&ys);

    // All elites are read before the first insertion.
    let diff: Vec<f64> = niches
        .iter()
        .zip(&ys)
        .map(|(&niche, y)| {
            let old = archive.get(niche);
            y - if old == f64::INFINITY { substitute } else { old }
        })
        .collect();

    let mut improved = 0;
    for (((evaluation, x), &niche), d) in evaluations.iter().zip(xs).zip(&niches).zip(&diff) {
        archive.record(niche, evaluation.y);
        if *d < 0.0 && archive.set_if_better(niche, evaluation, x) {
            improved += 1;
        }
    }

    Transformed { diff, ys, improved }
}
