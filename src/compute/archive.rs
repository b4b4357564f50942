//! Niche archive: one elite per Voronoi cell of descriptor space.
//!
//! The archive is shared by reference between all workers of a run. Each
//! niche sits behind its own lock, so updates to different niches never
//! contend and no operation needs more than one niche at a time.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::cvt::{KdTree, cvt_centers};
use super::fitness::Evaluation;
use crate::schema::Bounds;

/// Running statistics of all fitness values observed in a niche.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicheStats {
    /// Number of finite observations.
    pub count: u64,
    /// Mean of the observations.
    pub mean: f64,
    /// Sum of squared deviations from the mean (Welford).
    m2: f64,
    /// Smallest observation.
    pub min: Option<f64>,
    /// Largest observation.
    pub max: Option<f64>,
}

impl NicheStats {
    /// Add one observation; non-finite values are ignored.
    pub fn record(&mut self, y: f64) {
        if !y.is_finite() {
            return;
        }
        self.count += 1;
        let delta = y - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (y - self.mean);
        self.min = Some(self.min.map_or(y, |m| m.min(y)));
        self.max = Some(self.max.map_or(y, |m| m.max(y)));
    }

    /// Population standard deviation.
    pub fn stdev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone)]
struct Niche {
    y: f64,
    x: Vec<f64>,
    desc: Vec<f64>,
    stats: NicheStats,
}

impl Niche {
    fn empty(dim: usize, desc_dim: usize) -> Self {
        Self {
            y: f64::INFINITY,
            x: vec![0.0; dim],
            desc: vec![0.0; desc_dim],
            stats: NicheStats::default(),
        }
    }

    fn is_occupied(&self) -> bool {
        self.y < f64::INFINITY
    }
}

/// An occupied niche's elite.
#[derive(Debug, Clone, PartialEq)]
pub struct Elite {
    pub niche: usize,
    pub y: f64,
    pub x: Vec<f64>,
    pub desc: Vec<f64>,
}

/// Fixed-capacity store of one elite per niche.
pub struct Archive {
    dim: usize,
    desc_dim: usize,
    capacity: usize,
    /// Niche centers; empty until initialized.
    centers: KdTree,
    niches: Vec<Mutex<Niche>>,
    occupied: AtomicUsize,
    /// Niche indices, ascending by fitness as of the last `argsort`.
    order: RwLock<Vec<usize>>,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("dim", &self.dim)
            .field("desc_dim", &self.desc_dim)
            .field("capacity", &self.capacity)
            .field("occupied", &self.get_occupied())
            .finish()
    }
}

impl Archive {
    /// Create an archive whose niche centers are not placed yet.
    pub fn new(dim: usize, desc_dim: usize, capacity: usize) -> Self {
        Self {
            dim,
            desc_dim,
            capacity,
            centers: KdTree::default(),
            niches: (0..capacity)
                .map(|_| Mutex::new(Niche::empty(dim, desc_dim)))
                .collect(),
            occupied: AtomicUsize::new(0),
            order: RwLock::new((0..capacity).collect()),
        }
    }

    /// Create an archive with the given niche centers.
    pub fn with_centers(
        dim: usize,
        desc_dim: usize,
        centers: Vec<Vec<f64>>,
    ) -> Result<Self, ArchiveError> {
        if centers.is_empty() {
            return Err(ArchiveError::DimensionMismatch(
                "at least one niche center is required".to_string(),
            ));
        }
        if let Some(c) = centers.iter().find(|c| c.len() != desc_dim) {
            return Err(ArchiveError::DimensionMismatch(format!(
                "center has {} entries, descriptor dimension is {desc_dim}",
                c.len()
            )));
        }
        let mut archive = Self::new(dim, desc_dim, centers.len());
        archive.centers = KdTree::build(centers);
        Ok(archive)
    }

    /// Place the niche centers by centroidal Voronoi tessellation of
    /// `capacity * samples_per_niche` uniform samples in `desc_bounds`.
    pub fn init_niches<R: Rng + ?Sized>(
        &mut self,
        desc_bounds: &Bounds,
        samples_per_niche: usize,
        kmeans_iterations: usize,
        rng: &mut R,
    ) -> Result<(), ArchiveError> {
        if self.is_initialized() {
            return Err(ArchiveError::AlreadyInitialized);
        }
        if desc_bounds.dim() != self.desc_dim {
            return Err(ArchiveError::DimensionMismatch(format!(
                "descriptor bounds have {} dimensions, archive has {}",
                desc_bounds.dim(),
                self.desc_dim
            )));
        }
        let centers = cvt_centers(
            desc_bounds,
            self.capacity,
            samples_per_niche,
            kmeans_iterations,
            rng,
        );
        self.centers = KdTree::build(centers);
        Ok(())
    }

    /// Whether niche centers are in place.
    pub fn is_initialized(&self) -> bool {
        self.centers.len() == self.capacity && self.capacity > 0
    }

    /// Number of niches.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Decision-space dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Descriptor-space dimension.
    pub fn desc_dim(&self) -> usize {
        self.desc_dim
    }

    /// Niche centers, by niche index.
    pub fn centers(&self) -> &[Vec<f64>] {
        self.centers.points()
    }

    /// Number of niches holding an elite.
    pub fn get_occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    /// Niche of a single descriptor.
    pub fn index_of_niche(&self, desc: &[f64]) -> usize {
        debug_assert!(self.is_initialized(), "niche lookup before init_niches");
        self.centers.nearest(desc)
    }

    /// Nearest-center niche for every descriptor; ties go to the lowest index.
    pub fn index_of_niches<D: AsRef<[f64]>>(&self, descs: &[D]) -> Vec<usize> {
        descs
            .iter()
            .map(|d| self.index_of_niche(d.as_ref()))
            .collect()
    }

    /// Stored fitness, `+inf` when unoccupied.
    pub fn get(&self, niche: usize) -> f64 {
        self.niches[niche].lock().y
    }

    /// Elite of an occupied niche.
    pub fn elite(&self, niche: usize) -> Option<Elite> {
        let n = self.niches[niche].lock();
        n.is_occupied().then(|| Elite {
            niche,
            y: n.y,
            x: n.x.clone(),
            desc: n.desc.clone(),
        })
    }

    /// Overwrite a niche unconditionally.
    ///
    /// Callers decide whether the update is an improvement; two workers
    /// calling this for the same niche may lose the better write. Use
    /// [`set_if_better`](Self::set_if_better) to compare under the lock.
    pub fn set(&self, niche: usize, evaluation: &Evaluation, x: &[f64]) {
        let mut n = self.niches[niche].lock();
        self.overwrite(&mut n, evaluation, x);
    }

    /// Store the triple only if `evaluation.y` beats the current elite.
    pub fn set_if_better(&self, niche: usize, evaluation: &Evaluation, x: &[f64]) -> bool {
        let mut n = self.niches[niche].lock();
        if evaluation.y < n.y {
            self.overwrite(&mut n, evaluation, x);
            true
        } else {
            false
        }
    }

    fn overwrite(&self, n: &mut Niche, evaluation: &Evaluation, x: &[f64]) {
        let was_occupied = n.is_occupied();
        n.y = evaluation.y;
        n.x.clear();
        n.x.extend_from_slice(x);
        n.desc.clear();
        n.desc.extend_from_slice(&evaluation.desc);
        match (was_occupied, n.is_occupied()) {
            (false, true) => {
                self.occupied.fetch_add(1, Ordering::AcqRel);
            }
            (true, false) => {
                self.occupied.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    /// Add a fitness observation to the niche statistics.
    pub fn record(&self, niche: usize, y: f64) {
        self.niches[niche].lock().stats.record(y);
    }

    /// Statistics of the fitness values observed in a niche.
    pub fn stats(&self, niche: usize) -> NicheStats {
        self.niches[niche].lock().stats.clone()
    }

    /// Fitness of every niche, by niche index.
    pub fn get_ys(&self) -> Vec<f64> {
        self.niches.iter().map(|n| n.lock().y).collect()
    }

    /// Solution of every niche, by niche index (zeros when unoccupied).
    pub fn get_xs(&self) -> Vec<Vec<f64>> {
        self.niches.iter().map(|n| n.lock().x.clone()).collect()
    }

    /// Descriptor of every niche, by niche index (zeros when unoccupied).
    pub fn get_descriptors(&self) -> Vec<Vec<f64>> {
        self.niches.iter().map(|n| n.lock().desc.clone()).collect()
    }

    /// All occupied niches' elites, by niche index.
    pub fn elites(&self) -> Vec<Elite> {
        (0..self.capacity).filter_map(|i| self.elite(i)).collect()
    }

    /// Re-sort the niche order by ascending fitness (ties by niche index).
    pub fn argsort(&self) {
        let ys = self.get_ys();
        let mut order: Vec<usize> = (0..self.capacity).collect();
        order.sort_by(|&a, &b| ys[a].total_cmp(&ys[b]).then(a.cmp(&b)));
        *self.order.write() = order;
    }

    /// Niche indices in the order of the last [`argsort`](Self::argsort).
    pub fn sorted_niches(&self) -> Vec<usize> {
        self.order.read().clone()
    }

    /// The `n` smallest stored fitness values, ascending.
    pub fn best_ys(&self, n: usize) -> Vec<f64> {
        let mut ys = self.get_ys();
        ys.sort_by(f64::total_cmp);
        ys.truncate(n);
        ys
    }

    /// Serializable copy of centers and niches.
    pub fn snapshot(&self) -> ArchiveSnapshot {
        ArchiveSnapshot {
            dim: self.dim,
            desc_dim: self.desc_dim,
            centers: self.centers().to_vec(),
            niches: self
                .niches
                .iter()
                .map(|n| {
                    let n = n.lock();
                    NicheRecord {
                        y: n.is_occupied().then_some(n.y),
                        x: n.x.clone(),
                        desc: n.desc.clone(),
                        stats: n.stats.clone(),
                    }
                })
                .collect(),
        }
    }

    /// Rebuild an archive from a snapshot.
    pub fn from_snapshot(snapshot: ArchiveSnapshot) -> Result<Self, ArchiveError> {
        if snapshot.niches.len() != snapshot.centers.len() {
            return Err(ArchiveError::DimensionMismatch(format!(
                "{} niches for {} centers",
                snapshot.niches.len(),
                snapshot.centers.len()
            )));
        }
        let archive = Self::with_centers(snapshot.dim, snapshot.desc_dim, snapshot.centers)?;
        for (i, record) in snapshot.niches.into_iter().enumerate() {
            let mut n = archive.niches[i].lock();
            n.stats = record.stats;
            if let Some(y) = record.y {
                if record.x.len() != archive.dim || record.desc.len() != archive.desc_dim {
                    return Err(ArchiveError::DimensionMismatch(format!(
                        "niche {i} holds x of length {} and descriptor of length {}",
                        record.x.len(),
                        record.desc.len()
                    )));
                }
                archive.overwrite(&mut n, &Evaluation::new(y, record.desc), &record.x);
            }
        }
        archive.argsort();
        Ok(archive)
    }

    /// Write the archive as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        if !self.is_initialized() {
            return Err(ArchiveError::Uninitialized);
        }
        let json = serde_json::to_string(&self.snapshot())?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read an archive written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let content = fs::read_to_string(path)?;
        let snapshot: ArchiveSnapshot = serde_json::from_str(&content)?;
        Self::from_snapshot(snapshot)
    }
}

/// Continuation format: fixed centers plus per-niche elites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    pub dim: usize,
    pub desc_dim: usize,
    pub centers: Vec<Vec<f64>>,
    pub niches: Vec<NicheRecord>,
}

/// One niche of a snapshot; `y` is `None` for an unoccupied niche.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicheRecord {
    pub y: Option<f64>,
    pub x: Vec<f64>,
    pub desc: Vec<f64>,
    #[serde(default)]
    pub stats: NicheStats,
}

/// Archive errors.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("Niche centers are already initialized")]
    AlreadyInitialized,
    #[error("Niche centers are not initialized")]
    Uninitialized,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    fn grid_archive() -> Archive {
        // Four niches at the corners of the unit square.
        let centers = vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 1.0],
        ];
        Archive::with_centers(3, 2, centers).unwrap()
    }

    #[test]
    fn test_init_niches() {
        let mut archive = Archive::new(4, 2, 50);
        assert!(!archive.is_initialized());
        let mut rng = StdRng::seed_from_u64(1);
        let desc_bounds = Bounds::uniform(2, 0.0, 1.0);
        archive.init_niches(&desc_bounds, 10, 20, &mut rng).unwrap();
        assert!(archive.is_initialized());
        assert_eq!(archive.centers().len(), 50);
        assert!(matches!(
            archive.init_niches(&desc_bounds, 10, 20, &mut rng),
            Err(ArchiveError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_init_rejects_wrong_descriptor_bounds() {
        let mut archive = Archive::new(4, 2, 5);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            archive.init_niches(&Bounds::uniform(3, 0.0, 1.0), 10, 20, &mut rng),
            Err(ArchiveError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_index_of_niches() {
        let archive = grid_archive();
        let niches = archive.index_of_niches(&[
            vec![0.1, 0.1],
            vec![0.9, 0.2],
            vec![0.2, 0.8],
            vec![5.0, 5.0],
            vec![0.5, 0.5],
        ]);
        assert_eq!(niches, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_get_set() {
        let archive = grid_archive();
        assert_eq!(archive.get(2), f64::INFINITY);
        assert_eq!(archive.get_occupied(), 0);

        archive.set(2, &Evaluation::new(5.0, vec![0.1, 0.9]), &[1.0, 2.0, 3.0]);
        assert_eq!(archive.get(2), 5.0);
        assert_eq!(archive.get_occupied(), 1);

        assert!(!archive.set_if_better(2, &Evaluation::new(6.0, vec![0.0, 1.0]), &[0.0; 3]));
        assert!(archive.set_if_better(2, &Evaluation::new(4.0, vec![0.0, 1.0]), &[9.0; 3]));
        assert_eq!(archive.get_occupied(), 1);

        let elite = archive.elite(2).unwrap();
        assert_eq!(elite.y, 4.0);
        assert_eq!(elite.x, vec![9.0; 3]);
        assert_eq!(elite.desc, vec![0.0, 1.0]);
        assert!(archive.elite(0).is_none());

        let ys = archive.get_ys();
        assert_eq!(ys.len(), 4);
        assert_eq!(ys[2], 4.0);
        assert_eq!(archive.get_xs()[0], vec![0.0; 3]);
        assert_eq!(archive.get_descriptors()[2], vec![0.0, 1.0]);
    }

    #[test]
    fn test_argsort() {
        let archive = grid_archive();
        archive.set(3, &Evaluation::new(1.0, vec![1.0, 1.0]), &[0.0; 3]);
        archive.set(1, &Evaluation::new(-2.0, vec![1.0, 0.0]), &[0.0; 3]);
        archive.argsort();
        assert_eq!(archive.sorted_niches(), vec![1, 3, 0, 2]);
        assert_eq!(archive.best_ys(2), vec![-2.0, 1.0]);
        // Centers are untouched by sorting.
        assert_eq!(archive.index_of_niche(&[1.0, 0.0]), 1);
    }

    #[test]
    fn test_stats() {
        let archive = grid_archive();
        for y in [1.0, 3.0, f64::INFINITY, 5.0] {
            archive.record(0, y);
        }
        let stats = archive.stats(0);
        assert_eq!(stats.count, 3);
        assert!((stats.mean - 3.0).abs() < 1e-12);
        assert!((stats.stdev() - (8.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(stats.min, Some(1.0));
        assert_eq!(stats.max, Some(5.0));
        assert_eq!(archive.stats(1), NicheStats::default());
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.json");

        let archive = grid_archive();
        archive.set(1, &Evaluation::new(0.5, vec![0.9, 0.1]), &[1.0, 2.0, 3.0]);
        archive.record(1, 0.5);
        archive.save(&path).unwrap();

        // Niches 0, 2 and 3 were never visited.
        let json = std::fs::read_to_string(&path).unwrap();
        assert!(!json.contains("Infinity"));

        let loaded = Archive::load(&path).unwrap();
        assert_eq!(loaded.capacity(), 4);
        assert_eq!(loaded.get_occupied(), 1);
        assert_eq!(loaded.get(1), 0.5);
        assert_eq!(loaded.get(0), f64::INFINITY);
        assert_eq!(loaded.centers(), archive.centers());
        assert_eq!(loaded.elite(1), archive.elite(1));
        assert_eq!(loaded.stats(1).count, 1);
        assert_eq!(loaded.stats(1).min, Some(0.5));
        assert_eq!(loaded.stats(0), NicheStats::default());
        assert!(loaded.is_initialized());

        // A reloaded archive saves and loads again.
        loaded.save(&path).unwrap();
        let reloaded = Archive::load(&path).unwrap();
        assert_eq!(reloaded.get_ys(), archive.get_ys());
    }

    #[test]
    fn test_save_load_fresh_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.json");
        let archive = Archive::with_centers(1, 1, vec![vec![0.0], vec![1.0]]).unwrap();
        archive.save(&path).unwrap();
        let loaded = Archive::load(&path).unwrap();
        assert_eq!(loaded.get_occupied(), 0);
        assert_eq!(loaded.capacity(), 2);
        assert_eq!(loaded.stats(1), NicheStats::default());
    }

    #[test]
    fn test_save_requires_centers() {
        let dir = tempdir().unwrap();
        let archive = Archive::new(1, 1, 3);
        assert!(matches!(
            archive.save(dir.path().join("none.json")),
            Err(ArchiveError::Uninitialized)
        ));
    }

    #[test]
    fn test_load_rejects_inconsistent_snapshot() {
        let mut snapshot = grid_archive().snapshot();
        snapshot.niches.pop();
        assert!(Archive::from_snapshot(snapshot).is_err());
    }

    #[test]
    fn test_concurrent_updates() {
        let archive = grid_archive();
        std::thread::scope(|s| {
            for t in 0..4 {
                let archive = &archive;
                s.spawn(move || {
                    for i in 0..1000 {
                        let y = ((i * 7 + t * 13) % 997) as f64;
                        archive.set_if_better(i % 4, &Evaluation::new(y, vec![0.0, 0.0]), &[y; 3]);
                    }
                });
            }
        });
        assert_eq!(archive.get_occupied(), 4);
        for niche in 0..4 {
            assert_eq!(archive.elite(niche).unwrap().x[0], archive.get(niche));
        }
    }

    proptest! {
        #[test]
        fn prop_niche_index_in_range(
            d in prop::collection::vec(-1e6f64..1e6, 2),
            capacity in 1usize..30,
            seed in any::<u64>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut archive = Archive::new(1, 2, capacity);
            archive.init_niches(&Bounds::uniform(2, -1.0, 1.0), 3, 5, &mut rng).unwrap();
            let niche = archive.index_of_niches(&[d])[0];
            prop_assert!(niche < capacity);
        }

        #[test]
        fn prop_stored_fitness_is_minimum_offered(
            updates in prop::collection::vec((0usize..4, -100.0f64..100.0), 1..200),
        ) {
            let archive = grid_archive();
            let mut expected = [f64::INFINITY; 4];
            for (niche, y) in &updates {
                let before = archive.get(*niche);
                archive.set_if_better(*niche, &Evaluation::new(*y, vec![0.0, 0.0]), &[*y; 3]);
                prop_assert!(archive.get(*niche) <= before);
                expected[*niche] = expected[*niche].min(*y);
            }
            for niche in 0..4 {
                prop_assert_eq!(archive.get(niche), expected[niche]);
            }
            let occupied = expected.iter().filter(|y| y.is_finite()).count();
            prop_assert_eq!(archive.get_occupied(), occupied);
        }
    }
}
