//! Centroidal Voronoi tessellation of descriptor space.
//!
//! Niche centers are placed by clustering uniform random samples with
//! Lloyd's k-means; nearest-center queries go through a static k-d tree.

use rand::Rng;
use rand::seq::index;
use rayon::prelude::*;

use crate::schema::Bounds;

/// Squared Euclidean distance.
#[inline]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone)]
struct Node {
    point: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Static k-d tree over a fixed point set.
///
/// Nearest queries break distance ties toward the lowest point index.
#[derive(Debug, Clone, Default)]
pub struct KdTree {
    points: Vec<Vec<f64>>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl KdTree {
    /// Build a tree over `points`; all points must share one dimension.
    pub fn build(points: Vec<Vec<f64>>) -> Self {
        let dim = points.first().map_or(0, Vec::len);
        let mut order: Vec<usize> = (0..points.len()).collect();
        let mut tree = Self {
            points,
            nodes: Vec::new(),
            root: None,
        };
        if dim > 0 {
            tree.root = tree.build_node(&mut order, 0, dim);
        }
        tree
    }

    fn build_node(&mut self, order: &mut [usize], depth: usize, dim: usize) -> Option<usize> {
        if order.is_empty() {
            return None;
        }
        let axis = depth % dim;
        let mid = order.len() / 2;
        let points = &self.points;
        order.select_nth_unstable_by(mid, |&a, &b| {
            points[a][axis]
                .total_cmp(&points[b][axis])
                .then(a.cmp(&b))
        });
        let point = order[mid];
        let (lower, upper) = order.split_at_mut(mid);
        let left = self.build_node(lower, depth + 1, dim);
        let right = self.build_node(&mut upper[1..], depth + 1, dim);
        self.nodes.push(Node {
            point,
            axis,
            left,
            right,
        });
        Some(self.nodes.len() - 1)
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Indexed points, in their original order.
    pub fn points(&self) -> &[Vec<f64>] {
        &self.points
    }

    /// Index of the point nearest to `query`.
    ///
    /// Returns 0 for an empty tree or a query without a defined distance (NaN).
    pub fn nearest(&self, query: &[f64]) -> usize {
        let mut best = (f64::INFINITY, usize::MAX);
        if let Some(root) = self.root {
            self.search(root, query, &mut best);
        }
        if best.1 == usize::MAX { 0 } else { best.1 }
    }

    fn search(&self, node: usize, query: &[f64], best: &mut (f64, usize)) {
        let n = &self.nodes[node];
        let p = &self.points[n.point];
        let d = squared_distance(p, query);
        if d < best.0 || (d == best.0 && n.point < best.1) {
            *best = (d, n.point);
        }
        let diff = query[n.axis] - p[n.axis];
        let (near, far) = if diff <= 0.0 {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };
        if let Some(child) = near {
            self.search(child, query, best);
        }
        // `<=` keeps equidistant candidates reachable for the index tie-break.
        if let Some(child) = far
            && diff * diff <= best.0
        {
            self.search(child, query, best);
        }
    }
}

/// Place `k` centers inside `bounds` by clustering `k * samples_per_niche`
/// uniform samples for at most `max_iter` Lloyd iterations.
pub fn cvt_centers<R: Rng + ?Sized>(
    bounds: &Bounds,
    k: usize,
    samples_per_niche: usize,
    max_iter: usize,
    rng: &mut R,
) -> Vec<Vec<f64>> {
    let n = k * samples_per_niche.max(1);
    let samples: Vec<Vec<f64>> = (0..n).map(|_| bounds.sample(rng)).collect();
    let mut centers: Vec<Vec<f64>> = index::sample(rng, n, k)
        .into_iter()
        .map(|i| samples[i].clone())
        .collect();

    let mut assignment = vec![usize::MAX; n];
    for iteration in 0..max_iter {
        let tree = KdTree::build(centers.clone());
        let next: Vec<usize> = samples.par_iter().map(|s| tree.nearest(s)).collect();
        let changed = next.iter().zip(&assignment).filter(|(a, b)| a != b).count();
        assignment = next;
        centers = recompute_centers(&samples, &assignment, &centers);
        log::debug!("cvt iteration {iteration}: {changed} reassigned samples");
        if changed == 0 {
            break;
        }
    }
    centers
}

/// Cluster means; empty clusters take over the samples farthest from their centers.
fn recompute_centers(
    samples: &[Vec<f64>],
    assignment: &[usize],
    centers: &[Vec<f64>],
) -> Vec<Vec<f64>> {
    let dim = centers.first().map_or(0, Vec::len);
    let mut sums = vec![vec![0.0; dim]; centers.len()];
    let mut counts = vec![0usize; centers.len()];
    for (sample, &c) in samples.iter().zip(assignment) {
        counts[c] += 1;
        for (s, v) in sums[c].iter_mut().zip(sample) {
            *s += v;
        }
    }

    let empty: Vec<usize> = (0..centers.len()).filter(|&c| counts[c] == 0).collect();
    let mut far: Vec<usize> = Vec::new();
    if !empty.is_empty() {
        let mut by_distance: Vec<(f64, usize)> = samples
            .iter()
            .zip(assignment)
            .enumerate()
            .map(|(i, (s, &c))| (squared_distance(s, &centers[c]), i))
            .collect();
        by_distance.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        far = by_distance.into_iter().map(|(_, i)| i).collect();
    }

    let mut far_iter = far.into_iter();
    sums.into_iter()
        .zip(counts)
        .enumerate()
        .map(|(c, (sum, count))| {
            if count > 0 {
                sum.into_iter().map(|s| s / count as f64).collect()
            } else {
                far_iter
                    .next()
                    .map_or_else(|| centers[c].clone(), |i| samples[i].clone())
            }
        })
        .collect()
}
