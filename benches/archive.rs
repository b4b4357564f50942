//! Benchmarks for the niche archive and the niche-relative transform.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;

use diversifier::{
    compute::{Archive, GuardedFitness, NoopSink, Problem, update_archive},
    schema::Bounds,
};

fn initialized_archive(capacity: usize, dim: usize) -> Archive {
    let mut rng = StdRng::seed_from_u64(42);
    let mut archive = Archive::new(dim, 2, capacity);
    archive
        .init_niches(&Bounds::uniform(2, 0.0, 1.0), 10, 20, &mut rng)
        .expect("fresh archive");
    archive
}

fn bench_index_of_niches(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_of_niches");

    for capacity in [100, 1000, 4000] {
        let archive = initialized_archive(capacity, 10);
        let mut rng = StdRng::seed_from_u64(7);
        let descs: Vec<Vec<f64>> = (0..1024)
            .map(|_| Bounds::uniform(2, 0.0, 1.0).sample(&mut rng))
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, _| {
                b.iter(|| archive.index_of_niches(black_box(&descs)));
            },
        );
    }

    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_archive");

    for popsize in [16, 32, 64] {
        let problem = Problem::Arm { joints: 10 };
        let archive = initialized_archive(1000, 10);
        let guarded = GuardedFitness::new(&problem, 2, &NoopSink).with_archive(&archive);
        let mut rng = StdRng::seed_from_u64(3);
        let xs: Vec<Vec<f64>> = (0..popsize)
            .map(|_| problem.bounds().sample(&mut rng))
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(popsize),
            &popsize,
            |b, _| {
                b.iter(|| update_archive(&archive, black_box(&xs), &guarded));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_index_of_niches, bench_transform);
criterion_main!(benches);
