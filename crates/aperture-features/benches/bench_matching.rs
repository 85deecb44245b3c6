use aperture_features::matcher::match_descriptors;
use criterion::{criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn random_descriptors(n: usize, seed: u64) -> Vec<[u8; 32]> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.random()).collect()
}

fn bench_match_descriptors(c: &mut Criterion) {
    let set1 = random_descriptors(1000, 1);
    let set2 = random_descriptors(1000, 2);

    c.bench_function("match_descriptors_1000x1000", |b| {
        b.iter(|| match_descriptors(&set1, &set2, Some(80), Some(0.8), true))
    });

    c.bench_function("match_descriptors_no_cross_check", |b| {
        b.iter(|| match_descriptors(&set1, &set2, Some(80), Some(0.8), false))
    });
}

criterion_group!(benches, bench_match_descriptors);
criterion_main!(benches);
