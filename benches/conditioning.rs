//! Throughput benchmarks for the conditioning pipeline and quality
//! estimator.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use entropy_forge::conditioning::{extract_block, von_neumann_debias, xor_fold};
use entropy_forge::quality::quick_quality;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

fn bench_extractor(c: &mut Criterion) {
    let mut group = c.benchmark_group("extractor");
    group.throughput(Throughput::Bytes(32));
    group.bench_function("block_256_byte_chunk", |b| {
        let chunk = vec![0x5Au8; 256];
        let mut state = [7u8; 32];
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            state = extract_block(&state, &chunk, counter, 1_700_000_000, &[3u8; 8]);
            black_box(state);
        });
    });
    group.finish();
}

fn bench_debias_and_fold(c: &mut Criterion) {
    let mut rng = ChaCha20Rng::seed_from_u64(21);
    let mut data = vec![0u8; 64 * 1024];
    rng.fill_bytes(&mut data);

    let mut group = c.benchmark_group("whitening");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("von_neumann_64k", |b| {
        b.iter(|| black_box(von_neumann_debias(black_box(&data))));
    });
    group.bench_function("xor_fold_64k_k4", |b| {
        b.iter(|| black_box(xor_fold(black_box(&data), 4)));
    });
    group.finish();
}

fn bench_quality(c: &mut Criterion) {
    let mut rng = ChaCha20Rng::seed_from_u64(33);
    let mut data = vec![0u8; 16 * 1024];
    rng.fill_bytes(&mut data);

    let mut group = c.benchmark_group("quality");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("quick_quality_16k", |b| {
        b.iter(|| black_box(quick_quality(black_box(&data), "bench")));
    });
    group.finish();
}

criterion_group!(benches, bench_extractor, bench_debias_and_fold, bench_quality);
criterion_main!(benches);
