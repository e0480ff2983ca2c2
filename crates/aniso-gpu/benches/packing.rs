//! Benchmarks for the host-side neighbor packers.
//!
//! The host reference packer runs on the host share of a split workload,
//! so its throughput matters, not just its correctness.

use aniso_core::{CompressedNeighborList, FormCode};
use aniso_gpu::{pack_host, unpack_host, PackedNeighbors};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Deterministic LCG; benchmarks must not depend on an RNG crate.
fn synthetic_list(n: usize, max_deg: usize, seed: u64) -> CompressedNeighborList {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        (state >> 16) as usize
    };
    let adjacency: Vec<Vec<i32>> = (0..n)
        .map(|i| {
            let deg = next() % (max_deg + 1);
            (0..deg)
                .map(|_| {
                    let mut j = next() % n;
                    if j == i {
                        j = (j + 1) % n;
                    }
                    j as i32
                })
                .collect()
        })
        .collect();
    CompressedNeighborList::from_adjacency(&adjacency)
}

fn bench_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("unpack_host");
    for n in [1_000usize, 10_000, 50_000] {
        let list = synthetic_list(n, 60, 12345);
        let mut packed = PackedNeighbors::new(n, 64);
        group.bench_with_input(BenchmarkId::from_parameter(n), &list, |b, list| {
            b.iter(|| unpack_host(black_box(list), &mut packed).unwrap());
        });
    }
    group.finish();
}

fn bench_filtered_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_host_filtered");
    for n in [1_000usize, 10_000] {
        let list = synthetic_list(n, 60, 6789);
        let types: Vec<i32> = (0..n).map(|i| (i % 2) as i32).collect();
        let form = vec![
            FormCode::EllipseEllipse as i32,
            FormCode::EllipseSphere as i32,
            FormCode::SphereEllipse as i32,
            FormCode::SphereSphere as i32,
        ];
        let mut packed = PackedNeighbors::new(n, 64);
        group.bench_with_input(BenchmarkId::from_parameter(n), &list, |b, list| {
            b.iter(|| {
                pack_host(
                    black_box(list),
                    &types,
                    &form,
                    2,
                    FormCode::EllipseSphere,
                    FormCode::EllipseSphere,
                    0,
                    n,
                    &mut packed,
                )
                .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_unpack, bench_filtered_pack);
criterion_main!(benches);
