//! Benchmark: bitmap scan primitives on a full 1440-bit group map.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pfs_alloc::{bitmap_count_free, bitmap_find_free};

/// Build a mostly-full group bitmap: 180 bytes (1440 bits), ~5% free bits
/// scattered in small clusters.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0xFF_u8; 180];
    let mut pos = 40_usize;
    while pos + 8 < 1440 {
        for i in pos..pos + 8 {
            bm[i / 8] &= !(1 << (i % 8));
        }
        pos += 160;
    }
    bm
}

fn bench_count_free(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("count_free_1440", |b| {
        b.iter(|| black_box(bitmap_count_free(black_box(&bm), 1440)));
    });
}

fn bench_find_free(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("find_free_1440", |b| {
        b.iter(|| black_box(bitmap_find_free(black_box(&bm), 1440, black_box(4))));
    });
}

criterion_group!(benches, bench_count_free, bench_find_free);
criterion_main!(benches);
