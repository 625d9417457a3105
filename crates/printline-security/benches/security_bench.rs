// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for artifact hashing and certificate identity
// extraction in the printline-security crate.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use printline_security::{common_name, hash_bytes};

/// Benchmark SHA-256 hashing at sizes from a small profile file to a
/// decimated mesh.
fn bench_artifact_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_bytes");
    for size in [1024usize, 64 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
        let data = vec![0x5Au8; size];
        group.bench_function(format!("{size} bytes"), |b| {
            b.iter(|| black_box(hash_bytes(black_box(&data))));
        });
    }
    group.finish();
}

/// Benchmark CN extraction on a certificate-shaped byte string that is not a
/// certificate (the common case while sweeping a subnet).
fn bench_common_name_rejects(c: &mut Criterion) {
    let junk = vec![0x30u8, 0x82, 0xFF, 0xFF, 0x01, 0x02, 0x03];
    c.bench_function("common_name (reject)", |b| {
        b.iter(|| black_box(common_name(black_box(&junk))));
    });
}

criterion_group!(benches, bench_artifact_hash, bench_common_name_rejects);
criterion_main!(benches);
