// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Allocator micro-benchmarks: steady-state churn and a fragmenting
// alloc/release interleave over one segment.

use criterion::{criterion_group, criterion_main, Criterion};

use mmcache::alloc::BlobAllocator;
use mmcache::types::MediaType;

const MIB: u64 = 1024 * 1024;

fn bench_churn(c: &mut Criterion) {
    let allocator = BlobAllocator::new(0, MediaType::Dram, 0x1000_0000, 256 * MIB);
    allocator.start();

    c.bench_function("alloc_release_64k", |b| {
        b.iter(|| {
            let blob = allocator.alloc(64 * 1024).unwrap();
            allocator.release(&blob.desc()).unwrap();
        })
    });
}

fn bench_fragmented(c: &mut Criterion) {
    let allocator = BlobAllocator::new(0, MediaType::Dram, 0x2000_0000, 256 * MIB);
    allocator.start();

    // Allocate a dense run, then punch holes: every other 64K blob is
    // released with live neighbours, so nothing coalesces and the free
    // set stays fragmented.
    let blobs: Vec<_> = (0..1024).map(|_| allocator.alloc(64 * 1024).unwrap()).collect();
    let mut held = Vec::new();
    for (i, blob) in blobs.into_iter().enumerate() {
        if i % 2 == 0 {
            held.push(blob);
        } else {
            allocator.release(&blob.desc()).unwrap();
        }
    }

    c.bench_function("alloc_release_64k_fragmented", |b| {
        b.iter(|| {
            let blob = allocator.alloc(64 * 1024).unwrap();
            allocator.release(&blob.desc()).unwrap();
        })
    });

    for blob in held {
        allocator.release(&blob.desc()).unwrap();
    }
}

criterion_group!(benches, bench_churn, bench_fragmented);
criterion_main!(benches);
