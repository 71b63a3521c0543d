//! Chunker throughput benchmarks.

#![allow(missing_docs)]

use criterion::{Criterion, criterion_group, criterion_main};
use graphtog::chunking::Chunker;
use graphtog::config::ChunkingConfig;
use std::hint::black_box;

fn synthetic_document(paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|i| {
            format!(
                "Paragraph {i} discusses the relationship between organizations, \
                 people, and places. It mentions Entity{i} working with Partner{i} \
                 on a project located in City{i}. The collaboration started years \
                 ago and continues to produce results."
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn bench_chunking(c: &mut Criterion) {
    let small = synthetic_document(20);
    let large = synthetic_document(500);
    let chunker = Chunker::with_defaults();
    let tight = Chunker::new(ChunkingConfig {
        target_tokens: 200,
        overlap_tokens: 50,
        min_tokens: 20,
    })
    .unwrap_or_else(|_| Chunker::with_defaults());

    let mut group = c.benchmark_group("chunking");
    group.bench_function("small_defaults", |b| {
        b.iter(|| chunker.chunk(black_box(&small)));
    });
    group.bench_function("large_defaults", |b| {
        b.iter(|| chunker.chunk(black_box(&large)));
    });
    group.bench_function("large_tight_chunks", |b| {
        b.iter(|| tight.chunk(black_box(&large)));
    });
    group.finish();
}

criterion_group!(benches, bench_chunking);
criterion_main!(benches);
