// SPDX-License-Identifier: MIT
//! Benchmarks for record decoding/encoding and cache container writes

use criterion::{criterion_group, criterion_main, Criterion};
use mx_dataset::{
    CacheContainer, CompressionConfig, ContainerWriter, DecodingPlan, SectionType, Slot,
};
use std::hint::black_box;

/// Plan of a heating network record: timestamp, version, snapshot type,
/// a few scalars and 41 vector channels of 32 elements
fn network_plan() -> DecodingPlan {
    let mut tokens = vec!["C32", "C40", "C4", "R", "R", "R", "R"];
    tokens.extend(std::iter::repeat("R32").take(41));
    DecodingPlan::from_packed(&tokens.join(" ")).unwrap()
}

fn network_record(plan: &DecodingPlan) -> Vec<u8> {
    let mut record = vec![b' '; plan.record_length()];
    for (i, chunk) in record[76..].chunks_exact_mut(4).enumerate() {
        chunk.copy_from_slice(&(i as f32 * 0.25).to_le_bytes());
    }
    record
}

fn benchmark_decode(c: &mut Criterion) {
    let plan = network_plan();
    let record = network_record(&plan);

    c.bench_function("record_decode", |b| {
        b.iter(|| {
            let _slots = plan.decode(black_box(&record)).unwrap();
        })
    });
}

fn benchmark_encode(c: &mut Criterion) {
    let plan = network_plan();
    let slots: Vec<Slot> = plan.decode(&network_record(&plan)).unwrap();

    c.bench_function("record_encode", |b| {
        b.iter(|| {
            let _record = plan.encode(black_box(&slots)).unwrap();
        })
    });
}

fn benchmark_container(c: &mut Criterion) {
    let plan = network_plan();
    let scalars: Vec<u8> = (0..10_000)
        .flat_map(|i| network_record(&plan).into_iter().take(80 + i % 7))
        .collect();

    for (name, config) in [
        ("container_write_smart", CompressionConfig::smart()),
        ("container_write_never", CompressionConfig::never()),
    ] {
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut writer = ContainerWriter::with_config(config);
                writer
                    .add_section(SectionType::Scalars, black_box(scalars.clone()))
                    .unwrap();
                let _data = writer.finish();
            })
        });
    }

    let mut writer = ContainerWriter::new();
    writer.add_section(SectionType::Scalars, scalars).unwrap();
    let data = writer.finish();
    c.bench_function("container_read_section", |b| {
        b.iter(|| {
            let container = CacheContainer::from_vec(black_box(data.clone())).unwrap();
            let _section = container.section(SectionType::Scalars).unwrap();
        })
    });
}

criterion_group!(
    benches,
    benchmark_decode,
    benchmark_encode,
    benchmark_container
);
criterion_main!(benches);
