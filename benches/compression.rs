//! Benchmarks for input bundle compression
//!
//! Run with: cargo bench --bench compression
//!
//! Inputs travel as eight-byte records, XOR-ed against the last acknowledged record and
//! run-length encoded. The scenarios mimic how real players press buttons.

// Allow benchmark-specific patterns
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::print_stdout
)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rollback_session::network::compression::{decode, encode};
use std::hint::black_box;

/// Nobody touches the controller.
fn idle_inputs(frames: usize) -> Vec<i64> {
    vec![0; frames]
}

/// A button press every five frames.
fn active_inputs(frames: usize) -> Vec<i64> {
    (0..frames)
        .map(|i| if i % 5 == 0 { 1 << (i % 8) } else { 0 })
        .collect()
}

/// Button changes on half the frames and a direction every third.
fn fighting_game_inputs(frames: usize) -> Vec<i64> {
    (0..frames)
        .map(|i| {
            let buttons = if i % 2 == 0 { ((i * 7) % 256) as i64 } else { 0 };
            let stick = if i % 3 == 0 { ((i * 13) % 16) as i64 } else { 0 };
            buttons | stick << 8
        })
        .collect()
}

/// Smooth analog stick movement packed into two bytes.
fn analog_inputs(frames: usize) -> Vec<i64> {
    (0..frames)
        .map(|i| {
            let angle = i as f32 * 0.1;
            let x = (angle.sin() * 127.0) as i8 as u8;
            let y = (angle.cos() * 127.0) as i8 as u8;
            i64::from(x) | i64::from(y) << 8
        })
        .collect()
}

fn to_records(inputs: &[i64]) -> Vec<[u8; 8]> {
    inputs.iter().map(|input| input.to_le_bytes()).collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Bundle encode");
    let reference = 0i64.to_le_bytes();

    for frames in [8, 16, 32, 64] {
        group.throughput(Throughput::Bytes((frames * 8) as u64));

        let scenarios = [
            ("idle", to_records(&idle_inputs(frames))),
            ("active", to_records(&active_inputs(frames))),
            ("fighting", to_records(&fighting_game_inputs(frames))),
        ];
        for (name, records) in &scenarios {
            group.bench_with_input(BenchmarkId::new(*name, frames), records, |b, records| {
                b.iter(|| encode(black_box(&reference), records.iter().map(|r| r.as_slice())));
            });
        }
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Bundle decode");
    let reference = 0i64.to_le_bytes();

    for frames in [8, 16, 32, 64] {
        let records = to_records(&fighting_game_inputs(frames));
        let encoded = encode(&reference, records.iter().map(|r| r.as_slice()));
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("fighting", frames), &encoded, |b, encoded| {
            b.iter(|| decode(black_box(&reference), black_box(encoded)).unwrap());
        });
    }

    group.finish();
}

fn bench_compression_ratio(c: &mut Criterion) {
    let mut group = c.benchmark_group("Compression ratio analysis");

    let frames = 16;
    let reference = 0i64.to_le_bytes();
    let scenarios = [
        ("idle", to_records(&idle_inputs(frames))),
        ("active", to_records(&active_inputs(frames))),
        ("fighting", to_records(&fighting_game_inputs(frames))),
        ("analog", to_records(&analog_inputs(frames))),
    ];

    for (name, records) in &scenarios {
        let original_size = records.len() * 8;
        let compressed = encode(&reference, records.iter().map(|r| r.as_slice()));
        println!(
            "{}: {} -> {} bytes (ratio: {:.2})",
            name,
            original_size,
            compressed.len(),
            compressed.len() as f64 / original_size as f64
        );

        group.bench_function(BenchmarkId::new("roundtrip", *name), |b| {
            b.iter(|| {
                let compressed = encode(&reference, black_box(records).iter().map(|r| r.as_slice()));
                decode(&reference, black_box(&compressed)).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_compression_ratio);
criterion_main!(benches);
