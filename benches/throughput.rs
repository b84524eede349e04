//! Throughput benchmarks

use busmon_core::config::MediumSettings;
use busmon_core::core::format::{format_event, format_line};
use busmon_core::core::frame::{MonitorFrameEvent, MC_BUSMON_IND};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

fn group_write() -> Vec<u8> {
    let mut raw = vec![0xBC, 0x11, 0x05, 0x08, 0x01, 0xE3, 0x00, 0x80, 0x0C, 0x1A];
    raw.push(!raw.iter().fold(0u8, |acc, b| acc ^ b));
    let mut cemi = vec![MC_BUSMON_IND, 0x07, 0x03, 0x01, 0x05, 0x04, 0x02, 0x12, 0x34];
    cemi.extend_from_slice(&raw);
    cemi
}

fn decode_benchmark(c: &mut Criterion) {
    let cemi = group_write();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("envelope_only", |b| {
        b.iter(|| {
            let event = MonitorFrameEvent::from_cemi("bench", black_box(&cemi), &MediumSettings::Tp1, false);
            black_box(event)
        })
    });

    group.bench_function("raw_frame", |b| {
        b.iter(|| {
            let event = MonitorFrameEvent::from_cemi("bench", black_box(&cemi), &MediumSettings::Tp1, true);
            black_box(event)
        })
    });

    group.finish();
}

fn format_benchmark(c: &mut Criterion) {
    let event = MonitorFrameEvent::from_cemi("bench", &group_write(), &MediumSettings::Tp1, true)
        .expect("valid bus monitor indication");

    let mut group = c.benchmark_group("format");
    group.throughput(Throughput::Elements(1));

    group.bench_function("compact", |b| {
        b.iter(|| black_box(format_event(black_box(&event), true)))
    });

    group.bench_function("verbose", |b| {
        b.iter(|| black_box(format_event(black_box(&event), false)))
    });

    group.bench_function("timestamped_line", |b| {
        b.iter(|| black_box(format_line(black_box(&event), false)))
    });

    group.finish();
}

criterion_group!(benches, decode_benchmark, format_benchmark);
criterion_main!(benches);
