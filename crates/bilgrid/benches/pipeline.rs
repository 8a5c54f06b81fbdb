//! Benchmarks for the bilateral grid pipeline on the CPU device.
//!
//! Run with: `cargo bench -p bilgrid`

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use bilgrid::{BilateralParams, FilterMode, Session, bilateral_filter};
use bilgrid_compute::{ComputeDevice, CpuDevice};

fn test_image(width: usize, height: usize) -> Vec<f32> {
    (0..width * height)
        .map(|i| {
            let (x, y) = (i % width, i / width);
            let step = if x < width / 2 { 0.25 } else { 0.75 };
            step + ((x * 7 + y * 13) % 17) as f32 / 170.0
        })
        .collect()
}

/// Full host round trip: upload, filter, download.
fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("bilateral_filter");
    let device = CpuDevice::new();
    let params = BilateralParams::default();

    for (w, h) in [(256, 256), (1024, 768), (1920, 1080)] {
        let data = test_image(w, h);
        group.throughput(Throughput::Elements((w * h) as u64));
        group.bench_with_input(BenchmarkId::new("detail", format!("{w}x{h}")), &data, |b, data| {
            b.iter(|| bilateral_filter(&device, black_box(data), w, h, &params, FilterMode::Detail))
        });
    }

    group.finish();
}

/// Stages on their own, device-resident buffers.
fn bench_stages(c: &mut Criterion) {
    let mut group = c.benchmark_group("stages");
    let device = CpuDevice::new();
    let (w, h) = (1920, 1080);
    let data = test_image(w, h);
    let Ok(input) = device.upload(&data) else {
        return;
    };
    group.throughput(Throughput::Elements((w * h) as u64));

    for sigma_s in [4.0f32, 16.0] {
        group.bench_function(BenchmarkId::new("splat_blur", sigma_s), |b| {
            b.iter(|| {
                let mut session = Session::create(&device, w, h, sigma_s, 10.0).ok()?;
                session.splat_and_blur(black_box(&input)).ok()?;
                session.destroy().ok()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_filter, bench_stages);
criterion_main!(benches);
