//! Reshape benchmarks.
//!
//! Host-side cost of a reshape against `SimDevice`: descriptor rebuild,
//! selection and workspace bookkeeping. Device time is not modeled.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

use cudnn_conv::{ConvolutionConfig, CudnnConvLayer, EngineConfig, SimDevice};

/// Repeated identical reshape: the steady state between batches.
fn bench_steady_reshape(c: &mut Criterion) {
    let mut group = c.benchmark_group("steady_reshape");
    group.measurement_time(Duration::from_secs(5));

    for &groups in &[1usize, 2, 4, 8] {
        let device = Arc::new(SimDevice::new());
        let conv = ConvolutionConfig::new(16 * groups, 3).with_pad(1).with_group(groups);
        let dims = [[32usize, 4 * groups, 56, 56]];

        let Ok(mut layer) = CudnnConvLayer::new(device, EngineConfig::default(), conv) else {
            continue;
        };
        if layer.setup(&dims).is_err() {
            continue;
        }

        group.bench_with_input(BenchmarkId::new("groups", groups), &dims, |b, dims| {
            b.iter(|| black_box(layer.reshape(dims)))
        });
    }

    group.finish();
}

/// Alternating batch sizes: the workspace grows once, then stays.
fn bench_alternating_reshape(c: &mut Criterion) {
    let mut group = c.benchmark_group("alternating_reshape");

    for &inputs in &[1usize, 4, 16] {
        let device = Arc::new(SimDevice::new());
        let conv = ConvolutionConfig::new(64, 3).with_pad(1);
        let small = vec![[8usize, 32, 28, 28]; inputs];
        let large = vec![[64usize, 32, 28, 28]; inputs];

        let Ok(mut layer) = CudnnConvLayer::new(device, EngineConfig::default(), conv) else {
            continue;
        };
        if layer.setup(&small).is_err() {
            continue;
        }

        group.bench_function(BenchmarkId::new("inputs", inputs), |b| {
            let mut flip = false;
            b.iter(|| {
                flip = !flip;
                let dims = if flip { &large } else { &small };
                black_box(layer.reshape(dims))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_steady_reshape, bench_alternating_reshape);
criterion_main!(benches);
