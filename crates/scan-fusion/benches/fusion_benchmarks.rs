//! Benchmarks for scan-fusion stages.
//!
//! Run with: cargo bench -p scan-fusion
//!
//! To compare against baseline:
//! 1. First run: cargo bench -p scan-fusion -- --save-baseline main
//! 2. After changes: cargo bench -p scan-fusion -- --baseline main

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nalgebra::{Point3, Vector3};
use scan_fusion::alignment::align;
use scan_fusion::fusion::fuse;
use scan_fusion::reconstruct::reconstruct;
use scan_fusion::refine::refine;
use scan_fusion::smoothing::smooth_cloud;
use scan_fusion::{
    AlignmentParams, CancellationToken, CpuBackend, FusionParams, IndexKind, Point, PointCloud,
    ReconstructionParams, RefineParams, RigidTransform, SmoothingParams, SourceWeights,
    SpatialIndex, SpatialIndexHandle,
};

// =============================================================================
// Test Cloud Generation
// =============================================================================

/// Fibonacci sphere with outward normals.
fn sphere_cloud(n: usize, radius: f64) -> PointCloud {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let t = golden * i as f64;
            let dir = Vector3::new(r * t.cos(), y, r * t.sin());
            Point::from_position(Point3::from(dir * radius))
                .with_normal(dir)
                .with_confidence(0.5 + 0.5 * (t.sin() * 0.5 + 0.5))
        })
        .collect()
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    for &n in &[1_000usize, 10_000, 50_000] {
        let cloud = sphere_cloud(n, 0.1);
        group.throughput(Throughput::Elements(n as u64));
        for kind in [IndexKind::KdTree, IndexKind::Octree] {
            group.bench_with_input(BenchmarkId::new(format!("build_{:?}", kind), n), &cloud, |b, cloud| {
                b.iter(|| SpatialIndexHandle::build(kind, black_box(cloud)))
            });
            let index = SpatialIndexHandle::build(kind, &cloud);
            group.bench_with_input(BenchmarkId::new(format!("knn16_{:?}", kind), n), &cloud, |b, cloud| {
                b.iter(|| {
                    for p in cloud.iter().step_by(10) {
                        black_box(index.k_nearest(&p.position, 16));
                    }
                })
            });
        }
    }
    group.finish();
}

fn bench_alignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("alignment");
    group.sample_size(20);
    let token = CancellationToken::new();
    for &n in &[2_000usize, 10_000] {
        let target = sphere_cloud(n, 0.1);
        let motion = RigidTransform::from_axis_angle(&Vector3::y(), 0.02, Vector3::new(0.004, 0.0, 0.002));
        let source = target.transformed(&motion);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("icp", n), &source, |b, source| {
            b.iter(|| align(black_box(source), &target, &AlignmentParams::default(), &token))
        });
    }
    group.finish();
}

fn bench_fusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("fusion");
    let token = CancellationToken::new();
    for &n in &[5_000usize, 20_000] {
        let a = sphere_cloud(n, 0.1);
        let b = sphere_cloud(n / 2, 0.1005);
        group.throughput(Throughput::Elements((n + n / 2) as u64));
        group.bench_with_input(BenchmarkId::new("fuse", n), &(a, b), |bench, (a, b)| {
            bench.iter(|| {
                fuse(
                    black_box(a),
                    black_box(b),
                    SourceWeights::new(0.9, 0.6),
                    &FusionParams::default(),
                    &token,
                )
            })
        });
    }
    group.finish();
}

fn bench_smoothing(c: &mut Criterion) {
    let mut group = c.benchmark_group("smoothing");
    group.sample_size(20);
    let token = CancellationToken::new();
    let cloud = sphere_cloud(10_000, 0.1);
    group.bench_function("bilateral_10k", |b| {
        b.iter(|| smooth_cloud(black_box(&cloud), &[], &CpuBackend, &SmoothingParams::default(), &token))
    });
    group.finish();
}

fn bench_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruction");
    group.sample_size(10);
    let token = CancellationToken::new();
    let cloud = sphere_cloud(10_000, 0.1);
    for &resolution in &[32usize, 64] {
        let params = ReconstructionParams::default().with_resolution(resolution);
        group.bench_with_input(BenchmarkId::new("marching_cubes", resolution), &params, |b, params| {
            b.iter(|| reconstruct(black_box(&cloud), params, &token))
        });
    }
    group.finish();
}

fn bench_refinement(c: &mut Criterion) {
    let mut group = c.benchmark_group("refinement");
    group.sample_size(10);
    let token = CancellationToken::new();
    let cloud = sphere_cloud(10_000, 0.1);
    let mesh = reconstruct(&cloud, &ReconstructionParams::default().with_resolution(64), &token)
        .expect("reconstruction for benchmark input")
        .mesh;
    for divisor in [2usize, 8] {
        let params = RefineParams::default().with_target_triangles(mesh.triangle_count() / divisor);
        group.bench_with_input(BenchmarkId::new("decimate_to_fraction", divisor), &params, |b, params| {
            b.iter(|| refine(black_box(&mesh), &[], params, &token))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_indexing,
    bench_alignment,
    bench_fusion,
    bench_smoothing,
    bench_reconstruction,
    bench_refinement,
);
criterion_main!(benches);
