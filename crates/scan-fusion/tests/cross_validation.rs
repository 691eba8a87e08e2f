//! Cross-validation against independent implementations and closed forms.
//!
//! Neighbor queries are checked against `kiddo`, registration against known
//! rigid motions, and mesh measurements against analytic shapes.
//!
//! Run with: cargo test -p scan-fusion --test cross_validation

use approx::assert_relative_eq;
use kiddo::SquaredEuclidean;
use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scan_fusion::alignment::{align, kabsch};
use scan_fusion::reconstruct::reconstruct;
use scan_fusion::refine::validate_mesh;
use scan_fusion::spatial::{KdTree, Octree};
use scan_fusion::{
    AlignmentParams, CancellationToken, Point, PointCloud, ReconstructionParams, RigidTransform,
    SpatialIndex, ValidationLimits,
};

// =============================================================================
// Helpers
// =============================================================================

fn random_positions(n: usize, seed: u64) -> Vec<Point3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Point3::new(
                rng.random_range(-0.5..0.5),
                rng.random_range(-0.5..0.5),
                rng.random_range(0.2..1.2),
            )
        })
        .collect()
}

fn build_kiddo(points: &[Point3<f64>]) -> kiddo::KdTree<f64, 3> {
    let mut kdtree = kiddo::KdTree::new();
    for (i, p) in points.iter().enumerate() {
        kdtree.add(&[p.x, p.y, p.z], i as u64);
    }
    kdtree
}

/// Points on an ellipsoid-like bumpy surface, no two in the same place.
fn bumpy_surface(n: usize, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let u: f64 = rng.random_range(0.0..std::f64::consts::TAU);
            let v: f64 = rng.random_range(-1.0..1.0);
            let r = (1.0 - v * v).sqrt();
            let dir = Vector3::new(r * u.cos(), v, r * u.sin());
            let radius = 0.1 * (1.0 + 0.2 * (3.0 * u).sin() * r);
            Point::from_position(Point3::from(dir * radius))
        })
        .collect()
}

// =============================================================================
// Neighbor queries against kiddo
// =============================================================================

#[test]
fn test_k_nearest_matches_kiddo() {
    let points = random_positions(5000, 7);
    let reference = build_kiddo(&points);
    let kd = KdTree::build(points.clone());
    let oct = Octree::build(points.clone());

    for q in random_positions(200, 8) {
        let expected = reference.nearest_n::<SquaredEuclidean>(&[q.x, q.y, q.z], 12);
        for index in [&kd as &dyn SpatialIndex, &oct as &dyn SpatialIndex] {
            let got = index.k_nearest(&q, 12);
            assert_eq!(got.len(), expected.len());
            for (g, e) in got.iter().zip(&expected) {
                assert_relative_eq!(g.distance_squared, e.distance, epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn test_radius_matches_kiddo() {
    let points = random_positions(4000, 11);
    let reference = build_kiddo(&points);
    let kd = KdTree::build(points.clone());
    let oct = Octree::build(points.clone());
    let radius = 0.08;

    for q in random_positions(100, 12) {
        let mut expected: Vec<u64> = reference
            .within::<SquaredEuclidean>(&[q.x, q.y, q.z], radius * radius)
            .iter()
            .map(|n| n.item)
            .collect();
        expected.sort_unstable();

        for index in [&kd as &dyn SpatialIndex, &oct as &dyn SpatialIndex] {
            let mut got: Vec<u64> = index
                .within_radius(&q, radius)
                .iter()
                .map(|n| n.index as u64)
                .collect();
            got.sort_unstable();
            assert_eq!(got, expected);
        }
    }
}

// =============================================================================
// Registration against known motions
// =============================================================================

#[test]
fn test_kabsch_recovers_exact_motion() {
    let source = random_positions(100, 21);
    let motion = RigidTransform::from_axis_angle(
        &Vector3::new(0.3, 1.0, -0.2),
        0.4,
        Vector3::new(0.1, -0.05, 0.2),
    );
    let target: Vec<Point3<f64>> = source.iter().map(|p| motion.transform_point(p)).collect();

    let recovered = kabsch(&source, &target).unwrap();
    for (s, t) in source.iter().zip(&target) {
        assert_relative_eq!((recovered.transform_point(s) - t).norm(), 0.0, epsilon = 1e-9);
    }
}

#[test]
fn test_icp_recovers_small_motion() {
    let target = bumpy_surface(3000, 31);
    let motion = RigidTransform::from_axis_angle(
        &Vector3::z(),
        0.03,
        Vector3::new(0.004, -0.003, 0.002),
    );
    let source = target.transformed(&motion.inverse());

    let result = align(
        &source,
        &target,
        &AlignmentParams::default(),
        &CancellationToken::new(),
    );
    assert!(!result.is_failed(), "{:?}", result.termination);
    assert!(result.residual < 1e-3, "residual {}", result.residual);
    let delta = result.transform.then(&motion.inverse());
    assert!(delta.translation.norm() < 2e-3);
    assert!(delta.rotation_angle() < 0.01);
}

// =============================================================================
// Reconstruction against an analytic sphere
// =============================================================================

#[test]
fn test_sphere_area_and_topology() {
    let radius = 0.08;
    let n = 4000;
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    let cloud: PointCloud = (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let t = golden * i as f64;
            let dir = Vector3::new(r * t.cos(), y, r * t.sin());
            Point::from_position(Point3::from(dir * radius)).with_normal(dir)
        })
        .collect();

    let result = reconstruct(
        &cloud,
        &ReconstructionParams::default().with_resolution(40),
        &CancellationToken::new(),
    )
    .unwrap();
    let mesh = result.mesh;
    let expected_area = 4.0 * std::f64::consts::PI * radius * radius;
    assert_relative_eq!(mesh.surface_area(), expected_area, max_relative = 0.1);

    let report = validate_mesh(&mesh, &ValidationLimits::default());
    assert!(report.is_manifold(), "{}", report);
    assert!(report.is_watertight(), "{}", report);
}
