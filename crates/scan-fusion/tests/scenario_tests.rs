//! Scanning scenarios with seeded noise.
//!
//! Each scenario mimics a handheld capture: a depth sensor sampling an object
//! with small noise, and an image-derived cloud of the same object that is
//! offset by an uncalibrated extrinsic.
//!
//! Run with: cargo test -p scan-fusion --test scenario_tests --release

use std::time::{Duration, Instant};

use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scan_fusion::alignment::align;
use scan_fusion::fusion::fuse;
use scan_fusion::{
    AlignmentParams, CancellationToken, Feature, FusionConfig, FusionParams, PassInput, Point,
    PointCloud, QualityUpdate, ScanSession, ScanningStrategy, SourceWeights, StrategyConfig,
    StrategyController, StrategyDecision,
};

const OBJECT_RADIUS: f64 = 0.06;
const NOISE: f64 = 0.0001;

/// Noisy samples of a sphere in front of the camera.
fn capture(
    n: usize,
    center: Point3<f64>,
    offset: Vector3<f64>,
    confidence: f64,
    seed: u64,
) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let z: f64 = rng.random_range(-1.0..1.0);
            let phi: f64 = rng.random_range(0.0..std::f64::consts::TAU);
            let r = (1.0 - z * z).sqrt();
            let dir = Vector3::new(r * phi.cos(), r * phi.sin(), z);
            let jitter = Vector3::new(
                rng.random_range(-NOISE..NOISE),
                rng.random_range(-NOISE..NOISE),
                rng.random_range(-NOISE..NOISE),
            );
            Point::from_position(center + dir * OBJECT_RADIUS + jitter + offset)
                .with_normal(dir)
                .with_confidence(confidence)
        })
        .collect()
}

/// One set of sphere samples observed twice: the second copy is shifted by
/// `offset`, and each copy gets its own uniform jitter of `noise`.
fn paired_captures(
    n: usize,
    offset: Vector3<f64>,
    noise: f64,
    seed: u64,
) -> (PointCloud, PointCloud) {
    let mut rng = StdRng::seed_from_u64(seed);
    let center = Point3::new(0.0, 0.0, 0.5);
    let mut first = Vec::with_capacity(n);
    let mut second = Vec::with_capacity(n);
    for _ in 0..n {
        let z: f64 = rng.random_range(-1.0..1.0);
        let phi: f64 = rng.random_range(0.0..std::f64::consts::TAU);
        let r = (1.0 - z * z).sqrt();
        let dir = Vector3::new(r * phi.cos(), r * phi.sin(), z);
        let surface = center + dir * OBJECT_RADIUS;
        for (cloud, shift) in [(&mut first, Vector3::zeros()), (&mut second, offset)] {
            let jitter = Vector3::new(
                rng.random_range(-noise..noise),
                rng.random_range(-noise..noise),
                rng.random_range(-noise..noise),
            );
            cloud.push(
                Point::from_position(surface + shift + jitter)
                    .with_normal(dir)
                    .with_confidence(0.9),
            );
        }
    }
    (PointCloud::new(first), PointCloud::new(second))
}

fn scenario_config() -> FusionConfig {
    let mut config = FusionConfig::default();
    config.reconstruction.resolution = 40;
    config.refine.target_triangles = 4_000;
    config.refine.max_error = 1e-5;
    config.strategy.min_depth_quality = 0.05;
    config.strategy.min_image_quality = 0.05;
    config.strategy.min_fused_quality = 0.05;
    config.quality.mesh_floor.min_score = 0.0;
    config.quality.mesh_floor.min_vertex_density = 0.0;
    config
}

#[test]
fn test_offset_sources_are_registered_and_meshed() {
    let center = Point3::new(0.0, 0.0, 0.5);
    let depth = capture(10_000, center, Vector3::zeros(), 0.9, 1);
    let image = capture(6_000, center, Vector3::new(0.01, 0.0, 0.0), 0.7, 2);
    let features = vec![Feature::new(
        1,
        center + Vector3::new(0.0, 0.0, -OBJECT_RADIUS),
        -Vector3::z(),
        0.9,
    )];

    let session = ScanSession::new(scenario_config()).unwrap();
    let out = session
        .process(PassInput::new(depth, image).with_features(features))
        .unwrap();

    let alignment = out.alignment.as_ref().unwrap();
    assert!(!alignment.is_failed());
    // A sphere fixes the registration of its center, not its spin.
    let image_center = center + Vector3::new(0.01, 0.0, 0.0);
    let moved = alignment.transform.transform_point(&image_center);
    assert!((moved - center).norm() < 2e-3, "center registered to {:?}", moved);

    let mesh = &out.mesh;
    assert!(!mesh.is_empty());
    assert!(mesh.triangle_count() <= 4_000 || out.refine_rejection.is_some());
    let worst = mesh
        .vertices()
        .iter()
        .map(|v| ((v - center).norm() - OBJECT_RADIUS).abs())
        .fold(0.0, f64::max);
    assert!(worst < 0.006, "worst radial error {}", worst);
    if let Some(report) = &out.validation {
        assert!(report.is_manifold(), "{}", report);
    }
}

#[test]
fn test_two_depth_captures_register_and_merge() {
    // 1% of the object radius as uniform noise.
    let (reference, shifted) =
        paired_captures(10_000, Vector3::new(0.01, 0.0, 0.0), 0.01 * OBJECT_RADIUS, 5);
    let token = CancellationToken::new();

    let params = AlignmentParams::default().with_max_iterations(50);
    let result = align(&shifted, &reference, &params, &token);
    assert!(!result.is_failed());
    assert!(result.iterations <= 50);
    assert!(result.residual < 0.002, "residual {}", result.residual);

    let registered = shifted.transformed(&result.transform);
    let fused = fuse(
        &reference,
        &registered,
        SourceWeights::new(0.9, 0.9),
        &FusionParams::default(),
        &token,
    )
    .unwrap();
    assert!(
        fused.merged_fraction() >= 0.95,
        "merged {:.3}",
        fused.merged_fraction()
    );
    assert!(fused.cloud.iter().all(|p| (0.0..=1.0).contains(&p.confidence)));
}

#[test]
fn test_repeated_passes_converge_on_one_strategy() {
    let center = Point3::new(0.0, 0.0, 0.5);
    let mut config = scenario_config();
    config.reconstruction.resolution = 24;
    let session = ScanSession::new(config).unwrap();
    let events = session.subscribe();

    let mut strategies = Vec::new();
    for pass in 0..4u64 {
        let depth = capture(3_000, center, Vector3::zeros(), 0.9, 10 + pass);
        let image = capture(2_000, center, Vector3::new(0.01, 0.0, 0.0), 0.7, 20 + pass);
        let out = session.process(PassInput::new(depth, image)).unwrap();
        strategies.push(out.strategy);
    }

    // Same conditions every pass: at most one switch away from the start.
    assert!(events.try_iter().count() <= 1);
    assert!(strategies.windows(2).filter(|w| w[0] != w[1]).count() <= 1);
}

#[test]
fn test_depth_dropout_moves_to_image() {
    let center = Point3::new(0.0, 0.0, 0.5);
    let session = ScanSession::new(scenario_config()).unwrap();

    let depth = capture(3_000, center, Vector3::zeros(), 0.9, 40);
    let image = capture(2_000, center, Vector3::zeros(), 0.7, 41);
    session.process(PassInput::new(depth, image)).unwrap();

    // The depth sensor loses the object.
    let depth = capture(30, center, Vector3::zeros(), 0.9, 42);
    let image = capture(2_000, center, Vector3::zeros(), 0.7, 43);
    let out = session.process(PassInput::new(depth, image)).unwrap();
    assert_eq!(out.strategy, ScanningStrategy::ImageOnly);
    assert!(out.alignment.is_none());
}

#[test]
fn test_flickering_quality_is_damped() {
    let config = StrategyConfig::default();
    let controller = StrategyController::new(config.clone());
    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(99);

    // Sources trade places every 100 ms for three seconds.
    let mut switches = 0;
    for i in 0..30u64 {
        let (strong, weak) = (rng.random_range(0.8..0.9), rng.random_range(0.3..0.4));
        let update = if i % 2 == 0 {
            QualityUpdate::new(strong, weak, 0.0)
        } else {
            QualityUpdate::new(weak, strong, 0.0)
        };
        let now = start + Duration::from_millis(100 * i);
        if let StrategyDecision::Switched { .. } = controller.update_at(update, now) {
            switches += 1;
        }
    }
    assert!(
        switches <= config.rate_limit_max_transitions,
        "{} switches in {:?}",
        switches,
        Duration::from_millis(3000)
    );
}
