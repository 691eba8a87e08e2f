//! End-to-end integration tests for scan-fusion.
//!
//! These tests drive the public API the way a scanning application does:
//! stage by stage, and through a [`ScanSession`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::{Point3, Vector3};
use scan_fusion::alignment::align;
use scan_fusion::fusion::fuse;
use scan_fusion::reconstruct::reconstruct;
use scan_fusion::refine::refine;
use scan_fusion::{
    AlignmentParams, BoundingBox, CancellationToken, FusionConfig, FusionError, FusionParams,
    PassInput, Point, PointCloud, ReconstructionParams, RefineParams, RigidTransform, ScanSession,
    ScanningStrategy, SourceWeights, Stage,
};

/// Evenly spread points on a sphere with outward normals.
fn sphere_cloud(n: usize, radius: f64, center: Point3<f64>, confidence: f64) -> PointCloud {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f64;
            let dir = Vector3::new(r * theta.cos(), y, r * theta.sin());
            Point::from_position(center + dir * radius)
                .with_normal(dir)
                .with_confidence(confidence)
        })
        .collect()
}

/// Configuration loose enough for small synthetic clouds.
fn permissive_config() -> FusionConfig {
    let mut config = FusionConfig::default();
    config.reconstruction.resolution = 24;
    config.refine.target_triangles = 2_000;
    config.refine.max_error = 1e-4;
    config.strategy.min_depth_quality = 0.0;
    config.strategy.min_image_quality = 0.0;
    config.strategy.min_fused_quality = 0.0;
    let floor = &mut config.quality.mesh_floor;
    floor.min_vertex_density = 0.0;
    floor.min_normal_consistency = 0.0;
    floor.min_smoothness = 0.0;
    floor.min_feature_preservation = 0.0;
    floor.min_score = 0.0;
    config
}

// =============================================================================
// Stage by stage
// =============================================================================

#[test]
fn test_align_fuse_reconstruct_refine() {
    let token = CancellationToken::new();
    let center = Point3::new(0.0, 0.0, 0.5);
    let depth = sphere_cloud(2000, 0.05, center, 0.9);
    let offset = RigidTransform::from_translation(Vector3::new(0.003, -0.002, 0.001));
    let image = sphere_cloud(1200, 0.05, center, 0.6).transformed(&offset);

    let alignment = align(&image, &depth, &AlignmentParams::default(), &token)
        .into_result()
        .unwrap();
    let recovered = alignment.transform.translation;
    assert!(
        (recovered - Vector3::new(-0.003, 0.002, -0.001)).norm() < 1e-3,
        "translation {:?}",
        recovered
    );
    let image = image.transformed(&alignment.transform);

    let fused = fuse(
        &depth,
        &image,
        SourceWeights::new(0.9, 0.6),
        &FusionParams::default(),
        &token,
    )
    .unwrap();
    assert!(fused.matched > 0);
    assert_eq!(
        fused.cloud.len(),
        fused.matched + fused.unmatched_a + fused.unmatched_b
    );

    let reconstruction = reconstruct(
        &fused.cloud,
        &ReconstructionParams::default().with_resolution(24),
        &token,
    )
    .unwrap();
    let mesh = reconstruction.mesh;
    assert!(mesh.triangle_count() > 100);
    let radius_error = mesh
        .vertices()
        .iter()
        .map(|v| ((v - center).norm() - 0.05).abs())
        .fold(0.0, f64::max);
    assert!(radius_error < 0.01, "max radius error {}", radius_error);

    let params = RefineParams::default().with_target_triangles(mesh.triangle_count() / 2);
    let outcome = refine(&mesh, &[], &params, &token).unwrap();
    if !outcome.is_rejected() {
        assert!(outcome.mesh.triangle_count() <= mesh.triangle_count() / 2);
        assert!(outcome.report.is_manifold());
    }
    let stages: Vec<Stage> = outcome
        .mesh
        .metadata()
        .steps
        .iter()
        .map(|s| s.stage)
        .collect();
    assert!(stages.contains(&Stage::Reconstruction));
    assert!(stages.contains(&Stage::Refinement));
}

// =============================================================================
// Sessions
// =============================================================================

#[test]
fn test_session_pass_with_offset_sources() {
    let session = ScanSession::new(permissive_config()).unwrap();
    let center = Point3::new(0.0, 0.0, 0.4);
    let depth = sphere_cloud(1500, 0.05, center, 0.9);
    let image = sphere_cloud(900, 0.05, center + Vector3::new(0.002, 0.0, 0.0), 0.8);

    let out = session.process(PassInput::new(depth, image)).unwrap();
    assert!(!out.mesh.is_empty());
    assert!(out.alignment.is_some());
    assert!(out.quality.alignment_confidence > 0.0);
    assert!(ScanningStrategy::OPERATIONAL.contains(&out.strategy));
    if out.strategy == ScanningStrategy::Fused {
        assert!(out.fusion_stats.is_some());
    }
}

#[test]
fn test_session_rejects_mesh_below_quality_floor() {
    let mut config = permissive_config();
    // A curved mesh never scores a perfect 1.
    config.quality.mesh_floor.min_score = 1.0;
    let session = ScanSession::new(config).unwrap();
    let center = Point3::new(0.0, 0.0, 0.4);
    let depth = sphere_cloud(1500, 0.05, center, 0.9);
    let image = sphere_cloud(900, 0.05, center, 0.8);

    match session.process(PassInput::new(depth, image)) {
        Err(FusionError::QualityBelowThreshold {
            metric,
            value,
            threshold,
        }) => {
            assert_eq!(metric, "mesh quality score");
            assert!(value < threshold);
            assert_eq!(threshold, 1.0);
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(out) => panic!("mesh of {} triangles passed the floor", out.mesh.triangle_count()),
    }
}

#[test]
fn test_session_falls_back_to_depth_when_image_is_sparse() {
    let session = ScanSession::new(permissive_config()).unwrap();
    let center = Point3::new(0.0, 0.0, 0.4);
    let depth = sphere_cloud(1500, 0.05, center, 0.9);
    let image = sphere_cloud(10, 0.05, center, 0.9);

    let out = session.process(PassInput::new(depth, image)).unwrap();
    assert_eq!(out.strategy, ScanningStrategy::DepthOnly);
    assert!(out.quality.image.is_none());
    assert!(out.alignment.is_none());
    assert!(out.fusion_stats.is_none());
}

#[test]
fn test_session_publishes_transitions() {
    let session = ScanSession::new(permissive_config()).unwrap();
    let events = session.subscribe();
    let center = Point3::new(0.0, 0.0, 0.4);

    // Depth is absent, so the controller must leave DepthOnly.
    let depth = sphere_cloud(20, 0.05, center, 0.9);
    let image = sphere_cloud(1500, 0.05, center, 0.9);
    let out = session.process(PassInput::new(depth, image)).unwrap();

    assert_eq!(out.strategy, ScanningStrategy::ImageOnly);
    assert_eq!(out.events.len(), 1);
    let published: Vec<_> = events.try_iter().collect();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].from, ScanningStrategy::DepthOnly);
    assert_eq!(published[0].to, ScanningStrategy::ImageOnly);
    assert_eq!(session.controller().history().len(), 1);
}

#[test]
fn test_session_reports_recalibration() {
    let mut config = permissive_config();
    config.strategy.min_depth_quality = 1.0;
    config.strategy.min_image_quality = 1.0;
    config.strategy.min_fused_quality = 1.0;
    let session = ScanSession::new(config).unwrap();
    let center = Point3::new(0.0, 0.0, 0.4);
    // A scan volume far larger than the object keeps density and coverage low.
    let volume = BoundingBox::new(Point3::new(-1.0, -1.0, -0.6), Point3::new(1.0, 1.0, 1.4));

    let err = session
        .process(
            PassInput::new(
                sphere_cloud(300, 0.05, center, 0.2),
                sphere_cloud(200, 0.05, center, 0.2),
            )
            .with_bounds(volume),
        )
        .unwrap_err();
    assert!(matches!(err, FusionError::RecalibrationRequired { .. }));
    assert_eq!(
        session.controller().current(),
        ScanningStrategy::NeedsRecalibration
    );
}

#[test]
fn test_session_progress_and_cancel() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let session = ScanSession::new(permissive_config())
        .unwrap()
        .with_progress(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }));
    let center = Point3::new(0.0, 0.0, 0.4);
    let depth = sphere_cloud(800, 0.05, center, 0.9);

    session
        .process(PassInput::new(depth.clone(), depth.clone()))
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 10);

    session.cancel();
    let err = session
        .process(PassInput::new(depth.clone(), depth.clone()))
        .unwrap_err();
    assert!(matches!(err, FusionError::Cancelled { .. }));

    session.restart();
    assert!(session.process(PassInput::new(depth.clone(), depth)).is_ok());
}

#[test]
fn test_session_rejects_non_finite_input() {
    let session = ScanSession::new(permissive_config()).unwrap();
    let mut points = sphere_cloud(200, 0.05, Point3::origin(), 0.9).points().to_vec();
    points[7] = Point::new(f64::NAN, 0.0, 0.0);
    let err = session
        .process(PassInput::new(PointCloud::new(points), PointCloud::default()))
        .unwrap_err();
    assert!(matches!(err, FusionError::InvalidInput { .. }));
}

#[test]
fn test_session_tiny_budget_times_out_or_returns_partial() {
    let mut config = permissive_config();
    config.pass_time_budget_ms = Some(1);
    config.reconstruction.resolution = 64;
    let session = ScanSession::new(config).unwrap();
    let depth = sphere_cloud(5000, 0.05, Point3::new(0.0, 0.0, 0.4), 0.9);

    match session.process(PassInput::new(depth.clone(), depth)) {
        Ok(out) => {
            assert!(out.partial);
            assert!(out.mesh.metadata().partial);
        }
        Err(e) => assert!(matches!(e, FusionError::Timeout { .. }), "{e}"),
    }
}
