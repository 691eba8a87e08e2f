//! Property-based tests for indexing, fusion and strategy selection.
//!
//! Run with: cargo test -p scan-fusion --test proptest_spatial

use std::time::{Duration, Instant};

use nalgebra::{Point3, Vector3};
use proptest::prelude::*;
use scan_fusion::fusion::fuse;
use scan_fusion::spatial::{KdTree, Octree};
use scan_fusion::{
    CancellationToken, FusionParams, Point, PointCloud, QualityUpdate, ScanningStrategy,
    SourceWeights, SpatialIndex, StrategyConfig, StrategyController, StrategyDecision,
};

// =============================================================================
// Strategies
// =============================================================================

fn arb_position() -> impl Strategy<Value = Point3<f64>> {
    prop::array::uniform3(-1.0..1.0f64).prop_map(|[x, y, z]| Point3::new(x, y, z))
}

fn arb_positions(max: usize) -> impl Strategy<Value = Vec<Point3<f64>>> {
    prop::collection::vec(arb_position(), 1..max)
}

fn arb_cloud(max: usize) -> impl Strategy<Value = PointCloud> {
    prop::collection::vec((arb_position(), 0.0..=1.0f64, any::<bool>()), 1..max).prop_map(
        |samples| {
            samples
                .into_iter()
                .map(|(p, confidence, with_normal)| {
                    let point = Point::from_position(p).with_confidence(confidence);
                    if with_normal {
                        point.with_normal(Vector3::z())
                    } else {
                        point
                    }
                })
                .collect()
        },
    )
}

fn brute_force_k(points: &[Point3<f64>], q: &Point3<f64>, k: usize) -> Vec<f64> {
    let mut d: Vec<f64> = points.iter().map(|p| (p - q).norm_squared()).collect();
    d.sort_by(f64::total_cmp);
    d.truncate(k);
    d
}

// =============================================================================
// Spatial indexes
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn kdtree_k_nearest_matches_brute_force(
        points in arb_positions(300),
        q in arb_position(),
        k in 1usize..20,
    ) {
        let tree = KdTree::build(points.clone());
        let got: Vec<f64> = tree.k_nearest(&q, k).iter().map(|n| n.distance_squared).collect();
        let expected = brute_force_k(&points, &q, k);
        prop_assert_eq!(got.len(), expected.len());
        for (a, b) in got.iter().zip(&expected) {
            prop_assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn octree_k_nearest_matches_brute_force(
        points in arb_positions(300),
        q in arb_position(),
        k in 1usize..20,
    ) {
        let tree = Octree::build(points.clone());
        let got: Vec<f64> = tree.k_nearest(&q, k).iter().map(|n| n.distance_squared).collect();
        let expected = brute_force_k(&points, &q, k);
        prop_assert_eq!(got.len(), expected.len());
        for (a, b) in got.iter().zip(&expected) {
            prop_assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn radius_queries_agree(
        points in arb_positions(300),
        q in arb_position(),
        radius in 0.0..1.5f64,
    ) {
        let mut kd: Vec<usize> = KdTree::build(points.clone())
            .within_radius(&q, radius)
            .iter()
            .map(|n| n.index)
            .collect();
        let mut oct: Vec<usize> = Octree::build(points.clone())
            .within_radius(&q, radius)
            .iter()
            .map(|n| n.index)
            .collect();
        let mut expected: Vec<usize> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| (*p - q).norm_squared() <= radius * radius)
            .map(|(i, _)| i)
            .collect();
        kd.sort_unstable();
        oct.sort_unstable();
        expected.sort_unstable();
        prop_assert_eq!(&kd, &expected);
        prop_assert_eq!(&oct, &expected);
    }
}

// =============================================================================
// Fusion
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn fusion_conserves_points(
        a in arb_cloud(150),
        b in arb_cloud(150),
        wa in 0.3..1.0f64,
        wb in 0.3..1.0f64,
        distance in 0.01..0.5f64,
    ) {
        let params = FusionParams::default().with_max_fusion_distance(distance);
        let out = fuse(&a, &b, SourceWeights::new(wa, wb), &params, &CancellationToken::new()).unwrap();

        prop_assert_eq!(out.matched + out.unmatched_a, a.len());
        prop_assert_eq!(out.matched + out.unmatched_b, b.len());
        prop_assert_eq!(out.cloud.len(), out.matched + out.unmatched_a + out.unmatched_b);
        for p in out.cloud.iter() {
            prop_assert!((0.0..=1.0).contains(&p.confidence));
            prop_assert!(p.is_finite());
        }
    }
}

// =============================================================================
// Strategy controller
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn controller_guards_hold(
        updates in prop::collection::vec((0.0..=1.0f64, 0.0..=1.0f64, 0.0..=1.0f64, 0u64..3000), 1..60),
    ) {
        let config = StrategyConfig::default();
        let controller = StrategyController::new(config.clone());
        let mut now = Instant::now();

        for (depth, image, alignment, step_ms) in updates {
            now += Duration::from_millis(step_ms);
            let before = controller.current();
            let decision = controller.update_at(QualityUpdate::new(depth, image, alignment), now);
            prop_assert_eq!(decision.strategy(), controller.current());

            if let StrategyDecision::Switched { event } = &decision {
                prop_assert_eq!(event.from, before);
                prop_assert!(event.to != before);
                if before != ScanningStrategy::NeedsRecalibration {
                    let from = event.scores.get(event.from);
                    let to = event.scores.get(event.to);
                    prop_assert!(to >= from * (1.0 + config.improvement_margin));
                }
            }
            prop_assert!(controller.history().len() <= config.history_capacity);
        }
    }
}
