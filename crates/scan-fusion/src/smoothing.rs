//! Feature-preserving bilateral smoothing of point clouds.
//!
//! Each point moves along its normal by a weighted mean of its neighbors'
//! offsets from its tangent plane. Weights combine a spatial Gaussian on
//! distance with a range Gaussian on the normal offset, so points across a
//! sharp edge barely pull on each other. Trusted points and points near
//! tracked features are damped.

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::ComputeBackend;
use crate::error::{FusionError, FusionResult};
use crate::progress::CancellationToken;
use crate::spatial::{IndexKind, SpatialIndex, SpatialIndexHandle};
use crate::tracing_ext::OperationTimer;
use crate::types::{Feature, Point, PointCloud, Stage};

/// Bilateral smoothing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingParams {
    pub enabled: bool,
    pub iterations: usize,
    pub neighbors: usize,
    /// Spatial Gaussian width.
    pub spatial_sigma: f64,
    /// Gaussian width on the offset from the tangent plane.
    pub range_sigma: f64,
    /// Points below this confidence are smoothed at full strength.
    pub confidence_threshold: f64,
    /// Fraction of motion removed near features.
    pub feature_weight: f64,
    /// Points this close to a feature count as feature points.
    pub feature_radius: f64,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            enabled: true,
            iterations: 2,
            neighbors: 12,
            spatial_sigma: 0.004,
            range_sigma: 0.002,
            confidence_threshold: 0.5,
            feature_weight: 0.8,
            feature_radius: 0.005,
        }
    }
}

impl SmoothingParams {
    pub fn validate(&self) -> FusionResult<()> {
        if !(self.spatial_sigma > 0.0) || !(self.range_sigma > 0.0) {
            return Err(FusionError::invalid_config(
                "smoothing.spatial_sigma",
                "sigmas must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.confidence_threshold) {
            return Err(FusionError::invalid_config(
                "smoothing.confidence_threshold",
                "must be in [0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.feature_weight) {
            return Err(FusionError::invalid_config(
                "smoothing.feature_weight",
                "must be in [0, 1]",
            ));
        }
        Ok(())
    }
}

/// One element of the smoothing kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothInput {
    pub position: Point3<f64>,
    /// Unit normal; points without one stay put.
    pub normal: Option<Vector3<f64>>,
    pub confidence: f64,
    /// Near a tracked feature.
    pub feature: bool,
}

/// Motion strength in [0, 1] for a point.
pub fn smoothing_strength(p: &SmoothInput, params: &SmoothingParams) -> f64 {
    let mut strength = if p.confidence < params.confidence_threshold {
        1.0
    } else {
        let t = (p.confidence - params.confidence_threshold) / (1.0 - params.confidence_threshold);
        1.0 - 0.5 * t.clamp(0.0, 1.0)
    };
    if p.feature {
        strength *= 1.0 - params.feature_weight;
    }
    strength
}

/// Displacement of `p` for one bilateral step over `hood` (indices into `points`).
pub fn bilateral_displacement(
    p: &SmoothInput,
    hood: &[usize],
    points: &[SmoothInput],
    params: &SmoothingParams,
) -> Vector3<f64> {
    let Some(n) = p.normal else {
        return Vector3::zeros();
    };
    let inv_s = 1.0 / (2.0 * params.spatial_sigma * params.spatial_sigma);
    let inv_r = 1.0 / (2.0 * params.range_sigma * params.range_sigma);

    let mut sum = 0.0;
    let mut weight = 0.0;
    for &j in hood {
        let d = points[j].position - p.position;
        let h = n.dot(&d);
        let w = (-d.norm_squared() * inv_s).exp() * (-h * h * inv_r).exp();
        sum += w * h;
        weight += w;
    }
    if weight <= f64::MIN_POSITIVE {
        return Vector3::zeros();
    }
    n * (sum / weight * smoothing_strength(p, params))
}

/// Smooth a cloud, keeping normals and confidences.
///
/// Points without a normal are smoothed along their PCA normal. Neighbor
/// lists are computed once from the input positions.
pub fn smooth_cloud(
    cloud: &PointCloud,
    features: &[Feature],
    backend: &dyn ComputeBackend,
    params: &SmoothingParams,
    token: &CancellationToken,
) -> FusionResult<PointCloud> {
    if !params.enabled || params.iterations == 0 || cloud.len() < 3 {
        return Ok(cloud.clone());
    }
    let _timer = OperationTimer::with_size(Stage::Smoothing, cloud.len());

    let positions = cloud.positions();
    let index = SpatialIndexHandle::from_positions(IndexKind::KdTree, positions.clone());
    let hoods = index.neighborhoods(params.neighbors);

    let missing = cloud.iter().any(|p| p.normal.is_none());
    let frames = if missing {
        backend.covariance_normals(&positions, &hoods)
    } else {
        Vec::new()
    };

    let feature_index = (!features.is_empty()).then(|| {
        SpatialIndexHandle::from_positions(
            IndexKind::KdTree,
            features.iter().map(|f| f.position).collect(),
        )
    });

    let mut inputs: Vec<SmoothInput> = cloud
        .iter()
        .enumerate()
        .map(|(i, p)| SmoothInput {
            position: p.position,
            normal: p
                .normal
                .or_else(|| frames.get(i).copied().flatten().map(|f| f.normal)),
            confidence: p.confidence,
            feature: feature_index.as_ref().is_some_and(|fi| {
                fi.nearest_within(&p.position, params.feature_radius).is_some()
            }),
        })
        .collect();

    let mut max_shift = 0.0f64;
    for _ in 0..params.iterations {
        token.check(Stage::Smoothing)?;
        let next = backend.bilateral_smooth(&inputs, &hoods, params);
        for (input, position) in inputs.iter_mut().zip(next) {
            max_shift = max_shift.max((position - input.position).norm());
            input.position = position;
        }
    }
    debug!(
        points = cloud.len(),
        iterations = params.iterations,
        max_shift,
        "Bilateral smoothing finished"
    );

    Ok(cloud
        .iter()
        .zip(&inputs)
        .map(|(p, s)| Point {
            position: s.position,
            ..*p
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn noisy_plane(n: usize) -> PointCloud {
        (0..n * n)
            .map(|i| {
                let z = 0.0005 * if i % 2 == 0 { 1.0 } else { -1.0 } * ((i % 7) as f64 / 7.0);
                Point::new((i % n) as f64 * 0.002, (i / n) as f64 * 0.002, z)
                    .with_normal(Vector3::z())
                    .with_confidence(0.2)
            })
            .collect()
    }

    fn roughness(cloud: &PointCloud) -> f64 {
        cloud.iter().map(|p| p.position.z.abs()).sum::<f64>() / cloud.len() as f64
    }

    #[test]
    fn test_smoothing_flattens_noise() {
        let cloud = noisy_plane(20);
        let params = SmoothingParams::default();
        let out = smooth_cloud(&cloud, &[], &CpuBackend, &params, &CancellationToken::new()).unwrap();
        assert_eq!(out.len(), cloud.len());
        assert!(roughness(&out) < roughness(&cloud) * 0.7);
        // Motion is along the normal only.
        for (a, b) in cloud.iter().zip(out.iter()) {
            assert_eq!(a.position.x, b.position.x);
            assert_eq!(a.confidence, b.confidence);
        }
    }

    #[test]
    fn test_feature_points_move_less() {
        let p = SmoothInput {
            position: Point3::origin(),
            normal: Some(Vector3::z()),
            confidence: 0.1,
            feature: false,
        };
        let params = SmoothingParams::default();
        assert_eq!(smoothing_strength(&p, &params), 1.0);
        let trusted = SmoothInput {
            confidence: 1.0,
            ..p
        };
        assert!((smoothing_strength(&trusted, &params) - 0.5).abs() < 1e-12);
        let feature = SmoothInput { feature: true, ..p };
        assert!((smoothing_strength(&feature, &params) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_range_weight_preserves_step() {
        // Two flat terraces 5 mm apart: points on one barely see the other.
        let points: Vec<SmoothInput> = (0..20)
            .map(|i| SmoothInput {
                position: Point3::new((i % 10) as f64 * 0.001, 0.0, if i < 10 { 0.0 } else { 0.005 }),
                normal: Some(Vector3::z()),
                confidence: 0.0,
                feature: false,
            })
            .collect();
        let hood: Vec<usize> = (1..20).collect();
        let d = bilateral_displacement(&points[0], &hood, &points, &SmoothingParams::default());
        // A plain spatial average would pull it up by about 1.8 mm.
        assert!(d.norm() < 2.5e-4, "{}", d.norm());
    }

    #[test]
    fn test_disabled_and_cancelled() {
        let cloud = noisy_plane(6);
        let params = SmoothingParams {
            enabled: false,
            ..Default::default()
        };
        let out = smooth_cloud(&cloud, &[], &CpuBackend, &params, &CancellationToken::new()).unwrap();
        assert_eq!(out.points(), cloud.points());

        let token = CancellationToken::new();
        token.cancel();
        let err = smooth_cloud(&cloud, &[], &CpuBackend, &SmoothingParams::default(), &token);
        assert!(matches!(err, Err(FusionError::Cancelled { .. })));
    }
}
