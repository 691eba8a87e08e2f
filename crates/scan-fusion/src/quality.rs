//! Per-source and per-mesh quality metrics.
//!
//! A cloud is scored on density, normal consistency, completeness, noise and
//! feature coverage. The sub-metrics are folded into one confidence per
//! source with configured weights that must sum to 1. Meshes get their own
//! metric set, checked against a [`MeshQualityFloor`].
//!
//! # Example
//!
//! ```
//! use scan_fusion::quality::{QualityConfig, QualityEstimator};
//! use scan_fusion::PointCloud;
//! use nalgebra::Point3;
//!
//! let cloud = PointCloud::from_positions(
//!     (0..400).map(|i| Point3::new((i % 20) as f64 * 0.005, (i / 20) as f64 * 0.005, 0.0)),
//! );
//! let bounds = cloud.bounds().unwrap();
//! let estimator = QualityEstimator::new(QualityConfig::default());
//! let metrics = estimator.estimate(&cloud, &bounds);
//! assert!(metrics.normal_consistency > 0.99);
//! assert!(metrics.noise_level < 0.01);
//! ```

use std::sync::Arc;

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alignment::AlignmentResult;
use crate::backend::{ComputeBackend, CpuBackend};
use crate::camera::CameraIntrinsics;
use crate::error::{FusionError, FusionResult};
use crate::reconstruct::normals::local_frame;
use crate::spatial::{IndexKind, KdTree, SpatialIndex, SpatialIndexHandle};
use crate::tracing_ext::OperationTimer;
use crate::types::{BoundingBox, Feature, MeshData, PointCloud, Stage};

/// Neighbors needed before a point contributes to consistency or noise.
pub const MIN_QUALITY_NEIGHBORS: usize = 3;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Quality of one point source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Points per volume relative to the optimal density, in [0, 1].
    pub density: f64,
    /// Mean agreement of neighboring normals, in [0, 1].
    pub normal_consistency: f64,
    /// Coverage of the image or bounding-box grid, in [0, 1].
    pub completeness: f64,
    /// Mean distance to local planes over neighborhood radius, in [0, 1].
    pub noise_level: f64,
    /// Weighted share of features with nearby points, in [0, 1].
    pub feature_preservation: f64,
    /// Mean ICP residual in scan units, 0 until alignment ran.
    pub alignment_residual: f64,
}

impl QualityMetrics {
    pub fn with_alignment_residual(mut self, residual: f64) -> Self {
        self.alignment_residual = residual;
        self
    }
}

/// Weights folding [`QualityMetrics`] into one confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub density: f64,
    pub normal_consistency: f64,
    pub completeness: f64,
    /// Applied to `1 - noise_level`.
    pub noise: f64,
    pub feature_preservation: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            density: 0.25,
            normal_consistency: 0.25,
            completeness: 0.2,
            noise: 0.15,
            feature_preservation: 0.15,
        }
    }
}

impl QualityWeights {
    pub fn sum(&self) -> f64 {
        self.density
            + self.normal_consistency
            + self.completeness
            + self.noise
            + self.feature_preservation
    }

    pub fn validate(&self) -> FusionResult<()> {
        validate_weights(
            "quality.weights",
            &[
                self.density,
                self.normal_consistency,
                self.completeness,
                self.noise,
                self.feature_preservation,
            ],
        )
    }
}

fn validate_weights(field: &str, weights: &[f64]) -> FusionResult<()> {
    if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
        return Err(FusionError::invalid_config(field, "weights must lie in [0, 1]"));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(FusionError::invalid_config(
            field,
            format!("weights sum to {:.6}, expected 1", sum),
        ));
    }
    Ok(())
}

fn check_unit(field: &str, value: f64) -> FusionResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FusionError::invalid_config(field, "must be in [0, 1]"))
    }
}

fn check_positive(field: &str, value: f64) -> FusionResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(FusionError::invalid_config(field, "must be positive"))
    }
}

/// Weights folding [`MeshQualityMetrics`] into one score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshQualityWeights {
    pub vertex_density: f64,
    pub normal_consistency: f64,
    pub smoothness: f64,
    pub feature_preservation: f64,
}

impl Default for MeshQualityWeights {
    fn default() -> Self {
        Self {
            vertex_density: 0.2,
            normal_consistency: 0.3,
            smoothness: 0.3,
            feature_preservation: 0.2,
        }
    }
}

/// Minimum acceptable mesh quality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshQualityFloor {
    pub min_vertex_density: f64,
    pub min_normal_consistency: f64,
    pub min_smoothness: f64,
    pub min_feature_preservation: f64,
    /// Floor on the weighted score.
    pub min_score: f64,
    pub weights: MeshQualityWeights,
}

impl Default for MeshQualityFloor {
    fn default() -> Self {
        Self {
            min_vertex_density: 0.05,
            min_normal_consistency: 0.5,
            min_smoothness: 0.5,
            min_feature_preservation: 0.0,
            min_score: 0.4,
            weights: MeshQualityWeights::default(),
        }
    }
}

impl MeshQualityFloor {
    pub fn validate(&self) -> FusionResult<()> {
        check_unit("quality.mesh_floor.min_vertex_density", self.min_vertex_density)?;
        check_unit("quality.mesh_floor.min_normal_consistency", self.min_normal_consistency)?;
        check_unit("quality.mesh_floor.min_smoothness", self.min_smoothness)?;
        check_unit("quality.mesh_floor.min_feature_preservation", self.min_feature_preservation)?;
        check_unit("quality.mesh_floor.min_score", self.min_score)?;
        let w = &self.weights;
        validate_weights(
            "quality.mesh_floor.weights",
            &[w.vertex_density, w.normal_consistency, w.smoothness, w.feature_preservation],
        )
    }

    /// First metric under its floor, as `QualityBelowThreshold`.
    pub fn check(&self, metrics: &MeshQualityMetrics) -> FusionResult<()> {
        let checks = [
            ("mesh vertex density", metrics.vertex_density, self.min_vertex_density),
            ("mesh normal consistency", metrics.normal_consistency, self.min_normal_consistency),
            ("mesh smoothness", metrics.smoothness, self.min_smoothness),
            ("mesh feature preservation", metrics.feature_preservation, self.min_feature_preservation),
            ("mesh quality score", metrics.score(&self.weights), self.min_score),
        ];
        match checks.into_iter().find(|(_, value, floor)| value < floor) {
            Some((metric, value, floor)) => {
                Err(FusionError::quality_below_threshold(metric, value, floor))
            }
            None => Ok(()),
        }
    }
}

/// Quality estimator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Neighbors examined per point.
    pub k_neighbors: usize,
    /// Neighbors farther than this are ignored for consistency and noise.
    pub neighborhood_radius: f64,
    /// Points per cubic unit that scores a density of 1.
    pub optimal_density: f64,
    /// Floor on each bounding-box extent when computing volume, so flat
    /// scans don't divide by zero.
    pub min_extent: f64,
    /// Cells per side of the completeness grid.
    pub completeness_grid: usize,
    /// A feature counts as covered with a point this close.
    pub feature_radius: f64,
    /// Residual at which alignment confidence reaches 0.
    pub max_acceptable_residual: f64,
    pub min_density: f64,
    pub min_normal_consistency: f64,
    /// Minimum per-source confidence for a passing report.
    pub min_confidence: f64,
    pub weights: QualityWeights,
    /// Vertices per square unit that scores a mesh density of 1.
    pub optimal_surface_density: f64,
    /// Falloff for mesh feature preservation.
    pub mesh_feature_sigma: f64,
    pub mesh_floor: MeshQualityFloor,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            k_neighbors: 8,
            neighborhood_radius: 0.05,
            optimal_density: 1.0e6,
            min_extent: 1e-3,
            completeness_grid: 16,
            feature_radius: 0.005,
            max_acceptable_residual: 0.005,
            min_density: 0.05,
            min_normal_consistency: 0.5,
            min_confidence: 0.3,
            weights: QualityWeights::default(),
            optimal_surface_density: 1.0e4,
            mesh_feature_sigma: 0.005,
            mesh_floor: MeshQualityFloor::default(),
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> FusionResult<()> {
        if self.k_neighbors < MIN_QUALITY_NEIGHBORS {
            return Err(FusionError::invalid_config(
                "quality.k_neighbors",
                format!("must be at least {}", MIN_QUALITY_NEIGHBORS),
            ));
        }
        if self.completeness_grid == 0 {
            return Err(FusionError::invalid_config(
                "quality.completeness_grid",
                "must be at least 1",
            ));
        }
        check_positive("quality.neighborhood_radius", self.neighborhood_radius)?;
        check_positive("quality.optimal_density", self.optimal_density)?;
        check_positive("quality.min_extent", self.min_extent)?;
        check_positive("quality.feature_radius", self.feature_radius)?;
        check_positive("quality.max_acceptable_residual", self.max_acceptable_residual)?;
        check_positive("quality.optimal_surface_density", self.optimal_surface_density)?;
        check_positive("quality.mesh_feature_sigma", self.mesh_feature_sigma)?;
        check_unit("quality.min_density", self.min_density)?;
        check_unit("quality.min_normal_consistency", self.min_normal_consistency)?;
        check_unit("quality.min_confidence", self.min_confidence)?;
        self.weights.validate()?;
        self.mesh_floor.validate()
    }
}

/// One metric that failed its threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityFailure {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
}

/// Metrics plus a pass/fail verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub metrics: QualityMetrics,
    pub confidence: f64,
    pub passed: bool,
    pub failures: Vec<QualityFailure>,
}

impl QualityReport {
    /// The first failure as `QualityBelowThreshold`.
    pub fn into_result(self) -> FusionResult<Self> {
        match self.failures.first() {
            Some(f) => Err(FusionError::quality_below_threshold(
                f.metric.clone(),
                f.value,
                f.threshold,
            )),
            None => Ok(self),
        }
    }
}

/// Mesh-level quality.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshQualityMetrics {
    pub vertex_density: f64,
    pub normal_consistency: f64,
    pub smoothness: f64,
    pub feature_preservation: f64,
}

impl MeshQualityMetrics {
    pub fn score(&self, weights: &MeshQualityWeights) -> f64 {
        (self.vertex_density * weights.vertex_density
            + self.normal_consistency * weights.normal_consistency
            + self.smoothness * weights.smoothness
            + self.feature_preservation * weights.feature_preservation)
            .clamp(0.0, 1.0)
    }
}

/// Per-point kernel output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointQuality {
    /// Mean `n_i · n_j` over neighbors with normals, clamped to `[0, 1]`,
    /// if at least three. Flipped neighbors pull it towards 0.
    pub normal_agreement: Option<f64>,
    /// Mean distance of the neighborhood to its PCA plane over the
    /// neighborhood radius, if at least three neighbors.
    pub plane_deviation: Option<f64>,
}

/// Score point `i` against its (radius-limited) neighborhood.
pub fn point_quality(
    i: usize,
    hood: &[usize],
    positions: &[Point3<f64>],
    normals: &[Option<Vector3<f64>>],
) -> PointQuality {
    let normal_agreement = normals[i].and_then(|ni| {
        let dots: Vec<f64> = hood
            .iter()
            .filter_map(|&j| normals[j])
            .map(|nj| ni.dot(&nj))
            .collect();
        (dots.len() >= MIN_QUALITY_NEIGHBORS)
            .then(|| (dots.iter().sum::<f64>() / dots.len() as f64).clamp(0.0, 1.0))
    });

    let plane_deviation = if hood.len() >= MIN_QUALITY_NEIGHBORS {
        let p = positions[i];
        let pts: Vec<Point3<f64>> = std::iter::once(p)
            .chain(hood.iter().map(|&j| positions[j]))
            .collect();
        let radius = hood
            .iter()
            .map(|&j| (positions[j] - p).norm())
            .fold(0.0, f64::max);
        local_frame(&pts).filter(|_| radius > 0.0).map(|frame| {
            let mean = pts
                .iter()
                .map(|q| frame.normal.dot(&(q - frame.centroid)).abs())
                .sum::<f64>()
                / pts.len() as f64;
            (mean / radius).clamp(0.0, 1.0)
        })
    } else {
        None
    };

    PointQuality {
        normal_agreement,
        plane_deviation,
    }
}

/// `normal` flipped, if needed, to point back towards the camera origin.
fn facing_camera(normal: Vector3<f64>, position: &Point3<f64>) -> Vector3<f64> {
    if normal.dot(&position.coords) > 0.0 {
        -normal
    } else {
        normal
    }
}

/// Confidence that a registration is usable: `1 - min(residual / max, 1)`.
pub fn alignment_confidence(result: &AlignmentResult, max_acceptable_residual: f64) -> f64 {
    if result.is_failed() || !result.residual.is_finite() {
        return 0.0;
    }
    1.0 - (result.residual / max_acceptable_residual).min(1.0)
}

/// Computes [`QualityMetrics`] for clouds and [`MeshQualityMetrics`] for meshes.
#[derive(Clone)]
pub struct QualityEstimator {
    config: QualityConfig,
    camera: Option<CameraIntrinsics>,
    backend: Arc<dyn ComputeBackend>,
}

impl QualityEstimator {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            camera: None,
            backend: Arc::new(CpuBackend),
        }
    }

    /// Measure completeness as image-space coverage through this camera.
    pub fn with_camera(mut self, camera: Option<CameraIntrinsics>) -> Self {
        self.camera = camera;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Metrics for a cloud without features, building a temporary index.
    pub fn estimate(&self, cloud: &PointCloud, bounds: &BoundingBox) -> QualityMetrics {
        let index = SpatialIndexHandle::build(IndexKind::KdTree, cloud);
        self.estimate_with_index(cloud, &index, bounds, &[])
    }

    /// Metrics for a cloud using its prebuilt index.
    ///
    /// Points without a sensor normal are scored with their PCA normal,
    /// turned to face the camera at the origin.
    pub fn estimate_with_index(
        &self,
        cloud: &PointCloud,
        index: &SpatialIndexHandle,
        bounds: &BoundingBox,
        features: &[Feature],
    ) -> QualityMetrics {
        let _timer = OperationTimer::with_size(Stage::Quality, cloud.len());
        if cloud.is_empty() {
            return QualityMetrics::default();
        }

        let positions = cloud.positions();
        let hoods =
            index.neighborhoods_within(self.config.k_neighbors, self.config.neighborhood_radius);

        let mut normals: Vec<Option<Vector3<f64>>> = cloud.iter().map(|p| p.normal).collect();
        if normals.iter().any(Option::is_none) {
            let frames = self.backend.covariance_normals(&positions, &hoods);
            for ((n, frame), p) in normals.iter_mut().zip(frames).zip(&positions) {
                if n.is_none() {
                    *n = frame.map(|f| facing_camera(f.normal, p));
                }
            }
        }

        let scores = self.backend.quality_scores(&positions, &normals, &hoods);
        let normal_consistency = mean(scores.iter().filter_map(|s| s.normal_agreement));
        let noise_level = mean(scores.iter().filter_map(|s| s.plane_deviation));

        let metrics = QualityMetrics {
            density: self.density(cloud.len(), bounds),
            normal_consistency: normal_consistency.unwrap_or(0.0).clamp(0.0, 1.0),
            completeness: self.completeness(&positions, bounds),
            // No measurable neighborhoods means no evidence of a clean surface.
            noise_level: noise_level.unwrap_or(1.0).clamp(0.0, 1.0),
            feature_preservation: self.cloud_feature_preservation(index, features),
            alignment_residual: 0.0,
        };
        debug!(
            points = cloud.len(),
            density = metrics.density,
            normal_consistency = metrics.normal_consistency,
            completeness = metrics.completeness,
            noise = metrics.noise_level,
            "Estimated cloud quality"
        );
        metrics
    }

    fn density(&self, count: usize, bounds: &BoundingBox) -> f64 {
        let e = bounds.extent();
        let volume = (0..3)
            .map(|axis| e[axis].max(self.config.min_extent))
            .product::<f64>();
        (count as f64 / volume / self.config.optimal_density).clamp(0.0, 1.0)
    }

    fn completeness(&self, positions: &[Point3<f64>], bounds: &BoundingBox) -> f64 {
        let g = self.config.completeness_grid;
        let mut hit = vec![false; g * g];
        match &self.camera {
            Some(camera) => {
                for p in positions {
                    if let Some((u, v)) = camera.project(p) {
                        let cx = ((u / camera.width as f64) * g as f64) as usize;
                        let cy = ((v / camera.height as f64) * g as f64) as usize;
                        hit[cy.min(g - 1) * g + cx.min(g - 1)] = true;
                    }
                }
            }
            None => {
                // Occupancy over the two widest axes of the scan box.
                let e = bounds.extent();
                let mut axes = [0usize, 1, 2];
                axes.sort_by(|&a, &b| e[b].total_cmp(&e[a]));
                let (a, b) = (axes[0], axes[1]);
                if !(e[a] > 0.0 && e[b] > 0.0) {
                    return 0.0;
                }
                for p in positions.iter().filter(|p| bounds.contains(p)) {
                    let cx = ((p[a] - bounds.min[a]) / e[a] * g as f64) as usize;
                    let cy = ((p[b] - bounds.min[b]) / e[b] * g as f64) as usize;
                    hit[cy.min(g - 1) * g + cx.min(g - 1)] = true;
                }
            }
        }
        hit.iter().filter(|&&h| h).count() as f64 / hit.len() as f64
    }

    fn cloud_feature_preservation(&self, index: &SpatialIndexHandle, features: &[Feature]) -> f64 {
        let total: f64 = features.iter().map(|f| f.confidence).sum();
        if total <= 0.0 {
            return 1.0;
        }
        let covered: f64 = features
            .iter()
            .filter(|f| {
                index
                    .nearest_within(&f.position, self.config.feature_radius)
                    .is_some()
            })
            .map(|f| f.confidence)
            .sum();
        (covered / total).clamp(0.0, 1.0)
    }

    pub fn alignment_confidence(&self, result: &AlignmentResult) -> f64 {
        alignment_confidence(result, self.config.max_acceptable_residual)
    }

    /// Weighted per-source confidence.
    pub fn confidence(&self, m: &QualityMetrics) -> f64 {
        let w = &self.config.weights;
        (m.density * w.density
            + m.normal_consistency * w.normal_consistency
            + m.completeness * w.completeness
            + (1.0 - m.noise_level) * w.noise
            + m.feature_preservation * w.feature_preservation)
            .clamp(0.0, 1.0)
    }

    pub fn report(&self, metrics: QualityMetrics) -> QualityReport {
        let confidence = self.confidence(&metrics);
        let mut failures = Vec::new();
        let mut require = |metric: &str, value: f64, threshold: f64| {
            if value < threshold {
                failures.push(QualityFailure {
                    metric: metric.to_string(),
                    value,
                    threshold,
                });
            }
        };
        require("density", metrics.density, self.config.min_density);
        require(
            "normal consistency",
            metrics.normal_consistency,
            self.config.min_normal_consistency,
        );
        require("confidence", confidence, self.config.min_confidence);
        QualityReport {
            metrics,
            confidence,
            passed: failures.is_empty(),
            failures,
        }
    }

    /// Quality of a reconstructed or refined mesh.
    pub fn estimate_mesh(&self, mesh: &MeshData, features: &[Feature]) -> MeshQualityMetrics {
        if mesh.is_empty() {
            return MeshQualityMetrics::default();
        }

        let area = mesh.surface_area();
        let vertex_density = if area > 0.0 {
            (mesh.vertex_count() as f64 / area / self.config.optimal_surface_density).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut edge_faces: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
        for (t, tri) in mesh.indices().iter().enumerate() {
            for k in 0..3 {
                let (a, b) = (tri[k], tri[(k + 1) % 3]);
                edge_faces.entry((a.min(b), a.max(b))).or_default().push(t);
            }
        }

        let normals = mesh.normals();
        let normal_consistency = mean(
            edge_faces
                .keys()
                .map(|&(a, b)| normals[a as usize].dot(&normals[b as usize]).max(0.0)),
        )
        .unwrap_or(0.0);

        let face_normals: Vec<Option<Vector3<f64>>> = (0..mesh.triangle_count())
            .map(|t| mesh.face_normal_unnormalized(t).try_normalize(1e-300))
            .collect();
        let smoothness = mean(edge_faces.values().filter(|f| f.len() == 2).filter_map(|f| {
            let (a, b) = (face_normals[f[0]]?, face_normals[f[1]]?);
            Some(a.dot(&b).max(0.0))
        }))
        .unwrap_or(1.0);

        MeshQualityMetrics {
            vertex_density,
            normal_consistency: normal_consistency.clamp(0.0, 1.0),
            smoothness: smoothness.clamp(0.0, 1.0),
            feature_preservation: self.mesh_feature_preservation(mesh, features),
        }
    }

    fn mesh_feature_preservation(&self, mesh: &MeshData, features: &[Feature]) -> f64 {
        let total: f64 = features.iter().map(|f| f.confidence).sum();
        if total <= 0.0 {
            return 1.0;
        }
        let tree = KdTree::build(mesh.vertices().to_vec());
        let two_sigma2 = 2.0 * self.config.mesh_feature_sigma.powi(2);
        let preserved: f64 = features
            .iter()
            .map(|f| {
                let d2 = tree.nearest(&f.position).map_or(f64::INFINITY, |n| n.distance_squared);
                f.confidence * (-d2 / two_sigma2).exp()
            })
            .sum();
        (preserved / total).clamp(0.0, 1.0)
    }
}

impl std::fmt::Debug for QualityEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityEstimator")
            .field("config", &self.config)
            .field("camera", &self.camera)
            .field("backend", &self.backend.name())
            .finish()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{RigidTransform, Termination};
    use crate::types::Point;
    use approx::assert_relative_eq;

    fn grid_cloud(n: usize, spacing: f64, jitter: f64) -> PointCloud {
        (0..n * n)
            .map(|i| {
                let (x, y) = ((i % n) as f64, (i / n) as f64);
                // Deterministic pseudo-noise.
                let z = jitter * ((i as f64 * 12.9898).sin() * 43758.5453).fract();
                Point::new(x * spacing, y * spacing, z).with_normal(Vector3::z())
            })
            .collect()
    }

    fn estimator() -> QualityEstimator {
        QualityEstimator::new(QualityConfig::default())
    }

    #[test]
    fn test_flat_grid_is_consistent_and_clean() {
        let cloud = grid_cloud(20, 0.005, 0.0);
        let m = estimator().estimate(&cloud, &cloud.bounds().unwrap());
        assert_relative_eq!(m.normal_consistency, 1.0, epsilon = 1e-9);
        assert!(m.noise_level < 1e-6);
        assert_relative_eq!(m.completeness, 1.0);
        assert_relative_eq!(m.feature_preservation, 1.0);
    }

    #[test]
    fn test_flipped_normals_are_inconsistent() {
        let n = 20;
        let cloud: PointCloud = grid_cloud(n, 0.005, 0.0)
            .iter()
            .enumerate()
            .map(|(i, p)| {
                // Checkerboard, so every 4-neighbor faces the other way.
                let sign = if (i % n + i / n) % 2 == 0 { 1.0 } else { -1.0 };
                p.with_normal(Vector3::z() * sign)
            })
            .collect();
        let m = estimator().estimate(&cloud, &cloud.bounds().unwrap());
        assert!(m.normal_consistency < 0.2, "consistency {}", m.normal_consistency);
    }

    #[test]
    fn test_point_agreement_clamps_opposed_normals() {
        let positions: Vec<Point3<f64>> = (0..4).map(|i| Point3::new(i as f64, 0.0, 0.0)).collect();
        let mut normals = vec![Some(-Vector3::z()); 4];
        normals[0] = Some(Vector3::z());
        let q = point_quality(0, &[1, 2, 3], &positions, &normals);
        assert_eq!(q.normal_agreement, Some(0.0));
    }

    #[test]
    fn test_pca_normals_face_the_camera() {
        // A plane in front of the camera, no sensor normals.
        let cloud: PointCloud = (0..400)
            .map(|i| Point::new((i % 20) as f64 * 0.005, (i / 20) as f64 * 0.005, 0.5))
            .collect();
        let m = estimator().estimate(&cloud, &cloud.bounds().unwrap());
        assert_relative_eq!(m.normal_consistency, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_noise_raises_noise_level() {
        let clean = grid_cloud(20, 0.005, 0.0);
        let noisy = grid_cloud(20, 0.005, 0.004);
        let e = estimator();
        let a = e.estimate(&clean, &clean.bounds().unwrap());
        let b = e.estimate(&noisy, &noisy.bounds().unwrap());
        assert!(b.noise_level > a.noise_level + 0.01);
    }

    #[test]
    fn test_isolated_points_do_not_count() {
        // Points 1 m apart have no neighbors inside the 5 cm radius.
        let cloud = grid_cloud(5, 1.0, 0.0);
        let m = estimator().estimate(&cloud, &cloud.bounds().unwrap());
        assert_eq!(m.normal_consistency, 0.0);
        assert_eq!(m.noise_level, 1.0);
    }

    #[test]
    fn test_density_normalization() {
        let cloud = grid_cloud(10, 0.001, 0.0);
        let bounds = BoundingBox::new(Point3::origin(), Point3::new(0.1, 0.1, 0.1));
        let m = estimator().estimate(&cloud, &bounds);
        // 100 points in 1e-3 m^3 against 1e6 per m^3.
        assert_relative_eq!(m.density, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_completeness_half_covered() {
        let cloud = grid_cloud(20, 0.005, 0.0);
        let mut bounds = cloud.bounds().unwrap();
        bounds.max.x += bounds.extent().x + 1e-9;
        let m = estimator().estimate(&cloud, &bounds);
        assert!((m.completeness - 0.5).abs() < 0.07, "{}", m.completeness);
    }

    #[test]
    fn test_camera_completeness() {
        let cam = CameraIntrinsics::new(100.0, 100.0, 50.0, 50.0, 100, 100);
        // Covers the left half of the image at depth 1.
        let cloud = PointCloud::from_positions(
            (0..2500).map(|i| Point3::new(-0.5 + (i % 50) as f64 * 0.01, -0.5 + (i / 50) as f64 * 0.02, 1.0)),
        );
        let e = estimator().with_camera(Some(cam));
        let m = e.estimate(&cloud, &cloud.bounds().unwrap());
        assert!((m.completeness - 0.5).abs() < 0.07, "{}", m.completeness);
    }

    #[test]
    fn test_feature_preservation() {
        let cloud = grid_cloud(20, 0.005, 0.0);
        let index = SpatialIndexHandle::build(IndexKind::KdTree, &cloud);
        let features = [
            Feature::new(1, Point3::new(0.02, 0.02, 0.0), Vector3::z(), 1.0),
            Feature::new(2, Point3::new(5.0, 5.0, 5.0), Vector3::z(), 1.0),
        ];
        let m = estimator().estimate_with_index(&cloud, &index, &cloud.bounds().unwrap(), &features);
        assert_relative_eq!(m.feature_preservation, 0.5);
    }

    #[test]
    fn test_alignment_confidence() {
        let mut result = AlignmentResult {
            transform: RigidTransform::identity(),
            residual: 0.0025,
            iterations: 5,
            converged: true,
            correspondences: 100,
            termination: Termination::Converged,
        };
        assert_relative_eq!(alignment_confidence(&result, 0.005), 0.5);
        result.residual = 1.0;
        assert_eq!(alignment_confidence(&result, 0.005), 0.0);
        result.residual = f64::INFINITY;
        result.termination = Termination::InsufficientCorrespondences;
        assert_eq!(alignment_confidence(&result, 0.005), 0.0);
    }

    #[test]
    fn test_report_failures() {
        let e = estimator();
        let report = e.report(QualityMetrics {
            density: 0.01,
            normal_consistency: 0.9,
            completeness: 0.9,
            noise_level: 0.1,
            feature_preservation: 1.0,
            alignment_residual: 0.0,
        });
        assert!(!report.passed);
        assert_eq!(report.failures[0].metric, "density");
        assert!(matches!(
            report.into_result(),
            Err(FusionError::QualityBelowThreshold { .. })
        ));
    }

    #[test]
    fn test_weights_validation() {
        assert!(QualityConfig::default().validate().is_ok());
        let mut config = QualityConfig::default();
        config.weights.density = 0.5;
        assert!(config.validate().is_err());
        let mut config = QualityConfig::default();
        config.mesh_floor.weights.smoothness = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mesh_quality_on_flat_patch() {
        // 2x2 quad grid at 1 cm spacing.
        let mut vertices = Vec::new();
        for y in 0..3 {
            for x in 0..3 {
                vertices.push(Point3::new(x as f64 * 0.01, y as f64 * 0.01, 0.0));
            }
        }
        let mut indices = Vec::new();
        for y in 0..2u32 {
            for x in 0..2u32 {
                let i = y * 3 + x;
                indices.push([i, i + 1, i + 4]);
                indices.push([i, i + 4, i + 3]);
            }
        }
        let mesh = MeshData::new(vertices, vec![Vector3::z(); 9], vec![1.0; 9], indices).unwrap();
        let features = [Feature::new(0, Point3::new(0.01, 0.01, 0.0), Vector3::z(), 1.0)];
        let m = estimator().estimate_mesh(&mesh, &features);
        assert_relative_eq!(m.normal_consistency, 1.0);
        assert_relative_eq!(m.smoothness, 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.feature_preservation, 1.0);
        assert_relative_eq!(m.vertex_density, 1.0);
        assert!(MeshQualityFloor::default().check(&m).is_ok());

        let crumpled = MeshQualityMetrics {
            smoothness: 0.1,
            ..m
        };
        assert!(matches!(
            MeshQualityFloor::default().check(&crumpled),
            Err(FusionError::QualityBelowThreshold { .. })
        ));
    }
}
