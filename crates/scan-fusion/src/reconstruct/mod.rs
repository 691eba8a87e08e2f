//! Surface reconstruction from an unoriented point cloud.
//!
//! Three stages, each a hard synchronization point:
//!
//! 1. **Orientation** ([`estimate_normals`]): PCA normals over k-neighborhoods
//!    through the [`ComputeBackend`], made consistent by propagation, with
//!    low-confidence points discarded.
//! 2. **Field** ([`field::sample_field`]): blended tangent-plane distances
//!    on a uniform grid.
//! 3. **Extraction** ([`marching_cubes::extract`]): manifold iso-surface.
//!
//! # Example
//!
//! ```
//! use scan_fusion::reconstruct::{ReconstructionParams, reconstruct};
//! use scan_fusion::progress::CancellationToken;
//! use scan_fusion::PointCloud;
//! use nalgebra::Point3;
//!
//! let n = 1500;
//! let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
//! let cloud = PointCloud::from_positions((0..n).map(|i| {
//!     let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
//!     let r = (1.0 - y * y).sqrt();
//!     let t = golden * i as f64;
//!     Point3::new(r * t.cos(), y, r * t.sin())
//! }));
//!
//! let params = ReconstructionParams { resolution: 20, ..Default::default() };
//! let result = reconstruct(&cloud, &params, &CancellationToken::new()).unwrap();
//! assert!(result.mesh.triangle_count() > 0);
//! ```

pub mod field;
pub mod marching_cubes;
pub mod normals;
mod tables;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{ComputeBackend, CpuBackend};
use crate::error::{FusionError, FusionResult};
use crate::progress::CancellationToken;
use crate::spatial::{IndexKind, SpatialIndexHandle};
use crate::tracing_ext::{OperationTimer, log_mesh_stats};
use crate::types::{BoundingBox, MeshData, PointCloud, Stage};

use self::field::{FieldParams, GridSpec};

/// Fewest oriented points that can bound a surface.
pub const MIN_ORIENTED_POINTS: usize = 4;

/// A position with a consistently signed unit normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedPoint {
    pub position: Point3<f64>,
    pub normal: Vector3<f64>,
    /// Orientation confidence scaled by the source point's confidence.
    pub confidence: f64,
}

/// Parameters for [`reconstruct`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionParams {
    /// Grid cells along the longest bounding-box axis.
    pub resolution: usize,
    /// Neighbors used for PCA normals.
    pub normal_neighbors: usize,
    /// Points oriented less confidently than this are dropped.
    pub min_orientation_confidence: f64,
    /// Oriented points blended per grid node.
    pub field_neighbors: usize,
    /// Field support radius in grid cells.
    pub support_radius_cells: f64,
    /// Empty cells added around the bounds.
    pub padding_cells: usize,
    pub iso_level: f64,
    pub index_kind: IndexKind,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            resolution: 64,
            normal_neighbors: 20,
            min_orientation_confidence: 0.3,
            field_neighbors: 8,
            support_radius_cells: 2.5,
            padding_cells: 2,
            iso_level: 0.0,
            index_kind: IndexKind::KdTree,
        }
    }
}

impl ReconstructionParams {
    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn validate(&self) -> FusionResult<()> {
        if self.resolution < 2 || self.resolution > field::MAX_GRID_NODES_PER_AXIS / 2 {
            return Err(FusionError::invalid_config(
                "reconstruction.resolution",
                format!("must be in 2..={}", field::MAX_GRID_NODES_PER_AXIS / 2),
            ));
        }
        if self.normal_neighbors < 3 {
            return Err(FusionError::invalid_config(
                "reconstruction.normal_neighbors",
                "need at least 3 neighbors for a plane fit",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_orientation_confidence) {
            return Err(FusionError::invalid_config(
                "reconstruction.min_orientation_confidence",
                "must be in [0, 1]",
            ));
        }
        if self.field_neighbors == 0 {
            return Err(FusionError::invalid_config(
                "reconstruction.field_neighbors",
                "must be at least 1",
            ));
        }
        if !(self.support_radius_cells > 0.0) {
            return Err(FusionError::invalid_config(
                "reconstruction.support_radius_cells",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Output of [`reconstruct`].
#[derive(Debug, Clone)]
pub struct ReconstructionResult {
    pub mesh: MeshData,
    /// Points that survived orientation.
    pub oriented: Vec<OrientedPoint>,
    /// Points dropped for degenerate or low-confidence neighborhoods.
    pub discarded: usize,
    pub grid_dims: [usize; 3],
    /// Iso crossings interpolated by the extractor.
    pub iso_vertices: usize,
    /// Share of grid nodes with field support.
    pub supported_fraction: f64,
}

/// Orient every point of `cloud` and drop those that can't be trusted.
///
/// Returns the oriented points and the number discarded. Sensor normals
/// present on the input decide the sign of the estimated ones.
pub fn estimate_normals(
    cloud: &PointCloud,
    backend: &dyn ComputeBackend,
    params: &ReconstructionParams,
    token: &CancellationToken,
) -> FusionResult<(Vec<OrientedPoint>, usize)> {
    let positions = cloud.positions();
    let index = SpatialIndexHandle::from_positions(params.index_kind, positions.clone());
    let neighborhoods = index.neighborhoods(params.normal_neighbors);
    token.check(Stage::Reconstruction)?;

    let frames = backend.covariance_normals(&positions, &neighborhoods);
    token.check(Stage::Reconstruction)?;

    // Orientation only propagates through points that have a frame.
    let has_frame: Vec<bool> = frames.iter().map(Option::is_some).collect();
    let graph: Vec<Vec<usize>> = neighborhoods
        .iter()
        .enumerate()
        .map(|(i, hood)| {
            if has_frame[i] {
                hood.iter().copied().filter(|&j| has_frame[j]).collect()
            } else {
                Vec::new()
            }
        })
        .collect();
    let mut normals: Vec<Vector3<f64>> = frames
        .iter()
        .map(|f| f.map_or_else(Vector3::zeros, |f| f.normal))
        .collect();
    let hints: Vec<Option<Vector3<f64>>> = cloud.iter().map(|p| p.normal).collect();
    let centroid = cloud.centroid().unwrap_or_else(Point3::origin);
    normals::orient_normals(&positions, &mut normals, &hints, &graph, &centroid);

    let mut oriented = Vec::with_capacity(positions.len());
    let mut degenerate = 0usize;
    let mut unconfident = 0usize;
    for (i, frame) in frames.iter().enumerate() {
        let Some(frame) = frame else {
            degenerate += 1;
            continue;
        };
        let confidence =
            normals::orientation_confidence(frame, neighborhoods[i].len(), params.normal_neighbors);
        if confidence < params.min_orientation_confidence {
            unconfident += 1;
            continue;
        }
        oriented.push(OrientedPoint {
            position: positions[i],
            normal: normals[i],
            confidence: (confidence * cloud.points()[i].confidence).clamp(0.0, 1.0),
        });
    }

    debug!(
        kept = oriented.len(),
        degenerate, unconfident, "Normal estimation finished"
    );
    Ok((oriented, degenerate + unconfident))
}

/// Reconstruct a mesh on the CPU backend.
pub fn reconstruct(
    cloud: &PointCloud,
    params: &ReconstructionParams,
    token: &CancellationToken,
) -> FusionResult<ReconstructionResult> {
    reconstruct_with_backend(cloud, &CpuBackend, params, token)
}

/// Reconstruct a mesh, running per-point kernels on `backend`.
pub fn reconstruct_with_backend(
    cloud: &PointCloud,
    backend: &dyn ComputeBackend,
    params: &ReconstructionParams,
    token: &CancellationToken,
) -> FusionResult<ReconstructionResult> {
    let timer = OperationTimer::with_size(Stage::Reconstruction, cloud.len());
    params.validate()?;
    if cloud.len() < MIN_ORIENTED_POINTS {
        return Err(FusionError::insufficient_data(
            Stage::Reconstruction,
            MIN_ORIENTED_POINTS,
            cloud.len(),
        ));
    }

    let (oriented, discarded) = estimate_normals(cloud, backend, params, token)?;
    if oriented.len() < MIN_ORIENTED_POINTS {
        return Err(FusionError::insufficient_data(
            Stage::Reconstruction,
            MIN_ORIENTED_POINTS,
            oriented.len(),
        ));
    }

    let positions: Vec<Point3<f64>> = oriented.iter().map(|p| p.position).collect();
    let bounds = BoundingBox::from_points(positions.iter()).ok_or_else(|| {
        FusionError::insufficient_data(Stage::Reconstruction, MIN_ORIENTED_POINTS, 0)
    })?;
    let spec = GridSpec::covering(&bounds, params.resolution, params.padding_cells)?;
    let field_params = FieldParams {
        neighbors: params.field_neighbors,
        support_radius: params.support_radius_cells * spec.cell_size,
    };
    let index = SpatialIndexHandle::from_positions(params.index_kind, positions);
    let field = field::sample_field(&oriented, &index, spec, field_params, token)?;

    let extraction = marching_cubes::extract(&field, params.iso_level, token)?;
    if extraction.triangles.is_empty() {
        return Err(FusionError::insufficient_data(
            Stage::Reconstruction,
            MIN_ORIENTED_POINTS,
            oriented.len(),
        ));
    }

    let iso_vertices = extraction.crossings;
    let detail = format!(
        "marching cubes on {}x{}x{} grid, {} oriented points, {} discarded",
        spec.dims[0],
        spec.dims[1],
        spec.dims[2],
        oriented.len(),
        discarded
    );
    let mesh = MeshData::new(
        extraction.vertices,
        extraction.normals,
        extraction.confidence,
        extraction.triangles,
    )?
    .with_step(Stage::Reconstruction, detail, timer.elapsed_ms());

    info!(
        vertices = mesh.vertex_count(),
        triangles = mesh.triangle_count(),
        discarded,
        "Reconstruction complete"
    );
    log_mesh_stats(&mesh, "reconstruction");

    Ok(ReconstructionResult {
        mesh,
        oriented,
        discarded,
        grid_dims: spec.dims,
        iso_vertices,
        supported_fraction: field.supported_fraction(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn sphere_cloud(n: usize, radius: f64) -> PointCloud {
        let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
        PointCloud::from_positions((0..n).map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let t = golden * i as f64;
            Point3::new(r * t.cos() * radius, y * radius, r * t.sin() * radius)
        }))
    }

    #[test]
    fn test_sphere_reconstruction() {
        let cloud = sphere_cloud(2000, 1.0);
        let params = ReconstructionParams::default().with_resolution(24);
        let result = reconstruct(&cloud, &params, &CancellationToken::new()).unwrap();

        assert!(result.mesh.triangle_count() > 100);
        assert!(result.discarded < 100);
        assert!(result.iso_vertices >= result.mesh.vertex_count());
        for (v, n) in result.mesh.vertices().iter().zip(result.mesh.normals()) {
            assert!((v.coords.norm() - 1.0).abs() < 0.1, "{}", v.coords.norm());
            assert!(n.dot(&v.coords) > 0.0);
        }
        assert_eq!(result.mesh.metadata().steps.len(), 1);
        assert!(result.oriented.iter().all(|p| p.normal.dot(&p.position.coords) > 0.0));
    }

    #[test]
    fn test_sensor_normals_set_orientation() {
        // Inward-facing sensor normals flip the whole shell.
        let cloud: PointCloud = sphere_cloud(800, 1.0)
            .iter()
            .map(|p| Point::from_position(p.position).with_normal(-p.position.coords))
            .collect();
        let params = ReconstructionParams::default().with_resolution(16);
        let (oriented, _) =
            estimate_normals(&cloud, &CpuBackend, &params, &CancellationToken::new()).unwrap();
        assert!(oriented.iter().all(|p| p.normal.dot(&p.position.coords) < 0.0));
    }

    #[test]
    fn test_collinear_points_are_discarded() {
        let cloud = PointCloud::from_positions((0..50).map(|i| Point3::new(i as f64 * 0.1, 0.0, 0.0)));
        let params = ReconstructionParams::default();
        let (oriented, discarded) =
            estimate_normals(&cloud, &CpuBackend, &params, &CancellationToken::new()).unwrap();
        assert!(oriented.is_empty());
        assert_eq!(discarded, 50);
        assert!(matches!(
            reconstruct(&cloud, &params, &CancellationToken::new()),
            Err(FusionError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_too_few_points() {
        let cloud = PointCloud::from_positions([Point3::origin(), Point3::new(1.0, 0.0, 0.0)]);
        let err = reconstruct(&cloud, &ReconstructionParams::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, FusionError::InsufficientData { actual: 2, .. }));
    }

    #[test]
    fn test_cancelled_reconstruction() {
        let token = CancellationToken::new();
        token.cancel();
        let err = reconstruct(&sphere_cloud(300, 1.0), &ReconstructionParams::default(), &token)
            .unwrap_err();
        assert!(matches!(err, FusionError::Cancelled { .. }));
    }

    #[test]
    fn test_params_validation() {
        assert!(ReconstructionParams::default().validate().is_ok());
        assert!(ReconstructionParams::default().with_resolution(1).validate().is_err());
        let p = ReconstructionParams {
            normal_neighbors: 2,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }
}
