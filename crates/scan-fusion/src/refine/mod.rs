//! Feature-aware mesh refinement.
//!
//! [`refine`] decimates a reconstructed mesh toward a triangle budget,
//! optionally relaxes it with Laplacian smoothing, and validates the result.
//! Vertex importance (curvature plus proximity to tracked features) raises
//! collapse costs and damps smoothing, so detail survives where it matters.
//!
//! A refined mesh that fails validation, or that cannot reach the triangle
//! budget under the error bound, is never returned. The outcome then carries
//! the input mesh together with the typed rejection.

pub mod adjacency;
pub mod decimate;
pub mod importance;
pub mod smooth;
pub mod validate;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use adjacency::MeshAdjacency;
pub use decimate::DecimationStop;
pub use validate::{ValidationLimits, ValidationReport, validate_mesh};

use crate::backend::{ComputeBackend, CpuBackend};
use crate::error::{FusionError, FusionResult};
use crate::progress::CancellationToken;
use crate::tracing_ext::{OperationTimer, log_mesh_stats};
use crate::types::{Feature, MeshData, Stage};

use self::decimate::{Decimation, DecimationParams, decimate, recompute_normals};
use self::importance::vertex_importance;
use self::smooth::laplacian_smooth;

/// Mesh refinement parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineParams {
    pub target_triangles: usize,
    /// Largest importance-scaled quadric error a collapse may have.
    pub max_error: f64,
    /// Keep boundary vertices in place.
    pub preserve_boundary: bool,
    pub curvature_weight: f64,
    pub feature_weight: f64,
    /// Width of the Gaussian falloff around features.
    pub feature_sigma: f64,
    pub smoothing_iterations: usize,
    pub smoothing_lambda: f64,
    pub limits: ValidationLimits,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            target_triangles: 20_000,
            max_error: 1e-6,
            preserve_boundary: true,
            curvature_weight: 2.0,
            feature_weight: 4.0,
            feature_sigma: 0.005,
            smoothing_iterations: 1,
            smoothing_lambda: 0.25,
            limits: ValidationLimits::default(),
        }
    }
}

impl RefineParams {
    pub fn with_target_triangles(mut self, target: usize) -> Self {
        self.target_triangles = target;
        self
    }

    pub fn validate(&self) -> FusionResult<()> {
        if self.target_triangles == 0 {
            return Err(FusionError::invalid_config(
                "refine.target_triangles",
                "must be at least 1",
            ));
        }
        if !(self.max_error >= 0.0) {
            return Err(FusionError::invalid_config(
                "refine.max_error",
                "must be non-negative",
            ));
        }
        if self.curvature_weight < 0.0 || self.feature_weight < 0.0 || !(self.feature_sigma > 0.0)
        {
            return Err(FusionError::invalid_config(
                "refine.feature_sigma",
                "importance weights must be non-negative and sigma positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.smoothing_lambda) {
            return Err(FusionError::invalid_config(
                "refine.smoothing_lambda",
                "must be in [0, 1]",
            ));
        }
        self.limits.validate()
    }
}

/// Counters from one refinement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefineMetrics {
    pub original_triangles: usize,
    pub final_triangles: usize,
    pub collapses: usize,
    pub rejected_collapses: usize,
    pub max_collapse_error: f64,
    /// `None` when the mesh was already within budget.
    pub stop: Option<DecimationStop>,
    pub smoothing_iterations: usize,
    pub elapsed_ms: f64,
}

#[derive(Debug)]
pub struct RefineOutcome {
    /// The refined mesh, or the input mesh when refinement was rejected.
    pub mesh: MeshData,
    pub metrics: RefineMetrics,
    /// Validation of the refined candidate.
    pub report: ValidationReport,
    pub rejection: Option<FusionError>,
}

impl RefineOutcome {
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

/// Refine on the CPU backend.
pub fn refine(
    mesh: &MeshData,
    features: &[Feature],
    params: &RefineParams,
    token: &CancellationToken,
) -> FusionResult<RefineOutcome> {
    refine_with_backend(mesh, features, &CpuBackend, params, token)
}

pub fn refine_with_backend(
    mesh: &MeshData,
    features: &[Feature],
    backend: &dyn ComputeBackend,
    params: &RefineParams,
    token: &CancellationToken,
) -> FusionResult<RefineOutcome> {
    params.validate()?;
    if mesh.is_empty() {
        return Err(FusionError::insufficient_data(Stage::Refinement, 1, 0));
    }
    let timer = OperationTimer::with_size(Stage::Refinement, mesh.triangle_count());

    let importance = importance_for(mesh, features, params);
    let mut metrics = RefineMetrics {
        original_triangles: mesh.triangle_count(),
        ..Default::default()
    };

    let decimated = if mesh.triangle_count() > params.target_triangles {
        let result = decimate(
            mesh,
            &importance,
            &DecimationParams {
                target_triangles: params.target_triangles,
                max_error: params.max_error,
                preserve_boundary: params.preserve_boundary,
            },
            backend,
            token,
        )?;
        metrics.collapses = result.collapses;
        metrics.rejected_collapses = result.rejected;
        metrics.max_collapse_error = result.max_error;
        metrics.stop = Some(result.stop);
        result
    } else {
        Decimation {
            vertices: mesh.vertices().to_vec(),
            normals: mesh.normals().to_vec(),
            confidence: mesh.confidence().to_vec(),
            triangles: mesh.indices().to_vec(),
            collapses: 0,
            rejected: 0,
            max_error: 0.0,
            stop: DecimationStop::TargetReached,
        }
    };

    let candidate = match smoothed(decimated, features, params, token) {
        Ok(candidate) => candidate,
        Err(e @ FusionError::Cancelled { .. }) => return Err(e),
        Err(e) => {
            metrics.elapsed_ms = timer.elapsed_ms();
            return Ok(rejected(mesh, metrics, ValidationReport::default(), e));
        }
    };
    metrics.smoothing_iterations = params.smoothing_iterations;
    metrics.final_triangles = candidate.triangle_count();
    metrics.elapsed_ms = timer.elapsed_ms();

    let report = validate_mesh(&candidate, &params.limits);
    if let Err(e) = report.clone().into_result() {
        return Ok(rejected(mesh, metrics, report, e));
    }
    if candidate.triangle_count() > params.target_triangles {
        // Reported as budget / actual so the threshold reads as a floor.
        let e = FusionError::quality_below_threshold(
            "triangle budget ratio",
            params.target_triangles as f64 / candidate.triangle_count() as f64,
            1.0,
        );
        return Ok(rejected(mesh, metrics, report, e));
    }

    let detail = format!(
        "{} -> {} triangles, {} collapses",
        metrics.original_triangles, metrics.final_triangles, metrics.collapses
    );
    let refined = candidate
        .with_history_of(mesh)
        .with_step(Stage::Refinement, detail, metrics.elapsed_ms);
    log_mesh_stats(&refined, "refined");
    info!(
        from = metrics.original_triangles,
        to = metrics.final_triangles,
        "Refinement accepted"
    );
    Ok(RefineOutcome {
        mesh: refined,
        metrics,
        report,
        rejection: None,
    })
}

fn importance_for(mesh: &MeshData, features: &[Feature], params: &RefineParams) -> Vec<f64> {
    let adjacency = MeshAdjacency::build(mesh.indices());
    vertex_importance(
        mesh,
        &adjacency,
        features,
        params.curvature_weight,
        params.feature_weight,
        params.feature_sigma,
    )
}

/// Build the candidate mesh and run Laplacian smoothing on it.
fn smoothed(
    decimated: Decimation,
    features: &[Feature],
    params: &RefineParams,
    token: &CancellationToken,
) -> FusionResult<MeshData> {
    let Decimation {
        mut vertices,
        mut normals,
        confidence,
        triangles,
        ..
    } = decimated;
    if params.smoothing_iterations == 0 {
        return MeshData::new(vertices, normals, confidence, triangles);
    }
    let coarse = MeshData::new(
        vertices.clone(),
        normals.clone(),
        confidence.clone(),
        triangles.clone(),
    )?;
    let importance = importance_for(&coarse, features, params);
    laplacian_smooth(
        &mut vertices,
        &triangles,
        &importance,
        params.smoothing_iterations,
        params.smoothing_lambda,
        token,
    )?;
    recompute_normals(&vertices, &triangles, &mut normals);
    MeshData::new(vertices, normals, confidence, triangles)
}

fn rejected(
    input: &MeshData,
    metrics: RefineMetrics,
    report: ValidationReport,
    error: FusionError,
) -> RefineOutcome {
    warn!(error = %error, "Refinement rejected, keeping the previous mesh");
    let detail = format!("rejected: {}", error);
    RefineOutcome {
        mesh: input.with_step(Stage::Refinement, detail, metrics.elapsed_ms),
        metrics,
        report,
        rejection: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;
    use nalgebra::{Point3, Vector3};

    fn sphere(levels: usize, radius: f64) -> MeshData {
        let mut v = vec![
            Vector3::x(),
            Vector3::y(),
            Vector3::z(),
            -Vector3::x(),
            -Vector3::y(),
            -Vector3::z(),
        ];
        let mut tris: Vec<[u32; 3]> = vec![
            [0, 1, 2],
            [1, 3, 2],
            [3, 4, 2],
            [4, 0, 2],
            [1, 0, 5],
            [3, 1, 5],
            [4, 3, 5],
            [0, 4, 5],
        ];
        for _ in 0..levels {
            let mut mid: HashMap<(u32, u32), u32> = HashMap::new();
            let mut split = |a: u32, b: u32, v: &mut Vec<Vector3<f64>>| {
                *mid.entry((a.min(b), a.max(b))).or_insert_with(|| {
                    v.push((v[a as usize] + v[b as usize]).normalize());
                    (v.len() - 1) as u32
                })
            };
            tris = tris
                .iter()
                .flat_map(|&[a, b, c]| {
                    let ab = split(a, b, &mut v);
                    let bc = split(b, c, &mut v);
                    let ca = split(c, a, &mut v);
                    [[a, ab, ca], [ab, b, bc], [ca, bc, c], [ab, bc, ca]]
                })
                .collect();
        }
        let count = v.len();
        MeshData::new(
            v.iter().map(|n| Point3::from(n * radius)).collect(),
            v,
            vec![0.8; count],
            tris,
        )
        .unwrap()
    }

    fn plane(n: usize) -> MeshData {
        let row = (n + 1) as u32;
        let vertices: Vec<Point3<f64>> = (0..row * row)
            .map(|i| Point3::new((i % row) as f64 * 0.01, (i / row) as f64 * 0.01, 0.0))
            .collect();
        let mut tris = Vec::new();
        for j in 0..n as u32 {
            for i in 0..n as u32 {
                let v = j * row + i;
                tris.push([v, v + 1, v + row + 1]);
                tris.push([v, v + row + 1, v + row]);
            }
        }
        let count = vertices.len();
        MeshData::new(vertices, vec![Vector3::z(); count], vec![1.0; count], tris).unwrap()
    }

    #[test]
    fn test_sphere_decimates_to_valid_closed_mesh() {
        let mesh = sphere(3, 0.05);
        assert_eq!(mesh.triangle_count(), 512);
        let params = RefineParams {
            target_triangles: 128,
            max_error: 1.0,
            ..Default::default()
        };
        let out = refine(&mesh, &[], &params, &CancellationToken::new()).unwrap();
        assert!(out.rejection.is_none(), "{:?}", out.rejection);
        assert!(out.mesh.triangle_count() <= 128);
        assert!(out.report.is_watertight() && out.report.is_manifold());
        assert_eq!(out.metrics.stop, Some(DecimationStop::TargetReached));
        let step = out.mesh.metadata().steps.last().unwrap();
        assert_eq!(step.stage, Stage::Refinement);
    }

    #[test]
    fn test_unreachable_target_keeps_input() {
        let mesh = sphere(2, 0.05);
        let params = RefineParams {
            target_triangles: 8,
            max_error: 0.0,
            ..Default::default()
        };
        let out = refine(&mesh, &[], &params, &CancellationToken::new()).unwrap();
        assert!(matches!(
            out.rejection,
            Some(FusionError::QualityBelowThreshold { .. })
        ));
        assert_eq!(out.mesh.vertices(), mesh.vertices());
        assert_eq!(out.mesh.indices(), mesh.indices());
    }

    #[test]
    fn test_within_budget_only_smooths() {
        let mesh = plane(6);
        let params = RefineParams::default();
        let out = refine(&mesh, &[], &params, &CancellationToken::new()).unwrap();
        assert!(out.rejection.is_none());
        assert_eq!(out.metrics.collapses, 0);
        assert_eq!(out.metrics.stop, None);
        assert_eq!(out.mesh.triangle_count(), mesh.triangle_count());
        // A regular flat grid is its own Laplacian fixed point.
        for (a, b) in mesh.vertices().iter().zip(out.mesh.vertices()) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn test_cancellation_is_not_a_rejection() {
        let token = CancellationToken::new();
        token.cancel();
        let params = RefineParams {
            target_triangles: 8,
            max_error: 1.0,
            ..Default::default()
        };
        let err = refine(&sphere(2, 0.05), &[], &params, &token);
        assert!(matches!(err, Err(FusionError::Cancelled { .. })));
    }

    #[test]
    fn test_empty_mesh_and_bad_params() {
        let err = refine(&MeshData::empty(), &[], &RefineParams::default(), &CancellationToken::new());
        assert!(matches!(err, Err(FusionError::InsufficientData { .. })));
        let bad = RefineParams {
            smoothing_lambda: 2.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
