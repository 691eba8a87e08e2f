//! Rigid registration between two point clouds (point-to-point ICP).
//!
//! Each iteration matches every transformed source point to its nearest
//! target point through a [`SpatialIndex`], solves for the best rigid motion
//! of the matched pairs with the Kabsch SVD method, and applies it. The loop
//! stops when the mean residual changes by less than the convergence
//! threshold or the iteration budget runs out.
//!
//! # Example
//!
//! ```
//! use scan_fusion::alignment::{AlignmentParams, RigidTransform, align};
//! use scan_fusion::progress::CancellationToken;
//! use scan_fusion::PointCloud;
//! use nalgebra::{Point3, Vector3};
//!
//! let source = PointCloud::from_positions(
//!     (0..200).map(|i| {
//!         let t = i as f64 * 0.1;
//!         Point3::new(t.cos(), t.sin(), t * 0.05)
//!     }),
//! );
//! let shift = RigidTransform::from_translation(Vector3::new(0.02, 0.0, 0.0));
//! let target = source.transformed(&shift);
//!
//! let result = align(&source, &target, &AlignmentParams::default(), &CancellationToken::new());
//! assert!(result.converged);
//! assert!(result.residual < 1e-3);
//! ```

use std::time::Duration;

use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, UnitQuaternion, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FusionError, FusionResult};
use crate::progress::{Budget, CancellationToken};
use crate::spatial::{IndexKind, SpatialIndex, SpatialIndexHandle};
use crate::tracing_ext::OperationTimer;
use crate::types::{PointCloud, Stage};

/// Fewest matched pairs that determine a rigid motion.
pub const MIN_CORRESPONDENCES: usize = 3;

/// A rotation followed by a translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    pub fn from_rotation_translation(
        rotation: UnitQuaternion<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Rotation of `angle` radians about `axis`, then a translation.
    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64, translation: Vector3<f64>) -> Self {
        let rotation = nalgebra::Unit::try_new(*axis, 1e-12)
            .map(|axis| UnitQuaternion::from_axis_angle(&axis, angle))
            .unwrap_or_else(UnitQuaternion::identity);
        Self {
            rotation,
            translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.rotation * point + self.translation
    }

    /// Rotate a direction (translation does not apply).
    #[inline]
    pub fn transform_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * vector
    }

    /// Compose: `self` applied first, then `other`.
    pub fn then(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform {
            rotation: other.rotation * self.rotation,
            translation: other.rotation * self.translation + other.translation,
        }
    }

    pub fn inverse(&self) -> RigidTransform {
        let inv_rotation = self.rotation.inverse();
        RigidTransform {
            rotation: inv_rotation,
            translation: inv_rotation * (-self.translation),
        }
    }

    /// 4x4 homogeneous matrix.
    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let mut m = self.rotation.to_homogeneous();
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Rotation angle in radians, in [0, π].
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }
}

/// ICP parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentParams {
    pub max_iterations: usize,
    /// Stop once the mean residual changes by less than this.
    pub convergence_threshold: f64,
    /// Pairs farther apart than this are not matched.
    pub max_correspondence_distance: Option<f64>,
    /// Wall-clock limit for the whole alignment.
    pub time_budget_ms: Option<u64>,
    /// Index used for correspondence search when none is supplied.
    pub index_kind: IndexKind,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_threshold: 1e-6,
            max_correspondence_distance: None,
            time_budget_ms: None,
            index_kind: IndexKind::KdTree,
        }
    }
}

impl AlignmentParams {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    pub fn with_max_correspondence_distance(mut self, distance: f64) -> Self {
        self.max_correspondence_distance = Some(distance);
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget_ms = Some(budget.as_millis() as u64);
        self
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> FusionResult<()> {
        if self.max_iterations == 0 {
            return Err(FusionError::invalid_config(
                "alignment.max_iterations",
                "must be at least 1",
            ));
        }
        if !(self.convergence_threshold > 0.0) {
            return Err(FusionError::invalid_config(
                "alignment.convergence_threshold",
                "must be positive",
            ));
        }
        if self.max_correspondence_distance.is_some_and(|d| !(d > 0.0)) {
            return Err(FusionError::invalid_config(
                "alignment.max_correspondence_distance",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Why the ICP loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    MaxIterations,
    /// Fewer than three pairs matched in some iteration.
    InsufficientCorrespondences,
    /// The cross-covariance could not be decomposed.
    DegenerateCovariance,
    Cancelled,
    TimedOut,
}

/// Outcome of [`align`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentResult {
    /// Maps source coordinates into target coordinates.
    pub transform: RigidTransform,
    /// Mean point-to-point distance of the final correspondences.
    pub residual: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Pairs matched in the last evaluated iteration.
    pub correspondences: usize,
    pub termination: Termination,
}

impl AlignmentResult {
    fn failed(termination: Termination, correspondences: usize, iterations: usize) -> Self {
        Self {
            transform: RigidTransform::identity(),
            residual: f64::INFINITY,
            iterations,
            converged: false,
            correspondences,
            termination,
        }
    }

    /// True when no usable transform was found.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.termination,
            Termination::InsufficientCorrespondences | Termination::DegenerateCovariance
        )
    }

    /// True when the loop was cut short and the transform is best-effort.
    pub fn is_partial(&self) -> bool {
        matches!(
            self.termination,
            Termination::Cancelled | Termination::TimedOut
        )
    }

    /// `Err(AlignmentFailed)` for failed alignments, otherwise the result itself.
    pub fn into_result(self) -> FusionResult<Self> {
        match self.termination {
            Termination::InsufficientCorrespondences => Err(FusionError::alignment_failed(
                self.correspondences,
                format!(
                    "fewer than {} correspondences after {} iterations",
                    MIN_CORRESPONDENCES, self.iterations
                ),
            )),
            Termination::DegenerateCovariance => Err(FusionError::alignment_failed(
                self.correspondences,
                "cross-covariance decomposition failed",
            )),
            _ => Ok(self),
        }
    }
}

/// Align `source` onto `target`, building a target index internally.
pub fn align(
    source: &PointCloud,
    target: &PointCloud,
    params: &AlignmentParams,
    token: &CancellationToken,
) -> AlignmentResult {
    let index = SpatialIndexHandle::build(params.index_kind, target);
    align_with_index(source, &index, params, token)
}

/// Align `source` onto the points held by `target_index`.
pub fn align_with_index(
    source: &PointCloud,
    target_index: &SpatialIndexHandle,
    params: &AlignmentParams,
    token: &CancellationToken,
) -> AlignmentResult {
    let _timer = OperationTimer::with_size(Stage::Alignment, source.len());
    let budget = Budget::new(params.time_budget());
    let max_distance = params.max_correspondence_distance.unwrap_or(f64::INFINITY);

    let mut working = source.positions();
    let mut transform = RigidTransform::identity();
    let mut previous = f64::INFINITY;
    let mut last_residual = f64::INFINITY;
    let mut last_count = 0;

    for iter in 0..params.max_iterations {
        if let Err(e) = budget.check(Stage::Alignment, token) {
            let termination = if matches!(e, FusionError::Cancelled { .. }) {
                Termination::Cancelled
            } else {
                Termination::TimedOut
            };
            warn!(iteration = iter, ?termination, "Alignment stopped early");
            return AlignmentResult {
                transform,
                residual: last_residual,
                iterations: iter,
                converged: false,
                correspondences: last_count,
                termination,
            };
        }

        let pairs = correspondences(&working, target_index, max_distance);
        if pairs.len() < MIN_CORRESPONDENCES {
            warn!(
                iteration = iter,
                correspondences = pairs.len(),
                "Too few correspondences for alignment"
            );
            return AlignmentResult::failed(
                Termination::InsufficientCorrespondences,
                pairs.len(),
                iter + 1,
            );
        }

        let residual = mean_distance(&pairs);
        last_residual = residual;
        last_count = pairs.len();
        debug!(iteration = iter, residual, correspondences = pairs.len(), "ICP iteration");

        if (previous - residual).abs() < params.convergence_threshold {
            info!(iterations = iter + 1, residual, "Alignment converged");
            return AlignmentResult {
                transform,
                residual,
                iterations: iter + 1,
                converged: true,
                correspondences: pairs.len(),
                termination: Termination::Converged,
            };
        }
        previous = residual;

        let (src, dst): (Vec<_>, Vec<_>) = pairs.iter().map(|p| (p.source, p.target)).unzip();
        let Some(step) = kabsch(&src, &dst) else {
            return AlignmentResult::failed(
                Termination::DegenerateCovariance,
                pairs.len(),
                iter + 1,
            );
        };
        transform = transform.then(&step);
        working
            .par_iter_mut()
            .for_each(|p| *p = step.transform_point(p));
    }

    // Re-evaluate so the residual describes the final transform.
    let pairs = correspondences(&working, target_index, max_distance);
    if pairs.len() < MIN_CORRESPONDENCES {
        return AlignmentResult::failed(
            Termination::InsufficientCorrespondences,
            pairs.len(),
            params.max_iterations,
        );
    }
    let residual = mean_distance(&pairs);
    let converged = (previous - residual).abs() < params.convergence_threshold;
    info!(
        iterations = params.max_iterations,
        residual, converged, "Alignment reached iteration limit"
    );
    AlignmentResult {
        transform,
        residual,
        iterations: params.max_iterations,
        converged,
        correspondences: pairs.len(),
        termination: if converged {
            Termination::Converged
        } else {
            Termination::MaxIterations
        },
    }
}

#[derive(Debug, Clone, Copy)]
struct Pair {
    source: Point3<f64>,
    target: Point3<f64>,
    distance: f64,
}

fn correspondences(
    working: &[Point3<f64>],
    target: &SpatialIndexHandle,
    max_distance: f64,
) -> Vec<Pair> {
    working
        .par_iter()
        .filter_map(|p| {
            target.nearest_within(p, max_distance).map(|n| Pair {
                source: *p,
                target: target.position(n.index),
                distance: n.distance(),
            })
        })
        .collect()
}

fn mean_distance(pairs: &[Pair]) -> f64 {
    pairs.iter().map(|p| p.distance).sum::<f64>() / pairs.len() as f64
}

/// Least-squares rigid motion mapping `source[i]` onto `target[i]`.
///
/// Reflections are rejected by flipping the axis of the smallest singular
/// value when the determinant comes out negative.
pub fn kabsch(source: &[Point3<f64>], target: &[Point3<f64>]) -> Option<RigidTransform> {
    let n = source.len().min(target.len());
    if n == 0 {
        return None;
    }

    let source_centroid = source[..n].iter().map(|p| p.coords).sum::<Vector3<f64>>() / n as f64;
    let target_centroid = target[..n].iter().map(|p| p.coords).sum::<Vector3<f64>>() / n as f64;

    let mut h = Matrix3::zeros();
    for (s, t) in source[..n].iter().zip(&target[..n]) {
        h += (s.coords - source_centroid) * (t.coords - target_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);

    let mut rotation_matrix = v_t.transpose() * u.transpose();
    if rotation_matrix.determinant() < 0.0 {
        let mut v_t_fixed = v_t;
        v_t_fixed.set_row(2, &(-v_t.row(2)));
        rotation_matrix = v_t_fixed.transpose() * u.transpose();
    }
    if !rotation_matrix.iter().all(|v| v.is_finite()) {
        return None;
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_matrix));
    let translation = target_centroid - rotation * source_centroid;
    Some(RigidTransform {
        rotation,
        translation,
    })
}
