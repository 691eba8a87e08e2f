//! Core data records: points, clouds, bounding boxes, features and meshes.
//!
//! Point clouds and meshes are immutable values once built. Stages produce
//! new values rather than mutating their inputs, so the previous stage's
//! output is always available for comparison and rollback.

use std::sync::Arc;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::alignment::RigidTransform;
use crate::error::{FusionError, FusionResult};

/// Smallest triangle area treated as non-degenerate.
pub const AREA_EPSILON: f64 = 1e-12;

/// Pipeline stages, used for error attribution, timing and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Indexing,
    Quality,
    Alignment,
    Fusion,
    Strategy,
    Smoothing,
    Reconstruction,
    Refinement,
    Validation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Indexing => "indexing",
            Stage::Quality => "quality",
            Stage::Alignment => "alignment",
            Stage::Fusion => "fusion",
            Stage::Strategy => "strategy",
            Stage::Smoothing => "smoothing",
            Stage::Reconstruction => "reconstruction",
            Stage::Refinement => "refinement",
            Stage::Validation => "validation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single sample from a depth sensor or an image-derived feature track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Position in scan coordinates (meters).
    pub position: Point3<f64>,
    /// Unit surface normal, if known.
    pub normal: Option<Vector3<f64>>,
    /// Sensor or matching confidence in [0, 1].
    pub confidence: f64,
}

impl Point {
    /// Create a point with full confidence and no normal.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: Point3::new(x, y, z),
            normal: None,
            confidence: 1.0,
        }
    }

    /// Create a point from a position.
    pub fn from_position(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
            confidence: 1.0,
        }
    }

    /// Attach a normal. Zero-length normals are dropped.
    pub fn with_normal(mut self, normal: Vector3<f64>) -> Self {
        self.normal = normal.try_normalize(1e-12);
        self
    }

    /// Set the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|c| c.is_finite())
    }
}

/// An ordered, immutable point set for one processing pass.
///
/// Cloning is cheap: the points are shared behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    points: Arc<[Point]>,
}

impl PointCloud {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points: points.into(),
        }
    }

    /// Create a cloud of full-confidence points without normals.
    pub fn from_positions(positions: impl IntoIterator<Item = Point3<f64>>) -> Self {
        Self::new(positions.into_iter().map(Point::from_position).collect())
    }

    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    /// Positions as a freshly collected vector.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.points.iter().map(|p| p.position).collect()
    }

    /// Whether every point carries a normal.
    pub fn has_normals(&self) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.normal.is_some())
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.points.iter().map(|p| &p.position))
    }

    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.position.coords);
        Some(Point3::from(sum / self.points.len() as f64))
    }

    /// Mean confidence of all points, 0 for an empty cloud.
    pub fn mean_confidence(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().map(|p| p.confidence).sum::<f64>() / self.points.len() as f64
    }

    /// A new cloud with the transform applied to positions and normals.
    pub fn transformed(&self, transform: &RigidTransform) -> PointCloud {
        PointCloud::new(
            self.points
                .iter()
                .map(|p| Point {
                    position: transform.transform_point(&p.position),
                    normal: p.normal.map(|n| transform.transform_vector(&n)),
                    confidence: p.confidence,
                })
                .collect(),
        )
    }

    /// Reject non-finite coordinates.
    pub fn validate(&self) -> FusionResult<()> {
        if let Some(index) = self.points.iter().position(|p| !p.is_finite()) {
            return Err(FusionError::invalid_input(format!(
                "point {} has a non-finite coordinate",
                index
            )));
        }
        Ok(())
    }
}

impl From<Vec<Point>> for PointCloud {
    fn from(points: Vec<Point>) -> Self {
        Self::new(points)
    }
}

impl FromIterator<Point> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl BoundingBox {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Tight bounds of a point set, `None` when empty.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f64>>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut min = *first;
        let mut max = *first;
        for p in iter {
            min = min.inf(p);
            max = max.sup(p);
        }
        Some(Self { min, max })
    }

    #[inline]
    pub fn extent(&self) -> Vector3<f64> {
        self.max - self.min
    }

    #[inline]
    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn volume(&self) -> f64 {
        let e = self.extent();
        e.x.max(0.0) * e.y.max(0.0) * e.z.max(0.0)
    }

    pub fn diagonal(&self) -> f64 {
        self.extent().norm()
    }

    /// Index of the widest axis.
    pub fn longest_axis(&self) -> usize {
        self.extent().imax()
    }

    pub fn expanded(&self, margin: f64) -> Self {
        let m = Vector3::repeat(margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }

    /// Smallest cube sharing this box's center that encloses it.
    pub fn cubified(&self) -> Self {
        let half = self.extent().max() * 0.5;
        let c = self.center();
        let h = Vector3::repeat(half);
        Self {
            min: c - h,
            max: c + h,
        }
    }

    pub fn contains(&self, p: &Point3<f64>) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// Squared distance from a point to the box (0 inside).
    pub fn distance_squared_to(&self, p: &Point3<f64>) -> f64 {
        let mut d = 0.0;
        for i in 0..3 {
            let v = p[i];
            if v < self.min[i] {
                d += (self.min[i] - v).powi(2);
            } else if v > self.max[i] {
                d += (v - self.max[i]).powi(2);
            }
        }
        d
    }

    /// Child box for octant `i` (bit 0 = x, bit 1 = y, bit 2 = z upper half).
    ///
    /// The eight octants share the parent's center as a corner, so they
    /// partition the parent exactly.
    pub fn octant(&self, i: usize) -> Self {
        let c = self.center();
        let mut min = self.min;
        let mut max = c;
        for axis in 0..3 {
            if i & (1 << axis) != 0 {
                min[axis] = c[axis];
                max[axis] = self.max[axis];
            }
        }
        Self { min, max }
    }

    /// Octant of `p` relative to the box center.
    #[inline]
    pub fn octant_of(&self, p: &Point3<f64>) -> usize {
        let c = self.center();
        (0..3).fold(0, |acc, axis| {
            if p[axis] >= c[axis] {
                acc | (1 << axis)
            } else {
                acc
            }
        })
    }
}

/// A tracked image feature used to weight decimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Stable identity across frames.
    pub id: u64,
    pub position: Point3<f64>,
    pub normal: Vector3<f64>,
    /// Detection strength in [0, 1].
    pub confidence: f64,
}

impl Feature {
    pub fn new(id: u64, position: Point3<f64>, normal: Vector3<f64>, confidence: f64) -> Self {
        Self {
            id,
            position,
            normal: normal.try_normalize(1e-12).unwrap_or_else(Vector3::z),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// One entry in a mesh's processing history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingStep {
    pub stage: Stage,
    pub detail: String,
    pub elapsed_ms: f64,
}

/// Processing history attached to a mesh.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeshMetadata {
    pub steps: Vec<ProcessingStep>,
    /// Set when a stage returned best-effort output.
    pub partial: bool,
}

/// A triangle mesh with per-vertex normals and confidence.
///
/// `vertices`, `normals` and `confidence` are parallel arrays. Construction
/// through [`MeshData::new`] checks lengths, index ranges and triangle area.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeshData {
    vertices: Vec<Point3<f64>>,
    normals: Vec<Vector3<f64>>,
    confidence: Vec<f64>,
    indices: Vec<[u32; 3]>,
    metadata: MeshMetadata,
}

impl MeshData {
    /// Build a mesh, rejecting mismatched arrays, bad indices and degenerate triangles.
    pub fn new(
        vertices: Vec<Point3<f64>>,
        normals: Vec<Vector3<f64>>,
        confidence: Vec<f64>,
        indices: Vec<[u32; 3]>,
    ) -> FusionResult<Self> {
        if normals.len() != vertices.len() || confidence.len() != vertices.len() {
            return Err(FusionError::invalid_input(format!(
                "parallel arrays differ: {} vertices, {} normals, {} confidences",
                vertices.len(),
                normals.len(),
                confidence.len()
            )));
        }
        let mesh = Self {
            vertices,
            normals,
            confidence,
            indices,
            metadata: MeshMetadata::default(),
        };
        for (t, tri) in mesh.indices.iter().enumerate() {
            if let Some(&bad) = tri.iter().find(|&&i| i as usize >= mesh.vertices.len()) {
                return Err(FusionError::invalid_input(format!(
                    "triangle {} references vertex {} of {}",
                    t,
                    bad,
                    mesh.vertices.len()
                )));
            }
            if mesh.triangle_area(t) <= AREA_EPSILON {
                return Err(FusionError::invalid_topology(format!(
                    "triangle {} is degenerate",
                    t
                )));
            }
        }
        Ok(mesh)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    #[inline]
    pub fn normals(&self) -> &[Vector3<f64>] {
        &self.normals
    }

    #[inline]
    pub fn confidence(&self) -> &[f64] {
        &self.confidence
    }

    #[inline]
    pub fn indices(&self) -> &[[u32; 3]] {
        &self.indices
    }

    #[inline]
    pub fn metadata(&self) -> &MeshMetadata {
        &self.metadata
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Corner positions of triangle `t`.
    pub fn triangle(&self, t: usize) -> [Point3<f64>; 3] {
        let [a, b, c] = self.indices[t];
        [
            self.vertices[a as usize],
            self.vertices[b as usize],
            self.vertices[c as usize],
        ]
    }

    /// Unnormalized face normal (cross product of two edges).
    pub fn face_normal_unnormalized(&self, t: usize) -> Vector3<f64> {
        let [a, b, c] = self.triangle(t);
        (b - a).cross(&(c - a))
    }

    pub fn triangle_area(&self, t: usize) -> f64 {
        0.5 * self.face_normal_unnormalized(t).norm()
    }

    pub fn surface_area(&self) -> f64 {
        (0..self.indices.len()).map(|t| self.triangle_area(t)).sum()
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.vertices.iter())
    }

    /// Mean per-vertex confidence, 0 for an empty mesh.
    pub fn mean_confidence(&self) -> f64 {
        if self.confidence.is_empty() {
            return 0.0;
        }
        self.confidence.iter().sum::<f64>() / self.confidence.len() as f64
    }

    /// A copy of this mesh with one more processing step recorded.
    pub fn with_step(&self, stage: Stage, detail: impl Into<String>, elapsed_ms: f64) -> Self {
        let mut next = self.clone();
        next.metadata.steps.push(ProcessingStep {
            stage,
            detail: detail.into(),
            elapsed_ms,
        });
        next
    }

    /// A copy of this mesh flagged as best-effort output.
    pub fn into_partial(mut self) -> Self {
        self.metadata.partial = true;
        self
    }

    /// Carry the processing history of `previous` into this mesh.
    pub(crate) fn with_history_of(mut self, previous: &MeshData) -> Self {
        let mut steps = previous.metadata.steps.clone();
        steps.append(&mut self.metadata.steps);
        self.metadata.steps = steps;
        self.metadata.partial |= previous.metadata.partial;
        self
    }
}
