//! Topology and geometry validation of refined meshes.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FusionError, FusionResult, IssueSeverity, ValidationIssue};
use crate::refine::adjacency::MeshAdjacency;
use crate::types::{AREA_EPSILON, MeshData};

/// Bounds a refined mesh must respect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_holes: usize,
    /// Largest tolerated hole, in boundary edges.
    pub max_hole_edges: usize,
    /// Allowed deviation of normal length from 1.
    pub normal_tolerance: f64,
    /// Treat the longest boundary loop as the scan rim rather than a hole.
    pub allow_outer_boundary: bool,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_holes: 8,
            max_hole_edges: 64,
            normal_tolerance: 1e-3,
            allow_outer_boundary: true,
        }
    }
}

impl ValidationLimits {
    pub fn validate(&self) -> FusionResult<()> {
        if !(self.normal_tolerance > 0.0) {
            return Err(FusionError::invalid_config(
                "refine.limits.normal_tolerance",
                "must be positive",
            ));
        }
        if self.max_hole_edges < 3 {
            return Err(FusionError::invalid_config(
                "refine.limits.max_hole_edges",
                "a hole has at least 3 edges",
            ));
        }
        Ok(())
    }
}

/// Validation report for a mesh.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub vertex_count: usize,
    pub triangle_count: usize,
    /// Edges with one adjacent triangle.
    pub boundary_edge_count: usize,
    /// Edges with more than two adjacent triangles.
    pub non_manifold_edge_count: usize,
    /// Edge counts of boundary loops counted as holes.
    pub hole_sizes: Vec<usize>,
    /// Edge count of the loop treated as the outer rim, if any.
    pub outer_boundary: Option<usize>,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_watertight(&self) -> bool {
        self.boundary_edge_count == 0
    }

    pub fn is_manifold(&self) -> bool {
        self.non_manifold_edge_count == 0
    }

    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity() == IssueSeverity::Error)
    }

    /// True when no issue of any severity was found.
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }

    /// The first topology error, else the first bound violation.
    pub fn into_result(self) -> FusionResult<()> {
        let first_error = self
            .issues
            .iter()
            .find(|i| i.severity() == IssueSeverity::Error)
            .or_else(|| self.issues.first());
        match first_error {
            None => Ok(()),
            // Bounds are reported as allowed / actual against a floor of 1.
            Some(ValidationIssue::TooManyHoles { count, max }) => Err(
                FusionError::quality_below_threshold("hole count ratio", *max as f64 / *count as f64, 1.0),
            ),
            Some(ValidationIssue::OversizedHole { edges, max_edges }) => Err(
                FusionError::quality_below_threshold(
                    "hole size ratio",
                    *max_edges as f64 / *edges as f64,
                    1.0,
                ),
            ),
            Some(issue) => Err(FusionError::invalid_topology(issue.to_string())),
        }
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Mesh Validation:")?;
        writeln!(f, "  Vertices: {}", self.vertex_count)?;
        writeln!(f, "  Triangles: {}", self.triangle_count)?;
        writeln!(
            f,
            "  Manifold: {} (non-manifold edges: {})",
            if self.is_manifold() { "yes" } else { "NO" },
            self.non_manifold_edge_count
        )?;
        writeln!(
            f,
            "  Watertight: {} (boundary edges: {})",
            if self.is_watertight() { "yes" } else { "no" },
            self.boundary_edge_count
        )?;
        if let Some(rim) = self.outer_boundary {
            writeln!(f, "  Outer rim: {} edges", rim)?;
        }
        writeln!(f, "  Holes: {:?}", self.hole_sizes)?;
        if self.issues.is_empty() {
            write!(f, "  Status: OK")
        } else {
            writeln!(f, "  Issues:")?;
            for issue in &self.issues {
                writeln!(f, "    [{}] {}", issue.code(), issue)?;
            }
            write!(f, "  Status: FAILED")
        }
    }
}

/// Check manifoldness, winding, degeneracy, normal length and holes.
pub fn validate_mesh(mesh: &MeshData, limits: &ValidationLimits) -> ValidationReport {
    let mut report = ValidationReport {
        vertex_count: mesh.vertex_count(),
        triangle_count: mesh.triangle_count(),
        ..Default::default()
    };
    let triangles = mesh.indices();

    for (t, tri) in triangles.iter().enumerate() {
        if let Some(&index) = tri.iter().find(|&&i| i as usize >= mesh.vertex_count()) {
            report.issues.push(ValidationIssue::InvalidIndex {
                triangle: t,
                index,
                vertex_count: mesh.vertex_count(),
            });
        }
    }
    // Everything below indexes vertices.
    if report.has_errors() {
        return report;
    }

    for t in 0..triangles.len() {
        let area = mesh.triangle_area(t);
        if area <= AREA_EPSILON {
            report
                .issues
                .push(ValidationIssue::DegenerateTriangle { triangle: t, area });
        }
    }

    let adjacency = MeshAdjacency::build(triangles);
    let mut non_manifold: Vec<((u32, u32), usize)> = adjacency.non_manifold_edges().collect();
    non_manifold.sort_unstable();
    report.non_manifold_edge_count = non_manifold.len();
    report.issues.extend(
        non_manifold
            .into_iter()
            .map(|((a, b), triangles)| ValidationIssue::NonManifoldEdge { a, b, triangles }),
    );

    let mut directed: HashMap<(u32, u32), usize> = HashMap::new();
    for tri in triangles {
        for k in 0..3 {
            *directed.entry((tri[k], tri[(k + 1) % 3])).or_default() += 1;
        }
    }
    let mut flipped: Vec<(u32, u32)> = directed
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(&e, _)| e)
        .collect();
    flipped.sort_unstable();
    report
        .issues
        .extend(flipped.into_iter().map(|(a, b)| ValidationIssue::InconsistentWinding { a, b }));

    for (vertex, n) in mesh.normals().iter().enumerate() {
        let length = n.norm();
        if !((length - 1.0).abs() <= limits.normal_tolerance) {
            report
                .issues
                .push(ValidationIssue::NonUnitNormal { vertex, length });
        }
    }

    report.boundary_edge_count = adjacency.boundary_edges().count();
    let mut loops: Vec<usize> = adjacency.boundary_loops().iter().map(Vec::len).collect();
    loops.sort_unstable_by(|a, b| b.cmp(a));
    if limits.allow_outer_boundary && !loops.is_empty() {
        report.outer_boundary = Some(loops.remove(0));
    }
    if loops.len() > limits.max_holes {
        report.issues.push(ValidationIssue::TooManyHoles {
            count: loops.len(),
            max: limits.max_holes,
        });
    }
    if let Some(&largest) = loops.first() {
        if largest > limits.max_hole_edges {
            report.issues.push(ValidationIssue::OversizedHole {
                edges: largest,
                max_edges: limits.max_hole_edges,
            });
        }
    }
    report.hole_sizes = loops;

    if report.passed() {
        debug!(
            triangles = report.triangle_count,
            holes = report.hole_sizes.len(),
            "Mesh validation passed"
        );
    } else {
        warn!(issues = report.issues.len(), "Mesh validation found issues");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    fn tetrahedron() -> MeshData {
        let v = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ];
        let normals = v
            .iter()
            .map(|p| (p - Point3::new(0.25, 0.25, 0.25)).normalize())
            .collect();
        MeshData::new(v, normals, vec![1.0; 4], vec![[0, 2, 1], [0, 1, 3], [1, 2, 3], [0, 3, 2]])
            .unwrap()
    }

    #[test]
    fn test_closed_mesh_passes() {
        let report = validate_mesh(&tetrahedron(), &ValidationLimits::default());
        assert!(report.passed(), "{}", report);
        assert!(report.is_watertight());
        assert_eq!(report.outer_boundary, None);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_open_patch_rim_is_not_a_hole() {
        let mesh = MeshData::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![Vector3::z(); 4],
            vec![1.0; 4],
            vec![[0, 1, 2], [0, 2, 3]],
        )
        .unwrap();
        let report = validate_mesh(&mesh, &ValidationLimits::default());
        assert!(report.passed());
        assert_eq!(report.outer_boundary, Some(4));

        let strict = ValidationLimits {
            allow_outer_boundary: false,
            max_holes: 0,
            ..Default::default()
        };
        let err = validate_mesh(&mesh, &strict).into_result().unwrap_err();
        assert!(matches!(err, FusionError::QualityBelowThreshold { .. }));
    }

    #[test]
    fn test_detects_non_manifold_and_winding() {
        let mesh = MeshData::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, -1.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
            ],
            vec![Vector3::z(); 5],
            vec![1.0; 5],
            // The third triangle repeats the directed edge 0 -> 1.
            vec![[0, 1, 2], [1, 0, 3], [0, 1, 4]],
        )
        .unwrap();
        let report = validate_mesh(&mesh, &ValidationLimits::default());
        assert_eq!(report.non_manifold_edge_count, 1);
        assert!(report.issues.iter().any(|i| matches!(
            i,
            ValidationIssue::InconsistentWinding { a: 0, b: 1 }
        )));
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, FusionError::InvalidTopology { .. }));
    }

    #[test]
    fn test_detects_non_unit_normal() {
        let mesh = tetrahedron();
        let mut normals = mesh.normals().to_vec();
        normals[2] *= 1.01;
        let bad = MeshData::new(
            mesh.vertices().to_vec(),
            normals,
            mesh.confidence().to_vec(),
            mesh.indices().to_vec(),
        )
        .unwrap();
        let report = validate_mesh(&bad, &ValidationLimits::default());
        assert!(matches!(
            report.issues.as_slice(),
            [ValidationIssue::NonUnitNormal { vertex: 2, .. }]
        ));
    }
}
