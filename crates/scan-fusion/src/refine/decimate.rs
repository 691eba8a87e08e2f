//! Edge-collapse decimation with quadric error metrics.
//!
//! Each vertex accumulates the plane quadrics of its incident faces. An edge
//! collapse costs the summed quadric evaluated at the error-minimizing
//! position, scaled by the larger endpoint importance. Candidates live in a
//! min-heap; entries carry the endpoint version stamps current when they were
//! scored, so entries made stale by a neighboring collapse are discarded on
//! pop instead of being searched for and removed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use hashbrown::HashSet;
use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::backend::ComputeBackend;
use crate::error::FusionResult;
use crate::progress::CancellationToken;
use crate::refine::adjacency::{MeshAdjacency, edge_key};
use crate::types::{AREA_EPSILON, MeshData, Stage};

/// Symmetric 4x4 error quadric, upper triangle stored row by row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quadric {
    m: [f64; 10],
}

impl Quadric {
    /// Squared distance to the plane `n . x + d = 0` (with `n` unit length).
    pub fn from_plane(n: &Vector3<f64>, d: f64) -> Self {
        let (a, b, c) = (n.x, n.y, n.z);
        Self {
            m: [
                a * a,
                a * b,
                a * c,
                a * d,
                b * b,
                b * c,
                b * d,
                c * c,
                c * d,
                d * d,
            ],
        }
    }

    pub fn evaluate(&self, p: &Point3<f64>) -> f64 {
        let [a, b, c, d, e, f, g, h, i, j] = self.m;
        let (x, y, z) = (p.x, p.y, p.z);
        a * x * x
            + 2.0 * b * x * y
            + 2.0 * c * x * z
            + 2.0 * d * x
            + e * y * y
            + 2.0 * f * y * z
            + 2.0 * g * y
            + h * z * z
            + 2.0 * i * z
            + j
    }

    /// Minimizer of the quadric, `None` when the 3x3 block is near singular.
    pub fn optimal_point(&self) -> Option<Point3<f64>> {
        let [a, b, c, d, e, f, g, h, i, _] = self.m;
        let det = a * (e * h - f * f) - b * (b * h - f * c) + c * (b * f - e * c);
        if det.abs() < 1e-10 {
            return None;
        }
        let inv = 1.0 / det;
        let m00 = (e * h - f * f) * inv;
        let m01 = (c * f - b * h) * inv;
        let m02 = (b * f - c * e) * inv;
        let m11 = (a * h - c * c) * inv;
        let m12 = (b * c - a * f) * inv;
        let m22 = (a * e - b * b) * inv;
        Some(Point3::new(
            -(m00 * d + m01 * g + m02 * i),
            -(m01 * d + m11 * g + m12 * i),
            -(m02 * d + m12 * g + m22 * i),
        ))
    }
}

impl std::ops::Add for Quadric {
    type Output = Quadric;

    fn add(mut self, rhs: Quadric) -> Quadric {
        self += rhs;
        self
    }
}

impl std::ops::AddAssign for Quadric {
    fn add_assign(&mut self, rhs: Quadric) {
        for (l, r) in self.m.iter_mut().zip(rhs.m) {
            *l += r;
        }
    }
}

/// Inputs for scoring one edge collapse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollapseCandidate {
    pub a: Point3<f64>,
    pub b: Point3<f64>,
    pub qa: Quadric,
    pub qb: Quadric,
    /// Larger importance of the two endpoints.
    pub importance: f64,
    /// Forces the merged vertex onto `a` or `b` (boundary preservation).
    pub pinned: Option<Point3<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollapseCost {
    pub error: f64,
    pub position: Point3<f64>,
}

/// Importance-scaled quadric error and position for one collapse.
///
/// Falls back to the best of the endpoints and the midpoint when the summed
/// quadric has no unique minimizer.
pub fn collapse_cost(c: &CollapseCandidate) -> CollapseCost {
    let q = c.qa + c.qb;
    let position = match c.pinned {
        Some(p) => p,
        None => q.optimal_point().unwrap_or_else(|| {
            let mid = nalgebra::center(&c.a, &c.b);
            [c.a, c.b, mid]
                .into_iter()
                .min_by(|x, y| q.evaluate(x).total_cmp(&q.evaluate(y)))
                .unwrap_or(mid)
        }),
    };
    CollapseCost {
        error: q.evaluate(&position).max(0.0) * c.importance.max(1.0),
        position,
    }
}

/// Why decimation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimationStop {
    TargetReached,
    /// The cheapest remaining collapse exceeds the error bound.
    ErrorBound,
    /// No valid collapse is left.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct DecimationParams {
    pub target_triangles: usize,
    pub max_error: f64,
    pub preserve_boundary: bool,
}

#[derive(Debug, Clone)]
pub struct Decimation {
    pub vertices: Vec<Point3<f64>>,
    pub normals: Vec<Vector3<f64>>,
    pub confidence: Vec<f64>,
    pub triangles: Vec<[u32; 3]>,
    pub collapses: usize,
    pub rejected: usize,
    /// Largest error among applied collapses.
    pub max_error: f64,
    pub stop: DecimationStop,
}

#[derive(Debug, Clone, Copy)]
struct QueuedCollapse {
    error: f64,
    keep: u32,
    remove: u32,
    stamps: (u32, u32),
    position: Point3<f64>,
}

impl PartialEq for QueuedCollapse {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedCollapse {}

impl PartialOrd for QueuedCollapse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedCollapse {
    // Reversed so BinaryHeap pops the cheapest collapse.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .error
            .total_cmp(&self.error)
            .then_with(|| (other.keep, other.remove).cmp(&(self.keep, self.remove)))
    }
}

/// Mutable working copy of the mesh during decimation.
struct Working<'a> {
    positions: Vec<Point3<f64>>,
    normals: Vec<Vector3<f64>>,
    confidence: Vec<f64>,
    quadrics: Vec<Quadric>,
    importance: Vec<f64>,
    boundary: Vec<bool>,
    alive: Vec<bool>,
    stamp: Vec<u32>,
    faces: Vec<Option<[u32; 3]>>,
    vertex_faces: Vec<Vec<usize>>,
    preserve_boundary: bool,
    backend: &'a dyn ComputeBackend,
}

impl Working<'_> {
    fn ring(&self, v: u32) -> Vec<u32> {
        let mut ring: Vec<u32> = self.vertex_faces[v as usize]
            .iter()
            .filter_map(|&f| self.faces[f])
            .flatten()
            .filter(|&u| u != v)
            .collect();
        ring.sort_unstable();
        ring.dedup();
        ring
    }

    /// Candidate for collapsing `remove` into `keep`, `None` if the edge is frozen.
    fn candidate(&self, keep: u32, remove: u32) -> Option<CollapseCandidate> {
        let (k, r) = (keep as usize, remove as usize);
        let pinned = if self.preserve_boundary {
            match (self.boundary[k], self.boundary[r]) {
                (true, true) => return None,
                (true, false) => Some(self.positions[k]),
                (false, true) => Some(self.positions[r]),
                (false, false) => None,
            }
        } else {
            None
        };
        Some(CollapseCandidate {
            a: self.positions[k],
            b: self.positions[r],
            qa: self.quadrics[k],
            qb: self.quadrics[r],
            importance: self.importance[k].max(self.importance[r]),
            pinned,
        })
    }

    /// Score edges in one batch through the backend and push them.
    fn enqueue(&self, edges: &[(u32, u32)], heap: &mut BinaryHeap<QueuedCollapse>) {
        let (edges, candidates): (Vec<(u32, u32)>, Vec<CollapseCandidate>) = edges
            .iter()
            .filter_map(|&(k, r)| self.candidate(k, r).map(|c| ((k, r), c)))
            .unzip();
        let costs = self.backend.collapse_costs(&candidates);
        for ((keep, remove), cost) in edges.into_iter().zip(costs) {
            heap.push(QueuedCollapse {
                error: cost.error,
                keep,
                remove,
                stamps: (self.stamp[keep as usize], self.stamp[remove as usize]),
                position: cost.position,
            });
        }
    }

    fn is_current(&self, c: &QueuedCollapse) -> bool {
        let (k, r) = (c.keep as usize, c.remove as usize);
        self.alive[k] && self.alive[r] && self.stamp[k] == c.stamps.0 && self.stamp[r] == c.stamps.1
    }

    /// Link condition plus a no-flip, no-degeneracy check on surviving faces.
    fn is_collapse_valid(&self, keep: u32, remove: u32, target: &Point3<f64>) -> bool {
        let shared: Vec<usize> = self.vertex_faces[keep as usize]
            .iter()
            .copied()
            .filter(|&f| self.faces[f].is_some_and(|t| t.contains(&remove)))
            .collect();
        if shared.is_empty() || shared.len() > 2 {
            return false;
        }
        let ring_keep: HashSet<u32> = self.ring(keep).into_iter().collect();
        let common = self
            .ring(remove)
            .into_iter()
            .filter(|u| ring_keep.contains(u))
            .count();
        if common != shared.len() {
            return false;
        }

        for v in [keep, remove] {
            for &f in &self.vertex_faces[v as usize] {
                let Some(tri) = self.faces[f] else {
                    continue;
                };
                if tri.contains(&keep) && tri.contains(&remove) {
                    continue;
                }
                let corners = tri.map(|i| self.positions[i as usize]);
                let moved = tri.map(|i| if i == v { *target } else { self.positions[i as usize] });
                let before = (corners[1] - corners[0]).cross(&(corners[2] - corners[0]));
                let after = (moved[1] - moved[0]).cross(&(moved[2] - moved[0]));
                if 0.5 * after.norm() <= AREA_EPSILON || before.dot(&after) <= 0.0 {
                    return false;
                }
            }
        }
        true
    }

    /// Merge `remove` into `keep` at `position`; returns removed face count.
    fn apply(&mut self, keep: u32, remove: u32, position: Point3<f64>) -> usize {
        let (k, r) = (keep as usize, remove as usize);
        let mut removed = 0;
        for f in std::mem::take(&mut self.vertex_faces[r]) {
            let Some(mut tri) = self.faces[f] else {
                continue;
            };
            if tri.contains(&keep) {
                self.faces[f] = None;
                removed += 1;
            } else {
                for i in tri.iter_mut().filter(|i| **i == remove) {
                    *i = keep;
                }
                self.faces[f] = Some(tri);
                self.vertex_faces[k].push(f);
            }
        }
        let faces = &self.faces;
        self.vertex_faces[k].retain(|&f| faces[f].is_some());

        let q = self.quadrics[r];
        self.quadrics[k] += q;
        self.positions[k] = position;
        self.normals[k] = (self.normals[k] + self.normals[r])
            .try_normalize(1e-12)
            .unwrap_or(self.normals[k]);
        self.confidence[k] = 0.5 * (self.confidence[k] + self.confidence[r]);
        self.importance[k] = self.importance[k].max(self.importance[r]);
        self.boundary[k] |= self.boundary[r];
        self.alive[r] = false;
        self.stamp[k] = self.stamp[k].wrapping_add(1);
        removed
    }

    fn into_decimation(
        self,
        collapses: usize,
        rejected: usize,
        max_error: f64,
        stop: DecimationStop,
    ) -> Decimation {
        let mut remap = vec![u32::MAX; self.positions.len()];
        let mut out = Decimation {
            vertices: Vec::new(),
            normals: Vec::new(),
            confidence: Vec::new(),
            triangles: Vec::new(),
            collapses,
            rejected,
            max_error,
            stop,
        };
        for tri in self.faces.iter().flatten() {
            let mapped = tri.map(|v| {
                let slot = &mut remap[v as usize];
                if *slot == u32::MAX {
                    *slot = out.vertices.len() as u32;
                    out.vertices.push(self.positions[v as usize]);
                    out.normals.push(self.normals[v as usize]);
                    out.confidence.push(self.confidence[v as usize]);
                }
                *slot
            });
            out.triangles.push(mapped);
        }
        recompute_normals(&out.vertices, &out.triangles, &mut out.normals);
        out
    }
}

/// Area-weighted vertex normals, keeping the previous normal where the
/// faces cancel out.
pub fn recompute_normals(
    vertices: &[Point3<f64>],
    triangles: &[[u32; 3]],
    normals: &mut [Vector3<f64>],
) {
    let mut sums = vec![Vector3::zeros(); vertices.len()];
    for tri in triangles {
        let [a, b, c] = tri.map(|i| vertices[i as usize]);
        let n = (b - a).cross(&(c - a));
        for &i in tri {
            sums[i as usize] += n;
        }
    }
    for (n, s) in normals.iter_mut().zip(sums) {
        if let Some(unit) = s.try_normalize(1e-300) {
            *n = unit;
        } else if let Some(unit) = n.try_normalize(1e-12) {
            *n = unit;
        } else {
            *n = Vector3::z();
        }
    }
}

/// Decimate `mesh` toward `params.target_triangles`.
///
/// `importance` holds one value per vertex (at least 1). The loop checks
/// `token` as it goes and stops with a cancellation error.
pub fn decimate(
    mesh: &MeshData,
    importance: &[f64],
    params: &DecimationParams,
    backend: &dyn ComputeBackend,
    token: &CancellationToken,
) -> FusionResult<Decimation> {
    let triangles = mesh.indices();
    let n = mesh.vertex_count();
    let adjacency = MeshAdjacency::build(triangles);

    let mut quadrics = vec![Quadric::default(); n];
    for t in 0..triangles.len() {
        let cross = mesh.face_normal_unnormalized(t);
        let Some(normal) = cross.try_normalize(1e-300) else {
            continue;
        };
        let [a, _, _] = mesh.triangle(t);
        let q = Quadric::from_plane(&normal, -normal.dot(&a.coords));
        for &v in &triangles[t] {
            quadrics[v as usize] += q;
        }
    }

    let mut boundary = vec![false; n];
    for v in adjacency.boundary_vertices() {
        boundary[v as usize] = true;
    }
    let mut vertex_faces = vec![Vec::new(); n];
    for (t, tri) in triangles.iter().enumerate() {
        for &v in tri {
            vertex_faces[v as usize].push(t);
        }
    }

    let mut work = Working {
        positions: mesh.vertices().to_vec(),
        normals: mesh.normals().to_vec(),
        confidence: mesh.confidence().to_vec(),
        quadrics,
        importance: importance.to_vec(),
        boundary,
        alive: vec![true; n],
        stamp: vec![0; n],
        faces: triangles.iter().copied().map(Some).collect(),
        vertex_faces,
        preserve_boundary: params.preserve_boundary,
        backend,
    };

    let mut edges: Vec<(u32, u32)> = adjacency.edge_to_faces.keys().copied().collect();
    edges.sort_unstable();
    let mut heap = BinaryHeap::with_capacity(edges.len());
    work.enqueue(&edges, &mut heap);

    let mut active = triangles.len();
    let mut collapses = 0;
    let mut rejected = 0;
    let mut max_error = 0.0f64;
    let stop = loop {
        if active <= params.target_triangles {
            break DecimationStop::TargetReached;
        }
        let Some(next) = heap.pop() else {
            break DecimationStop::Exhausted;
        };
        if !work.is_current(&next) {
            continue;
        }
        if next.error > params.max_error {
            break DecimationStop::ErrorBound;
        }
        if collapses % 64 == 0 {
            token.check(Stage::Refinement)?;
        }
        if !work.is_collapse_valid(next.keep, next.remove, &next.position) {
            rejected += 1;
            continue;
        }

        active -= work.apply(next.keep, next.remove, next.position);
        collapses += 1;
        max_error = max_error.max(next.error);

        let ring: Vec<(u32, u32)> = work
            .ring(next.keep)
            .into_iter()
            .map(|u| edge_key(next.keep, u))
            .collect();
        work.enqueue(&ring, &mut heap);
    };

    debug!(
        from = triangles.len(),
        to = active,
        collapses,
        rejected,
        max_error,
        ?stop,
        "Decimation finished"
    );
    Ok(work.into_decimation(collapses, rejected, max_error, stop))
}
