//! Normal estimation and consistent orientation.
//!
//! Normals come from the covariance of each point's k-neighborhood. The two
//! dominant eigenvectors are found by power iteration (the second after
//! deflating the first), and the normal is their cross product, which is the
//! eigenvector of the smallest eigenvalue.
//!
//! Orientation is propagated over the neighbor graph in order of increasing
//! `1 - |n_i · n_j|`, so flips only cross nearly parallel neighbors first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use nalgebra::{Matrix3, Point3, Vector3};

/// Power-iteration steps per eigenvector.
const POWER_ITERATIONS: usize = 64;

/// Relative eigenvalue below which a direction counts as collapsed.
const DEGENERATE_RATIO: f64 = 1e-10;

/// Principal axes of a local neighborhood.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalFrame {
    pub centroid: Point3<f64>,
    /// Unit normal (smallest-variance direction), sign arbitrary.
    pub normal: Vector3<f64>,
    /// Eigenvalues in descending order.
    pub eigenvalues: [f64; 3],
}

impl LocalFrame {
    /// `(λ2 - λ3) / λ1`: near 1 for a flat disk, near 0 for a line or blob.
    pub fn planarity(&self) -> f64 {
        let [l1, l2, l3] = self.eigenvalues;
        if l1 <= 0.0 {
            0.0
        } else {
            ((l2 - l3) / l1).clamp(0.0, 1.0)
        }
    }

    /// `λ3 / (λ1 + λ2 + λ3)`, in [0, 1/3].
    pub fn surface_variation(&self) -> f64 {
        let sum: f64 = self.eigenvalues.iter().sum();
        if sum <= 0.0 {
            0.0
        } else {
            (self.eigenvalues[2] / sum).max(0.0)
        }
    }
}

/// Covariance of a point set about its centroid.
pub fn covariance(points: &[Point3<f64>]) -> Option<(Point3<f64>, Matrix3<f64>)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let centroid = Point3::from(points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n);
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    Some((centroid, cov / n))
}

/// Dominant eigenvector of a symmetric positive semi-definite matrix,
/// kept orthogonal to `exclude` when given.
fn power_iteration(m: &Matrix3<f64>, exclude: Option<&Vector3<f64>>) -> Option<Vector3<f64>> {
    // Start from the axis least aligned with the excluded direction.
    let mut v = match exclude {
        Some(e) => {
            let axis = Vector3::ith(e.iamin(), 1.0);
            axis - e * e.dot(&axis)
        }
        None => {
            // The largest column is never orthogonal to the dominant eigenvector
            // unless the matrix is zero.
            let col = (0..3)
                .map(|i| m.column(i).into_owned())
                .max_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))?;
            if col.norm_squared() > 0.0 { col } else { Vector3::new(1.0, 1.0, 1.0) }
        }
    };
    v = v.try_normalize(1e-300)?;

    for _ in 0..POWER_ITERATIONS {
        let mut next = m * v;
        if let Some(e) = exclude {
            next -= e * e.dot(&next);
        }
        let next = next.try_normalize(1e-300)?;
        let delta = (next - v).norm_squared();
        v = next;
        if delta < 1e-24 {
            break;
        }
    }
    Some(v)
}

/// PCA frame of a neighborhood, `None` when fewer than three points or the
/// points are (nearly) coincident or collinear.
pub fn local_frame(points: &[Point3<f64>]) -> Option<LocalFrame> {
    if points.len() < 3 {
        return None;
    }
    let (centroid, cov) = covariance(points)?;
    if !cov.iter().all(|v| v.is_finite()) {
        return None;
    }

    let v1 = power_iteration(&cov, None)?;
    let l1 = v1.dot(&(cov * v1));
    if l1 <= f64::MIN_POSITIVE {
        return None;
    }

    let deflated = cov - l1 * v1 * v1.transpose();
    let v2 = power_iteration(&deflated, Some(&v1))?;
    let l2 = v2.dot(&(cov * v2));
    if l2 <= l1 * DEGENERATE_RATIO {
        return None;
    }

    let normal = v1.cross(&v2).try_normalize(1e-12)?;
    let l3 = normal.dot(&(cov * normal)).max(0.0);
    Some(LocalFrame {
        centroid,
        normal,
        eigenvalues: [l1, l2, l3],
    })
}

/// Orientation confidence from flatness and neighborhood support.
pub fn orientation_confidence(frame: &LocalFrame, neighbors: usize, expected: usize) -> f64 {
    let support = if expected == 0 {
        1.0
    } else {
        (neighbors as f64 / expected as f64).min(1.0)
    };
    (frame.planarity() * support).clamp(0.0, 1.0)
}

#[derive(Debug, PartialEq)]
struct Edge {
    cost: f64,
    from: usize,
    to: usize,
}

impl Eq for Edge {}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Edge {
    // Reversed so the heap pops the cheapest edge.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.to.cmp(&self.to))
    }
}

/// Flip normals in place so neighbors agree.
///
/// `hints` carries sensor-supplied normals; where present they fix the sign.
/// A component without any hint is seeded so its first normal faces away
/// from `centroid`.
pub fn orient_normals(
    positions: &[Point3<f64>],
    normals: &mut [Vector3<f64>],
    hints: &[Option<Vector3<f64>>],
    neighborhoods: &[Vec<usize>],
    centroid: &Point3<f64>,
) {
    let n = normals.len();
    let mut visited = vec![false; n];
    let mut heap = BinaryHeap::new();

    // Seeds with hints first, so hinted components take the sensor's sign.
    let mut seeds: Vec<usize> = (0..n).filter(|&i| hints[i].is_some()).collect();
    seeds.extend((0..n).filter(|&i| hints[i].is_none()));

    for seed in seeds {
        if visited[seed] {
            continue;
        }
        let reference = hints[seed].unwrap_or(positions[seed] - centroid);
        if normals[seed].dot(&reference) < 0.0 {
            normals[seed] = -normals[seed];
        }
        visited[seed] = true;
        push_edges(seed, normals, neighborhoods, &visited, &mut heap);

        while let Some(Edge { from, to, .. }) = heap.pop() {
            if visited[to] {
                continue;
            }
            let reference = hints[to].unwrap_or(normals[from]);
            if normals[to].dot(&reference) < 0.0 {
                normals[to] = -normals[to];
            }
            visited[to] = true;
            push_edges(to, normals, neighborhoods, &visited, &mut heap);
        }
    }
}

fn push_edges(
    from: usize,
    normals: &[Vector3<f64>],
    neighborhoods: &[Vec<usize>],
    visited: &[bool],
    heap: &mut BinaryHeap<Edge>,
) {
    for &to in &neighborhoods[from] {
        if !visited[to] {
            heap.push(Edge {
                cost: 1.0 - normals[from].dot(&normals[to]).abs(),
                from,
                to,
            });
        }
    }
}
