//! Importance-damped Laplacian smoothing of mesh vertices.

use nalgebra::Point3;
use rayon::prelude::*;

use crate::error::FusionResult;
use crate::progress::CancellationToken;
use crate::refine::adjacency::MeshAdjacency;
use crate::types::Stage;

/// Move each free vertex toward its one-ring centroid by `lambda / importance`.
///
/// Boundary vertices stay fixed. Updates are Jacobi style: every iteration
/// reads the previous iteration's positions only.
pub fn laplacian_smooth(
    vertices: &mut [Point3<f64>],
    triangles: &[[u32; 3]],
    importance: &[f64],
    iterations: usize,
    lambda: f64,
    token: &CancellationToken,
) -> FusionResult<()> {
    if iterations == 0 || lambda <= 0.0 {
        return Ok(());
    }
    let adjacency = MeshAdjacency::build(triangles);
    let boundary = adjacency.boundary_vertices();
    let rings: Vec<Vec<u32>> = (0..vertices.len() as u32)
        .into_par_iter()
        .map(|v| {
            if boundary.contains(&v) {
                Vec::new()
            } else {
                adjacency.vertex_neighbors(v, triangles)
            }
        })
        .collect();

    for _ in 0..iterations {
        token.check(Stage::Refinement)?;
        let current = vertices.to_vec();
        vertices
            .par_iter_mut()
            .zip(rings.par_iter())
            .zip(importance.par_iter())
            .for_each(|((p, ring), &w)| {
                if ring.is_empty() {
                    return;
                }
                let centroid = ring
                    .iter()
                    .fold(nalgebra::Vector3::zeros(), |acc, &u| acc + current[u as usize].coords)
                    / ring.len() as f64;
                let step = (lambda / w.max(1.0)).min(1.0);
                *p += (Point3::from(centroid) - *p) * step;
            });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // A fan around vertex 0 with the center pushed up.
    fn fan() -> (Vec<Point3<f64>>, Vec<[u32; 3]>) {
        let mut vertices = vec![Point3::new(0.0, 0.0, 1.0)];
        for k in 0..6 {
            let a = k as f64 * std::f64::consts::TAU / 6.0;
            vertices.push(Point3::new(a.cos(), a.sin(), 0.0));
        }
        let tris = (0..6u32).map(|k| [0, 1 + k, 1 + (k + 1) % 6]).collect();
        (vertices, tris)
    }

    #[test]
    fn test_center_relaxes_and_rim_stays() {
        let (mut v, tris) = fan();
        let rim: Vec<_> = v[1..].to_vec();
        laplacian_smooth(&mut v, &tris, &[1.0; 7], 1, 0.5, &CancellationToken::new()).unwrap();
        assert!((v[0].z - 0.5).abs() < 1e-12);
        assert_eq!(&v[1..], rim.as_slice());
    }

    #[test]
    fn test_importance_damps_motion() {
        let (mut v, tris) = fan();
        let mut importance = [1.0; 7];
        importance[0] = 5.0;
        laplacian_smooth(&mut v, &tris, &importance, 1, 0.5, &CancellationToken::new()).unwrap();
        assert!((v[0].z - 0.9).abs() < 1e-12);
    }
}
