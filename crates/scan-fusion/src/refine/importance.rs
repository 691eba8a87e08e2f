//! Per-vertex importance used to protect detail during refinement.
//!
//! Importance is `1 + curvature_weight * curvature + feature_weight * falloff`,
//! where curvature is the mean normal deviation over the one-ring (in
//! [0, 1]) and falloff is the strongest confidence-weighted Gaussian of the
//! distance to a tracked feature.

use rayon::prelude::*;

use crate::refine::adjacency::MeshAdjacency;
use crate::spatial::{KdTree, SpatialIndex};
use crate::types::{Feature, MeshData};

/// Mean `(1 - n_i . n_j) / 2` over the one-ring of each vertex.
pub fn vertex_curvature(mesh: &MeshData, adjacency: &MeshAdjacency) -> Vec<f64> {
    let normals = mesh.normals();
    let triangles = mesh.indices();
    (0..mesh.vertex_count() as u32)
        .into_par_iter()
        .map(|v| {
            let ring = adjacency.vertex_neighbors(v, triangles);
            if ring.is_empty() {
                return 0.0;
            }
            let n = normals[v as usize];
            let sum: f64 = ring
                .iter()
                .map(|&u| 0.5 * (1.0 - n.dot(&normals[u as usize])))
                .sum();
            (sum / ring.len() as f64).clamp(0.0, 1.0)
        })
        .collect()
}

/// Strongest `confidence * exp(-d^2 / 2 sigma^2)` over features within 3 sigma.
pub fn feature_falloff(mesh: &MeshData, features: &[Feature], sigma: f64) -> Vec<f64> {
    if features.is_empty() || !(sigma > 0.0) {
        return vec![0.0; mesh.vertex_count()];
    }
    let tree = KdTree::build(features.iter().map(|f| f.position).collect());
    let two_sigma2 = 2.0 * sigma * sigma;
    mesh.vertices()
        .par_iter()
        .map(|p| {
            tree.within_radius(p, 3.0 * sigma)
                .into_iter()
                .map(|n| features[n.index].confidence * (-n.distance_squared / two_sigma2).exp())
                .fold(0.0, f64::max)
        })
        .collect()
}

/// Importance of every vertex, always at least 1.
pub fn vertex_importance(
    mesh: &MeshData,
    adjacency: &MeshAdjacency,
    features: &[Feature],
    curvature_weight: f64,
    feature_weight: f64,
    feature_sigma: f64,
) -> Vec<f64> {
    let curvature = vertex_curvature(mesh, adjacency);
    let falloff = feature_falloff(mesh, features, feature_sigma);
    curvature
        .iter()
        .zip(&falloff)
        .map(|(c, f)| 1.0 + curvature_weight * c + feature_weight * f)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    fn tent() -> MeshData {
        // Two faces folded 90 degrees along the x axis.
        let s = std::f64::consts::FRAC_1_SQRT_2;
        MeshData::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.5, 1.0, 0.0),
                Point3::new(0.5, 0.0, 1.0),
            ],
            vec![
                Vector3::new(0.0, -s, s),
                Vector3::new(0.0, -s, s),
                Vector3::z(),
                Vector3::new(0.0, -1.0, 0.0),
            ],
            vec![1.0; 4],
            vec![[0, 1, 2], [1, 0, 3]],
        )
        .unwrap()
    }

    #[test]
    fn test_fold_has_curvature() {
        let mesh = tent();
        let adj = MeshAdjacency::build(mesh.indices());
        let c = vertex_curvature(&mesh, &adj);
        assert!(c[2] > 0.1 && c[3] > 0.1);
        assert!(c.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_importance_peaks_at_feature() {
        let mesh = tent();
        let adj = MeshAdjacency::build(mesh.indices());
        let features = [Feature::new(1, Point3::new(0.5, 1.0, 0.0), Vector3::z(), 0.9)];
        let plain = vertex_importance(&mesh, &adj, &[], 0.0, 2.0, 0.1);
        let featured = vertex_importance(&mesh, &adj, &features, 0.0, 2.0, 0.1);
        assert!(plain.iter().all(|&v| v == 1.0));
        assert!((featured[2] - 2.8).abs() < 1e-12);
        assert_eq!(featured[0], 1.0);
    }
}
