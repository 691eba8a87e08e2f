//! Per-point numeric kernels behind a backend-selection interface.
//!
//! The pipeline never hard-wires where its embarrassingly parallel work
//! runs. Each kernel takes flat inputs (positions, precomputed neighbor
//! lists) and returns one output per element, so it can execute as a rayon
//! loop ([`CpuBackend`]) or as a GPU compute dispatch (the
//! `scan-fusion-gpu` crate) with identical results up to float precision.

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::quality::{PointQuality, point_quality};
use crate::reconstruct::normals::{LocalFrame, local_frame};
use crate::refine::decimate::{CollapseCandidate, CollapseCost, collapse_cost};
use crate::smoothing::{SmoothInput, SmoothingParams, bilateral_displacement};

/// Numeric kernels used by the pipeline.
pub trait ComputeBackend: Send + Sync {
    /// Short identifier for logs and reports.
    fn name(&self) -> &str;

    /// PCA frame of each point's neighborhood (the point itself plus its
    /// neighbors). `None` where the covariance is degenerate.
    fn covariance_normals(
        &self,
        positions: &[Point3<f64>],
        neighborhoods: &[Vec<usize>],
    ) -> Vec<Option<LocalFrame>>;

    /// New position for each point after one bilateral smoothing step.
    fn bilateral_smooth(
        &self,
        points: &[SmoothInput],
        neighborhoods: &[Vec<usize>],
        params: &SmoothingParams,
    ) -> Vec<Point3<f64>>;

    /// Quadric error and optimal position for each candidate edge collapse.
    fn collapse_costs(&self, candidates: &[CollapseCandidate]) -> Vec<CollapseCost>;

    /// Normal agreement and plane deviation per point.
    fn quality_scores(
        &self,
        positions: &[Point3<f64>],
        normals: &[Option<Vector3<f64>>],
        neighborhoods: &[Vec<usize>],
    ) -> Vec<PointQuality>;
}

/// Multi-threaded CPU implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn covariance_normals(
        &self,
        positions: &[Point3<f64>],
        neighborhoods: &[Vec<usize>],
    ) -> Vec<Option<LocalFrame>> {
        neighborhoods
            .par_iter()
            .enumerate()
            .map(|(i, hood)| {
                let pts: Vec<Point3<f64>> = std::iter::once(positions[i])
                    .chain(hood.iter().map(|&j| positions[j]))
                    .collect();
                local_frame(&pts)
            })
            .collect()
    }

    fn bilateral_smooth(
        &self,
        points: &[SmoothInput],
        neighborhoods: &[Vec<usize>],
        params: &SmoothingParams,
    ) -> Vec<Point3<f64>> {
        points
            .par_iter()
            .zip(neighborhoods.par_iter())
            .map(|(p, hood)| p.position + bilateral_displacement(p, hood, points, params))
            .collect()
    }

    fn collapse_costs(&self, candidates: &[CollapseCandidate]) -> Vec<CollapseCost> {
        candidates.par_iter().map(collapse_cost).collect()
    }

    fn quality_scores(
        &self,
        positions: &[Point3<f64>],
        normals: &[Option<Vector3<f64>>],
        neighborhoods: &[Vec<usize>],
    ) -> Vec<PointQuality> {
        neighborhoods
            .par_iter()
            .enumerate()
            .map(|(i, hood)| point_quality(i, hood, positions, normals))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_normals_on_plane() {
        let positions: Vec<Point3<f64>> = (0..25)
            .map(|i| Point3::new((i % 5) as f64, (i / 5) as f64, 0.0))
            .collect();
        let hoods: Vec<Vec<usize>> = (0..25)
            .map(|i| (0..25).filter(|&j| j != i).collect())
            .collect();
        let frames = CpuBackend.covariance_normals(&positions, &hoods);
        assert_eq!(frames.len(), 25);
        for frame in frames.into_iter().flatten() {
            assert!(frame.normal.z.abs() > 0.999);
        }
    }

    #[test]
    fn test_backend_is_object_safe() {
        let backend: Box<dyn ComputeBackend> = Box::new(CpuBackend::new());
        assert_eq!(backend.name(), "cpu");
        assert!(backend.collapse_costs(&[]).is_empty());
    }
}
