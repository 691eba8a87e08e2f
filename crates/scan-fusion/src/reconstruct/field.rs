//! Signed distance field sampled on a uniform grid.
//!
//! Each grid node blends the signed distances to the tangent planes of its
//! nearest oriented points, weighting by a Gaussian of the distance and by
//! point confidence. Nodes with no oriented point inside the support radius
//! stay NaN; the extractor skips cells touching them, which keeps open scans
//! from growing phantom surfaces far from the data.

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;

use crate::error::{FusionError, FusionResult};
use crate::progress::CancellationToken;
use crate::spatial::{SpatialIndex, SpatialIndexHandle};
use crate::types::{BoundingBox, Stage};

use super::OrientedPoint;

/// Largest grid a caller may request per axis.
pub const MAX_GRID_NODES_PER_AXIS: usize = 1024;

/// Field layout parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub origin: Point3<f64>,
    pub cell_size: f64,
    /// Node counts along x, y and z.
    pub dims: [usize; 3],
}

impl GridSpec {
    /// Grid covering `bounds` with `resolution` cells along its longest axis
    /// plus `padding` cells on every side.
    pub fn covering(bounds: &BoundingBox, resolution: usize, padding: usize) -> FusionResult<Self> {
        let longest = bounds.extent().max();
        if !(longest > 0.0) || !longest.is_finite() {
            return Err(FusionError::insufficient_data(Stage::Reconstruction, 2, 1));
        }
        let resolution = resolution.max(1);
        let cell_size = longest / resolution as f64;
        let pad = Vector3::repeat(padding as f64 * cell_size);
        let origin = bounds.min - pad;
        let extent = bounds.extent() + pad * 2.0;

        let mut dims = [0usize; 3];
        for (axis, d) in dims.iter_mut().enumerate() {
            *d = (extent[axis] / cell_size).ceil() as usize + 1;
            if *d > MAX_GRID_NODES_PER_AXIS {
                return Err(FusionError::invalid_config(
                    "reconstruction.resolution",
                    format!("{} grid nodes along axis {} exceed the limit", d, axis),
                ));
            }
        }
        Ok(Self {
            origin,
            cell_size,
            dims,
        })
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    #[inline]
    pub fn position(&self, x: usize, y: usize, z: usize) -> Point3<f64> {
        self.origin + Vector3::new(x as f64, y as f64, z as f64) * self.cell_size
    }
}

/// Sampled field plus per-node confidence.
#[derive(Debug, Clone)]
pub struct ScalarField {
    pub spec: GridSpec,
    /// Signed distance (positive on the normal side), NaN where unsupported.
    pub values: Vec<f64>,
    /// Confidence of the points supporting each node, 0 where unsupported.
    pub confidence: Vec<f64>,
}

impl ScalarField {
    #[inline]
    pub fn value(&self, x: usize, y: usize, z: usize) -> f64 {
        self.values[self.spec.index(x, y, z)]
    }

    /// Share of nodes with a defined value.
    pub fn supported_fraction(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().filter(|v| v.is_finite()).count() as f64 / self.values.len() as f64
    }

    /// Central-difference gradient, one-sided at borders and next to
    /// unsupported nodes. Zero when no neighbor is defined.
    pub fn gradient(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        let c = [x, y, z];
        let center = self.value(x, y, z);
        let mut g = Vector3::zeros();
        for axis in 0..3 {
            let sample = |offset: isize| -> Option<f64> {
                let i = c[axis] as isize + offset;
                if i < 0 || i as usize >= self.spec.dims[axis] {
                    return None;
                }
                let mut p = c;
                p[axis] = i as usize;
                let v = self.value(p[0], p[1], p[2]);
                v.is_finite().then_some(v)
            };
            g[axis] = match (sample(-1), sample(1)) {
                (Some(lo), Some(hi)) => (hi - lo) / (2.0 * self.spec.cell_size),
                (None, Some(hi)) if center.is_finite() => (hi - center) / self.spec.cell_size,
                (Some(lo), None) if center.is_finite() => (center - lo) / self.spec.cell_size,
                _ => 0.0,
            };
        }
        g
    }
}

/// Field sampling parameters.
#[derive(Debug, Clone, Copy)]
pub struct FieldParams {
    /// Oriented points blended per node.
    pub neighbors: usize,
    /// Support radius in world units.
    pub support_radius: f64,
}

/// Sample the blended tangent-plane distance over `spec`.
///
/// `index` must be built over the positions of `points`. Polls the token once
/// per z-slice.
pub fn sample_field(
    points: &[OrientedPoint],
    index: &SpatialIndexHandle,
    spec: GridSpec,
    params: FieldParams,
    token: &CancellationToken,
) -> FusionResult<ScalarField> {
    let sigma = params.support_radius * 0.5;
    let inv_two_sigma2 = 1.0 / (2.0 * sigma * sigma);
    let r2 = params.support_radius * params.support_radius;
    let [nx, ny, nz] = spec.dims;

    let slices: Vec<Vec<(f64, f64)>> = (0..nz)
        .into_par_iter()
        .map(|z| {
            token.check(Stage::Reconstruction)?;
            let mut slice = Vec::with_capacity(nx * ny);
            for y in 0..ny {
                for x in 0..nx {
                    let node = spec.position(x, y, z);
                    let mut weight_sum = 0.0;
                    let mut distance_sum = 0.0;
                    let mut confidence_sum = 0.0;
                    let mut count = 0usize;
                    for n in index.k_nearest(&node, params.neighbors) {
                        if n.distance_squared > r2 {
                            break;
                        }
                        let p = &points[n.index];
                        let w = (-n.distance_squared * inv_two_sigma2).exp() * p.confidence.max(1e-6);
                        weight_sum += w;
                        distance_sum += w * p.normal.dot(&(node - p.position));
                        confidence_sum += w * p.confidence;
                        count += 1;
                    }
                    slice.push(if count == 0 || weight_sum <= f64::MIN_POSITIVE {
                        (f64::NAN, 0.0)
                    } else {
                        let support = (count as f64 / params.neighbors.max(1) as f64).min(1.0);
                        (
                            distance_sum / weight_sum,
                            (confidence_sum / weight_sum * support).clamp(0.0, 1.0),
                        )
                    });
                }
            }
            Ok(slice)
        })
        .collect::<FusionResult<_>>()?;

    let mut values = Vec::with_capacity(spec.node_count());
    let mut confidence = Vec::with_capacity(spec.node_count());
    for slice in slices {
        for (v, c) in slice {
            values.push(v);
            confidence.push(c);
        }
    }
    Ok(ScalarField {
        spec,
        values,
        confidence,
    })
}
