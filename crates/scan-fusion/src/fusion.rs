//! Confidence-weighted merge of two aligned point sources.
//!
//! An index is built over the base source (the one with more weighted
//! points). Every point of the other source proposes its nearest base points
//! inside the fusion distance; proposals are accepted greedily by distance
//! so each point merges at most once. Matched pairs become one point,
//! unmatched points pass through unchanged, so
//! `max(|A|, |B|) <= |fused| <= |A| + |B|`.
//!
//! # Example
//!
//! ```
//! use scan_fusion::fusion::{FusionParams, SourceWeights, fuse};
//! use scan_fusion::progress::CancellationToken;
//! use scan_fusion::PointCloud;
//! use nalgebra::Point3;
//!
//! let a = PointCloud::from_positions((0..10).map(|i| Point3::new(i as f64 * 0.05, 0.0, 0.0)));
//! let b = PointCloud::from_positions((0..10).map(|i| Point3::new(i as f64 * 0.05, 0.002, 0.0)));
//!
//! let out = fuse(&a, &b, SourceWeights::new(0.8, 0.6), &FusionParams::default(), &CancellationToken::new())
//!     .unwrap();
//! assert_eq!(out.matched, 10);
//! assert_eq!(out.cloud.len(), 10);
//! ```

use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FusionError, FusionResult};
use crate::progress::CancellationToken;
use crate::spatial::{IndexKind, SpatialIndex, SpatialIndexHandle};
use crate::tracing_ext::OperationTimer;
use crate::types::{Point, PointCloud, Stage};

/// Base points each query point proposes.
const MATCH_CANDIDATES: usize = 4;

/// Same-source neighbors consulted for computed confidence.
const SUPPORT_NEIGHBORS: usize = 8;

/// How the confidence of a merged pair is combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidencePolicy {
    #[default]
    Mean,
    /// The stronger signal wins.
    Max,
}

/// Confidence assigned to points that found no partner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedConfidence {
    #[default]
    /// Scale the point's own confidence by its local support and normal
    /// stability within its source.
    Computed,
    /// Fixed values for unmatched points of source A and source B.
    Fixed { primary: f64, secondary: f64 },
}

/// Fusion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    /// Pairs farther apart than this are not merged.
    pub max_fusion_distance: f64,
    pub confidence_policy: ConfidencePolicy,
    pub unmatched_confidence: UnmatchedConfidence,
    /// Sources weighted below this don't pull merged positions.
    pub min_source_confidence: f64,
    pub index_kind: IndexKind,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            max_fusion_distance: 0.01,
            confidence_policy: ConfidencePolicy::Mean,
            unmatched_confidence: UnmatchedConfidence::Computed,
            min_source_confidence: 0.2,
            index_kind: IndexKind::KdTree,
        }
    }
}

impl FusionParams {
    pub fn with_max_fusion_distance(mut self, distance: f64) -> Self {
        self.max_fusion_distance = distance;
        self
    }

    pub fn validate(&self) -> FusionResult<()> {
        if !(self.max_fusion_distance > 0.0) || !self.max_fusion_distance.is_finite() {
            return Err(FusionError::invalid_config(
                "fusion.max_fusion_distance",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_source_confidence) {
            return Err(FusionError::invalid_config(
                "fusion.min_source_confidence",
                "must be in [0, 1]",
            ));
        }
        if let UnmatchedConfidence::Fixed { primary, secondary } = self.unmatched_confidence {
            if !(0.0..=1.0).contains(&primary) || !(0.0..=1.0).contains(&secondary) {
                return Err(FusionError::invalid_config(
                    "fusion.unmatched_confidence",
                    "fixed confidences must be in [0, 1]",
                ));
            }
        }
        Ok(())
    }
}

/// Scalar confidence of each source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceWeights {
    pub a: f64,
    pub b: f64,
}

impl SourceWeights {
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            a: a.clamp(0.0, 1.0),
            b: b.clamp(0.0, 1.0),
        }
    }
}

/// Which source the index was built over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionBase {
    A,
    B,
}

/// Counts describing one fusion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionStats {
    pub matched: usize,
    pub unmatched_a: usize,
    pub unmatched_b: usize,
    pub output_points: usize,
    pub base: FusionBase,
}

/// Fused cloud plus match statistics.
#[derive(Debug, Clone)]
pub struct FusionOutput {
    pub cloud: PointCloud,
    pub matched: usize,
    pub unmatched_a: usize,
    pub unmatched_b: usize,
    pub base: FusionBase,
}

impl FusionOutput {
    /// Share of the smaller source that found a partner.
    pub fn merged_fraction(&self) -> f64 {
        let smaller = (self.matched + self.unmatched_a).min(self.matched + self.unmatched_b);
        if smaller == 0 {
            0.0
        } else {
            self.matched as f64 / smaller as f64
        }
    }

    pub fn stats(&self) -> FusionStats {
        FusionStats {
            matched: self.matched,
            unmatched_a: self.unmatched_a,
            unmatched_b: self.unmatched_b,
            output_points: self.cloud.len(),
            base: self.base,
        }
    }
}

/// Merge two aligned clouds.
pub fn fuse(
    a: &PointCloud,
    b: &PointCloud,
    weights: SourceWeights,
    params: &FusionParams,
    token: &CancellationToken,
) -> FusionResult<FusionOutput> {
    let _timer = OperationTimer::with_size(Stage::Fusion, a.len() + b.len());
    params.validate()?;
    if a.is_empty() && b.is_empty() {
        return Err(FusionError::insufficient_data(Stage::Fusion, 1, 0));
    }
    let strongest = weights.a.max(weights.b);
    if strongest < params.min_source_confidence {
        return Err(FusionError::quality_below_threshold(
            "fusion source confidence",
            strongest,
            params.min_source_confidence,
        ));
    }

    let base_kind = if (a.len() as f64) * weights.a >= (b.len() as f64) * weights.b {
        FusionBase::A
    } else {
        FusionBase::B
    };
    let (base, query, w_base, w_query) = match base_kind {
        FusionBase::A => (a, b, weights.a, weights.b),
        FusionBase::B => (b, a, weights.b, weights.a),
    };
    // A source below the threshold keeps its points but doesn't move merged ones.
    let effective = |w: f64| if w < params.min_source_confidence { 0.0 } else { w };
    let (w_base, w_query) = (effective(w_base), effective(w_query));

    let base_index = SpatialIndexHandle::build(params.index_kind, base);
    let query_index = SpatialIndexHandle::build(params.index_kind, query);
    token.check(Stage::Fusion)?;

    let pairs = match_greedy(&base_index, query, params.max_fusion_distance);
    token.check(Stage::Fusion)?;

    let mut partner_of_base: Vec<Option<usize>> = vec![None; base.len()];
    let mut query_matched = vec![false; query.len()];
    for &(bi, qi) in &pairs {
        partner_of_base[bi] = Some(qi);
        query_matched[qi] = true;
    }

    let (fixed_base, fixed_query) = match (params.unmatched_confidence, base_kind) {
        (UnmatchedConfidence::Fixed { primary, secondary }, FusionBase::A) => {
            (Some(primary), Some(secondary))
        }
        (UnmatchedConfidence::Fixed { primary, secondary }, FusionBase::B) => {
            (Some(secondary), Some(primary))
        }
        (UnmatchedConfidence::Computed, _) => (None, None),
    };

    let base_points: Vec<Point> = (0..base.len())
        .into_par_iter()
        .map(|i| {
            let p = &base.points()[i];
            match partner_of_base[i] {
                Some(qi) => merge_pair(
                    p,
                    &query.points()[qi],
                    w_base,
                    w_query,
                    params.confidence_policy,
                ),
                None => unmatched(
                    p,
                    i,
                    base,
                    &base_index,
                    fixed_base,
                    params.max_fusion_distance,
                ),
            }
        })
        .collect();
    let query_points: Vec<Point> = (0..query.len())
        .into_par_iter()
        .filter(|&i| !query_matched[i])
        .map(|i| {
            unmatched(
                &query.points()[i],
                i,
                query,
                &query_index,
                fixed_query,
                params.max_fusion_distance,
            )
        })
        .collect();

    let matched = pairs.len();
    let unmatched_base = base.len() - matched;
    let unmatched_query = query_points.len();
    let (unmatched_a, unmatched_b) = match base_kind {
        FusionBase::A => (unmatched_base, unmatched_query),
        FusionBase::B => (unmatched_query, unmatched_base),
    };

    let mut points = base_points;
    points.extend(query_points);
    let output = FusionOutput {
        cloud: PointCloud::new(points),
        matched,
        unmatched_a,
        unmatched_b,
        base: base_kind,
    };
    info!(
        a = a.len(),
        b = b.len(),
        matched,
        output = output.cloud.len(),
        ?base_kind,
        "Fusion complete"
    );
    Ok(output)
}

/// One-to-one pairs `(base, query)`, accepted in order of increasing distance.
fn match_greedy(
    base_index: &SpatialIndexHandle,
    query: &PointCloud,
    max_distance: f64,
) -> Vec<(usize, usize)> {
    let r2 = max_distance * max_distance;
    let mut candidates: Vec<(f64, usize, usize)> = query
        .points()
        .par_iter()
        .enumerate()
        .flat_map_iter(|(qi, p)| {
            base_index
                .k_nearest(&p.position, MATCH_CANDIDATES)
                .into_iter()
                .take_while(move |n| n.distance_squared <= r2)
                .map(move |n| (n.distance_squared, n.index, qi))
        })
        .collect();
    candidates.par_sort_unstable_by(|x, y| {
        x.0.total_cmp(&y.0)
            .then(x.1.cmp(&y.1))
            .then(x.2.cmp(&y.2))
    });

    let mut base_used = vec![false; base_index.len()];
    let mut query_used = vec![false; query.len()];
    let mut pairs = Vec::new();
    for (_, bi, qi) in candidates {
        if base_used[bi] || query_used[qi] {
            continue;
        }
        base_used[bi] = true;
        query_used[qi] = true;
        pairs.push((bi, qi));
    }
    debug!(pairs = pairs.len(), "Greedy matching finished");
    pairs
}

fn merge_pair(p: &Point, q: &Point, w_p: f64, w_q: f64, policy: ConfidencePolicy) -> Point {
    let wp = w_p * p.confidence.max(1e-6);
    let wq = w_q * q.confidence.max(1e-6);
    let total = wp + wq;
    let (sp, sq) = if total > 0.0 {
        (wp / total, wq / total)
    } else if w_p > 0.0 || w_q == 0.0 {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };

    let position = p.position + (q.position - p.position) * sq;
    let normal = match (p.normal, q.normal) {
        (Some(np), Some(nq)) => {
            // Flip the weaker normal onto the stronger one's side before blending.
            let nq = if np.dot(&nq) < 0.0 { -nq } else { nq };
            (np * sp + nq * sq)
                .try_normalize(1e-12)
                .or(Some(if sp >= sq { np } else { nq }))
        }
        (n, None) | (None, n) => n,
    };
    let confidence = match policy {
        ConfidencePolicy::Mean => 0.5 * (p.confidence + q.confidence),
        ConfidencePolicy::Max => p.confidence.max(q.confidence),
    };
    Point {
        position,
        normal,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

/// Pass an unmatched point through, reassigning only its confidence.
fn unmatched(
    p: &Point,
    i: usize,
    source: &PointCloud,
    index: &SpatialIndexHandle,
    fixed: Option<f64>,
    radius: f64,
) -> Point {
    let confidence = match fixed {
        Some(c) => c,
        None => p.confidence * computed_support(p, i, source, index, radius),
    };
    Point {
        confidence: confidence.clamp(0.0, 1.0),
        ..*p
    }
}

/// `0.5 + 0.5 * support * stability`: local density inside `radius` times
/// normal agreement with those neighbors.
fn computed_support(
    p: &Point,
    i: usize,
    source: &PointCloud,
    index: &SpatialIndexHandle,
    radius: f64,
) -> f64 {
    let r2 = radius * radius;
    let hood: Vec<usize> = index
        .k_nearest(&p.position, SUPPORT_NEIGHBORS + 1)
        .into_iter()
        .filter(|n| n.index != i && n.distance_squared <= r2)
        .map(|n| n.index)
        .collect();
    let support = (hood.len() as f64 / SUPPORT_NEIGHBORS as f64).min(1.0);
    let stability = match p.normal {
        Some(n) => {
            let dots: Vec<f64> = hood
                .iter()
                .filter_map(|&j| source.points()[j].normal)
                .map(|m: Vector3<f64>| n.dot(&m).abs())
                .collect();
            if dots.is_empty() {
                1.0
            } else {
                dots.iter().sum::<f64>() / dots.len() as f64
            }
        }
        None => 1.0,
    };
    0.5 + 0.5 * support * stability
}
