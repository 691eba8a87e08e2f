//! Spatial indexes for k-nearest-neighbor and radius queries.
//!
//! Two structures implement [`SpatialIndex`]:
//!
//! - [`KdTree`]: median split on the widest axis, leaf buckets of up to 8 points
//! - [`Octree`]: capacity-8 leaves, maximum depth 8
//!
//! Both own an immutable snapshot of the positions they were built from.
//! Once built they are read-only and can be queried from many threads at once.
//! Rebuilding (for a new pass) produces a new handle; results from an old
//! handle keep referring to the old snapshot's indices.
//!
//! # Example
//!
//! ```
//! use scan_fusion::spatial::{IndexKind, SpatialIndex, SpatialIndexHandle};
//! use scan_fusion::PointCloud;
//! use nalgebra::Point3;
//!
//! let cloud = PointCloud::from_positions((0..10).map(|i| Point3::new(i as f64, 0.0, 0.0)));
//! let index = SpatialIndexHandle::build(IndexKind::KdTree, &cloud);
//!
//! let nearest = index.k_nearest(&Point3::new(3.2, 0.0, 0.0), 2);
//! assert_eq!(nearest[0].index, 3);
//! assert_eq!(nearest[1].index, 4);
//! ```

mod kdtree;
mod octree;

pub use kdtree::KdTree;
pub use octree::Octree;

use std::cmp::Ordering;
use std::sync::Arc;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::types::PointCloud;

/// A query hit: index into the indexed snapshot and squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance_squared: f64,
}

impl Neighbor {
    #[inline]
    pub fn distance(&self) -> f64 {
        self.distance_squared.sqrt()
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_squared
            .total_cmp(&other.distance_squared)
            .then(self.index.cmp(&other.index))
    }
}

/// Read-only nearest-neighbor queries over a point snapshot.
pub trait SpatialIndex: Send + Sync {
    /// Number of indexed points.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `min(k, len)` closest points, sorted by non-decreasing distance.
    fn k_nearest(&self, query: &Point3<f64>, k: usize) -> Vec<Neighbor>;

    /// All points within distance `radius` (inclusive), in no particular order.
    fn within_radius(&self, query: &Point3<f64>, radius: f64) -> Vec<Neighbor>;

    /// Closest point, if any.
    fn nearest(&self, query: &Point3<f64>) -> Option<Neighbor> {
        self.k_nearest(query, 1).into_iter().next()
    }

    /// Closest point no farther than `max_distance`.
    fn nearest_within(&self, query: &Point3<f64>, max_distance: f64) -> Option<Neighbor> {
        self.nearest(query)
            .filter(|n| n.distance_squared <= max_distance * max_distance)
    }
}

/// Which index structure to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    #[default]
    KdTree,
    Octree,
}

/// An index built over one point cloud snapshot.
#[derive(Debug, Clone)]
pub enum SpatialIndexHandle {
    KdTree(Arc<KdTree>),
    Octree(Arc<Octree>),
}

impl SpatialIndexHandle {
    /// Build an index over a cloud's positions.
    pub fn build(kind: IndexKind, cloud: &PointCloud) -> Self {
        Self::from_positions(kind, cloud.positions())
    }

    pub fn from_positions(kind: IndexKind, positions: Vec<Point3<f64>>) -> Self {
        match kind {
            IndexKind::KdTree => Self::KdTree(Arc::new(KdTree::build(positions))),
            IndexKind::Octree => Self::Octree(Arc::new(Octree::build(positions))),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Self::KdTree(_) => IndexKind::KdTree,
            Self::Octree(_) => IndexKind::Octree,
        }
    }

    /// Position of an indexed point.
    pub fn position(&self, index: usize) -> Point3<f64> {
        match self {
            Self::KdTree(t) => t.positions()[index],
            Self::Octree(t) => t.positions()[index],
        }
    }

    /// Neighbor indices (excluding the point itself) for every indexed point.
    pub fn neighborhoods(&self, k: usize) -> Vec<Vec<usize>> {
        self.neighborhoods_within(k, f64::INFINITY)
    }

    /// Like [`neighborhoods`](Self::neighborhoods), keeping only neighbors
    /// no farther than `radius`.
    pub fn neighborhoods_within(&self, k: usize, radius: f64) -> Vec<Vec<usize>> {
        use rayon::prelude::*;

        let r2 = radius * radius;
        (0..self.len())
            .into_par_iter()
            .map(|i| {
                let p = self.position(i);
                self.k_nearest(&p, k + 1)
                    .into_iter()
                    .filter(|n| n.index != i && n.distance_squared <= r2)
                    .take(k)
                    .map(|n| n.index)
                    .collect()
            })
            .collect()
    }
}

impl SpatialIndex for SpatialIndexHandle {
    fn len(&self) -> usize {
        match self {
            Self::KdTree(t) => t.len(),
            Self::Octree(t) => t.len(),
        }
    }

    fn k_nearest(&self, query: &Point3<f64>, k: usize) -> Vec<Neighbor> {
        match self {
            Self::KdTree(t) => t.k_nearest(query, k),
            Self::Octree(t) => t.k_nearest(query, k),
        }
    }

    fn within_radius(&self, query: &Point3<f64>, radius: f64) -> Vec<Neighbor> {
        match self {
            Self::KdTree(t) => t.within_radius(query, radius),
            Self::Octree(t) => t.within_radius(query, radius),
        }
    }
}

/// Bounded max-heap of the best `k` candidates seen so far.
#[derive(Debug)]
pub(crate) struct KBest {
    k: usize,
    heap: std::collections::BinaryHeap<Neighbor>,
}

impl KBest {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            heap: std::collections::BinaryHeap::with_capacity(k + 1),
        }
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Squared distance a candidate must beat, infinite until full.
    #[inline]
    pub(crate) fn worst(&self) -> f64 {
        if self.is_full() {
            self.heap.peek().map_or(f64::INFINITY, |n| n.distance_squared)
        } else {
            f64::INFINITY
        }
    }

    #[inline]
    pub(crate) fn offer(&mut self, candidate: Neighbor) {
        if !self.is_full() {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|top| candidate < *top) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    pub(crate) fn into_sorted(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kbest_keeps_smallest() {
        let mut best = KBest::new(2);
        for (i, d) in [5.0, 1.0, 3.0, 0.5].iter().enumerate() {
            best.offer(Neighbor {
                index: i,
                distance_squared: *d,
            });
        }
        let sorted = best.into_sorted();
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].index, 3);
        assert_eq!(sorted[1].index, 1);
    }

    #[test]
    fn test_handle_dispatch() {
        let cloud = PointCloud::from_positions((0..50).map(|i| Point3::new(i as f64, 0.0, 0.0)));
        for kind in [IndexKind::KdTree, IndexKind::Octree] {
            let index = SpatialIndexHandle::build(kind, &cloud);
            assert_eq!(index.kind(), kind);
            assert_eq!(index.len(), 50);
            let hit = index.nearest_within(&Point3::new(10.4, 0.0, 0.0), 0.5).unwrap();
            assert_eq!(hit.index, 10);
            assert!(index.nearest_within(&Point3::new(10.5, 3.0, 0.0), 0.5).is_none());
        }
    }

    #[test]
    fn test_neighborhoods_exclude_self() {
        let cloud = PointCloud::from_positions((0..20).map(|i| Point3::new(i as f64, 0.0, 0.0)));
        let index = SpatialIndexHandle::build(IndexKind::KdTree, &cloud);
        let hoods = index.neighborhoods(2);
        assert_eq!(hoods.len(), 20);
        assert!(hoods.iter().enumerate().all(|(i, h)| !h.contains(&i)));
        assert_eq!(hoods[5].len(), 2);
    }
}
