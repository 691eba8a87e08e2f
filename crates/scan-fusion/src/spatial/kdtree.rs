//! Balanced k-d tree with leaf buckets.

use nalgebra::Point3;

use super::{KBest, Neighbor, SpatialIndex};
use crate::types::BoundingBox;

/// Maximum number of points in a leaf bucket.
pub const LEAF_SIZE: usize = 8;

#[derive(Debug, Clone)]
enum KdNode {
    Leaf {
        start: u32,
        end: u32,
    },
    Split {
        axis: u8,
        value: f64,
        left: u32,
        right: u32,
    },
}

/// k-d tree over an owned position snapshot.
///
/// Each split node partitions its points at the median of the widest axis;
/// points with coordinate `<= value` go left and `>= value` go right. A node
/// whose points all coincide becomes a leaf regardless of size, so duplicate
/// positions never cause unbounded recursion.
#[derive(Debug, Clone)]
pub struct KdTree {
    positions: Vec<Point3<f64>>,
    /// Point indices, permuted so every leaf owns a contiguous range.
    order: Vec<u32>,
    nodes: Vec<KdNode>,
}

impl KdTree {
    pub fn build(positions: Vec<Point3<f64>>) -> Self {
        let mut order: Vec<u32> = (0..positions.len() as u32).collect();
        let mut nodes = Vec::with_capacity(2 * positions.len() / LEAF_SIZE + 1);
        if !positions.is_empty() {
            build_node(&positions, &mut order, 0, &mut nodes);
        }
        Self {
            positions,
            order,
            nodes,
        }
    }

    #[inline]
    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    /// Number of tree nodes (splits and leaves).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Depth of the deepest leaf (a single leaf tree has depth 0).
    pub fn depth(&self) -> usize {
        fn walk(nodes: &[KdNode], node: usize) -> usize {
            match nodes[node] {
                KdNode::Leaf { .. } => 0,
                KdNode::Split { left, right, .. } => {
                    1 + walk(nodes, left as usize).max(walk(nodes, right as usize))
                }
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    /// Verify the partition invariant and that every point sits in exactly one leaf.
    pub fn check_invariants(&self) -> bool {
        if self.nodes.is_empty() {
            return self.positions.is_empty();
        }
        let mut seen = vec![false; self.positions.len()];
        self.check_node(0, &mut seen, &mut Vec::new()) && seen.iter().all(|&s| s)
    }

    fn check_node(
        &self,
        node: usize,
        seen: &mut [bool],
        constraints: &mut Vec<(usize, f64, bool)>,
    ) -> bool {
        match self.nodes[node] {
            KdNode::Leaf { start, end } => {
                if end - start > LEAF_SIZE as u32 && !self.all_coincident(start, end) {
                    return false;
                }
                for &i in &self.order[start as usize..end as usize] {
                    let p = &self.positions[i as usize];
                    let inside = constraints.iter().all(|&(axis, value, is_left)| {
                        if is_left {
                            p[axis] <= value
                        } else {
                            p[axis] >= value
                        }
                    });
                    if !inside || std::mem::replace(&mut seen[i as usize], true) {
                        return false;
                    }
                }
                true
            }
            KdNode::Split {
                axis,
                value,
                left,
                right,
            } => {
                constraints.push((axis as usize, value, true));
                let ok_left = self.check_node(left as usize, seen, constraints);
                constraints.pop();
                constraints.push((axis as usize, value, false));
                let ok_right = self.check_node(right as usize, seen, constraints);
                constraints.pop();
                ok_left && ok_right
            }
        }
    }

    fn all_coincident(&self, start: u32, end: u32) -> bool {
        let slice = &self.order[start as usize..end as usize];
        let first = self.positions[slice[0] as usize];
        slice.iter().all(|&i| self.positions[i as usize] == first)
    }

    fn search_knn(&self, node: usize, query: &Point3<f64>, best: &mut KBest) {
        match self.nodes[node] {
            KdNode::Leaf { start, end } => {
                for &i in &self.order[start as usize..end as usize] {
                    best.offer(Neighbor {
                        index: i as usize,
                        distance_squared: (self.positions[i as usize] - query).norm_squared(),
                    });
                }
            }
            KdNode::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis as usize] - value;
                let (near, far) = if diff < 0.0 {
                    (left, right)
                } else {
                    (right, left)
                };
                self.search_knn(near as usize, query, best);
                if diff * diff <= best.worst() {
                    self.search_knn(far as usize, query, best);
                }
            }
        }
    }

    fn search_radius(
        &self,
        node: usize,
        query: &Point3<f64>,
        radius: f64,
        out: &mut Vec<Neighbor>,
    ) {
        match self.nodes[node] {
            KdNode::Leaf { start, end } => {
                let r2 = radius * radius;
                for &i in &self.order[start as usize..end as usize] {
                    let d2 = (self.positions[i as usize] - query).norm_squared();
                    if d2 <= r2 {
                        out.push(Neighbor {
                            index: i as usize,
                            distance_squared: d2,
                        });
                    }
                }
            }
            KdNode::Split {
                axis,
                value,
                left,
                right,
            } => {
                let q = query[axis as usize];
                if q - radius <= value {
                    self.search_radius(left as usize, query, radius, out);
                }
                if q + radius >= value {
                    self.search_radius(right as usize, query, radius, out);
                }
            }
        }
    }
}

fn build_node(
    positions: &[Point3<f64>],
    order: &mut [u32],
    offset: usize,
    nodes: &mut Vec<KdNode>,
) -> usize {
    let id = nodes.len();
    let leaf = KdNode::Leaf {
        start: offset as u32,
        end: (offset + order.len()) as u32,
    };
    if order.len() <= LEAF_SIZE {
        nodes.push(leaf);
        return id;
    }

    let Some(bounds) = BoundingBox::from_points(order.iter().map(|&i| &positions[i as usize]))
    else {
        nodes.push(leaf);
        return id;
    };
    let axis = bounds.longest_axis();
    if bounds.extent()[axis] <= 0.0 {
        nodes.push(leaf);
        return id;
    }

    let mid = order.len() / 2;
    order.select_nth_unstable_by(mid, |&a, &b| {
        positions[a as usize][axis].total_cmp(&positions[b as usize][axis])
    });
    let value = positions[order[mid] as usize][axis];

    // Placeholder, patched once both children exist.
    nodes.push(leaf);
    let (lo, hi) = order.split_at_mut(mid);
    let left = build_node(positions, lo, offset, nodes);
    let right = build_node(positions, hi, offset + mid, nodes);
    nodes[id] = KdNode::Split {
        axis: axis as u8,
        value,
        left: left as u32,
        right: right as u32,
    };
    id
}

impl SpatialIndex for KdTree {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn k_nearest(&self, query: &Point3<f64>, k: usize) -> Vec<Neighbor> {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let mut best = KBest::new(k.min(self.positions.len()));
        self.search_knn(0, query, &mut best);
        best.into_sorted()
    }

    fn within_radius(&self, query: &Point3<f64>, radius: f64) -> Vec<Neighbor> {
        let mut out = Vec::new();
        if radius >= 0.0 && !self.nodes.is_empty() {
            self.search_radius(0, query, radius, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<Point3<f64>> {
        let mut out = Vec::new();
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    out.push(Point3::new(x as f64, y as f64, z as f64));
                }
            }
        }
        out
    }

    #[test]
    fn test_empty_tree() {
        let tree = KdTree::build(Vec::new());
        assert!(tree.is_empty());
        assert!(tree.k_nearest(&Point3::origin(), 3).is_empty());
        assert!(tree.within_radius(&Point3::origin(), 10.0).is_empty());
        assert!(tree.check_invariants());
    }

    #[test]
    fn test_k_larger_than_len() {
        let tree = KdTree::build(vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)]);
        let hits = tree.k_nearest(&Point3::origin(), 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 0);
    }

    #[test]
    fn test_knn_matches_brute_force() {
        let points = grid(6);
        let tree = KdTree::build(points.clone());
        assert!(tree.check_invariants());

        let query = Point3::new(2.3, 1.7, 4.1);
        let hits = tree.k_nearest(&query, 7);
        let mut brute: Vec<f64> = points.iter().map(|p| (p - query).norm_squared()).collect();
        brute.sort_by(f64::total_cmp);
        for (hit, expected) in hits.iter().zip(&brute) {
            assert_eq!(hit.distance_squared, *expected);
        }
        assert!(hits.windows(2).all(|w| w[0].distance_squared <= w[1].distance_squared));
    }

    #[test]
    fn test_radius_inclusive() {
        let tree = KdTree::build(grid(4));
        let hits = tree.within_radius(&Point3::new(1.0, 1.0, 1.0), 1.0);
        // Center plus six face neighbors at exactly distance 1.
        assert_eq!(hits.len(), 7);
    }

    #[test]
    fn test_duplicates_form_single_leaf() {
        let tree = KdTree::build(vec![Point3::new(1.0, 1.0, 1.0); 100]);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.check_invariants());
        assert_eq!(tree.k_nearest(&Point3::origin(), 5).len(), 5);
    }

    #[test]
    fn test_depth_is_logarithmic() {
        let tree = KdTree::build(grid(10));
        assert!(tree.check_invariants());
        // 1000 points, 8 per leaf: about 7 levels.
        assert!(tree.depth() <= 9);
    }
}
