//! Point octree with bounded leaf capacity and depth.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use nalgebra::Point3;

use super::{KBest, Neighbor, SpatialIndex};
use crate::types::BoundingBox;

/// Points a leaf holds before it subdivides.
pub const LEAF_CAPACITY: usize = 8;

/// Depth below which leaves stop subdividing and simply grow.
pub const MAX_DEPTH: u8 = 8;

#[derive(Debug, Clone)]
struct OctreeNode {
    bounds: BoundingBox,
    depth: u8,
    children: Option<[u32; 8]>,
    points: Vec<u32>,
}

impl OctreeNode {
    fn leaf(bounds: BoundingBox, depth: u8) -> Self {
        Self {
            bounds,
            depth,
            children: None,
            points: Vec::new(),
        }
    }
}

/// Octree over an owned position snapshot.
///
/// The root is the cubified bounding box of the input. Each internal node's
/// eight children partition it around its center; a point lying on a split
/// plane belongs to the upper child.
#[derive(Debug, Clone)]
pub struct Octree {
    positions: Vec<Point3<f64>>,
    nodes: Vec<OctreeNode>,
}

/// Min-heap entry for best-first traversal.
#[derive(Debug, PartialEq)]
struct NodeDistance(f64, u32);

impl Eq for NodeDistance {}

impl PartialOrd for NodeDistance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeDistance {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

impl Octree {
    pub fn build(positions: Vec<Point3<f64>>) -> Self {
        let mut tree = Self {
            positions,
            nodes: Vec::new(),
        };
        let Some(bounds) = BoundingBox::from_points(tree.positions.iter()) else {
            return tree;
        };
        let cube = bounds.cubified();
        let margin = (cube.diagonal() * 1e-9).max(1e-12);
        tree.nodes.push(OctreeNode::leaf(cube.expanded(margin), 0));
        for i in 0..tree.positions.len() {
            tree.insert(i as u32);
        }
        tree
    }

    #[inline]
    pub fn positions(&self) -> &[Point3<f64>] {
        &self.positions
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Bounds of the root cell.
    pub fn root_bounds(&self) -> Option<BoundingBox> {
        self.nodes.first().map(|n| n.bounds)
    }

    pub fn max_depth_reached(&self) -> u8 {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    fn insert(&mut self, index: u32) {
        let p = self.positions[index as usize];
        let mut node = 0usize;
        while let Some(children) = self.nodes[node].children {
            node = children[self.nodes[node].bounds.octant_of(&p)] as usize;
        }
        self.nodes[node].points.push(index);
        if self.nodes[node].points.len() > LEAF_CAPACITY && self.nodes[node].depth < MAX_DEPTH {
            self.subdivide(node);
        }
    }

    /// Split an overfull leaf, cascading while a child is still overfull.
    fn subdivide(&mut self, node: usize) {
        let mut pending = vec![node];
        while let Some(node) = pending.pop() {
            let bounds = self.nodes[node].bounds;
            let depth = self.nodes[node].depth + 1;
            let first = self.nodes.len() as u32;
            for octant in 0..8 {
                self.nodes.push(OctreeNode::leaf(bounds.octant(octant), depth));
            }
            let children: [u32; 8] = std::array::from_fn(|i| first + i as u32);
            let points = std::mem::take(&mut self.nodes[node].points);
            self.nodes[node].children = Some(children);
            for index in points {
                let octant = bounds.octant_of(&self.positions[index as usize]);
                self.nodes[children[octant] as usize].points.push(index);
            }
            pending.extend(children.iter().map(|&c| c as usize).filter(|&c| {
                self.nodes[c].points.len() > LEAF_CAPACITY && self.nodes[c].depth < MAX_DEPTH
            }));
        }
    }

    /// Verify the structural invariants: children partition their parent,
    /// points lie inside their leaf, only depth-limited leaves exceed
    /// capacity, and every point is stored exactly once.
    pub fn check_invariants(&self) -> bool {
        if self.nodes.is_empty() {
            return self.positions.is_empty();
        }
        let mut seen = vec![false; self.positions.len()];
        for node in &self.nodes {
            match node.children {
                Some(children) => {
                    if !node.points.is_empty() {
                        return false;
                    }
                    for (octant, &child) in children.iter().enumerate() {
                        let c = &self.nodes[child as usize];
                        if c.bounds != node.bounds.octant(octant) || c.depth != node.depth + 1 {
                            return false;
                        }
                    }
                }
                None => {
                    if node.points.len() > LEAF_CAPACITY && node.depth < MAX_DEPTH {
                        return false;
                    }
                    for &i in &node.points {
                        if !node.bounds.contains(&self.positions[i as usize])
                            || std::mem::replace(&mut seen[i as usize], true)
                        {
                            return false;
                        }
                    }
                }
            }
        }
        seen.iter().all(|&s| s)
    }
}

impl SpatialIndex for Octree {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn k_nearest(&self, query: &Point3<f64>, k: usize) -> Vec<Neighbor> {
        if k == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let mut best = KBest::new(k.min(self.positions.len()));
        let mut queue = BinaryHeap::new();
        queue.push(Reverse(NodeDistance(
            self.nodes[0].bounds.distance_squared_to(query),
            0,
        )));

        while let Some(Reverse(NodeDistance(d2, id))) = queue.pop() {
            if d2 > best.worst() {
                break;
            }
            let node = &self.nodes[id as usize];
            match node.children {
                Some(children) => {
                    for child in children {
                        let c = &self.nodes[child as usize];
                        if c.children.is_none() && c.points.is_empty() {
                            continue;
                        }
                        queue.push(Reverse(NodeDistance(
                            c.bounds.distance_squared_to(query),
                            child,
                        )));
                    }
                }
                None => {
                    for &i in &node.points {
                        best.offer(Neighbor {
                            index: i as usize,
                            distance_squared: (self.positions[i as usize] - query).norm_squared(),
                        });
                    }
                }
            }
        }
        best.into_sorted()
    }

    fn within_radius(&self, query: &Point3<f64>, radius: f64) -> Vec<Neighbor> {
        let mut out = Vec::new();
        if radius < 0.0 || self.nodes.is_empty() {
            return out;
        }
        let r2 = radius * radius;
        let mut stack = vec![0u32];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            if node.bounds.distance_squared_to(query) > r2 {
                continue;
            }
            match node.children {
                Some(children) => stack.extend(children),
                None => {
                    for &i in &node.points {
                        let d2 = (self.positions[i as usize] - query).norm_squared();
                        if d2 <= r2 {
                            out.push(Neighbor {
                                index: i as usize,
                                distance_squared: d2,
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spiral(n: usize) -> Vec<Point3<f64>> {
        (0..n)
            .map(|i| {
                let t = i as f64 * 0.37;
                Point3::new(t.cos() * (1.0 + t * 0.01), t.sin(), t * 0.02)
            })
            .collect()
    }

    #[test]
    fn test_root_is_cube() {
        let tree = Octree::build(vec![Point3::origin(), Point3::new(4.0, 1.0, 2.0)]);
        let e = tree.root_bounds().unwrap().extent();
        assert!((e.x - e.y).abs() < 1e-9 && (e.y - e.z).abs() < 1e-9);
    }

    #[test]
    fn test_invariants_hold() {
        let tree = Octree::build(spiral(2000));
        assert!(tree.check_invariants());
        assert!(tree.node_count() > 1);
        assert!(tree.max_depth_reached() <= MAX_DEPTH);
    }

    #[test]
    fn test_depth_limit_with_duplicates() {
        let tree = Octree::build(vec![Point3::new(0.5, 0.5, 0.5); 50]);
        assert!(tree.check_invariants());
        assert!(tree.max_depth_reached() <= MAX_DEPTH);
        assert_eq!(tree.k_nearest(&Point3::origin(), 60).len(), 50);
    }

    #[test]
    fn test_knn_matches_brute_force() {
        let points = spiral(500);
        let tree = Octree::build(points.clone());
        let query = Point3::new(0.3, -0.2, 1.0);
        let hits = tree.k_nearest(&query, 10);
        let mut brute: Vec<f64> = points.iter().map(|p| (p - query).norm_squared()).collect();
        brute.sort_by(f64::total_cmp);
        assert_eq!(hits.len(), 10);
        for (hit, expected) in hits.iter().zip(&brute) {
            assert_eq!(hit.distance_squared, *expected);
        }
    }

    #[test]
    fn test_radius_covers_everything() {
        let points = spiral(300);
        let tree = Octree::build(points);
        let diag = tree.root_bounds().unwrap().diagonal();
        let mut hits: Vec<usize> = tree
            .within_radius(&Point3::origin(), diag * 2.0)
            .into_iter()
            .map(|n| n.index)
            .collect();
        hits.sort_unstable();
        assert_eq!(hits, (0..300).collect::<Vec<_>>());
    }
}
