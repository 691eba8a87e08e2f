//! Indexed edge and vertex adjacency for triangle meshes.

use hashbrown::{HashMap, HashSet};
use tracing::warn;

/// Edge and vertex incidence of a triangle list.
///
/// Edges are keyed by `(min, max)` vertex index.
#[derive(Debug, Clone, Default)]
pub struct MeshAdjacency {
    /// Triangles incident to each undirected edge.
    pub edge_to_faces: HashMap<(u32, u32), Vec<u32>>,
    /// Triangles incident to each vertex.
    pub vertex_to_faces: HashMap<u32, Vec<u32>>,
}

#[inline]
pub fn edge_key(a: u32, b: u32) -> (u32, u32) {
    if a < b { (a, b) } else { (b, a) }
}

impl MeshAdjacency {
    pub fn build(triangles: &[[u32; 3]]) -> Self {
        let mut adj = Self::default();
        for (t, tri) in triangles.iter().enumerate() {
            let t = t as u32;
            for k in 0..3 {
                adj.edge_to_faces
                    .entry(edge_key(tri[k], tri[(k + 1) % 3]))
                    .or_default()
                    .push(t);
                adj.vertex_to_faces.entry(tri[k]).or_default().push(t);
            }
        }
        adj
    }

    /// Edges used by exactly one triangle.
    pub fn boundary_edges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.edge_to_faces
            .iter()
            .filter(|(_, faces)| faces.len() == 1)
            .map(|(&e, _)| e)
    }

    /// Edges used by more than two triangles.
    pub fn non_manifold_edges(&self) -> impl Iterator<Item = ((u32, u32), usize)> + '_ {
        self.edge_to_faces
            .iter()
            .filter(|(_, faces)| faces.len() > 2)
            .map(|(&e, faces)| (e, faces.len()))
    }

    pub fn is_manifold(&self) -> bool {
        self.non_manifold_edges().next().is_none()
    }

    pub fn is_watertight(&self) -> bool {
        self.boundary_edges().next().is_none()
    }

    /// Vertices touching at least one boundary edge.
    pub fn boundary_vertices(&self) -> HashSet<u32> {
        self.boundary_edges().flat_map(|(a, b)| [a, b]).collect()
    }

    /// Distinct one-ring neighbors of `v`, sorted.
    pub fn vertex_neighbors(&self, v: u32, triangles: &[[u32; 3]]) -> Vec<u32> {
        let mut ring: Vec<u32> = self
            .vertex_to_faces
            .get(&v)
            .into_iter()
            .flatten()
            .flat_map(|&t| triangles[t as usize])
            .filter(|&u| u != v)
            .collect();
        ring.sort_unstable();
        ring.dedup();
        ring
    }

    /// Closed loops of boundary edges, each as an ordered vertex list.
    ///
    /// Open chains (possible on non-manifold input) are skipped with a warning.
    pub fn boundary_loops(&self) -> Vec<Vec<u32>> {
        let mut next: HashMap<u32, Vec<u32>> = HashMap::new();
        for (a, b) in self.boundary_edges() {
            next.entry(a).or_default().push(b);
            next.entry(b).or_default().push(a);
        }

        let mut starts: Vec<u32> = next.keys().copied().collect();
        starts.sort_unstable();

        let mut visited: HashSet<u32> = HashSet::new();
        let mut loops = Vec::new();
        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            let mut ring = vec![start];
            visited.insert(start);
            let mut prev = None;
            let mut current = start;
            let closed = loop {
                let candidates = next.get(&current).map(Vec::as_slice).unwrap_or(&[]);
                let step = candidates
                    .iter()
                    .copied()
                    .find(|&n| Some(n) != prev && !visited.contains(&n));
                match step {
                    Some(n) => {
                        visited.insert(n);
                        ring.push(n);
                        prev = Some(current);
                        current = n;
                    }
                    None => break ring.len() > 2 && candidates.contains(&start),
                }
            };
            if closed {
                loops.push(ring);
            } else {
                warn!(start, "Boundary chain is not closed");
            }
        }
        loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two triangles forming a square.
    fn quad() -> Vec<[u32; 3]> {
        vec![[0, 1, 2], [0, 2, 3]]
    }

    #[test]
    fn test_quad_boundary() {
        let adj = MeshAdjacency::build(&quad());
        assert_eq!(adj.boundary_edges().count(), 4);
        assert!(adj.is_manifold());
        assert!(!adj.is_watertight());
        assert_eq!(adj.edge_to_faces[&(0, 2)].len(), 2);

        let loops = adj.boundary_loops();
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].len(), 4);
    }

    #[test]
    fn test_tetrahedron_closed() {
        let tris = vec![[0, 2, 1], [0, 1, 3], [1, 2, 3], [0, 3, 2]];
        let adj = MeshAdjacency::build(&tris);
        assert!(adj.is_watertight());
        assert!(adj.boundary_loops().is_empty());
        assert_eq!(adj.vertex_neighbors(0, &tris), vec![1, 2, 3]);
    }

    #[test]
    fn test_fin_is_non_manifold() {
        let tris = vec![[0, 1, 2], [1, 0, 3], [0, 1, 4]];
        let adj = MeshAdjacency::build(&tris);
        let bad: Vec<_> = adj.non_manifold_edges().collect();
        assert_eq!(bad, vec![((0, 1), 3)]);
        assert!(!adj.is_manifold());
    }
}
