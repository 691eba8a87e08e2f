//! Iso-surface extraction over a [`ScalarField`].
//!
//! Vertices are registered per grid edge, keyed by the edge's lower node and
//! axis, so neighboring cells share them and the output is manifold rather
//! than a soup of per-cell triangles.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::{debug, trace};

use crate::error::FusionResult;
use crate::progress::CancellationToken;
use crate::types::{AREA_EPSILON, Stage};

use super::field::ScalarField;
use super::tables::{CORNER_OFFSETS, EDGE_CORNERS, EDGE_TABLE, TRI_TABLE};

/// Interpolation parameters are kept this far from either edge end so
/// vertices never coincide with grid nodes.
const EDGE_T_MARGIN: f64 = 0.01;

/// Raw extraction output, ready for [`crate::MeshData::new`].
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub vertices: Vec<Point3<f64>>,
    pub normals: Vec<Vector3<f64>>,
    pub confidence: Vec<f64>,
    pub triangles: Vec<[u32; 3]>,
    /// Interpolated iso crossings (one per registered grid edge).
    pub crossings: usize,
    /// Triangles dropped for having no area.
    pub dropped_triangles: usize,
}

struct Registry<'a> {
    field: &'a ScalarField,
    iso: f64,
    by_edge: HashMap<(usize, u8), u32>,
    vertices: Vec<Point3<f64>>,
    normals: Vec<Option<Vector3<f64>>>,
    confidence: Vec<f64>,
}

impl Registry<'_> {
    /// Vertex on the edge from node `lo` to the next node along `axis`.
    fn vertex(&mut self, lo: [usize; 3], axis: u8) -> u32 {
        let spec = &self.field.spec;
        let key = (spec.index(lo[0], lo[1], lo[2]), axis);
        if let Some(&id) = self.by_edge.get(&key) {
            return id;
        }

        let mut hi = lo;
        hi[axis as usize] += 1;
        let a = self.field.value(lo[0], lo[1], lo[2]);
        let b = self.field.value(hi[0], hi[1], hi[2]);
        let t = if (b - a).abs() > f64::EPSILON {
            ((self.iso - a) / (b - a)).clamp(EDGE_T_MARGIN, 1.0 - EDGE_T_MARGIN)
        } else {
            0.5
        };

        let pa = spec.position(lo[0], lo[1], lo[2]);
        let pb = spec.position(hi[0], hi[1], hi[2]);
        let ga = self.field.gradient(lo[0], lo[1], lo[2]);
        let gb = self.field.gradient(hi[0], hi[1], hi[2]);
        let ca = self.field.confidence[key.0];
        let cb = self.field.confidence[spec.index(hi[0], hi[1], hi[2])];

        let id = self.vertices.len() as u32;
        self.vertices.push(pa + (pb - pa) * t);
        self.normals.push((ga * (1.0 - t) + gb * t).try_normalize(1e-12));
        self.confidence.push((ca * (1.0 - t) + cb * t).clamp(0.0, 1.0));
        self.by_edge.insert(key, id);
        id
    }
}

/// Triangulate the `iso` level set. Cells touching an unsupported (NaN) node
/// are skipped. Polls the token once per z-layer of cells.
pub fn extract(field: &ScalarField, iso: f64, token: &CancellationToken) -> FusionResult<Extraction> {
    let [nx, ny, nz] = field.spec.dims;
    let mut registry = Registry {
        field,
        iso,
        by_edge: HashMap::new(),
        vertices: Vec::new(),
        normals: Vec::new(),
        confidence: Vec::new(),
    };
    let mut triangles = Vec::new();
    let mut dropped = 0usize;

    for z in 0..nz.saturating_sub(1) {
        token.check(Stage::Reconstruction)?;
        for y in 0..ny.saturating_sub(1) {
            for x in 0..nx.saturating_sub(1) {
                let mut values = [0.0f64; 8];
                let mut case = 0usize;
                let mut supported = true;
                for (i, off) in CORNER_OFFSETS.iter().enumerate() {
                    let v = field.value(x + off[0], y + off[1], z + off[2]);
                    if !v.is_finite() {
                        supported = false;
                        break;
                    }
                    values[i] = v;
                    if v < iso {
                        case |= 1 << i;
                    }
                }
                if !supported || EDGE_TABLE[case] == 0 {
                    continue;
                }

                let mut edge_vertex = [u32::MAX; 12];
                for (e, slot) in edge_vertex.iter_mut().enumerate() {
                    if EDGE_TABLE[case] & (1 << e) == 0 {
                        continue;
                    }
                    let [c0, c1] = EDGE_CORNERS[e];
                    let (o0, o1) = (CORNER_OFFSETS[c0], CORNER_OFFSETS[c1]);
                    let axis = (0..3).find(|&k| o0[k] != o1[k]).unwrap_or(0);
                    let lo = if o0[axis] < o1[axis] { o0 } else { o1 };
                    *slot = registry.vertex([x + lo[0], y + lo[1], z + lo[2]], axis as u8);
                }

                for tri in TRI_TABLE[case].chunks_exact(3) {
                    if tri[0] < 0 {
                        break;
                    }
                    let ids = [
                        edge_vertex[tri[0] as usize],
                        edge_vertex[tri[1] as usize],
                        edge_vertex[tri[2] as usize],
                    ];
                    let [a, b, c] = ids.map(|i| registry.vertices[i as usize]);
                    if 0.5 * (b - a).cross(&(c - a)).norm() <= AREA_EPSILON {
                        dropped += 1;
                        continue;
                    }
                    triangles.push(ids);
                }
            }
        }
    }

    let crossings = registry.vertices.len();
    if dropped > 0 {
        debug!(dropped, "Dropped zero-area triangles during extraction");
    }
    trace!(crossings, triangles = triangles.len(), "Marching cubes finished");

    let Registry {
        vertices,
        normals,
        confidence,
        ..
    } = registry;
    let normals = fill_missing_normals(&vertices, normals, &triangles);
    Ok(compact(Extraction {
        vertices,
        normals,
        confidence,
        triangles,
        crossings,
        dropped_triangles: dropped,
    }))
}

/// Use area-weighted face normals where the field gradient vanished.
fn fill_missing_normals(
    vertices: &[Point3<f64>],
    normals: Vec<Option<Vector3<f64>>>,
    triangles: &[[u32; 3]],
) -> Vec<Vector3<f64>> {
    if normals.iter().all(Option::is_some) {
        return normals.into_iter().flatten().collect();
    }
    let mut accumulated = vec![Vector3::zeros(); vertices.len()];
    for t in triangles {
        let [a, b, c] = t.map(|i| vertices[i as usize]);
        let face = (b - a).cross(&(c - a));
        for &i in t {
            accumulated[i as usize] += face;
        }
    }
    normals
        .into_iter()
        .zip(accumulated)
        .map(|(n, acc)| n.or_else(|| acc.try_normalize(1e-12)).unwrap_or_else(Vector3::z))
        .collect()
}

/// Remove vertices no triangle references.
fn compact(mut ex: Extraction) -> Extraction {
    let mut used = vec![false; ex.vertices.len()];
    for t in &ex.triangles {
        for &i in t {
            used[i as usize] = true;
        }
    }
    if used.iter().all(|&u| u) {
        return ex;
    }
    let mut remap = vec![u32::MAX; ex.vertices.len()];
    let mut next = 0u32;
    for (i, &u) in used.iter().enumerate() {
        if u {
            remap[i] = next;
            next += 1;
        }
    }
    let keep = |i: &usize| used[*i];
    ex.vertices = (0..ex.vertices.len()).filter(keep).map(|i| ex.vertices[i]).collect();
    ex.normals = (0..ex.normals.len()).filter(keep).map(|i| ex.normals[i]).collect();
    ex.confidence = (0..ex.confidence.len()).filter(keep).map(|i| ex.confidence[i]).collect();
    for t in &mut ex.triangles {
        *t = t.map(|i| remap[i as usize]);
    }
    ex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::field::GridSpec;
    use hashbrown::HashMap as Map;

    fn sphere_field(n: usize, radius: f64) -> ScalarField {
        let spec = GridSpec {
            origin: Point3::origin(),
            cell_size: 1.0,
            dims: [n, n, n],
        };
        let c = (n as f64 - 1.0) / 2.0;
        let mut values = Vec::with_capacity(spec.node_count());
        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let p = Vector3::new(x as f64 - c, y as f64 - c, z as f64 - c + 0.13);
                    values.push(p.norm() - radius);
                }
            }
        }
        let confidence = vec![1.0; values.len()];
        ScalarField {
            spec,
            values,
            confidence,
        }
    }

    fn edge_uses(triangles: &[[u32; 3]]) -> Map<(u32, u32), usize> {
        let mut uses = Map::new();
        for t in triangles {
            for k in 0..3 {
                *uses.entry((t[k], t[(k + 1) % 3])).or_insert(0) += 1;
            }
        }
        uses
    }

    #[test]
    fn test_sphere_is_closed_and_outward() {
        let field = sphere_field(14, 4.3);
        let ex = extract(&field, 0.0, &CancellationToken::new()).unwrap();
        assert!(!ex.triangles.is_empty());
        assert_eq!(ex.vertices.len(), ex.crossings);

        // Every directed edge appears once and its reverse once: closed, consistently wound.
        let uses = edge_uses(&ex.triangles);
        for (&(a, b), &count) in &uses {
            assert_eq!(count, 1);
            assert_eq!(uses.get(&(b, a)), Some(&1));
        }

        let center = Point3::new(6.5, 6.5, 6.37);
        for t in &ex.triangles {
            let [a, b, c] = t.map(|i| ex.vertices[i as usize]);
            let n = (b - a).cross(&(c - a));
            let centroid = Point3::from((a.coords + b.coords + c.coords) / 3.0);
            assert!(n.dot(&(centroid - center)) > 0.0);
        }
        for (v, n) in ex.vertices.iter().zip(&ex.normals) {
            assert!((n.norm() - 1.0).abs() < 1e-9);
            assert!(n.dot(&(v - center)) > 0.0);
            assert!(((v - center).norm() - 4.3).abs() < 0.2);
        }
    }

    #[test]
    fn test_unsupported_cells_are_skipped() {
        let mut field = sphere_field(14, 4.3);
        let nan_nodes: Vec<usize> = (0..field.values.len())
            .filter(|&i| i % field.spec.dims[0] < 7)
            .collect();
        for i in nan_nodes {
            field.values[i] = f64::NAN;
        }
        let ex = extract(&field, 0.0, &CancellationToken::new()).unwrap();
        assert!(!ex.triangles.is_empty());
        assert!(ex.vertices.iter().all(|v| v.x >= 7.0));
        // Open along the cut: some directed edges have no reverse.
        let uses = edge_uses(&ex.triangles);
        assert!(uses.keys().any(|&(a, b)| !uses.contains_key(&(b, a))));
    }

    #[test]
    fn test_empty_when_no_crossing() {
        let mut field = sphere_field(6, 100.0);
        field.values.iter_mut().for_each(|v| *v = v.abs());
        let ex = extract(&field, 0.0, &CancellationToken::new()).unwrap();
        assert!(ex.triangles.is_empty());
        assert_eq!(ex.crossings, 0);
    }
}
