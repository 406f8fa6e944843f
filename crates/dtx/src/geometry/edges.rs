//! Automatic wireframe edges for triangle meshes.

use glam::DVec3;
use hashbrown::HashMap;

/// A derived edge: two vertex ids plus the triangle that introduced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub a: u32,
    pub b: u32,
    pub triangle: usize,
}

struct EdgeUse {
    first: Edge,
    faces: [usize; 2],
    count: u32,
}

/// Derives the wireframe of a triangle mesh.
///
/// `weld` maps each vertex to a position-canonical id so that split vertices
/// (per-face normals, uv seams) still share edges. An undirected edge is
/// emitted when exactly one triangle uses it, or exactly two do and the angle
/// between their normals exceeds `threshold_deg`. Output order follows first
/// occurrence.
pub fn build_edge_indices(
    positions: &[f64],
    indices: &[u32],
    weld: &[u32],
    threshold_deg: f64,
) -> Vec<Edge> {
    let vertex = |i: u32| {
        let i = i as usize * 3;
        DVec3::new(positions[i], positions[i + 1], positions[i + 2])
    };

    let normals: Vec<DVec3> = indices
        .chunks_exact(3)
        .map(|t| {
            let (p0, p1, p2) = (vertex(t[0]), vertex(t[1]), vertex(t[2]));
            (p1 - p0).cross(p2 - p0).normalize_or_zero()
        })
        .collect();

    let mut uses: Vec<EdgeUse> = Vec::new();
    let mut lookup: HashMap<(u32, u32), usize> = HashMap::new();

    for (triangle, t) in indices.chunks_exact(3).enumerate() {
        for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
            let (wa, wb) = (weld[a as usize], weld[b as usize]);
            if wa == wb {
                continue;
            }
            let key = (wa.min(wb), wa.max(wb));

            match lookup.get(&key) {
                Some(&slot) => {
                    let used = &mut uses[slot];
                    if used.count < 2 {
                        used.faces[used.count as usize] = triangle;
                    }
                    used.count += 1;
                }
                None => {
                    lookup.insert(key, uses.len());
                    uses.push(EdgeUse {
                        first: Edge { a, b, triangle },
                        faces: [triangle, usize::MAX],
                        count: 1,
                    });
                }
            }
        }
    }

    let cos_threshold = threshold_deg.to_radians().cos();

    uses.into_iter()
        .filter(|u| match u.count {
            1 => true,
            2 => {
                let (n0, n1) = (normals[u.faces[0]], normals[u.faces[1]]);
                n0.dot(n1) < cos_threshold
            }
            _ => false,
        })
        .map(|u| u.first)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_weld(n: usize) -> Vec<u32> {
        (0..n as u32).collect()
    }

    #[test]
    fn flat_quad_keeps_only_its_border() {
        // Two coplanar triangles sharing the 0-2 diagonal.
        let positions = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        let indices = [0, 1, 2, 0, 2, 3];

        let edges = build_edge_indices(&positions, &indices, &identity_weld(4), 10.0);
        assert_eq!(edges.len(), 4);
        assert!(edges.iter().all(|e| !((e.a == 0 && e.b == 2) || (e.a == 2 && e.b == 0))));
    }

    #[test]
    fn folded_quad_keeps_the_crease() {
        // Same quad folded 90 degrees along the diagonal.
        let positions = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let indices = [0, 1, 2, 0, 2, 3];

        let edges = build_edge_indices(&positions, &indices, &identity_weld(4), 10.0);
        assert_eq!(edges.len(), 5);

        let loose = build_edge_indices(&positions, &indices, &identity_weld(4), 120.0);
        assert_eq!(loose.len(), 4);
    }

    #[test]
    fn welded_split_vertices_share_edges() {
        // Two coplanar triangles whose shared edge uses distinct but coincident vertices.
        let positions = [
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0,
        ];
        let indices = [0, 1, 2, 3, 4, 5];
        let weld = [0, 1, 2, 0, 2, 5];

        let edges = build_edge_indices(&positions, &indices, &weld, 10.0);
        assert_eq!(edges.len(), 4);

        let unwelded = build_edge_indices(&positions, &indices, &identity_weld(6), 10.0);
        assert_eq!(unwelded.len(), 6);
    }

    #[test]
    fn closed_cube_has_twelve_edges() {
        let (positions, indices) = crate::geometry::compress::tests::cube();
        let edges = build_edge_indices(&positions, &indices, &identity_weld(8), 10.0);
        assert_eq!(edges.len(), 12);
    }
}
