//! Geometry records, their compressed bucketed form, and the compressor.
//!
//! Raw geometry arrives as f64 positions (plus optional uvs, colours, indices
//! and edge indices). Compression:
//! - picks an RTC origin snapped to `rtc_cell_size`,
//! - quantizes origin-relative positions to u16 over their AABB,
//! - splits primitives into buckets whose local vertex count keeps the index
//!   arrays at the smallest of 8/16/32 bits,
//! - derives wireframe edges for triangle meshes when none are supplied.

mod buckets;
pub(crate) mod compress;
mod edges;
mod quantize;

pub use self::compress::{compress_all, compress_geometry};
pub use self::edges::build_edge_indices;
pub use self::quantize::{
    compress_colors, compress_uvs, positions_decompress_matrix, quantize_positions, snap_origin,
    Aabb,
};

use crate::error::{DtxError, Result};
use glam::{DVec3, Mat3, Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Points,
    Lines,
    Triangles,
    /// Closed triangle mesh; back faces may be culled.
    Solid,
    /// Open triangle mesh.
    Surface,
}

/// What a layer actually draws; layers are keyed by family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveFamily {
    Points,
    Lines,
    Triangles,
}

impl PrimitiveKind {
    pub fn family(self) -> PrimitiveFamily {
        match self {
            PrimitiveKind::Points => PrimitiveFamily::Points,
            PrimitiveKind::Lines => PrimitiveFamily::Lines,
            PrimitiveKind::Triangles | PrimitiveKind::Solid | PrimitiveKind::Surface => {
                PrimitiveFamily::Triangles
            }
        }
    }

    /// Indices per primitive.
    pub fn arity(self) -> usize {
        self.family().arity()
    }

    pub fn code(self) -> u8 {
        match self {
            PrimitiveKind::Points => 0,
            PrimitiveKind::Lines => 1,
            PrimitiveKind::Triangles => 2,
            PrimitiveKind::Solid => 3,
            PrimitiveKind::Surface => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => PrimitiveKind::Points,
            1 => PrimitiveKind::Lines,
            2 => PrimitiveKind::Triangles,
            3 => PrimitiveKind::Solid,
            4 => PrimitiveKind::Surface,
            _ => return None,
        })
    }
}

impl PrimitiveFamily {
    pub fn arity(self) -> usize {
        match self {
            PrimitiveFamily::Points => 1,
            PrimitiveFamily::Lines => 2,
            PrimitiveFamily::Triangles => 3,
        }
    }
}

/// One mesh's raw arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    pub id: String,
    pub primitive: PrimitiveKind,
    /// Flat xyz triples.
    pub positions: Vec<f64>,
    /// Flat uv pairs.
    #[serde(default)]
    pub uvs: Option<Vec<f32>>,
    /// Flat RGBA quadruples in `[0, 1]`.
    #[serde(default)]
    pub colors: Option<Vec<f32>>,
    /// When absent, vertices are consumed in order (`arity` per primitive).
    #[serde(default)]
    pub indices: Option<Vec<u32>>,
    /// When absent on a triangle mesh, edges are derived.
    #[serde(default)]
    pub edge_indices: Option<Vec<u32>>,
}

/// Bit width of an index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum IndexWidth {
    U8,
    U16,
    U32,
}

impl IndexWidth {
    pub const ALL: [IndexWidth; 3] = [IndexWidth::U8, IndexWidth::U16, IndexWidth::U32];

    /// Smallest width able to address `vertex_count` vertices.
    pub fn for_vertex_count(vertex_count: usize) -> Self {
        if vertex_count <= 1 << 8 {
            IndexWidth::U8
        } else if vertex_count <= 1 << 16 {
            IndexWidth::U16
        } else {
            IndexWidth::U32
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            IndexWidth::U8 => 8,
            IndexWidth::U16 => 16,
            IndexWidth::U32 => 32,
        }
    }

    /// Position in `ALL`, used to index per-width arrays.
    pub fn slot(self) -> usize {
        match self {
            IndexWidth::U8 => 0,
            IndexWidth::U16 => 1,
            IndexWidth::U32 => 2,
        }
    }

    pub fn max_value(self) -> u64 {
        (1u64 << self.bits()) - 1
    }
}

/// Index payload stored at its bucket's width.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexArray {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexArray {
    /// Narrows `values` to `width`; values must already fit.
    pub fn with_width(values: &[u32], width: IndexWidth) -> Self {
        match width {
            IndexWidth::U8 => IndexArray::U8(values.iter().map(|&v| v as u8).collect()),
            IndexWidth::U16 => IndexArray::U16(values.iter().map(|&v| v as u16).collect()),
            IndexWidth::U32 => IndexArray::U32(values.to_vec()),
        }
    }

    pub fn width(&self) -> IndexWidth {
        match self {
            IndexArray::U8(_) => IndexWidth::U8,
            IndexArray::U16(_) => IndexWidth::U16,
            IndexArray::U32(_) => IndexWidth::U32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IndexArray::U8(v) => v.len(),
            IndexArray::U16(v) => v.len(),
            IndexArray::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<u32> {
        match self {
            IndexArray::U8(v) => v.get(i).map(|&x| x as u32),
            IndexArray::U16(v) => v.get(i).map(|&x| x as u32),
            IndexArray::U32(v) => v.get(i).copied(),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            IndexArray::U8(v) => Box::new(v.iter().map(|&x| x as u32)),
            IndexArray::U16(v) => Box::new(v.iter().map(|&x| x as u32)),
            IndexArray::U32(v) => Box::new(v.iter().copied()),
        }
    }

    pub fn max(&self) -> Option<u32> {
        self.iter().max()
    }
}

/// One index-width-optimal partition of a geometry. All indices are local.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryBucket {
    /// Flat xyz, quantized over the geometry's AABB.
    pub positions_compressed: Vec<u16>,
    pub uvs_compressed: Option<Vec<u16>>,
    /// Flat RGBA8.
    pub colors_compressed: Option<Vec<u8>>,
    pub indices: Option<IndexArray>,
    pub edge_indices: Option<IndexArray>,
}

impl GeometryBucket {
    pub fn num_vertices(&self) -> usize {
        self.positions_compressed.len() / 3
    }

    /// Primitives for a family of the given arity. Index-less buckets draw every vertex.
    pub fn num_primitives(&self, arity: usize) -> usize {
        match self.indices.as_ref() {
            Some(indices) => indices.len() / arity,
            None => self.num_vertices() / arity,
        }
    }

    pub fn num_edges(&self) -> usize {
        self.edge_indices.as_ref().map_or(0, |e| e.len() / 2)
    }

    /// Width of the primitive index table this bucket lands in.
    pub fn index_width(&self) -> IndexWidth {
        self.indices
            .as_ref()
            .map(IndexArray::width)
            .unwrap_or_else(|| IndexWidth::for_vertex_count(self.num_vertices()))
    }

    pub fn edge_width(&self) -> Option<IndexWidth> {
        self.edge_indices.as_ref().map(IndexArray::width)
    }

    /// Local indices of the bucket's primitives, synthesizing them when absent.
    pub fn primitive_indices(&self) -> Vec<u32> {
        match self.indices.as_ref() {
            Some(indices) => indices.iter().collect(),
            None => (0..self.num_vertices() as u32).collect(),
        }
    }
}

/// Compressed geometry: buckets plus the shared decompression state.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryCompressedParams {
    pub id: String,
    pub primitive: PrimitiveKind,
    /// RTC origin shared by every bucket.
    pub origin: DVec3,
    /// Maps quantized `[0, 65535]` positions back to origin-relative space.
    pub positions_decompress_matrix: Mat4,
    pub uv_decompress_matrix: Option<Mat3>,
    pub buckets: Vec<GeometryBucket>,
}

impl GeometryCompressedParams {
    pub fn num_vertices(&self) -> usize {
        self.buckets.iter().map(GeometryBucket::num_vertices).sum()
    }

    pub fn num_primitives(&self) -> usize {
        let arity = self.primitive.arity();
        self.buckets.iter().map(|b| b.num_primitives(arity)).sum()
    }

    /// World-space (origin-applied) position of vertex `vertex` of bucket `bucket`.
    pub fn decompress_position(&self, bucket: usize, vertex: usize) -> Option<DVec3> {
        let p = self.buckets.get(bucket)?.positions_compressed.get(vertex * 3..vertex * 3 + 3)?;
        let q = Vec4::new(p[0] as f32, p[1] as f32, p[2] as f32, 1.0);
        let rel: Vec3 = (self.positions_decompress_matrix * q).truncate();
        Some(self.origin + rel.as_dvec3())
    }

    /// Checks every structural invariant a layer relies on.
    pub fn validate(&self) -> Result<()> {
        let id = self.id.as_str();
        let arity = self.primitive.arity();

        if self.buckets.is_empty() {
            return Err(DtxError::malformed(id, "no buckets"));
        }

        if self.primitive == PrimitiveKind::Solid && self.buckets.len() > 1 {
            return Err(DtxError::malformed(
                id,
                "solid geometry split over several buckets must be a surface",
            ));
        }

        if !self.origin.is_finite() || !self.positions_decompress_matrix.is_finite() {
            return Err(DtxError::malformed(id, "non-finite origin or decompress matrix"));
        }

        for (b, bucket) in self.buckets.iter().enumerate() {
            let verts = bucket.num_vertices();

            if bucket.positions_compressed.len() % 3 != 0 {
                return Err(DtxError::malformed(
                    id,
                    format!("bucket {b}: positions length is not a multiple of 3"),
                ));
            }

            if let Some(uvs) = bucket.uvs_compressed.as_ref() {
                if uvs.len() != verts * 2 {
                    return Err(DtxError::malformed(id, format!("bucket {b}: uvs length != 2 * vertices")));
                }
            }

            if let Some(colors) = bucket.colors_compressed.as_ref() {
                if colors.len() != verts * 4 {
                    return Err(DtxError::malformed(id, format!("bucket {b}: colors length != 4 * vertices")));
                }
            }

            match bucket.indices.as_ref() {
                Some(indices) => {
                    if indices.len() % arity != 0 {
                        return Err(DtxError::malformed(
                            id,
                            format!("bucket {b}: {} indices is not a multiple of {arity}", indices.len()),
                        ));
                    }
                    check_local(id, b, "index", indices, verts)?;
                }
                None if verts % arity != 0 => {
                    return Err(DtxError::malformed(
                        id,
                        format!("bucket {b}: {verts} unindexed vertices is not a multiple of {arity}"),
                    ));
                }
                None => {}
            }

            if let Some(edges) = bucket.edge_indices.as_ref() {
                if self.primitive.family() != PrimitiveFamily::Triangles {
                    return Err(DtxError::malformed(id, "edge indices on a non-triangle geometry"));
                }
                if edges.len() % 2 != 0 {
                    return Err(DtxError::malformed(id, format!("bucket {b}: odd edge index count")));
                }
                check_local(id, b, "edge index", edges, verts)?;
            }
        }

        Ok(())
    }
}

fn check_local(id: &str, bucket: usize, what: &str, indices: &IndexArray, verts: usize) -> Result<()> {
    if let Some(max) = indices.max() {
        if max as usize >= verts {
            return Err(DtxError::malformed(
                id,
                format!("bucket {bucket}: {what} {max} out of range ({verts} vertices)"),
            ));
        }
    }

    if (verts as u64) > indices.width().max_value() + 1 {
        return Err(DtxError::malformed(
            id,
            format!("bucket {bucket}: {}-bit {what} array cannot address {verts} vertices", indices.width().bits()),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_bucket(indices: IndexArray) -> GeometryCompressedParams {
        GeometryCompressedParams {
            id: "g".into(),
            primitive: PrimitiveKind::Triangles,
            origin: DVec3::ZERO,
            positions_decompress_matrix: Mat4::IDENTITY,
            uv_decompress_matrix: None,
            buckets: vec![GeometryBucket {
                positions_compressed: vec![0; 9],
                uvs_compressed: None,
                colors_compressed: None,
                indices: Some(indices),
                edge_indices: None,
            }],
        }
    }

    #[test]
    fn width_follows_vertex_count() {
        assert_eq!(IndexWidth::for_vertex_count(8), IndexWidth::U8);
        assert_eq!(IndexWidth::for_vertex_count(256), IndexWidth::U8);
        assert_eq!(IndexWidth::for_vertex_count(257), IndexWidth::U16);
        assert_eq!(IndexWidth::for_vertex_count(65536), IndexWidth::U16);
        assert_eq!(IndexWidth::for_vertex_count(65537), IndexWidth::U32);
    }

    #[test]
    fn validate_rejects_non_local_index() {
        let ok = one_bucket(IndexArray::U8(vec![0, 1, 2]));
        assert!(ok.validate().is_ok());

        let bad = one_bucket(IndexArray::U8(vec![0, 1, 3]));
        let err = bad.validate().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedGeometry);
    }

    #[test]
    fn validate_rejects_split_solid() {
        let mut g = one_bucket(IndexArray::U8(vec![0, 1, 2]));
        g.primitive = PrimitiveKind::Solid;
        assert!(g.validate().is_ok());

        g.buckets.push(g.buckets[0].clone());
        assert!(g.validate().is_err());
    }

    #[test]
    fn unindexed_bucket_counts_vertices() {
        let mut g = one_bucket(IndexArray::U8(vec![]));
        g.buckets[0].indices = None;
        assert_eq!(g.num_primitives(), 1);
        assert_eq!(g.buckets[0].primitive_indices(), vec![0, 1, 2]);
    }
}
