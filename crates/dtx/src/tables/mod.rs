//! The per-layer set of data textures and the row packers that fill them.
//!
//! Each-mesh tables hold one record per row (`meshIndex` row, or one row per
//! geometry bucket of a mesh). Per-vertex tables hold one texel per vertex,
//! index tables one texel per primitive, split by index bit width. Lookup
//! tables map every `PRIMITIVE_ALIGNMENT` primitives of the draw stream back
//! to their row.

mod texture;

pub use self::texture::DataTexture;

use crate::config::MatrixPrecision;
use crate::error::Result;
use crate::flags::{pack_flags, pack_flags2, RenderFlags};
use crate::geometry::{IndexWidth, PrimitiveFamily};
use crate::sink::{Scalar, TableKind, TexelFormat};
use glam::{Mat3, Mat4, Vec3};
use half::f16;

/// Texel columns of the each-mesh-attributes record.
pub mod column {
    pub const COLOR: u32 = 0;
    pub const PICK_COLOR: u32 = 1;
    pub const FLAGS: u32 = 2;
    pub const FLAGS2: u32 = 3;
    pub const VERTEX_BASE: u32 = 4;
    pub const INDEX_BASE_OFFSET: u32 = 5;
    pub const EDGE_INDEX_BASE_OFFSET: u32 = 6;
    /// `[solid, index width slot, edge width slot, family]`.
    pub const SOLID: u32 = 7;

    pub const COUNT: u32 = 8;
}

/// Texels per each-mesh-matrices record (two column-major 4x4 matrices).
pub const MATRIX_TEXELS: u32 = 8;

/// Encodes a pick id as an RGBA8 colour. Zero means "nothing".
pub fn pick_color(id: u32) -> [u8; 4] {
    id.to_le_bytes()
}

pub fn pick_id(color: [u8; 4]) -> u32 {
    u32::from_le_bytes(color)
}

/// One row of the each-mesh-attributes table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttributeRow {
    pub color: [u8; 4],
    pub pick_id: u32,
    pub flags: RenderFlags,
    pub vertex_base: u32,
    pub index_base_offset: u32,
    pub edge_index_base_offset: u32,
    pub solid: bool,
    pub family: PrimitiveFamily,
    pub index_width: IndexWidth,
    pub edge_width: Option<IndexWidth>,
}

impl AttributeRow {
    pub fn pack(&self) -> [u8; 32] {
        let family = match self.family {
            PrimitiveFamily::Points => 0,
            PrimitiveFamily::Lines => 1,
            PrimitiveFamily::Triangles => 2,
        };
        let edge_slot = self.edge_width.map_or(255, |w| w.slot() as u8);

        let texels: [[u8; 4]; 8] = [
            self.color,
            pick_color(self.pick_id),
            pack_flags(self.flags),
            pack_flags2(self.flags),
            self.vertex_base.to_le_bytes(),
            self.index_base_offset.to_le_bytes(),
            self.edge_index_base_offset.to_le_bytes(),
            [
                if self.solid { 255 } else { 0 },
                self.index_width.slot() as u8,
                edge_slot,
                family,
            ],
        ];
        bytemuck::cast(texels)
    }
}

/// Packs `decompress` then `modeling`, column-major.
pub fn pack_matrices(decompress: &Mat4, modeling: &Mat4) -> [f32; 32] {
    let mut out = [0.0; 32];
    out[..16].copy_from_slice(&decompress.to_cols_array());
    out[16..].copy_from_slice(&modeling.to_cols_array());
    out
}

/// Pads a 3x3 matrix to three xyz0 texels.
pub fn pack_mat3(m: &Mat3) -> [f32; 12] {
    let c = m.to_cols_array();
    [
        c[0], c[1], c[2], 0.0, //
        c[3], c[4], c[5], 0.0, //
        c[6], c[7], c[8], 0.0,
    ]
}

fn per_width(make: impl Fn(IndexWidth) -> DataTexture) -> [DataTexture; 3] {
    IndexWidth::ALL.map(make)
}

fn index_scalar(width: IndexWidth) -> Scalar {
    match width {
        IndexWidth::U8 => Scalar::U8,
        IndexWidth::U16 => Scalar::U16,
        IndexWidth::U32 => Scalar::U32,
    }
}

/// All tables of one layer.
#[derive(Debug)]
pub struct DataTextureSet {
    precision: MatrixPrecision,
    pub attributes: DataTexture,
    pub matrices: DataTexture,
    pub offsets: DataTexture,
    /// Created when the first textured geometry gets a row.
    pub uv_matrices: Option<DataTexture>,
    pub positions: DataTexture,
    pub uvs: Option<DataTexture>,
    pub colors: Option<DataTexture>,
    pub indices: [DataTexture; 3],
    pub edge_indices: [DataTexture; 3],
    pub primitive_lookup: [DataTexture; 3],
    pub edge_lookup: [DataTexture; 3],
}

impl DataTextureSet {
    pub fn new(family: PrimitiveFamily, precision: MatrixPrecision) -> Self {
        let matrix_scalar = match precision {
            MatrixPrecision::Half => Scalar::F16,
            MatrixPrecision::Full => Scalar::F32,
        };
        // wgpu has no 3-component formats: triangles use 4 channels.
        let index_channels = match family {
            PrimitiveFamily::Points => 1,
            PrimitiveFamily::Lines => 2,
            PrimitiveFamily::Triangles => 4,
        };
        let lookup = TexelFormat::new(Scalar::U32, 1);

        Self {
            precision,
            attributes: DataTexture::new(TableKind::Attributes, TexelFormat::new(Scalar::U8, 4), column::COUNT),
            matrices: DataTexture::new(TableKind::Matrices, TexelFormat::new(matrix_scalar, 4), MATRIX_TEXELS),
            offsets: DataTexture::new(TableKind::Offsets, TexelFormat::new(Scalar::F32, 4), 1),
            uv_matrices: None,
            positions: DataTexture::new(TableKind::Positions, TexelFormat::new(Scalar::U16, 4), 1),
            uvs: None,
            colors: None,
            indices: per_width(|w| {
                DataTexture::new(TableKind::Indices(w), TexelFormat::new(index_scalar(w), index_channels), 1)
            }),
            edge_indices: per_width(|w| {
                DataTexture::new(TableKind::EdgeIndices(w), TexelFormat::new(index_scalar(w), 2), 1)
            }),
            primitive_lookup: per_width(|w| DataTexture::new(TableKind::PrimitiveLookup(w), lookup, 1)),
            edge_lookup: per_width(|w| DataTexture::new(TableKind::EdgeLookup(w), lookup, 1)),
        }
    }

    pub fn precision(&self) -> MatrixPrecision {
        self.precision
    }

    /// Every allocated table, non-empty or not.
    pub fn tables(&self) -> impl Iterator<Item = &DataTexture> + '_ {
        [&self.attributes, &self.matrices, &self.offsets, &self.positions]
            .into_iter()
            .chain(self.uv_matrices.iter())
            .chain(self.uvs.iter())
            .chain(self.colors.iter())
            .chain(self.indices.iter())
            .chain(self.edge_indices.iter())
            .chain(self.primitive_lookup.iter())
            .chain(self.edge_lookup.iter())
    }

    pub fn tables_mut(&mut self) -> impl Iterator<Item = &mut DataTexture> + '_ {
        [&mut self.attributes, &mut self.matrices, &mut self.offsets, &mut self.positions]
            .into_iter()
            .chain(self.uv_matrices.iter_mut())
            .chain(self.uvs.iter_mut())
            .chain(self.colors.iter_mut())
            .chain(self.indices.iter_mut())
            .chain(self.edge_indices.iter_mut())
            .chain(self.primitive_lookup.iter_mut())
            .chain(self.edge_lookup.iter_mut())
    }

    pub fn table(&self, kind: TableKind) -> Option<&DataTexture> {
        self.tables().find(|t| t.kind() == kind)
    }

    /// Sum of CPU-side table sizes.
    pub fn byte_size(&self) -> usize {
        self.tables().map(|t| t.bytes().len()).sum()
    }

    /// Appends one matrices record at the configured precision.
    pub fn append_matrices(&mut self, decompress: &Mat4, modeling: &Mat4) -> Result<u32> {
        let packed = pack_matrices(decompress, modeling);
        match self.precision {
            MatrixPrecision::Half => self.matrices.append(&packed.map(f16::from_f32)),
            MatrixPrecision::Full => self.matrices.append(&packed),
        }
    }

    /// Rewrites the modeling half of a matrices record.
    pub fn write_modeling_matrix(&mut self, row: u32, modeling: &Mat4) -> Result<()> {
        let cols = modeling.to_cols_array();
        match self.precision {
            MatrixPrecision::Half => self.matrices.write(row, 4, &cols.map(f16::from_f32)),
            MatrixPrecision::Full => self.matrices.write(row, 4, &cols),
        }
    }

    /// Reads a matrices record back as f32, regardless of precision.
    pub fn read_matrices(&self, row: u32) -> [f32; 32] {
        let mut out = [0.0; 32];
        match self.precision {
            MatrixPrecision::Half => {
                for (o, h) in out.iter_mut().zip(self.matrices.read::<f16>(row, 0, MATRIX_TEXELS)) {
                    *o = h.to_f32();
                }
            }
            MatrixPrecision::Full => out.copy_from_slice(self.matrices.read::<f32>(row, 0, MATRIX_TEXELS)),
        }
        out
    }

    pub fn append_offset(&mut self, offset: Vec3) -> Result<u32> {
        self.offsets.append(&[offset.x, offset.y, offset.z, 0.0])
    }

    pub fn write_offset(&mut self, row: u32, offset: Vec3) -> Result<()> {
        self.offsets.write(row, 0, &[offset.x, offset.y, offset.z, 0.0])
    }

    /// Appends a uv-matrix record, creating and back-filling the table on
    /// first use.
    pub fn append_uv_matrix(&mut self, row: u32, m: Option<&Mat3>) -> Result<()> {
        append_optional(
            &mut self.uv_matrices,
            || DataTexture::new(TableKind::UvMatrices, TexelFormat::new(Scalar::F32, 4), 3),
            row,
            m.map(pack_mat3).as_ref().map(|p| &p[..]),
            1,
        )
    }

    /// Appends per-vertex uvs (pairs), back-filling when the table is new.
    pub fn append_uvs(&mut self, vertices_before: u32, uvs: Option<&[u16]>, count: u32) -> Result<()> {
        append_optional(
            &mut self.uvs,
            || DataTexture::new(TableKind::Uvs, TexelFormat::new(Scalar::U16, 2), 1),
            vertices_before,
            uvs,
            count,
        )
    }

    /// Appends per-vertex RGBA8 colours, back-filling when the table is new.
    pub fn append_colors(&mut self, vertices_before: u32, colors: Option<&[u8]>, count: u32) -> Result<()> {
        append_optional(
            &mut self.colors,
            || DataTexture::new(TableKind::Colors, TexelFormat::new(Scalar::U8, 4), 1),
            vertices_before,
            colors,
            count,
        )
    }
}

/// Appends `count` records to an optional table. A table that does not exist
/// yet is created on the first real values and zero-filled for the `before`
/// records that precede them.
fn append_optional<T: bytemuck::Pod>(
    table: &mut Option<DataTexture>,
    make: impl FnOnce() -> DataTexture,
    before: u32,
    values: Option<&[T]>,
    count: u32,
) -> Result<()> {
    if let Some(t) = table.as_mut() {
        match values {
            Some(v) => t.append(v)?,
            None => t.append_zeroed(count)?,
        };
        return Ok(());
    }

    if let Some(v) = values {
        let mut t = make();
        t.append_zeroed(before)?;
        t.append(v)?;
        *table = Some(t);
    }
    Ok(())
}
