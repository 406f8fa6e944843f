//! Upload seam between layers and whatever owns the GPU textures.

use crate::error::{DtxError, Result};
use crate::geometry::IndexWidth;
use std::fmt;

/// Which logical table a texture holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Colour, pick colour, flags, flags2, vertex base, index offsets, solid flag.
    Attributes,
    /// Positions decompress matrix + modeling matrix.
    Matrices,
    Offsets,
    UvMatrices,
    Positions,
    Uvs,
    Colors,
    Indices(IndexWidth),
    EdgeIndices(IndexWidth),
    /// Primitive stream -> attribute row, one entry per aligned group.
    PrimitiveLookup(IndexWidth),
    EdgeLookup(IndexWidth),
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Attributes => f.write_str("each-mesh-attributes"),
            TableKind::Matrices => f.write_str("each-mesh-matrices"),
            TableKind::Offsets => f.write_str("each-mesh-offsets"),
            TableKind::UvMatrices => f.write_str("each-mesh-uv-matrices"),
            TableKind::Positions => f.write_str("positions"),
            TableKind::Uvs => f.write_str("uvs"),
            TableKind::Colors => f.write_str("colors"),
            TableKind::Indices(w) => write!(f, "indices-{}", w.bits()),
            TableKind::EdgeIndices(w) => write!(f, "edge-indices-{}", w.bits()),
            TableKind::PrimitiveLookup(w) => write!(f, "primitive-to-mesh-{}", w.bits()),
            TableKind::EdgeLookup(w) => write!(f, "edge-to-mesh-{}", w.bits()),
        }
    }
}

/// Component type of a texel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    U8,
    U16,
    U32,
    F16,
    F32,
}

impl Scalar {
    pub fn size(self) -> u32 {
        match self {
            Scalar::U8 => 1,
            Scalar::U16 | Scalar::F16 => 2,
            Scalar::U32 | Scalar::F32 => 4,
        }
    }
}

/// Texel layout of a table: 1, 2 or 4 components of one scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TexelFormat {
    pub scalar: Scalar,
    pub channels: u32,
}

impl TexelFormat {
    pub const fn new(scalar: Scalar, channels: u32) -> Self {
        Self { scalar, channels }
    }

    pub fn bytes_per_texel(self) -> u32 {
        self.scalar.size() * self.channels
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub kind: TableKind,
    pub label: String,
    pub format: TexelFormat,
    pub width: u32,
    pub height: u32,
}

/// Sub-rectangle of a table in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Opaque id of an uploaded table, issued by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

/// Receives table uploads.
///
/// `upload` is called once per table when a layer is built, `update` for
/// every flushed dirty region afterwards, and `release` when the layer is
/// destroyed. `data` for `update` covers exactly `region`, row-major,
/// tightly packed.
pub trait TextureSink {
    fn upload(&mut self, desc: &TextureDesc, data: &[u8]) -> Result<TextureHandle>;
    fn update(&mut self, handle: TextureHandle, region: TexelRegion, data: &[u8]) -> Result<()>;
    fn release(&mut self, handle: TextureHandle);
}

/// Keeps a CPU copy of every upload and counts writes; used by tests and
/// headless tooling.
#[derive(Debug, Default)]
pub struct MemorySink {
    next: u64,
    pub textures: hashbrown::HashMap<TextureHandle, (TextureDesc, Vec<u8>)>,
    pub uploads: usize,
    pub updates: Vec<(TextureHandle, TexelRegion)>,
    pub released: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texture(&self, kind: TableKind) -> impl Iterator<Item = (&TextureDesc, &[u8])> + '_ {
        self.textures
            .values()
            .filter(move |(desc, _)| desc.kind == kind)
            .map(|(desc, data)| (desc, data.as_slice()))
    }
}

impl TextureSink for MemorySink {
    fn upload(&mut self, desc: &TextureDesc, data: &[u8]) -> Result<TextureHandle> {
        self.next += 1;
        let handle = TextureHandle(self.next);
        self.textures.insert(handle, (desc.clone(), data.to_vec()));
        self.uploads += 1;
        Ok(handle)
    }

    fn update(&mut self, handle: TextureHandle, region: TexelRegion, data: &[u8]) -> Result<()> {
        let (desc, bytes) = self
            .textures
            .get_mut(&handle)
            .ok_or_else(|| DtxError::backend(format!("update of unknown texture {handle:?}")))?;

        let texel = desc.format.bytes_per_texel() as usize;
        let row_bytes = desc.width as usize * texel;
        let span = region.width as usize * texel;
        if data.len() != span * region.height as usize {
            return Err(DtxError::backend("region data size mismatch"));
        }

        for (i, src) in data.chunks_exact(span).enumerate() {
            let start = (region.y as usize + i) * row_bytes + region.x as usize * texel;
            let dst = bytes
                .get_mut(start..start + span)
                .ok_or_else(|| DtxError::backend("region outside texture"))?;
            dst.copy_from_slice(src);
        }

        self.updates.push((handle, region));
        Ok(())
    }

    fn release(&mut self, handle: TextureHandle) {
        if self.textures.remove(&handle).is_some() {
            self.released += 1;
        }
    }
}
