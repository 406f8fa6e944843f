//! DTXB: versioned container for compressed BIM/CAD geometry and per-mesh params.
//!
//! - Geometry is stored already quantized: u16 positions per bucket, a 4x4
//!   positions-decompress matrix and an f64 RTC origin shared by all buckets.
//! - Bucket indices are local to their bucket and stored at 8, 16 or 32 bits.
//! - Meshes reference geometries by id and carry a f64 modeling matrix,
//!   an RGBA8 colour, initial entity flags and a world-space offset.
//! - The body may be deflated (miniz_oxide).
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"DTXB"
//!   04  : u32     version = 2 (1 is read, meshes without offset)
//!   08  : u32     flags (bitfield)
//!                 bit 0 => body is deflated
//!   0C  : u32     body_len (uncompressed)
//!   10  : body (deflated if bit0)
//!
//! Body:
//!   str    model_id
//!   u32    geometries_count
//!   u32    meshes_count
//!   ..     geometries
//!   ..     meshes
//!
//! Geometry:
//!   str id, u8 primitive, f64[3] origin, f32[16] positions_decompress_matrix,
//!   u8 has_uv_matrix, [f32[9] uv_decompress_matrix], u32 buckets_count, buckets
//!
//! Bucket:
//!   u8 flags (bit0 uvs, bit1 colors, bit2 indices, bit3 edge indices)
//!   u32 vertices_count
//!   u16[3n] positions, [u16[2n] uvs], [u8[4n] colors], [indices], [edge indices]
//!
//! Index block: u8 width (1|2|4), u32 count, count * width bytes
//!
//! Mesh:
//!   str id, str geometry_id, str texture_set_id (empty => none),
//!   f64[16] matrix, u8[4] color, u32 flags, f32[3] offset (version >= 2)
//!
//! str: u16 byte length + UTF-8 bytes

use std::fs::File;
use std::io::{self, ErrorKind, Write};
use std::path::Path;

pub const DTXB_MAGIC: [u8; 4] = *b"DTXB";
pub const DTXB_VERSION: u32 = 2;

const FLAG_DEFLATED: u32 = 1 << 0;

const BUCKET_UVS: u8 = 1 << 0;
const BUCKET_COLORS: u8 = 1 << 1;
const BUCKET_INDICES: u8 = 1 << 2;
const BUCKET_EDGES: u8 = 1 << 3;

/// Index payload of a bucket, at the width chosen when it was compressed.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexData {
    pub fn len(&self) -> usize {
        match self {
            IndexData::U8(v) => v.len(),
            IndexData::U16(v) => v.len(),
            IndexData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of one index in bytes.
    pub fn width(&self) -> u8 {
        match self {
            IndexData::U8(_) => 1,
            IndexData::U16(_) => 2,
            IndexData::U32(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DtxbBucket {
    pub positions: Vec<u16>,
    pub uvs: Option<Vec<u16>>,
    pub colors: Option<Vec<u8>>,
    pub indices: Option<IndexData>,
    pub edge_indices: Option<IndexData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DtxbGeometry {
    pub id: String,
    /// 0 points, 1 lines, 2 triangles, 3 solid, 4 surface.
    pub primitive: u8,
    pub origin: [f64; 3],
    /// Column-major.
    pub positions_decompress_matrix: [f32; 16],
    /// Column-major.
    pub uv_decompress_matrix: Option<[f32; 9]>,
    pub buckets: Vec<DtxbBucket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DtxbMesh {
    pub id: String,
    pub geometry_id: String,
    pub texture_set_id: Option<String>,
    /// Column-major world matrix.
    pub matrix: [f64; 16],
    pub color: [u8; 4],
    pub flags: u32,
    /// Translation added after the modeling matrix.
    pub offset: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DtxbModel {
    pub id: String,
    pub geometries: Vec<DtxbGeometry>,
    pub meshes: Vec<DtxbMesh>,
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated DTXB"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u8(buf: &mut &[u8]) -> io::Result<u8> {
    Ok(take(buf, 1)?[0])
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> io::Result<u16> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> io::Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
fn le_f32(buf: &mut &[u8]) -> io::Result<f32> {
    Ok(f32::from_bits(le_u32(buf)?))
}

#[inline(always)]
fn le_f64(buf: &mut &[u8]) -> io::Result<f64> {
    let b = take(buf, 8)?;
    Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

fn read_str(p: &mut &[u8]) -> io::Result<String> {
    let len = le_u16(p)? as usize;
    let raw = take(p, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| bad("string is not UTF-8"))
}

/// Element count times element size, guarded against overflow before any allocation.
fn sized(count: usize, elem: usize) -> io::Result<usize> {
    count.checked_mul(elem).ok_or_else(|| bad("array size overflow"))
}

fn read_u16s(p: &mut &[u8], count: usize) -> io::Result<Vec<u16>> {
    let raw = take(p, sized(count, 2)?)?;
    Ok(raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn read_u32s(p: &mut &[u8], count: usize) -> io::Result<Vec<u32>> {
    let raw = take(p, sized(count, 4)?)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_index_data(p: &mut &[u8]) -> io::Result<IndexData> {
    let width = le_u8(p)?;
    let count = le_u32(p)? as usize;

    match width {
        1 => Ok(IndexData::U8(take(p, count)?.to_vec())),
        2 => Ok(IndexData::U16(read_u16s(p, count)?)),
        4 => Ok(IndexData::U32(read_u32s(p, count)?)),
        x => Err(bad(&format!("unknown index width {}", x))),
    }
}

fn read_bucket(p: &mut &[u8]) -> io::Result<DtxbBucket> {
    let flags = le_u8(p)?;
    let vertices = le_u32(p)? as usize;

    let positions = read_u16s(p, sized(vertices, 3)?)?;

    let uvs = if flags & BUCKET_UVS != 0 {
        Some(read_u16s(p, sized(vertices, 2)?)?)
    } else {
        None
    };

    let colors = if flags & BUCKET_COLORS != 0 {
        Some(take(p, sized(vertices, 4)?)?.to_vec())
    } else {
        None
    };

    let indices = if flags & BUCKET_INDICES != 0 {
        Some(read_index_data(p)?)
    } else {
        None
    };

    let edge_indices = if flags & BUCKET_EDGES != 0 {
        Some(read_index_data(p)?)
    } else {
        None
    };

    Ok(DtxbBucket {
        positions,
        uvs,
        colors,
        indices,
        edge_indices,
    })
}

fn read_geometry(p: &mut &[u8]) -> io::Result<DtxbGeometry> {
    let id = read_str(p)?;
    let primitive = le_u8(p)?;
    if primitive > 4 {
        return Err(bad(&format!("unknown primitive {}", primitive)));
    }

    let origin = [le_f64(p)?, le_f64(p)?, le_f64(p)?];

    let mut positions_decompress_matrix = [0f32; 16];
    for v in positions_decompress_matrix.iter_mut() {
        *v = le_f32(p)?;
    }

    let uv_decompress_matrix = if le_u8(p)? != 0 {
        let mut m = [0f32; 9];
        for v in m.iter_mut() {
            *v = le_f32(p)?;
        }
        Some(m)
    } else {
        None
    };

    let count = le_u32(p)? as usize;
    // Each bucket needs at least 5 bytes; reject absurd counts before reserving.
    need(p, sized(count, 5)?)?;
    let mut buckets = Vec::with_capacity(count);
    for _ in 0..count {
        buckets.push(read_bucket(p)?);
    }

    Ok(DtxbGeometry {
        id,
        primitive,
        origin,
        positions_decompress_matrix,
        uv_decompress_matrix,
        buckets,
    })
}

fn read_mesh(p: &mut &[u8], version: u32) -> io::Result<DtxbMesh> {
    let id = read_str(p)?;
    let geometry_id = read_str(p)?;
    let texture_set = read_str(p)?;

    let mut matrix = [0f64; 16];
    for v in matrix.iter_mut() {
        *v = le_f64(p)?;
    }

    let c = take(p, 4)?;
    let color = [c[0], c[1], c[2], c[3]];
    let flags = le_u32(p)?;

    let mut offset = [0f32; 3];
    if version >= 2 {
        for v in offset.iter_mut() {
            *v = le_f32(p)?;
        }
    }

    Ok(DtxbMesh {
        id,
        geometry_id,
        texture_set_id: (!texture_set.is_empty()).then_some(texture_set),
        matrix,
        color,
        flags,
        offset,
    })
}

/// Parse DTXB from a contiguous byte slice. This is the single source of truth for parsing.
pub fn parse_dtxb_bytes(mut p: &[u8]) -> io::Result<DtxbModel> {
    // Header
    if take(&mut p, 4)? != DTXB_MAGIC {
        return Err(bad("bad DTXB magic"));
    }

    let version = le_u32(&mut p)?;
    if version == 0 || version > DTXB_VERSION {
        return Err(bad("unsupported DTXB version"));
    }

    let flags = le_u32(&mut p)?;
    let body_len = le_u32(&mut p)? as usize;

    let inflated;
    let mut body: &[u8] = if flags & FLAG_DEFLATED != 0 {
        inflated = miniz_oxide::inflate::decompress_to_vec(p)
            .map_err(|e| bad(&format!("inflate failed: {:?}", e.status)))?;
        &inflated
    } else {
        p
    };

    if body.len() != body_len {
        return Err(bad("DTXB body length mismatch"));
    }

    let id = read_str(&mut body)?;
    let geometries_count = le_u32(&mut body)? as usize;
    let meshes_count = le_u32(&mut body)? as usize;

    let mut geometries = Vec::with_capacity(geometries_count.min(body.len()));
    for _ in 0..geometries_count {
        geometries.push(read_geometry(&mut body)?);
    }

    let mut meshes = Vec::with_capacity(meshes_count.min(body.len()));
    for _ in 0..meshes_count {
        meshes.push(read_mesh(&mut body, version)?);
    }

    if !body.is_empty() {
        return Err(bad("trailing bytes after DTXB body"));
    }

    Ok(DtxbModel {
        id,
        geometries,
        meshes,
    })
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<DtxbModel> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_dtxb_bytes(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<DtxbModel> {
    let bytes = std::fs::read(path)?;
    parse_dtxb_bytes(&bytes)
}

pub fn write_file<P: AsRef<Path>>(path: P, model: &DtxbModel, deflate: bool) -> io::Result<()> {
    let mut file = File::create(path)?;
    write_dtxb(&mut file, model, deflate)?;
    file.flush()
}

/// Serialize `model` into any writer.
pub fn write_dtxb<W: Write>(w: &mut W, model: &DtxbModel, deflate: bool) -> io::Result<()> {
    let mut body = Vec::<u8>::new();

    write_str(&mut body, &model.id)?;
    write_u32(&mut body, model.geometries.len() as u32)?;
    write_u32(&mut body, model.meshes.len() as u32)?;

    for geometry in &model.geometries {
        write_geometry(&mut body, geometry)?;
    }

    for mesh in &model.meshes {
        write_mesh(&mut body, mesh)?;
    }

    let body_len = u32::try_from(body.len()).map_err(|_| bad("DTXB body exceeds 4 GiB"))?;

    w.write_all(&DTXB_MAGIC)?;
    write_u32(w, DTXB_VERSION)?;
    write_u32(w, if deflate { FLAG_DEFLATED } else { 0 })?;
    write_u32(w, body_len)?;

    if deflate {
        w.write_all(&miniz_oxide::deflate::compress_to_vec(&body, 6))?;
    } else {
        w.write_all(&body)?;
    }

    Ok(())
}

fn write_geometry<W: Write>(w: &mut W, g: &DtxbGeometry) -> io::Result<()> {
    write_str(w, &g.id)?;
    w.write_all(&[g.primitive])?;

    for v in g.origin {
        w.write_all(&v.to_le_bytes())?;
    }

    for v in g.positions_decompress_matrix {
        w.write_all(&v.to_le_bytes())?;
    }

    match g.uv_decompress_matrix {
        Some(m) => {
            w.write_all(&[1])?;
            for v in m {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        None => w.write_all(&[0])?,
    }

    write_u32(w, g.buckets.len() as u32)?;
    for bucket in &g.buckets {
        write_bucket(w, bucket)?;
    }

    Ok(())
}

fn write_bucket<W: Write>(w: &mut W, b: &DtxbBucket) -> io::Result<()> {
    if b.positions.len() % 3 != 0 {
        return Err(bad("positions length is not a multiple of 3"));
    }
    let vertices = b.positions.len() / 3;

    let mut flags = 0u8;

    if let Some(uvs) = b.uvs.as_ref() {
        if uvs.len() != vertices * 2 {
            return Err(bad("uvs length != 2 * vertices"));
        }
        flags |= BUCKET_UVS;
    }

    if let Some(colors) = b.colors.as_ref() {
        if colors.len() != vertices * 4 {
            return Err(bad("colors length != 4 * vertices"));
        }
        flags |= BUCKET_COLORS;
    }

    if b.indices.is_some() {
        flags |= BUCKET_INDICES;
    }

    if b.edge_indices.is_some() {
        flags |= BUCKET_EDGES;
    }

    w.write_all(&[flags])?;
    write_u32(w, vertices as u32)?;
    write_u16s(w, &b.positions)?;

    if let Some(uvs) = b.uvs.as_ref() {
        write_u16s(w, uvs)?;
    }

    if let Some(colors) = b.colors.as_ref() {
        w.write_all(colors)?;
    }

    if let Some(indices) = b.indices.as_ref() {
        write_index_data(w, indices)?;
    }

    if let Some(edges) = b.edge_indices.as_ref() {
        write_index_data(w, edges)?;
    }

    Ok(())
}

fn write_mesh<W: Write>(w: &mut W, m: &DtxbMesh) -> io::Result<()> {
    write_str(w, &m.id)?;
    write_str(w, &m.geometry_id)?;
    write_str(w, m.texture_set_id.as_deref().unwrap_or(""))?;

    for v in m.matrix {
        w.write_all(&v.to_le_bytes())?;
    }

    w.write_all(&m.color)?;
    write_u32(w, m.flags)?;

    for v in m.offset {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_index_data<W: Write>(w: &mut W, data: &IndexData) -> io::Result<()> {
    w.write_all(&[data.width()])?;
    write_u32(w, data.len() as u32)?;

    match data {
        IndexData::U8(v) => w.write_all(v),
        IndexData::U16(v) => write_u16s(w, v),
        IndexData::U32(v) => {
            #[cfg(target_endian = "little")]
            {
                w.write_all(bytemuck::cast_slice(v))
            }

            #[cfg(not(target_endian = "little"))]
            {
                for x in v {
                    write_u32(w, *x)?;
                }
                Ok(())
            }
        }
    }
}

#[inline]
fn write_u16s<W: Write>(w: &mut W, v: &[u16]) -> io::Result<()> {
    #[cfg(target_endian = "little")]
    {
        // u16 -> u8 casts never fail on alignment.
        w.write_all(bytemuck::cast_slice(v))
    }

    #[cfg(not(target_endian = "little"))]
    {
        for x in v {
            w.write_all(&x.to_le_bytes())?;
        }
        Ok(())
    }
}

#[inline]
fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| bad("string longer than 65535 bytes"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(s.as_bytes())
}

#[inline]
fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}
