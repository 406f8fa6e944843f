//! Capacity-bounded partition of meshes sharing a `LayerKey`.
//!
//! A layer owns one `DataTextureSet`. While building, meshes append rows and
//! (for geometries not yet in the layer) vertex and index data. `build`
//! uploads every table once; afterwards only row contents change (flags,
//! colour, matrices, offsets), each change marking a dirty region that
//! `sync` or `commit_deferred_flags` pushes to the sink.

use crate::capacity::{aligned, LayerKey, LayerLimits, LayerUsage};
use crate::config::{DtxConfig, PRIMITIVE_ALIGNMENT};
use crate::error::{DtxError, Result};
use crate::flags::{pack_flags, pack_flags2, MeshCounts, RenderFlags};
use crate::geometry::{GeometryCompressedParams, IndexWidth, PrimitiveKind};
use crate::sink::{TableKind, TextureHandle, TextureSink};
use crate::tables::{column, AttributeRow, DataTexture, DataTextureSet};
use glam::{DMat4, DVec3, Mat4, Vec3};
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u32);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Building,
    Built,
    Destroyed,
}

/// Where one geometry bucket's data sits in the shared tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlacedBucket {
    vertex_base: u32,
    index_base: u32,
    edge_base: u32,
}

/// One row of the each-mesh tables: a (mesh, bucket) pair and its ranges of
/// the primitive and edge draw streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowEntry {
    pub mesh: u32,
    pub bucket: u32,
    pub index_width: IndexWidth,
    pub vertex_base: u32,
    pub stream_start: u32,
    pub stream_len: u32,
    pub index_base_offset: u32,
    pub edge_width: Option<IndexWidth>,
    pub edge_stream_start: u32,
    pub edge_stream_len: u32,
    pub edge_index_base_offset: u32,
}

/// One placed mesh.
#[derive(Debug, Clone)]
pub struct MeshEntry {
    pub id: String,
    pub geometry: Arc<GeometryCompressedParams>,
    pub texture_set: Option<String>,
    /// World transform of the geometry's local frame.
    pub matrix: DMat4,
    pub color: [u8; 4],
    pub offset: Vec3,
    pub flags: RenderFlags,
    pub pick_id: u32,
    pub first_row: u32,
    pub num_rows: u32,
}

impl MeshEntry {
    pub fn rows(&self) -> std::ops::Range<u32> {
        self.first_row..self.first_row + self.num_rows
    }
}

/// Everything a layer needs to place one mesh.
#[derive(Debug, Clone)]
pub struct MeshPlacement {
    pub id: String,
    pub geometry: Arc<GeometryCompressedParams>,
    pub texture_set: Option<String>,
    pub matrix: DMat4,
    pub color: [u8; 4],
    pub flags: RenderFlags,
    pub pick_id: u32,
}

/// Modeling matrix relative to the layer origin, so that f32 precision is
/// spent on the local extent only.
fn modeling_matrix(matrix: &DMat4, geometry_origin: DVec3, layer_origin: DVec3) -> Mat4 {
    (DMat4::from_translation(-layer_origin) * *matrix * DMat4::from_translation(geometry_origin))
        .as_mat4()
}

/// Appends `indices` (groups of `arity`) as `records` texels of `channels`
/// components each; unused channels and padding primitives are zero.
fn append_index_records(
    table: &mut DataTexture,
    width: IndexWidth,
    indices: &[u32],
    arity: usize,
    records: usize,
) -> Result<u32> {
    let channels = table.format().channels as usize;
    let mut flat = vec![0u32; records * channels];
    for (p, prim) in indices.chunks_exact(arity).enumerate() {
        flat[p * channels..p * channels + arity].copy_from_slice(prim);
    }

    match width {
        IndexWidth::U8 => table.append(&flat.iter().map(|&v| v as u8).collect::<Vec<u8>>()),
        IndexWidth::U16 => table.append(&flat.iter().map(|&v| v as u16).collect::<Vec<u16>>()),
        IndexWidth::U32 => table.append(&flat),
    }
}

/// Appends `len / PRIMITIVE_ALIGNMENT` lookup entries pointing at `row`;
/// returns the first stream primitive of the range.
fn append_stream(lookup: &mut DataTexture, row: u32, len: u64) -> Result<u32> {
    let entries = (len / PRIMITIVE_ALIGNMENT as u64) as usize;
    let first = lookup.append(&vec![row; entries])?;
    Ok(first * PRIMITIVE_ALIGNMENT)
}

#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    key: LayerKey,
    origin: DVec3,
    limits: LayerLimits,
    state: LayerState,
    tables: DataTextureSet,
    usage: LayerUsage,
    placed: HashMap<String, Vec<PlacedBucket>>,
    rows: Vec<RowEntry>,
    meshes: Vec<MeshEntry>,
    counts: MeshCounts,
    textures: Vec<(TableKind, TextureHandle)>,
    deferred: bool,
}

impl Layer {
    pub fn new(id: LayerId, key: LayerKey, config: &DtxConfig) -> Self {
        log::debug!("{id}: open for {:?} tile {:?}", key.family, key.tile);
        Self {
            id,
            origin: key.origin(config.rtc_cell_size),
            tables: DataTextureSet::new(key.family, config.matrix_precision),
            key,
            limits: LayerLimits::from(&config.capacity),
            state: LayerState::Building,
            usage: LayerUsage::default(),
            placed: HashMap::new(),
            rows: Vec::new(),
            meshes: Vec::new(),
            counts: MeshCounts::default(),
            textures: Vec::new(),
            deferred: false,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn key(&self) -> &LayerKey {
        &self.key
    }

    /// World-space RTC origin; table positions and matrices are relative to it.
    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn counts(&self) -> &MeshCounts {
        &self.counts
    }

    pub fn usage(&self) -> &LayerUsage {
        &self.usage
    }

    pub fn limits(&self) -> &LayerLimits {
        &self.limits
    }

    pub fn tables(&self) -> &DataTextureSet {
        &self.tables
    }

    pub fn textures(&self) -> &[(TableKind, TextureHandle)] {
        &self.textures
    }

    pub fn rows(&self) -> &[RowEntry] {
        &self.rows
    }

    pub fn meshes(&self) -> &[MeshEntry] {
        &self.meshes
    }

    pub fn mesh(&self, index: u32) -> Option<&MeshEntry> {
        self.meshes.get(index as usize)
    }

    pub fn num_meshes(&self) -> u32 {
        self.meshes.len() as u32
    }

    /// Any wireframe edges stored at all.
    pub fn has_edges(&self) -> bool {
        self.usage.edges.iter().any(|&e| e > 0)
    }

    /// Length of the primitive draw stream of `width`.
    pub fn stream_len(&self, width: IndexWidth) -> u32 {
        self.tables.primitive_lookup[width.slot()].len() * PRIMITIVE_ALIGNMENT
    }

    pub fn edge_stream_len(&self, width: IndexWidth) -> u32 {
        self.tables.edge_lookup[width.slot()].len() * PRIMITIVE_ALIGNMENT
    }

    /// Usage after adding one mesh of `geometry`.
    pub fn footprint(&self, geometry: &GeometryCompressedParams) -> LayerUsage {
        let placed = self.placed.contains_key(&geometry.id);
        self.usage.plus(&LayerUsage::of_mesh(geometry, placed))
    }

    /// True iff a mesh of `geometry` can still be appended.
    pub fn can_create_mesh(&self, geometry: &GeometryCompressedParams) -> bool {
        self.state == LayerState::Building
            && geometry.primitive.family() == self.key.family
            && self.footprint(geometry).fits(&self.limits)
    }

    /// Appends a mesh and returns its `meshIndex`. On a capacity failure the
    /// layer is left untouched.
    pub fn create_mesh(&mut self, mesh: MeshPlacement) -> Result<u32> {
        if self.state != LayerState::Building {
            return Err(DtxError::state(format!(
                "{}: cannot add mesh `{}` to a {:?} layer",
                self.id, mesh.id, self.state
            )));
        }

        let geometry = mesh.geometry.clone();
        if geometry.primitive.family() != self.key.family {
            return Err(DtxError::state(format!(
                "{}: mesh `{}` is {:?}, layer holds {:?}",
                self.id,
                mesh.id,
                geometry.primitive.family(),
                self.key.family
            )));
        }

        let next = self.footprint(&geometry);
        next.check(&self.limits)?;

        let placed = match self.placed.get(&geometry.id) {
            Some(p) => p.clone(),
            None => {
                let p = self.place_geometry(&geometry)?;
                self.placed.insert(geometry.id.clone(), p.clone());
                p
            }
        };

        let index = self.meshes.len() as u32;
        let first_row = self.tables.attributes.len();
        let modeling = modeling_matrix(&mesh.matrix, geometry.origin, self.origin);
        let arity = geometry.primitive.arity();

        for (b, (bucket, at)) in geometry.buckets.iter().zip(&placed).enumerate() {
            let row = first_row + b as u32;
            let width = bucket.index_width();

            let stream_len = aligned(bucket.num_primitives(arity));
            let stream_start = append_stream(&mut self.tables.primitive_lookup[width.slot()], row, stream_len)?;

            let edge_width = bucket.edge_width();
            let (edge_stream_start, edge_stream_len) = match edge_width {
                Some(ew) => {
                    let len = aligned(bucket.num_edges());
                    (append_stream(&mut self.tables.edge_lookup[ew.slot()], row, len)?, len)
                }
                None => (0, 0),
            };

            let entry = RowEntry {
                mesh: index,
                bucket: b as u32,
                index_width: width,
                vertex_base: at.vertex_base,
                stream_start,
                stream_len: stream_len as u32,
                index_base_offset: stream_start - at.index_base,
                edge_width,
                edge_stream_start,
                edge_stream_len: edge_stream_len as u32,
                edge_index_base_offset: if edge_width.is_some() {
                    edge_stream_start - at.edge_base
                } else {
                    0
                },
            };

            let attributes = AttributeRow {
                color: mesh.color,
                pick_id: mesh.pick_id,
                flags: mesh.flags,
                vertex_base: entry.vertex_base,
                index_base_offset: entry.index_base_offset,
                edge_index_base_offset: entry.edge_index_base_offset,
                solid: geometry.primitive == PrimitiveKind::Solid,
                family: self.key.family,
                index_width: width,
                edge_width,
            };

            self.tables.attributes.append(&attributes.pack())?;
            self.tables.append_matrices(&geometry.positions_decompress_matrix, &modeling)?;
            self.tables.append_offset(Vec3::ZERO)?;
            self.tables.append_uv_matrix(row, geometry.uv_decompress_matrix.as_ref())?;
            self.rows.push(entry);
        }

        self.counts.add(mesh.flags);
        self.meshes.push(MeshEntry {
            id: mesh.id,
            geometry: geometry.clone(),
            texture_set: mesh.texture_set,
            matrix: mesh.matrix,
            color: mesh.color,
            offset: Vec3::ZERO,
            flags: mesh.flags,
            pick_id: mesh.pick_id,
            first_row,
            num_rows: geometry.buckets.len() as u32,
        });
        self.usage = next;

        Ok(index)
    }

    /// Appends the vertex and index data of every bucket of `geometry`.
    fn place_geometry(&mut self, geometry: &GeometryCompressedParams) -> Result<Vec<PlacedBucket>> {
        let arity = geometry.primitive.arity();
        let mut out = Vec::with_capacity(geometry.buckets.len());

        for bucket in &geometry.buckets {
            let n = bucket.num_vertices() as u32;
            let vertex_base = self.tables.positions.len();

            let positions: Vec<u16> = bucket
                .positions_compressed
                .chunks_exact(3)
                .flat_map(|p| [p[0], p[1], p[2], 0])
                .collect();
            self.tables.positions.append(&positions)?;
            self.tables.append_uvs(vertex_base, bucket.uvs_compressed.as_deref(), n)?;
            self.tables.append_colors(vertex_base, bucket.colors_compressed.as_deref(), n)?;

            let width = bucket.index_width();
            let prims = bucket.primitive_indices();
            let records = aligned(prims.len() / arity) as usize;
            let index_base =
                append_index_records(&mut self.tables.indices[width.slot()], width, &prims, arity, records)?;

            let edge_base = match bucket.edge_indices.as_ref() {
                Some(edges) => {
                    let ew = edges.width();
                    let flat: Vec<u32> = edges.iter().collect();
                    let records = aligned(flat.len() / 2) as usize;
                    append_index_records(&mut self.tables.edge_indices[ew.slot()], ew, &flat, 2, records)?
                }
                None => 0,
            };

            out.push(PlacedBucket {
                vertex_base,
                index_base,
                edge_base,
            });
        }

        log::trace!(
            "{}: placed geometry `{}` ({} bucket(s))",
            self.id,
            geometry.id,
            geometry.buckets.len()
        );
        Ok(out)
    }

    fn check_mutable(&self) -> Result<()> {
        if self.state == LayerState::Destroyed {
            return Err(DtxError::state(format!("{} is destroyed", self.id)));
        }
        Ok(())
    }

    fn entry(&self, mesh: u32) -> Result<&MeshEntry> {
        self.check_mutable()?;
        self.meshes
            .get(mesh as usize)
            .ok_or_else(|| DtxError::state(format!("{}: no mesh index {mesh}", self.id)))
    }

    /// Rewrites `flags` of `mesh`; the counters follow in O(1).
    fn update_flags(&mut self, mesh: u32, new: RenderFlags) -> Result<()> {
        let entry = self.entry(mesh)?;
        let (old, rows) = (entry.flags, entry.rows());
        if old == new {
            return Ok(());
        }

        let mut texels = [0u8; 8];
        texels[..4].copy_from_slice(&pack_flags(new));
        texels[4..].copy_from_slice(&pack_flags2(new));
        for row in rows {
            self.tables.attributes.write(row, column::FLAGS, &texels)?;
        }

        self.meshes[mesh as usize].flags = new;
        self.counts.apply(old, new);
        Ok(())
    }

    fn set_flag(&mut self, mesh: u32, flag: RenderFlags, on: bool, transparent: bool) -> Result<()> {
        let mut flags = self.entry(mesh)?.flags;
        flags.set(flag, on);
        flags.set(RenderFlags::TRANSPARENT, transparent);
        self.update_flags(mesh, flags)
    }

    pub fn set_mesh_visible(&mut self, mesh: u32, visible: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::VISIBLE, visible, transparent)
    }

    pub fn set_mesh_highlighted(&mut self, mesh: u32, highlighted: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::HIGHLIGHTED, highlighted, transparent)
    }

    pub fn set_mesh_xrayed(&mut self, mesh: u32, xrayed: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::XRAYED, xrayed, transparent)
    }

    pub fn set_mesh_selected(&mut self, mesh: u32, selected: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::SELECTED, selected, transparent)
    }

    pub fn set_mesh_culled(&mut self, mesh: u32, culled: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::CULLED, culled, transparent)
    }

    pub fn set_mesh_clippable(&mut self, mesh: u32, clippable: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::CLIPPABLE, clippable, transparent)
    }

    pub fn set_mesh_pickable(&mut self, mesh: u32, pickable: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::PICKABLE, pickable, transparent)
    }

    pub fn set_mesh_collidable(&mut self, mesh: u32, collidable: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::COLLIDABLE, collidable, transparent)
    }

    pub fn set_mesh_edges(&mut self, mesh: u32, edges: bool, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::EDGES, edges, transparent)
    }

    pub fn set_mesh_transparent(&mut self, mesh: u32, transparent: bool) -> Result<()> {
        self.set_flag(mesh, RenderFlags::TRANSPARENT, transparent, transparent)
    }

    /// Sets RGBA colour; `transparent` decides which pass the mesh draws in.
    pub fn set_mesh_color(&mut self, mesh: u32, color: [u8; 4], transparent: bool) -> Result<()> {
        let rows = self.entry(mesh)?.rows();
        for row in rows {
            self.tables.attributes.write(row, column::COLOR, &color)?;
        }
        self.meshes[mesh as usize].color = color;
        self.set_mesh_transparent(mesh, transparent)
    }

    /// Sets a translation applied after the modeling matrix.
    pub fn set_mesh_offset(&mut self, mesh: u32, offset: Vec3) -> Result<()> {
        let rows = self.entry(mesh)?.rows();
        for row in rows {
            self.tables.write_offset(row, offset)?;
        }
        self.meshes[mesh as usize].offset = offset;
        Ok(())
    }

    /// Replaces the world transform of `mesh`.
    pub fn set_mesh_matrix(&mut self, mesh: u32, matrix: DMat4) -> Result<()> {
        let entry = self.entry(mesh)?;
        let rows = entry.rows();
        let modeling = modeling_matrix(&matrix, entry.geometry.origin, self.origin);

        for row in rows {
            self.tables.write_modeling_matrix(row, &modeling)?;
        }
        self.meshes[mesh as usize].matrix = matrix;
        Ok(())
    }

    /// Uploads every non-empty table. Structural growth ends here.
    pub fn build(&mut self, sink: &mut dyn TextureSink) -> Result<()> {
        if self.state != LayerState::Building {
            return Err(DtxError::state(format!("{} is already {:?}", self.id, self.state)));
        }

        let label = self.id.to_string();
        let mut uploaded = Vec::new();

        for table in self.tables.tables().filter(|t| !t.is_empty()) {
            match sink.upload(&table.desc(&label), table.bytes()) {
                Ok(handle) => uploaded.push((table.kind(), handle)),
                Err(e) => {
                    for (_, handle) in uploaded {
                        sink.release(handle);
                    }
                    return Err(e);
                }
            }
        }

        let deferred = self.deferred;
        for table in self.tables.tables_mut() {
            table.start_tracking();
            table.set_deferred(deferred);
        }

        log::debug!(
            "{}: built {} meshes, {} rows, {} vertices, {} textures, {} KiB",
            self.id,
            self.meshes.len(),
            self.rows.len(),
            self.usage.vertices,
            uploaded.len(),
            self.tables.byte_size() / 1024
        );

        self.textures = uploaded;
        self.state = LayerState::Built;
        Ok(())
    }

    /// True when a flush would write anything.
    pub fn has_pending_updates(&self) -> bool {
        self.tables.tables().any(DataTexture::has_pending)
    }

    fn flush(&mut self, sink: &mut dyn TextureSink) -> Result<usize> {
        let mut writes = 0;
        for table in self.tables.tables_mut() {
            if !table.has_pending() {
                continue;
            }
            let kind = table.kind();
            let Some(&(_, handle)) = self.textures.iter().find(|(k, _)| *k == kind) else {
                table.take_regions();
                continue;
            };

            // Regions leave the table only once the sink has taken them.
            let regions = table.pending_regions();
            for (sent, region) in regions.iter().enumerate() {
                if let Err(e) = sink.update(handle, *region, table.region_bytes(region)) {
                    table.complete(sent);
                    log::warn!("{}: {kind} update failed, {} region(s) kept", self.id, regions.len() - sent);
                    return Err(e);
                }
                writes += 1;
            }
            table.complete(regions.len());
        }

        if writes > 0 {
            log::trace!("{}: flushed {writes} region(s)", self.id);
        }
        Ok(writes)
    }

    /// Pushes pending row updates. Deferred updates wait for
    /// `commit_deferred_flags`.
    pub fn sync(&mut self, sink: &mut dyn TextureSink) -> Result<usize> {
        match self.state {
            LayerState::Built if !self.deferred => self.flush(sink),
            LayerState::Destroyed => Err(DtxError::state(format!("{} is destroyed", self.id))),
            _ => Ok(0),
        }
    }

    /// Starts coalescing row updates into one region per table.
    pub fn begin_deferred_flags(&mut self) {
        self.deferred = true;
        for table in self.tables.tables_mut() {
            table.set_deferred(true);
        }
    }

    /// Ends coalescing and pushes the accumulated regions.
    pub fn commit_deferred_flags(&mut self, sink: &mut dyn TextureSink) -> Result<usize> {
        self.check_mutable()?;
        self.deferred = false;
        for table in self.tables.tables_mut() {
            table.set_deferred(false);
        }

        if self.state == LayerState::Built {
            self.flush(sink)
        } else {
            Ok(0)
        }
    }

    pub fn is_deferring(&self) -> bool {
        self.deferred
    }

    /// Releases every uploaded table. No draw may be in flight.
    pub fn destroy(&mut self, sink: &mut dyn TextureSink) {
        if self.state == LayerState::Destroyed {
            return;
        }

        for (_, handle) in self.textures.drain(..) {
            sink.release(handle);
        }
        self.tables = DataTextureSet::new(self.key.family, self.tables.precision());
        self.placed.clear();
        self.rows.clear();
        self.meshes.clear();
        self.counts = MeshCounts::default();
        self.state = LayerState::Destroyed;
        log::debug!("{}: destroyed", self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::LayerCapacity;
    use crate::geometry::compress::tests::cube_record;
    use crate::geometry::compress_geometry;
    use crate::sink::MemorySink;
    use crate::ErrorKind;

    pub(crate) fn cube() -> Arc<GeometryCompressedParams> {
        Arc::new(compress_geometry(&cube_record("cube"), &DtxConfig::default()).unwrap())
    }

    pub(crate) fn placement(id: &str, geometry: &Arc<GeometryCompressedParams>) -> MeshPlacement {
        MeshPlacement {
            id: id.into(),
            geometry: geometry.clone(),
            texture_set: None,
            matrix: DMat4::IDENTITY,
            color: [255, 0, 0, 255],
            flags: RenderFlags::DEFAULT | RenderFlags::EDGES,
            pick_id: 1,
        }
    }

    fn layer(config: &DtxConfig, geometry: &GeometryCompressedParams) -> Layer {
        let key = LayerKey::for_mesh(geometry, None, &DMat4::IDENTITY, config.rtc_cell_size);
        Layer::new(LayerId(0), key, config)
    }

    #[test]
    fn cube_fills_one_row() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);

        assert!(layer.can_create_mesh(&cube));
        let index = layer.create_mesh(placement("a", &cube)).unwrap();
        assert_eq!(index, 0);

        let t = layer.tables();
        assert_eq!(t.positions.len(), 8);
        // 12 triangles padded to 16.
        assert_eq!(t.indices[IndexWidth::U8.slot()].len(), 16);
        assert_eq!(t.edge_indices[IndexWidth::U8.slot()].len(), 16);
        assert_eq!(t.primitive_lookup[0].len(), 2);
        assert_eq!(t.attributes.read::<u8>(0, column::COLOR, 1), &[255, 0, 0, 255]);
        assert_eq!(layer.counts().num_meshes, 1);
        assert_eq!(layer.counts().num_edges, 1);
        assert!(layer.has_edges());
    }

    #[test]
    fn instanced_geometry_is_stored_once() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);

        layer.create_mesh(placement("a", &cube)).unwrap();
        let mut b = placement("b", &cube);
        b.matrix = DMat4::from_translation(DVec3::new(5.0, 0.0, 0.0));
        layer.create_mesh(b).unwrap();

        let t = layer.tables();
        assert_eq!(t.positions.len(), 8);
        assert_eq!(t.indices[0].len(), 16);
        assert_eq!(layer.stream_len(IndexWidth::U8), 32);

        let second = layer.rows()[1];
        assert_eq!(second.stream_start, 16);
        assert_eq!(second.index_base_offset, 16);
        assert_eq!(second.vertex_base, 0);

        // The second row's modeling matrix carries its translation.
        let m = t.read_matrices(1);
        assert_eq!(m[28], 5.0);
    }

    #[test]
    fn full_layer_rejects_without_mutation() {
        let cube = cube();
        let config = DtxConfig {
            capacity: LayerCapacity {
                max_meshes: 100,
                max_vertices: 20,
                max_primitives: 1000,
            },
            ..DtxConfig::default()
        };
        let mut layer = layer(&config, &cube);

        // Distinct geometries: each one costs 8 vertices.
        let geometries: Vec<_> = (0..3)
            .map(|i| {
                let mut g = (*cube).clone();
                g.id = format!("g{i}");
                Arc::new(g)
            })
            .collect();

        layer.create_mesh(placement("a", &geometries[0])).unwrap();
        layer.create_mesh(placement("b", &geometries[1])).unwrap();
        assert!(!layer.can_create_mesh(&geometries[2]));

        let before = *layer.usage();
        let err = layer.create_mesh(placement("c", &geometries[2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(*layer.usage(), before);
        assert_eq!(layer.tables().positions.len(), 16);
        assert_eq!(layer.num_meshes(), 2);

        // Reusing a placed geometry costs no vertices and still fits.
        assert!(layer.can_create_mesh(&geometries[0]));
    }

    #[test]
    fn built_layer_is_structurally_frozen() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);
        layer.create_mesh(placement("a", &cube)).unwrap();

        let mut sink = MemorySink::new();
        layer.build(&mut sink).unwrap();
        assert_eq!(layer.state(), LayerState::Built);
        assert!(!layer.can_create_mesh(&cube));

        let err = layer.create_mesh(placement("b", &cube)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatePrecondition);
        assert!(layer.build(&mut sink).is_err());

        // attributes, matrices, offsets, positions, indices-8, edge-indices-8,
        // primitive lookup, edge lookup.
        assert_eq!(sink.uploads, 8);
    }

    #[test]
    fn flag_updates_are_partial_writes() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);
        for i in 0..4 {
            layer.create_mesh(placement(&format!("m{i}"), &cube)).unwrap();
        }

        let mut sink = MemorySink::new();
        layer.build(&mut sink).unwrap();

        layer.set_mesh_highlighted(1, true, false).unwrap();
        layer.set_mesh_visible(3, false, false).unwrap();
        assert!(layer.has_pending_updates());
        assert_eq!(layer.sync(&mut sink).unwrap(), 2);
        assert!(!layer.has_pending_updates());

        let (_, bytes) = sink.texture(TableKind::Attributes).next().unwrap();
        let flags_of = |row: usize| &bytes[row * 32 + 8..row * 32 + 12];
        assert_eq!(flags_of(1)[1], crate::flags::pass_value::SILHOUETTE_HIGHLIGHTED);
        assert_eq!(flags_of(3), &[0, 0, 0, 0]);

        assert_eq!(layer.counts().num_highlighted, 1);
        assert_eq!(layer.counts().num_visible, 3);
    }

    /// Memory sink whose `fail_on`-th update (0-based) returns an error once.
    struct FlakySink {
        inner: MemorySink,
        fail_on: Option<usize>,
        calls: usize,
    }

    impl TextureSink for FlakySink {
        fn upload(&mut self, desc: &crate::sink::TextureDesc, data: &[u8]) -> Result<TextureHandle> {
            self.inner.upload(desc, data)
        }

        fn update(&mut self, handle: TextureHandle, region: crate::sink::TexelRegion, data: &[u8]) -> Result<()> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on == Some(call) {
                self.fail_on = None;
                return Err(DtxError::backend("device lost"));
            }
            self.inner.update(handle, region, data)
        }

        fn release(&mut self, handle: TextureHandle) {
            self.inner.release(handle)
        }
    }

    #[test]
    fn failed_update_keeps_unsent_regions() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);
        for i in 0..4 {
            layer.create_mesh(placement(&format!("m{i}"), &cube)).unwrap();
        }

        let mut sink = FlakySink {
            inner: MemorySink::new(),
            fail_on: None,
            calls: 0,
        };
        layer.build(&mut sink).unwrap();

        // Two disjoint regions of the attribute table; the second write fails.
        layer.set_mesh_highlighted(0, true, false).unwrap();
        layer.set_mesh_highlighted(3, true, false).unwrap();
        sink.fail_on = Some(1);

        let err = layer.sync(&mut sink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(layer.has_pending_updates());
        assert_eq!(sink.inner.updates.len(), 1);

        // Only the region the sink rejected is sent again.
        assert_eq!(layer.sync(&mut sink).unwrap(), 1);
        assert!(!layer.has_pending_updates());
        assert_eq!(sink.inner.updates.len(), 2);

        let (_, bytes) = sink.inner.texture(TableKind::Attributes).next().unwrap();
        let highlight = crate::flags::pass_value::SILHOUETTE_HIGHLIGHTED;
        assert_eq!(bytes[8 + 1], highlight);
        assert_eq!(bytes[3 * 32 + 8 + 1], highlight);
    }

    #[test]
    fn deferred_flags_flush_once_on_commit() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);
        for i in 0..50 {
            layer.create_mesh(placement(&format!("m{i}"), &cube)).unwrap();
        }
        let mut sink = MemorySink::new();
        layer.build(&mut sink).unwrap();

        layer.begin_deferred_flags();
        for i in 0..50 {
            layer.set_mesh_selected(i, true, false).unwrap();
        }
        assert_eq!(layer.sync(&mut sink).unwrap(), 0);
        assert_eq!(layer.commit_deferred_flags(&mut sink).unwrap(), 1);
        assert_eq!(layer.counts().num_selected, 50);
    }

    #[test]
    fn color_matrix_and_offset_update_every_row() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);
        layer.create_mesh(placement("a", &cube)).unwrap();

        layer.set_mesh_color(0, [0, 0, 255, 128], true).unwrap();
        assert_eq!(layer.counts().num_transparent, 1);
        assert_eq!(layer.tables().attributes.read::<u8>(0, column::COLOR, 1), &[0, 0, 255, 128]);

        layer.set_mesh_offset(0, Vec3::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(layer.tables().offsets.read::<f32>(0, 0, 1), &[1.0, 2.0, 3.0, 0.0]);

        layer
            .set_mesh_matrix(0, DMat4::from_translation(DVec3::new(0.0, 0.0, -4.0)))
            .unwrap();
        assert_eq!(layer.tables().read_matrices(0)[30], -4.0);
    }

    #[test]
    fn destroyed_layer_rejects_mutation() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);
        layer.create_mesh(placement("a", &cube)).unwrap();

        let mut sink = MemorySink::new();
        layer.build(&mut sink).unwrap();
        layer.destroy(&mut sink);

        assert_eq!(sink.released, 8);
        assert!(sink.textures.is_empty());
        let err = layer.set_mesh_visible(0, false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatePrecondition);
        assert!(layer.sync(&mut sink).is_err());
    }

    #[test]
    fn unknown_mesh_index_is_rejected() {
        let cube = cube();
        let mut layer = layer(&DtxConfig::default(), &cube);
        assert!(layer.set_mesh_selected(0, true, false).is_err());
    }
}
