//! `SceneModel`: owns the geometries, layers and mesh ids of one loaded model.
//!
//! Meshes are routed to the open layer of their `LayerKey`. When that layer
//! cannot take the mesh it is closed to appends and a fresh layer with the
//! same key is opened. `finalize` builds every layer; after that only row
//! contents change.

use crate::capacity::LayerKey;
use crate::config::DtxConfig;
use crate::error::{DtxError, Result};
use crate::flags::{MeshCounts, RenderFlags};
use crate::geometry::{compress_all, compress_geometry, GeometryCompressedParams, GeometryRecord};
use crate::layer::{Layer, LayerId, LayerState, MeshEntry, MeshPlacement};
use crate::scheduler::{DrawBackend, PassRenderer, RenderPass, COLOR_FRAME, PICK_FRAME, SNAP_FRAME};
use crate::sink::TextureSink;
use crate::tables::pick_id;
use glam::{DMat4, Vec3};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_color() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

fn default_opacity() -> f32 {
    1.0
}

fn default_flags() -> RenderFlags {
    RenderFlags::DEFAULT
}

/// Creation parameters of one mesh, as supplied by a loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshParams {
    pub id: String,
    pub geometry_id: String,
    #[serde(default)]
    pub texture_set_id: Option<String>,
    /// Column-major world transform; identity when absent.
    #[serde(default)]
    pub matrix: Option<[f64; 16]>,
    #[serde(default = "default_color")]
    pub color: [f32; 3],
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_flags")]
    pub flags: RenderFlags,
}

impl MeshParams {
    pub fn new(id: impl Into<String>, geometry_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            geometry_id: geometry_id.into(),
            texture_set_id: None,
            matrix: None,
            color: default_color(),
            opacity: default_opacity(),
            flags: default_flags(),
        }
    }

    pub fn matrix(&self) -> DMat4 {
        self.matrix.map_or(DMat4::IDENTITY, |m| DMat4::from_cols_array(&m))
    }
}

fn unit_to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn rgba(color: [f32; 3], opacity: f32) -> [u8; 4] {
    [
        unit_to_u8(color[0]),
        unit_to_u8(color[1]),
        unit_to_u8(color[2]),
        unit_to_u8(opacity),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Loading,
    Finalized,
    Destroyed,
}

/// Where a mesh lives: layer slot and row-group index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRef {
    pub layer: usize,
    pub index: u32,
}

#[derive(Debug)]
pub struct SceneModel {
    id: String,
    config: DtxConfig,
    state: ModelState,
    geometries: HashMap<String, Arc<GeometryCompressedParams>>,
    layers: Vec<Layer>,
    open: HashMap<LayerKey, usize>,
    /// Meshes in creation order; pick id `n` is `order[n - 1]`.
    order: Vec<MeshRef>,
    mesh_ids: HashMap<String, usize>,
    deferred: bool,
}

impl SceneModel {
    pub fn new(id: impl Into<String>, config: DtxConfig) -> Self {
        Self {
            id: id.into(),
            config,
            state: ModelState::Loading,
            geometries: HashMap::new(),
            layers: Vec::new(),
            open: HashMap::new(),
            order: Vec::new(),
            mesh_ids: HashMap::new(),
            deferred: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &DtxConfig {
        &self.config
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id() == id)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_meshes(&self) -> usize {
        self.order.len()
    }

    pub fn geometry(&self, id: &str) -> Option<&Arc<GeometryCompressedParams>> {
        self.geometries.get(id)
    }

    pub fn geometries(&self) -> impl Iterator<Item = &Arc<GeometryCompressedParams>> + '_ {
        self.geometries.values()
    }

    /// Meshes in creation order.
    pub fn meshes(&self) -> impl Iterator<Item = &MeshEntry> + '_ {
        self.order
            .iter()
            .filter_map(|r| self.layers.get(r.layer).and_then(|l| l.mesh(r.index)))
    }

    pub fn mesh(&self, id: &str) -> Option<&MeshEntry> {
        let r = self.order.get(*self.mesh_ids.get(id)?)?;
        self.layers.get(r.layer)?.mesh(r.index)
    }

    /// Layer id and mesh index of mesh `id`.
    pub fn mesh_location(&self, id: &str) -> Option<(LayerId, u32)> {
        let r = self.order.get(*self.mesh_ids.get(id)?)?;
        Some((self.layers.get(r.layer)?.id(), r.index))
    }

    /// Totals over every layer.
    pub fn mesh_counts(&self) -> MeshCounts {
        let mut total = MeshCounts::default();
        for layer in &self.layers {
            total.merge(layer.counts());
        }
        total
    }

    /// Mesh whose pick colour was read back from a pick pass.
    pub fn mesh_for_pick_color(&self, color: [u8; 4]) -> Option<&str> {
        let n = pick_id(color) as usize;
        let r = self.order.get(n.checked_sub(1)?)?;
        self.layers.get(r.layer)?.mesh(r.index).map(|m| m.id.as_str())
    }

    fn check_loading(&self, what: &str) -> Result<()> {
        if self.state != ModelState::Loading {
            return Err(DtxError::state(format!(
                "model `{}`: cannot {what} once {:?}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    fn check_new_geometry(&self, id: &str) -> Result<()> {
        if self.geometries.contains_key(id) {
            return Err(DtxError::DuplicateId(id.to_owned()));
        }
        Ok(())
    }

    /// Compresses `record` and registers it.
    pub fn create_geometry(&mut self, record: &GeometryRecord) -> Result<Arc<GeometryCompressedParams>> {
        self.check_loading("create geometry")?;
        self.check_new_geometry(&record.id)?;

        let geometry = Arc::new(compress_geometry(record, &self.config)?);
        self.geometries.insert(record.id.clone(), geometry.clone());
        Ok(geometry)
    }

    /// Registers already-compressed geometry after checking its invariants.
    pub fn create_geometry_compressed(
        &mut self,
        params: GeometryCompressedParams,
    ) -> Result<Arc<GeometryCompressedParams>> {
        self.check_loading("create geometry")?;
        self.check_new_geometry(&params.id)?;
        params.validate()?;

        let geometry = Arc::new(params);
        self.geometries.insert(geometry.id.clone(), geometry.clone());
        Ok(geometry)
    }

    /// Compresses `records` in parallel. Either all are registered or none.
    pub fn create_geometries(&mut self, records: &[GeometryRecord]) -> Result<()> {
        self.check_loading("create geometry")?;

        let mut seen = hashbrown::HashSet::with_capacity(records.len());
        for record in records {
            self.check_new_geometry(&record.id)?;
            if !seen.insert(record.id.as_str()) {
                return Err(DtxError::DuplicateId(record.id.clone()));
            }
        }

        let compressed = compress_all(records, &self.config)
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        for geometry in compressed {
            self.geometries.insert(geometry.id.clone(), geometry);
        }
        Ok(())
    }

    fn new_layer(&self, key: LayerKey) -> Layer {
        let id = LayerId(self.layers.len() as u32);
        let mut layer = Layer::new(id, key, &self.config);
        if self.deferred {
            layer.begin_deferred_flags();
        }
        layer
    }

    /// Places a mesh and returns its location. A mesh that cannot fit even
    /// an empty layer is rejected and nothing changes.
    pub fn create_mesh(&mut self, params: &MeshParams) -> Result<MeshRef> {
        self.check_loading("create mesh")?;
        if self.mesh_ids.contains_key(&params.id) {
            return Err(DtxError::DuplicateId(params.id.clone()));
        }

        let geometry = self
            .geometries
            .get(&params.geometry_id)
            .cloned()
            .ok_or_else(|| DtxError::UnknownGeometry(params.geometry_id.clone()))?;

        let matrix = params.matrix();
        let key = LayerKey::for_mesh(
            &geometry,
            params.texture_set_id.as_deref(),
            &matrix,
            self.config.rtc_cell_size,
        );

        let mut flags = params.flags;
        flags.set(RenderFlags::TRANSPARENT, params.opacity < 1.0);

        let placement = MeshPlacement {
            id: params.id.clone(),
            geometry: geometry.clone(),
            texture_set: params.texture_set_id.clone(),
            matrix,
            color: rgba(params.color, params.opacity),
            flags,
            pick_id: self.order.len() as u32 + 1,
        };

        let current = self.open.get(&key).copied();
        let (slot, index) = match current {
            Some(slot) if self.layers[slot].can_create_mesh(&geometry) => {
                (slot, self.layers[slot].create_mesh(placement)?)
            }
            _ => {
                // A new layer is registered only once it holds the mesh.
                let mut layer = self.new_layer(key.clone());
                let index = layer.create_mesh(placement)?;

                if let Some(full) = current.map(|slot| &self.layers[slot]) {
                    log::warn!(
                        "{} full at {} meshes ({} vertices); opening another for {:?} tile {:?}",
                        full.id(),
                        full.num_meshes(),
                        full.usage().vertices,
                        key.family,
                        key.tile
                    );
                }

                self.layers.push(layer);
                let slot = self.layers.len() - 1;
                self.open.insert(key, slot);
                (slot, index)
            }
        };

        let r = MeshRef { layer: slot, index };
        self.mesh_ids.insert(params.id.clone(), self.order.len());
        self.order.push(r);
        Ok(r)
    }

    /// Builds and uploads every layer. No meshes can be added afterwards.
    pub fn finalize(&mut self, sink: &mut dyn TextureSink) -> Result<()> {
        self.check_loading("finalize")?;

        for layer in self.layers.iter_mut().filter(|l| l.state() == LayerState::Building) {
            layer.build(sink)?;
        }

        self.open.clear();
        self.state = ModelState::Finalized;
        log::debug!(
            "model `{}`: finalized {} meshes in {} layer(s)",
            self.id,
            self.order.len(),
            self.layers.len()
        );
        Ok(())
    }

    fn locate(&mut self, id: &str) -> Result<(&mut Layer, u32, RenderFlags)> {
        if self.state == ModelState::Destroyed {
            return Err(DtxError::state(format!("model `{}` is destroyed", self.id)));
        }

        let r = self
            .mesh_ids
            .get(id)
            .and_then(|&n| self.order.get(n))
            .copied()
            .ok_or_else(|| DtxError::UnknownMesh(id.to_owned()))?;

        let layer = self
            .layers
            .get_mut(r.layer)
            .ok_or_else(|| DtxError::UnknownMesh(id.to_owned()))?;
        let flags = layer
            .mesh(r.index)
            .map(|m| m.flags)
            .ok_or_else(|| DtxError::UnknownMesh(id.to_owned()))?;
        Ok((layer, r.index, flags))
    }

    fn update<F>(&mut self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Layer, u32, bool) -> Result<()>,
    {
        let (layer, index, flags) = self.locate(id)?;
        f(layer, index, flags.contains(RenderFlags::TRANSPARENT))
    }

    pub fn set_mesh_visible(&mut self, id: &str, visible: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_visible(i, visible, t))
    }

    pub fn set_mesh_highlighted(&mut self, id: &str, highlighted: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_highlighted(i, highlighted, t))
    }

    pub fn set_mesh_xrayed(&mut self, id: &str, xrayed: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_xrayed(i, xrayed, t))
    }

    pub fn set_mesh_selected(&mut self, id: &str, selected: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_selected(i, selected, t))
    }

    pub fn set_mesh_culled(&mut self, id: &str, culled: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_culled(i, culled, t))
    }

    pub fn set_mesh_clippable(&mut self, id: &str, clippable: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_clippable(i, clippable, t))
    }

    pub fn set_mesh_pickable(&mut self, id: &str, pickable: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_pickable(i, pickable, t))
    }

    pub fn set_mesh_collidable(&mut self, id: &str, collidable: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_collidable(i, collidable, t))
    }

    pub fn set_mesh_edges(&mut self, id: &str, edges: bool) -> Result<()> {
        self.update(id, |l, i, t| l.set_mesh_edges(i, edges, t))
    }

    pub fn set_mesh_transparent(&mut self, id: &str, transparent: bool) -> Result<()> {
        self.update(id, |l, i, _| l.set_mesh_transparent(i, transparent))
    }

    /// Sets RGB, keeping the current opacity.
    pub fn set_mesh_color(&mut self, id: &str, color: [f32; 3]) -> Result<()> {
        self.update(id, |l, i, t| {
            let alpha = l.mesh(i).map_or(255, |m| m.color[3]);
            let rgb = rgba(color, 1.0);
            l.set_mesh_color(i, [rgb[0], rgb[1], rgb[2], alpha], t)
        })
    }

    /// Sets alpha; opacity below one moves the mesh to the transparent passes.
    pub fn set_mesh_opacity(&mut self, id: &str, opacity: f32) -> Result<()> {
        self.update(id, |l, i, _| {
            let mut color = l.mesh(i).map_or([255; 4], |m| m.color);
            color[3] = unit_to_u8(opacity);
            l.set_mesh_color(i, color, opacity < 1.0)
        })
    }

    pub fn set_mesh_offset(&mut self, id: &str, offset: Vec3) -> Result<()> {
        self.update(id, |l, i, _| l.set_mesh_offset(i, offset))
    }

    pub fn set_mesh_matrix(&mut self, id: &str, matrix: DMat4) -> Result<()> {
        self.update(id, |l, i, _| l.set_mesh_matrix(i, matrix))
    }

    /// Coalesces row updates of every layer until `commit_deferred_flags`.
    pub fn begin_deferred_flags(&mut self) {
        self.deferred = true;
        for layer in self.layers.iter_mut().filter(|l| l.state() != LayerState::Destroyed) {
            layer.begin_deferred_flags();
        }
    }

    pub fn commit_deferred_flags(&mut self, sink: &mut dyn TextureSink) -> Result<usize> {
        self.deferred = false;
        let mut writes = 0;
        for layer in self.layers.iter_mut().filter(|l| l.state() != LayerState::Destroyed) {
            writes += layer.commit_deferred_flags(sink)?;
        }
        Ok(writes)
    }

    /// Pushes pending row updates; call once per frame before drawing.
    pub fn prepare_frame(&mut self, sink: &mut dyn TextureSink) -> Result<usize> {
        let mut writes = 0;
        for layer in self.layers.iter_mut().filter(|l| l.state() == LayerState::Built) {
            writes += layer.sync(sink)?;
        }
        Ok(writes)
    }

    fn check_drawable(&self) -> Result<()> {
        if self.state != ModelState::Finalized {
            return Err(DtxError::state(format!(
                "model `{}`: cannot draw while {:?}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Runs `passes` pass-major over every layer; returns passes that drew.
    pub fn draw_passes<B: DrawBackend>(&self, passes: &[RenderPass], r: &mut PassRenderer<B>) -> Result<usize> {
        self.check_drawable()?;

        let mut drawn = 0;
        for &pass in passes {
            for layer in &self.layers {
                if layer.draw_pass(pass, r)? {
                    drawn += 1;
                }
            }
        }
        Ok(drawn)
    }

    pub fn draw_frame<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<usize> {
        self.draw_passes(&COLOR_FRAME, r)
    }

    pub fn draw_pick_frame<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<usize> {
        self.draw_passes(&PICK_FRAME, r)
    }

    pub fn draw_snap_frame<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<usize> {
        self.draw_passes(&SNAP_FRAME, r)
    }

    pub fn draw_occlusion<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<usize> {
        self.draw_passes(&[RenderPass::Occlusion], r)
    }

    pub fn draw_shadow<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<usize> {
        self.draw_passes(&[RenderPass::Shadow], r)
    }

    pub fn draw_depth<B: DrawBackend>(&self, r: &mut PassRenderer<B>) -> Result<usize> {
        self.draw_passes(&[RenderPass::Depth, RenderPass::Normals], r)
    }

    /// `prepare_frame` followed by `draw_frame`.
    pub fn render_frame<B: DrawBackend>(
        &mut self,
        sink: &mut dyn TextureSink,
        r: &mut PassRenderer<B>,
    ) -> Result<usize> {
        self.prepare_frame(sink)?;
        self.draw_frame(r)
    }

    /// Releases every layer's tables. No draw may be in flight.
    pub fn destroy(&mut self, sink: &mut dyn TextureSink) {
        for layer in &mut self.layers {
            layer.destroy(sink);
        }
        self.open.clear();
        self.state = ModelState::Destroyed;
        log::debug!("model `{}`: destroyed", self.id);
    }
}
